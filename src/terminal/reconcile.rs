// ABOUTME: Slicing raw pane captures down to one command's output
//
// Given the marker occurrences found in a capture, these functions recover
// exactly the text attributable to the command under observation: no prompt
// blocks, no output already returned by an earlier poll, no echo of the
// command itself.

use super::marker::MarkerMatch;

/// Combine the output segments between marker occurrences.
///
/// With two or more markers the wanted output is every inter-marker segment
/// in order plus whatever follows the last marker (multiple commands can
/// complete between two polls under fast successive empty submissions).
///
/// With exactly one marker the split is ambiguous: the marker may be the one
/// that *preceded* the command (its terminator scrolled out of history) or
/// the terminating one itself. `content_before_last` selects the branch; the
/// session driver picks it from which state it is in.
///
/// With no markers at all the whole capture is returned as a best effort.
pub fn combine_outputs_between_matches(
    pane_content: &str,
    matches: &[MarkerMatch],
    content_before_last: bool,
) -> String {
    match matches {
        [] => pane_content.to_string(),
        [only] => {
            if content_before_last {
                pane_content[..only.start].to_string()
            } else {
                after_marker(pane_content, only).to_string()
            }
        }
        _ => {
            let mut combined = String::new();
            for pair in matches.windows(2) {
                let from = (pair[0].end + 1).min(pair[1].start);
                combined.push_str(&pane_content[from..pair[1].start]);
                combined.push('\n');
            }
            combined.push_str(after_marker(
                pane_content,
                matches.last().expect("non-empty match list"),
            ));
            combined
        }
    }
}

/// Content following a marker, skipping the newline that terminates its end
/// line. Clamped so a marker flush against the end of the capture yields "".
fn after_marker<'a>(pane_content: &'a str, marker: &MarkerMatch) -> &'a str {
    pane_content.get(marker.end + 1..).unwrap_or("")
}

/// Strip the echoed command from the head of its own output. Tolerates the
/// leading whitespace the prompt and the echo both introduce.
pub fn remove_command_echo(output: &str, command: &str) -> String {
    let trimmed = output.trim_start();
    trimmed
        .strip_prefix(command.trim_start())
        .unwrap_or(trimmed)
        .trim_start()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::marker::MarkerProtocol;

    fn proto() -> MarkerProtocol {
        MarkerProtocol::with_token("RECON")
    }

    fn block(exit_code: i32) -> String {
        format!(
            "###RECON###\n{{\"exit_code\": \"{exit_code}\", \"working_dir\": \"/w\"}}\n###RECON-END###"
        )
    }

    #[test]
    fn test_two_markers_yield_between_segment() {
        let text = format!("{}\ncommand output here\n{}\n", block(0), block(0));
        let matches = proto().find_all(&text);
        assert_eq!(matches.len(), 2);
        let combined = combine_outputs_between_matches(&text, &matches, false);
        assert_eq!(combined.trim(), "command output here");
    }

    #[test]
    fn test_three_markers_concatenate_segments_in_order() {
        let text = format!(
            "{}\nfirst\n{}\nsecond\n{}\n",
            block(0),
            block(0),
            block(0)
        );
        let matches = proto().find_all(&text);
        assert_eq!(matches.len(), 3);
        let combined = combine_outputs_between_matches(&text, &matches, false);
        let first = combined.find("first").expect("first segment present");
        let second = combined.find("second").expect("second segment present");
        assert!(first < second);
    }

    #[test]
    fn test_single_marker_before_branch() {
        let text = format!("truncated tail of output\n{}\n", block(0));
        let matches = proto().find_all(&text);
        let combined = combine_outputs_between_matches(&text, &matches, true);
        assert_eq!(combined.trim(), "truncated tail of output");
    }

    #[test]
    fn test_single_marker_after_branch() {
        let text = format!("{}\nstill running output", block(0));
        let matches = proto().find_all(&text);
        let combined = combine_outputs_between_matches(&text, &matches, false);
        assert_eq!(combined, "still running output");
    }

    #[test]
    fn test_single_marker_at_end_of_capture() {
        let text = format!("leading\n{}", block(0));
        let matches = proto().find_all(&text);
        let combined = combine_outputs_between_matches(&text, &matches, false);
        assert_eq!(combined, "");
    }

    #[test]
    fn test_zero_markers_return_everything() {
        let text = "no markers anywhere";
        assert_eq!(
            combine_outputs_between_matches(text, &[], false),
            "no markers anywhere"
        );
    }

    #[test]
    fn test_remove_command_echo() {
        assert_eq!(remove_command_echo("echo hi\nhi", "echo hi"), "hi");
        assert_eq!(remove_command_echo("  echo hi\nhi", "echo hi"), "hi");
        assert_eq!(remove_command_echo("unrelated\nhi", "echo hi"), "unrelated\nhi");
    }
}
