// ABOUTME: Prompt marker protocol for detecting command boundaries in pane text
//
// The shell's PS1 is overridden so that every completed command prints a
// sentinel block: a begin line, a JSON object of shell-expanded metadata
// (exit code, cwd, interpreter path, ...), and an end line. Scanning captured
// pane text for these blocks is how the session driver knows a command
// finished and what it left behind.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Metadata recovered from one marker block, plus the prefix/suffix
/// annotations the driver attaches while building an observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Exit code of the command the marker terminates. `-1` means the
    /// process is still running and no code is available yet.
    pub exit_code: i32,
    /// Last background pid reported by the shell, if any.
    pub pid: Option<i64>,
    pub username: Option<String>,
    pub hostname: Option<String>,
    /// Working directory at the time the marker printed. Empty when the
    /// marker was unavailable (timeout paths).
    pub working_dir: String,
    /// Active python interpreter on the session's PATH, best effort.
    pub py_interpreter_path: Option<String>,
    /// Human-readable annotation prepended to the observation output.
    pub prefix: String,
    /// Human-readable annotation appended to the observation output.
    pub suffix: String,
}

impl Default for CommandMetadata {
    fn default() -> Self {
        Self {
            exit_code: -1,
            pid: None,
            username: None,
            hostname: None,
            working_dir: String::new(),
            py_interpreter_path: None,
            prefix: String::new(),
            suffix: String::new(),
        }
    }
}

/// One well-formed marker found in captured pane text. Byte offsets index
/// into the capture the marker was found in and are recomputed every poll.
#[derive(Debug, Clone)]
pub struct MarkerMatch {
    pub start: usize,
    pub end: usize,
    pub metadata: CommandMetadata,
}

/// The fields the prompt template asks the shell to expand. Values are bash
/// expressions, not data; they are resolved by the shell each time the
/// prompt redraws.
#[derive(Serialize)]
struct Ps1Template {
    pid: &'static str,
    exit_code: &'static str,
    username: &'static str,
    hostname: &'static str,
    working_dir: &'static str,
    py_interpreter_path: &'static str,
}

const PS1_TEMPLATE: Ps1Template = Ps1Template {
    pid: "$!",
    exit_code: "$?",
    username: "\\u",
    hostname: "\\h",
    working_dir: "$(pwd)",
    py_interpreter_path: "$(which python 2>/dev/null || echo \"\")",
};

/// Renders the prompt sentinel and scans pane captures for it.
///
/// The delimiter token is derived from a fresh UUID per session, so program
/// output colliding with it is a probability argument, not a guarantee: a
/// program that happens to print the exact token can still confuse the scan.
/// The threat model is buggy output, not adversarial output.
#[derive(Debug, Clone)]
pub struct MarkerProtocol {
    begin: String,
    end: String,
    regex: Regex,
}

impl MarkerProtocol {
    /// Build a protocol instance with a session-unique token.
    pub fn new() -> Self {
        Self::with_token(&format!("SHELLBOX-{}", Uuid::new_v4().simple()))
    }

    /// Build a protocol instance around a caller-chosen token. Used by tests
    /// to get deterministic sentinels.
    pub fn with_token(token: &str) -> Self {
        let begin = format!("###{token}###");
        let end = format!("###{token}-END###");
        let pattern = format!(
            "(?s){}\\s*(.*?)\\s*{}",
            regex::escape(&begin),
            regex::escape(&end)
        );
        let regex = Regex::new(&pattern).expect("marker pattern is valid");
        Self { begin, end, regex }
    }

    /// The PS1 value embedding the marker template. Inner double quotes are
    /// backslash-escaped so they survive the `PS1="..."` assignment.
    pub fn ps1_prompt(&self) -> String {
        let json = serde_json::to_string_pretty(&PS1_TEMPLATE)
            .expect("static prompt template serializes");
        let escaped = json.replace('"', "\\\"");
        format!("\n{}\n{}\n{}\n\n", self.begin, escaped, self.end)
    }

    /// The shell statement that installs the prompt override. PROMPT_COMMAND
    /// re-exports PS1 before every prompt so `$?` and `$(pwd)` are expanded
    /// fresh each time; PS2 is emptied so multiline commands do not inject
    /// continuation prompts into the capture.
    pub fn prompt_export_command(&self) -> String {
        format!(
            "export PROMPT_COMMAND='export PS1=\"{}\"'; export PS2=\"\"",
            self.ps1_prompt()
        )
    }

    /// Scan captured text for every well-formed marker block, in order.
    /// Blocks whose metadata does not parse as JSON (e.g. truncated by the
    /// scrollback limit) are skipped, never an error.
    pub fn find_all(&self, text: &str) -> Vec<MarkerMatch> {
        let mut matches = Vec::new();
        for caps in self.regex.captures_iter(text) {
            let whole = caps.get(0).expect("capture 0 always present");
            let body = caps.get(1).map_or("", |m| m.as_str());
            match parse_metadata(body) {
                Some(metadata) => matches.push(MarkerMatch {
                    start: whole.start(),
                    end: whole.end(),
                    metadata,
                }),
                None => {
                    warn!("Skipping malformed marker metadata block: {:?}", body);
                }
            }
        }
        matches
    }

    /// Whether the capture ends with the marker's end line, modulo trailing
    /// whitespace. This is the completion signal that survives the begin
    /// line scrolling out of the history buffer.
    pub fn ends_with_sentinel(&self, text: &str) -> bool {
        text.trim_end().ends_with(&self.end)
    }
}

impl Default for MarkerProtocol {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one marker body. The shell expands every field into a JSON string
/// value, so numbers arrive as text and are converted leniently: a mangled
/// exit code degrades to the "still running" sentinel rather than an error.
fn parse_metadata(body: &str) -> Option<CommandMetadata> {
    let value: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
    let obj = value.as_object()?;

    let field = |name: &str| -> Option<String> {
        obj.get(name).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    };

    let exit_code = match field("exit_code") {
        Some(raw) => parse_int_lenient(&raw).map_or_else(
            || {
                warn!("Failed to parse exit code from marker: {:?}", raw);
                -1
            },
            |v| v as i32,
        ),
        None => -1,
    };
    let pid = field("pid").and_then(|raw| parse_int_lenient(&raw));

    Some(CommandMetadata {
        exit_code,
        pid,
        username: field("username").filter(|s| !s.is_empty()),
        hostname: field("hostname").filter(|s| !s.is_empty()),
        working_dir: field("working_dir").unwrap_or_default(),
        py_interpreter_path: field("py_interpreter_path").filter(|s| !s.is_empty()),
        prefix: String::new(),
        suffix: String::new(),
    })
}

fn parse_int_lenient(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .parse::<i64>()
        .ok()
        .or_else(|| trimmed.parse::<f64>().ok().map(|f| f as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> MarkerProtocol {
        MarkerProtocol::with_token("TESTTOKEN")
    }

    fn marker_block(exit_code: &str, cwd: &str) -> String {
        format!(
            "###TESTTOKEN###\n{{\"pid\": \"\", \"exit_code\": \"{exit_code}\", \
             \"username\": \"root\", \"hostname\": \"box\", \"working_dir\": \"{cwd}\", \
             \"py_interpreter_path\": \"\"}}\n###TESTTOKEN-END###"
        )
    }

    #[test]
    fn test_ps1_prompt_contains_token_and_template_fields() {
        let prompt = protocol().ps1_prompt();
        assert!(prompt.contains("###TESTTOKEN###"));
        assert!(prompt.contains("###TESTTOKEN-END###"));
        assert!(prompt.contains("\\\"exit_code\\\": \\\"$?\\\""));
        assert!(prompt.contains("$(pwd)"));
    }

    #[test]
    fn test_prompt_export_command_disables_ps2() {
        let cmd = protocol().prompt_export_command();
        assert!(cmd.starts_with("export PROMPT_COMMAND="));
        assert!(cmd.ends_with("export PS2=\"\""));
    }

    #[test]
    fn test_find_all_parses_single_marker() {
        let text = format!("hello\n{}\n", marker_block("0", "/tmp"));
        let matches = protocol().find_all(&text);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].metadata.exit_code, 0);
        assert_eq!(matches[0].metadata.working_dir, "/tmp");
        assert_eq!(matches[0].metadata.pid, None);
        assert_eq!(matches[0].metadata.username.as_deref(), Some("root"));
    }

    #[test]
    fn test_find_all_returns_offsets_in_order() {
        let first = marker_block("0", "/a");
        let second = marker_block("1", "/b");
        let text = format!("{first}\nmiddle output\n{second}\ntail");
        let matches = protocol().find_all(&text);
        assert_eq!(matches.len(), 2);
        assert!(matches[0].end <= matches[1].start);
        assert_eq!(&text[matches[0].start..matches[0].end], first);
        assert_eq!(matches[1].metadata.exit_code, 1);
    }

    #[test]
    fn test_find_all_skips_malformed_json() {
        let text = "###TESTTOKEN###\nnot json at all\n###TESTTOKEN-END###";
        assert!(protocol().find_all(text).is_empty());
    }

    #[test]
    fn test_find_all_ignores_truncated_block() {
        // begin line scrolled off; only the tail of a block remains
        let text = "\"exit_code\": \"0\"}\n###TESTTOKEN-END###";
        assert!(protocol().find_all(text).is_empty());
    }

    #[test]
    fn test_exit_code_parse_fallback() {
        let text = marker_block("not-a-number", "/tmp");
        let matches = protocol().find_all(&text);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].metadata.exit_code, -1);
    }

    #[test]
    fn test_ends_with_sentinel() {
        let proto = protocol();
        let text = format!("output\n{}\n  \n", marker_block("0", "/tmp"));
        assert!(proto.ends_with_sentinel(&text));
        assert!(!proto.ends_with_sentinel("output with no marker"));
        // marker present but not trailing
        let text = format!("{}\nmore output after", marker_block("0", "/tmp"));
        assert!(!proto.ends_with_sentinel(&text));
    }

    #[test]
    fn test_tokens_are_unique_per_instance() {
        let a = MarkerProtocol::new();
        let b = MarkerProtocol::new();
        assert_ne!(a.ps1_prompt(), b.ps1_prompt());
    }
}
