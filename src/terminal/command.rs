// ABOUTME: Pre-flight analysis of submitted command text
//
// Two jobs before anything touches the pane: split the text into top-level
// shell statements (the driver rejects submissions containing more than
// one), and escape backslash sequences that tmux key delivery would
// otherwise swallow before bash sees them.

/// Context the scanner can be nested inside while walking command text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    DoubleQuote,
    Paren,
    DollarParen,
    DollarBrace,
    Backtick,
}

/// Split command text into top-level shell statements.
///
/// Statement boundaries are unquoted `;`, newlines, and background `&` at
/// nesting depth zero outside compound constructs. Operators that join one
/// pipeline (`&&`, `||`, `|`) do not split, and neither do separators inside
/// `if`/`while`/`until`/`for`/`case` bodies, brace groups, subshells,
/// command substitutions, quotes, or heredoc bodies — those all belong to a
/// single compound statement.
///
/// Text the scanner cannot make sense of (unbalanced quoting, unterminated
/// heredoc) is returned as a single statement and left for the shell to
/// judge.
pub fn split_commands(command: &str) -> Vec<String> {
    match try_split(command) {
        Some(parts) => parts,
        None => {
            let trimmed = command.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            }
        }
    }
}

fn try_split(command: &str) -> Option<Vec<String>> {
    let bytes = command.as_bytes();
    let len = bytes.len();

    let mut parts: Vec<String> = Vec::new();
    let mut stack: Vec<Context> = Vec::new();
    // expected closing keywords for open compound constructs, innermost last
    let mut compounds: Vec<&'static str> = Vec::new();
    let mut pending_heredocs: Vec<(String, bool)> = Vec::new();

    let mut stmt_start = 0usize;
    let mut at_cmd_start = true;
    let mut word_boundary = true;
    let mut in_single = false;

    let mut i = 0usize;
    let mut flush = |parts: &mut Vec<String>, start: usize, end: usize| {
        let stmt = command[start..end].trim();
        if !stmt.is_empty() {
            parts.push(stmt.to_string());
        }
    };

    while i < len {
        let c = bytes[i];

        if in_single {
            if c == b'\'' {
                in_single = false;
            }
            i += 1;
            word_boundary = false;
            continue;
        }

        if c == b'\\' {
            // escape consumes the next byte in every context but single quotes
            i += 2;
            word_boundary = false;
            continue;
        }

        match stack.last() {
            Some(Context::DoubleQuote) => {
                match c {
                    b'"' => {
                        stack.pop();
                    }
                    b'`' => stack.push(Context::Backtick),
                    b'$' if i + 1 < len && bytes[i + 1] == b'(' => {
                        stack.push(Context::DollarParen);
                        i += 1;
                    }
                    b'$' if i + 1 < len && bytes[i + 1] == b'{' => {
                        stack.push(Context::DollarBrace);
                        i += 1;
                    }
                    _ => {}
                }
                i += 1;
                continue;
            }
            Some(Context::DollarBrace) => {
                match c {
                    b'}' => {
                        stack.pop();
                    }
                    b'"' => stack.push(Context::DoubleQuote),
                    b'\'' => in_single = true,
                    _ => {}
                }
                i += 1;
                continue;
            }
            Some(Context::Backtick) => {
                if c == b'`' {
                    stack.pop();
                }
                i += 1;
                continue;
            }
            _ => {}
        }

        // code context: top level, subshell, or command substitution
        match c {
            b'\'' => {
                in_single = true;
                word_boundary = false;
                i += 1;
            }
            b'"' => {
                stack.push(Context::DoubleQuote);
                word_boundary = false;
                i += 1;
            }
            b'`' => {
                stack.push(Context::Backtick);
                word_boundary = false;
                i += 1;
            }
            b'#' if word_boundary => {
                while i < len && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'$' if i + 1 < len && bytes[i + 1] == b'(' => {
                stack.push(Context::DollarParen);
                word_boundary = false;
                i += 2;
            }
            b'$' if i + 1 < len && bytes[i + 1] == b'{' => {
                stack.push(Context::DollarBrace);
                word_boundary = false;
                i += 2;
            }
            b'(' => {
                stack.push(Context::Paren);
                at_cmd_start = true;
                word_boundary = true;
                i += 1;
            }
            b')' => {
                // stray `)` is a case-pattern terminator, not a close
                if matches!(stack.last(), Some(Context::Paren | Context::DollarParen)) {
                    stack.pop();
                    word_boundary = false;
                } else {
                    at_cmd_start = true;
                    word_boundary = true;
                }
                i += 1;
            }
            b'{' if word_boundary && i + 1 < len && (bytes[i + 1] as char).is_whitespace() => {
                compounds.push("}");
                word_boundary = true;
                i += 1;
            }
            b'}' if compounds.last() == Some(&"}") && word_boundary => {
                compounds.pop();
                word_boundary = false;
                i += 1;
            }
            b'<' if i + 1 < len && bytes[i + 1] == b'<' => {
                if i + 2 < len && bytes[i + 2] == b'<' {
                    i += 3; // herestring
                } else {
                    let (delim, strip_tabs, next) = read_heredoc_delimiter(command, i + 2)?;
                    pending_heredocs.push((delim, strip_tabs));
                    i = next;
                }
                word_boundary = false;
            }
            b'|' => {
                if i + 1 < len && bytes[i + 1] == b'|' {
                    i += 1;
                }
                at_cmd_start = true;
                word_boundary = true;
                i += 1;
            }
            b'&' => {
                let prev = command[..i].trim_end().as_bytes().last().copied();
                if i + 1 < len && bytes[i + 1] == b'&' {
                    // && joins one compound statement
                    at_cmd_start = true;
                    word_boundary = true;
                    i += 2;
                } else if matches!(prev, Some(b'>' | b'<')) || (i + 1 < len && bytes[i + 1] == b'>')
                {
                    // fd redirection (2>&1, &>file), not a terminator
                    word_boundary = false;
                    i += 1;
                } else if stack.is_empty() && compounds.is_empty() {
                    flush(&mut parts, stmt_start, i);
                    stmt_start = i + 1;
                    at_cmd_start = true;
                    word_boundary = true;
                    i += 1;
                } else {
                    i += 1;
                }
            }
            b';' if stack.is_empty() && compounds.is_empty() => {
                flush(&mut parts, stmt_start, i);
                stmt_start = i + 1;
                at_cmd_start = true;
                word_boundary = true;
                i += 1;
            }
            b'\n' => {
                if !pending_heredocs.is_empty() {
                    i = consume_heredoc_bodies(command, i + 1, &mut pending_heredocs)?;
                    word_boundary = true;
                    continue;
                }
                if stack.is_empty() && compounds.is_empty() {
                    flush(&mut parts, stmt_start, i);
                    stmt_start = i + 1;
                }
                at_cmd_start = true;
                word_boundary = true;
                i += 1;
            }
            b';' | b'\t' | b' ' => {
                // `;` inside a compound or substitution, or plain whitespace
                if c != b';' {
                    word_boundary = true;
                } else {
                    at_cmd_start = true;
                    word_boundary = true;
                }
                i += 1;
            }
            _ if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let word = &command[start..i];
                track_keyword(word, at_cmd_start, &mut compounds);
                // these reserved words put the scanner back at command
                // position, so a compound opener right after them is tracked
                at_cmd_start = matches!(
                    word,
                    "if" | "while" | "until" | "do" | "then" | "else" | "elif" | "function"
                );
                word_boundary = false;
            }
            _ => {
                at_cmd_start = false;
                word_boundary = false;
                i += 1;
            }
        }
    }

    if in_single || !stack.is_empty() || !compounds.is_empty() || !pending_heredocs.is_empty() {
        return None;
    }

    flush(&mut parts, stmt_start, len);
    Some(parts)
}

/// Update the compound-construct stack for one scanned word.
fn track_keyword(word: &str, at_cmd_start: bool, compounds: &mut Vec<&'static str>) {
    match word {
        "if" if at_cmd_start => compounds.push("fi"),
        "while" | "until" | "for" | "select" if at_cmd_start => compounds.push("done"),
        "case" if at_cmd_start => compounds.push("esac"),
        // closers only count at command position; `echo done` is just a word
        "fi" | "done" | "esac" => {
            if at_cmd_start && compounds.last() == Some(&word) {
                compounds.pop();
            }
        }
        _ => {}
    }
}

/// Parse the delimiter word after `<<`. Returns (delimiter, strip-tabs flag,
/// index just past the delimiter), or None if no delimiter is present.
fn read_heredoc_delimiter(command: &str, mut i: usize) -> Option<(String, bool, usize)> {
    let bytes = command.as_bytes();
    let len = bytes.len();
    let strip_tabs = i < len && bytes[i] == b'-';
    if strip_tabs {
        i += 1;
    }
    while i < len && (bytes[i] == b' ' || bytes[i] == b'\t') {
        i += 1;
    }
    let quote = match bytes.get(i) {
        Some(b'\'') => Some(b'\''),
        Some(b'"') => Some(b'"'),
        _ => None,
    };
    if let Some(q) = quote {
        let start = i + 1;
        let mut j = start;
        while j < len && bytes[j] != q {
            j += 1;
        }
        if j >= len {
            return None;
        }
        return Some((command[start..j].to_string(), strip_tabs, j + 1));
    }
    let start = i;
    while i < len && !(bytes[i] as char).is_whitespace() && bytes[i] != b';' {
        i += 1;
    }
    if i == start {
        return None;
    }
    Some((command[start..i].to_string(), strip_tabs, i))
}

/// Skip past the heredoc bodies queued on the current statement. Returns the
/// index of the newline terminating the final delimiter line (or the end of
/// input), so the caller's newline handling still sees a statement boundary
/// there. None if a delimiter never appears (unterminated heredoc).
fn consume_heredoc_bodies(
    command: &str,
    mut i: usize,
    pending: &mut Vec<(String, bool)>,
) -> Option<usize> {
    let mut end_of_last = i;
    for (delim, strip_tabs) in pending.drain(..) {
        loop {
            if i >= command.len() {
                return None;
            }
            let line_end = command[i..]
                .find('\n')
                .map_or(command.len(), |off| i + off);
            let line = &command[i..line_end];
            let candidate = if strip_tabs {
                line.trim_start_matches('\t')
            } else {
                line
            };
            i = (line_end + 1).min(command.len());
            if candidate == delim {
                end_of_last = line_end;
                break;
            }
        }
    }
    Some(end_of_last)
}

/// Escape backslash sequences in unquoted regions so they survive tmux key
/// delivery. tmux consumes one level of backslash when injecting keystrokes,
/// so `\;` typed by the agent must travel as `\\;` to reach bash intact.
/// Quoted regions are passed through untouched.
pub fn escape_special_chars(command: &str) -> String {
    if command.trim().is_empty() {
        return String::new();
    }

    const SPECIALS: &[char] = &[';', '&', '|', '>', '<'];
    let mut out = String::with_capacity(command.len());
    let mut chars = command.chars();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(ch) = chars.next() {
        if in_single {
            out.push(ch);
            if ch == '\'' {
                in_single = false;
            }
            continue;
        }
        if ch == '\\' {
            match chars.next() {
                Some(next) => {
                    if !in_double && SPECIALS.contains(&next) {
                        out.push('\\');
                    }
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            }
            continue;
        }
        match ch {
            '\'' if !in_double => in_single = true,
            '"' => in_double = !in_double,
            _ => {}
        }
        out.push(ch);
    }
    out
}
