// ABOUTME: The persistent shell session state machine
//
// Owns one pane, one marker protocol instance, and the cross-call state
// (status, previous output, tracked cwd). `execute` runs the full
// dispatch/poll/classify cycle for a single request and is the only place
// session state transitions happen.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::command::{escape_special_chars, split_commands};
use super::marker::{CommandMetadata, MarkerMatch, MarkerProtocol};
use super::pane::{Pane, PaneError, TmuxPane};
use super::reconcile::{combine_outputs_between_matches, remove_command_echo};
use super::{DEFAULT_NO_CHANGE_TIMEOUT, DEFAULT_POLL_INTERVAL};

/// Guidance appended to every observation that leaves a command running.
const TIMEOUT_HINT: &str = "You may wait longer to see additional output by sending an empty \
     command '', send other commands to interact with the current process, or send keys \
     (\"C-c\", \"C-z\", \"C-d\") to interrupt/kill the command.";

/// Prefix used when an observation continues output already shown for the
/// same in-flight command.
const CONTINUE_PREFIX: &str = "[Below is the output of the previous command.]\n";

/// Delay after session setup keystrokes so the shell applies them before the
/// first real command arrives.
const SETUP_DELAY: Duration = Duration::from_millis(100);

/// Where the session's last command stands. Persists across `execute` calls
/// and decides how the next request is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Command dispatched, no terminal marker seen, no timeout fired yet.
    Continue,
    /// Terminal marker observed; the session is ready for a new command.
    Completed,
    /// Output stopped changing for the configured window; command still runs.
    NoChangeTimeout,
    /// Caller-supplied deadline elapsed; command still runs.
    HardTimeout,
}

/// One shell invocation or input delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Command text. Empty means "retrieve pending output from the running
    /// command".
    pub command: String,
    /// Route the text to the running foreground process (stdin or a
    /// `C-<key>` control key) instead of starting a new command.
    #[serde(default)]
    pub is_input: bool,
    /// Hard deadline for this call. When set, the no-change timeout is
    /// suppressed: the caller has declared they expect silence.
    #[serde(
        default,
        with = "duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl ExecuteRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn input(text: impl Into<String>) -> Self {
        Self {
            command: text.into(),
            is_input: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one `execute` call. Immutable once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandObservation {
    /// Reconciled output attributable to this call.
    pub output: String,
    /// The command as it was sent to the pane, when one was sent.
    pub command: Option<String>,
    /// Exit code of the command; `-1` while the process is still running.
    pub exit_code: i32,
    /// A recoverable request error (nothing was sent to the pane).
    pub error: bool,
    /// The call ended on a timeout path rather than completion.
    pub timeout: bool,
    pub metadata: CommandMetadata,
}

impl CommandObservation {
    /// Observation for a recoverable request error. The pane is untouched.
    pub fn error_text(message: impl Into<String>) -> Self {
        Self {
            output: message.into(),
            command: None,
            exit_code: -1,
            error: true,
            timeout: false,
            metadata: CommandMetadata::default(),
        }
    }

    fn from_parts(
        output: String,
        command: &str,
        metadata: CommandMetadata,
        timeout: bool,
    ) -> Self {
        Self {
            output,
            command: Some(command.to_string()),
            exit_code: metadata.exit_code,
            error: false,
            timeout,
            metadata,
        }
    }

    /// Command id reported by the shell, when one was captured.
    pub fn command_id(&self) -> Option<i64> {
        self.metadata.pid
    }

    /// Render the observation the way the agent loop consumes it: prefix,
    /// output and suffix plus the tracked environment trailer lines.
    pub fn agent_observation(&self) -> String {
        let mut ret = format!(
            "{}{}{}",
            self.metadata.prefix, self.output, self.metadata.suffix
        );
        if !self.metadata.working_dir.is_empty() {
            ret.push_str(&format!(
                "\n[Current working directory: {}]",
                self.metadata.working_dir
            ));
        }
        if let Some(py) = &self.metadata.py_interpreter_path {
            ret.push_str(&format!("\n[Python interpreter: {py}]"));
        }
        if self.metadata.exit_code != -1 {
            ret.push_str(&format!(
                "\n[Command finished with exit code {}]",
                self.metadata.exit_code
            ));
        }
        if self.error {
            ret = format!("[There was an error during command execution.]\n{ret}");
        }
        ret
    }
}

/// Fatal session failures. Recoverable conditions are reported as
/// observations instead, so the agent can adapt in-conversation.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `execute` called before `initialize`
    #[error("Terminal session is not initialized")]
    NotInitialized,

    /// Completion was detected but no marker parsed from the capture: the
    /// sentinel convention itself broke (prompt redefined, shell crashed).
    /// Output reconciliation would be unreliable from here on.
    #[error("Expected at least one marker block in the capture, found none.\n---FULL OUTPUT---\n{capture}\n---END OF OUTPUT---")]
    MarkerProtocolViolation { capture: String },

    /// The terminal surface failed underneath the driver.
    #[error(transparent)]
    Pane(#[from] PaneError),
}

/// Construction-time knobs. Everything optional; defaults match the module
/// constants.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Identity to run the shell as; see `shell_command_for`.
    pub username: Option<String>,
    /// Address-space cap applied to the shell via `ulimit -v`.
    pub max_memory_mb: Option<u64>,
    pub no_change_timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
    pub history_limit: Option<u32>,
}

/// A long-lived shell bound to one pane. One per executor; `&mut self` on
/// `execute` keeps access strictly sequential.
pub struct TerminalSession<P: Pane = TmuxPane> {
    pane: P,
    marker: MarkerProtocol,
    work_dir: PathBuf,
    no_change_timeout: Duration,
    poll_interval: Duration,
    max_memory_mb: Option<u64>,
    prev_status: Option<CommandStatus>,
    prev_output: String,
    cwd: PathBuf,
    initialized: bool,
    closed: bool,
}

impl TerminalSession<TmuxPane> {
    /// Session over a fresh tmux pane in `work_dir`.
    pub fn new(work_dir: impl AsRef<Path>, options: SessionOptions) -> Self {
        let mut pane = TmuxPane::new(work_dir.as_ref(), options.username.as_deref());
        if let Some(limit) = options.history_limit {
            pane = pane.with_history_limit(limit);
        }
        Self::with_pane(pane, work_dir, options)
    }
}

impl<P: Pane> TerminalSession<P> {
    /// Session over a caller-provided pane. This is also the seam alternate
    /// terminal backends and the scripted test pane come through.
    pub fn with_pane(pane: P, work_dir: impl AsRef<Path>, options: SessionOptions) -> Self {
        let work_dir = work_dir.as_ref().to_path_buf();
        Self {
            pane,
            marker: MarkerProtocol::new(),
            cwd: absolutize(&work_dir),
            work_dir,
            no_change_timeout: options.no_change_timeout.unwrap_or(DEFAULT_NO_CHANGE_TIMEOUT),
            poll_interval: options.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL),
            max_memory_mb: options.max_memory_mb,
            prev_status: None,
            prev_output: String::new(),
            initialized: false,
            closed: false,
        }
    }

    /// Replace the marker protocol before initialization. Tests and
    /// alternate backends use this to pin a deterministic sentinel.
    pub fn with_marker(mut self, marker: MarkerProtocol) -> Self {
        self.marker = marker;
        self
    }

    /// Spawn the pane, install the marker prompt, and clear the screen so
    /// the first capture starts empty. Must be called once before `execute`.
    pub async fn initialize(&mut self) -> Result<(), SessionError> {
        self.pane.spawn().await?;
        self.pane
            .send_keys(&self.marker.prompt_export_command(), true)
            .await?;
        sleep(SETUP_DELAY).await;
        if let Some(mb) = self.max_memory_mb {
            // ulimit takes KiB; inherited by everything the shell forks
            self.pane
                .send_keys(&format!("ulimit -v {}", mb * 1024), true)
                .await?;
            sleep(SETUP_DELAY).await;
        }
        self.prev_status = None;
        self.prev_output.clear();
        self.cwd = absolutize(&self.work_dir);
        self.initialized = true;
        self.pane.clear().await?;
        info!("Terminal session initialized in {}", self.cwd.display());
        Ok(())
    }

    /// Last working directory reported by the marker protocol.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Status left behind by the previous `execute` call.
    pub fn status(&self) -> Option<CommandStatus> {
        self.prev_status
    }

    /// Tear down the pane and the process tree inside it. Idempotent.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.pane.kill().await?;
        self.closed = true;
        Ok(())
    }

    /// Run one request through the dispatch/poll/classify cycle.
    pub async fn execute(
        &mut self,
        request: &ExecuteRequest,
    ) -> Result<CommandObservation, SessionError> {
        if !self.initialized {
            return Err(SessionError::NotInitialized);
        }

        let command = request.command.trim().to_string();
        let is_input = request.is_input;
        debug!(
            "Executing request: command={:?} is_input={} timeout={:?}",
            command, is_input, request.timeout
        );

        let in_flight = matches!(
            self.prev_status,
            Some(
                CommandStatus::Continue
                    | CommandStatus::NoChangeTimeout
                    | CommandStatus::HardTimeout
            )
        );

        // Empty and input requests only make sense against a running command.
        if !in_flight {
            if command.is_empty() {
                return Ok(CommandObservation::error_text(
                    "ERROR: No previous running command to retrieve logs from.",
                ));
            }
            if is_input {
                return Ok(CommandObservation::error_text(
                    "ERROR: No previous running command to interact with.",
                ));
            }
        }

        // Visually-separate sequential commands in one request are a caller
        // mistake; catch them before the pane sees anything.
        let statements = split_commands(&command);
        if statements.len() > 1 {
            let listing = statements
                .iter()
                .enumerate()
                .map(|(i, cmd)| format!("({}) {}", i + 1, cmd))
                .collect::<Vec<_>>()
                .join("\n");
            return Ok(CommandObservation::error_text(format!(
                "ERROR: Cannot execute multiple commands at once.\n\
                 Please run each command separately OR chain them into a single command via && or ;\n\
                 Provided commands:\n{listing}"
            )));
        }

        // Baseline: marker count before this request touches the pane.
        let initial_pane_output = self.pane.capture().await?;
        let initial_markers = self.marker.find_all(&initial_pane_output);
        let initial_marker_count = initial_markers.len();
        debug!("Initial marker count: {}", initial_marker_count);

        let start_time = Instant::now();
        let mut last_change_time = start_time;
        let mut last_pane_output = initial_pane_output;

        // A fresh command while the previous one still runs is refused; the
        // input channel is the only way to reach a running process.
        if in_flight
            && !self.marker.ends_with_sentinel(&last_pane_output)
            && !is_input
            && !command.is_empty()
        {
            let raw = combine_outputs_between_matches(&last_pane_output, &initial_markers, false);
            let mut metadata = CommandMetadata {
                suffix: format!(
                    "\n[Your command \"{command}\" is NOT executed. The previous command is still \
                     running - You CANNOT send new commands until the previous command is \
                     completed. By setting `is_input` to `true`, you can interact with the \
                     current process: {TIMEOUT_HINT}]"
                ),
                ..CommandMetadata::default()
            };
            let output = self.reconcile_output(&command, &raw, &mut metadata, CONTINUE_PREFIX);
            return Ok(CommandObservation {
                output,
                command: Some(command),
                exit_code: metadata.exit_code,
                error: true,
                timeout: false,
                metadata,
            });
        }

        // Dispatch. Control keys go through tmux key lookup without Enter;
        // new commands are escaped so backslash sequences survive delivery.
        let command = if !command.is_empty() && !is_input {
            escape_special_chars(&command)
        } else {
            command
        };
        if !command.is_empty() {
            let is_control = is_control_key(&command);
            if is_input {
                debug!("Sending input to running process: {:?}", command);
            } else {
                debug!("Sending command: {:?}", command);
            }
            self.pane.send_keys(&command, !is_control).await?;
        }
        self.prev_status = Some(CommandStatus::Continue);

        loop {
            let cur_pane_output = self.pane.capture().await?;
            let markers = self.marker.find_all(&cur_pane_output);

            if cur_pane_output != last_pane_output {
                last_pane_output = cur_pane_output.clone();
                last_change_time = Instant::now();
            }

            // Completion wins over both timeout checks: either a new marker
            // appeared, or the buffer ends with the sentinel (the baseline
            // markers scrolled out of history).
            if markers.len() > initial_marker_count
                || self.marker.ends_with_sentinel(&cur_pane_output)
            {
                return self
                    .handle_completed(&command, &cur_pane_output, &markers)
                    .await;
            }

            // The caller supplying a deadline means "expect silence": the
            // no-change heuristic is suppressed entirely.
            let is_blocking = request.timeout.is_some();
            if !is_blocking && last_change_time.elapsed() >= self.no_change_timeout {
                return Ok(self.handle_no_change_timeout(&command, &cur_pane_output, &markers));
            }

            if let Some(timeout) = request.timeout {
                if start_time.elapsed() >= timeout {
                    debug!("Hard timeout after {:?}", timeout);
                    return Ok(self.handle_hard_timeout(
                        &command,
                        &cur_pane_output,
                        &markers,
                        timeout,
                    ));
                }
            }

            sleep(self.poll_interval).await;
        }
    }

    async fn handle_completed(
        &mut self,
        command: &str,
        pane_content: &str,
        markers: &[MarkerMatch],
    ) -> Result<CommandObservation, SessionError> {
        let Some(last) = markers.last() else {
            return Err(SessionError::MarkerProtocolViolation {
                capture: pane_content.to_string(),
            });
        };
        let mut metadata = last.metadata.clone();

        // One visible marker on completion means the terminating marker is
        // the only survivor: the output above it is a truncated tail.
        let content_before_last = markers.len() == 1;

        if !metadata.working_dir.is_empty() && Path::new(&metadata.working_dir) != self.cwd {
            self.cwd = PathBuf::from(&metadata.working_dir);
        }

        let raw = combine_outputs_between_matches(pane_content, markers, content_before_last);
        if content_before_last {
            let num_lines = raw.lines().count();
            metadata.prefix = format!(
                "[Previous command outputs are truncated. Showing the last {num_lines} lines of \
                 the output below.]\n"
            );
        }
        metadata.suffix = if is_control_key(command) {
            format!(
                "\n[The command completed with exit code {}. CTRL+{} was sent.]",
                metadata.exit_code,
                command
                    .trim()
                    .chars()
                    .last()
                    .unwrap_or('?')
                    .to_ascii_uppercase()
            )
        } else {
            format!(
                "\n[The command completed with exit code {}.]",
                metadata.exit_code
            )
        };
        let output = self.reconcile_output(command, &raw, &mut metadata, "");

        self.prev_status = Some(CommandStatus::Completed);
        self.prev_output.clear();
        // bound memory and keep stale markers out of the next round
        self.pane.clear().await?;

        Ok(CommandObservation::from_parts(
            output, command, metadata, false,
        ))
    }

    fn handle_no_change_timeout(
        &mut self,
        command: &str,
        pane_content: &str,
        markers: &[MarkerMatch],
    ) -> CommandObservation {
        self.prev_status = Some(CommandStatus::NoChangeTimeout);
        if markers.len() != 1 {
            warn!(
                "Expected exactly one marker block before the command executed, got {}",
                markers.len()
            );
        }
        let raw = combine_outputs_between_matches(pane_content, markers, false);
        let mut metadata = CommandMetadata {
            suffix: format!(
                "\n[The command has no new output after {} seconds. {TIMEOUT_HINT}]",
                format_seconds(self.no_change_timeout)
            ),
            ..CommandMetadata::default()
        };
        let output = self.reconcile_output(command, &raw, &mut metadata, CONTINUE_PREFIX);
        CommandObservation::from_parts(output, command, metadata, true)
    }

    fn handle_hard_timeout(
        &mut self,
        command: &str,
        pane_content: &str,
        markers: &[MarkerMatch],
        timeout: Duration,
    ) -> CommandObservation {
        self.prev_status = Some(CommandStatus::HardTimeout);
        if markers.len() != 1 {
            warn!(
                "Expected exactly one marker block before the command executed, got {}",
                markers.len()
            );
        }
        let raw = combine_outputs_between_matches(pane_content, markers, false);
        let mut metadata = CommandMetadata {
            suffix: format!(
                "\n[The command timed out after {} seconds. {TIMEOUT_HINT}]",
                format_seconds(timeout)
            ),
            ..CommandMetadata::default()
        };
        let output = self.reconcile_output(command, &raw, &mut metadata, CONTINUE_PREFIX);
        CommandObservation::from_parts(output, command, metadata, true)
    }

    /// Remove output already returned for the same in-flight command, then
    /// the command's own echo. Records the raw capture so the next poll can
    /// dedup against it.
    fn reconcile_output(
        &mut self,
        command: &str,
        raw: &str,
        metadata: &mut CommandMetadata,
        continue_prefix: &str,
    ) -> String {
        let output = if self.prev_output.is_empty() {
            raw.to_string()
        } else {
            let stripped = raw.strip_prefix(self.prev_output.as_str()).unwrap_or(raw);
            metadata.prefix = continue_prefix.to_string();
            stripped.to_string()
        };
        self.prev_output = raw.to_string();
        remove_command_echo(&output, command).trim_end().to_string()
    }
}

fn is_control_key(command: &str) -> bool {
    let trimmed = command.trim();
    trimmed.len() == 3 && trimmed.starts_with("C-")
}

fn format_seconds(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        duration.as_secs_f64().to_string()
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

mod duration_secs {
    //! Serialize an optional Duration as fractional seconds, the shape the
    //! tool boundary exchanges.

    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_control_key() {
        assert!(is_control_key("C-c"));
        assert!(is_control_key(" C-d "));
        assert!(!is_control_key("C-"));
        assert!(!is_control_key("C-cc"));
        assert!(!is_control_key("echo C-c"));
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(Duration::from_secs(30)), "30");
        assert_eq!(format_seconds(Duration::from_millis(1500)), "1.5");
    }

    #[test]
    fn test_error_observation_shape() {
        let obs = CommandObservation::error_text("ERROR: nope");
        assert!(obs.error);
        assert_eq!(obs.exit_code, -1);
        assert_eq!(obs.command, None);
        assert!(!obs.timeout);
        assert_eq!(obs.metadata.prefix, "");
        assert_eq!(obs.metadata.suffix, "");
    }

    #[test]
    fn test_agent_observation_rendering() {
        let mut obs = CommandObservation::error_text("ERROR: nope");
        let rendered = obs.agent_observation();
        assert!(rendered.starts_with("[There was an error during command execution.]\n"));
        assert!(rendered.contains("ERROR: nope"));

        obs.error = false;
        obs.exit_code = 0;
        obs.metadata.exit_code = 0;
        obs.metadata.working_dir = "/workspace".to_string();
        obs.metadata.py_interpreter_path = Some("/usr/bin/python".to_string());
        let rendered = obs.agent_observation();
        assert!(rendered.contains("[Current working directory: /workspace]"));
        assert!(rendered.contains("[Python interpreter: /usr/bin/python]"));
        assert!(rendered.contains("[Command finished with exit code 0]"));
    }

    #[test]
    fn test_request_serde_round_trip() {
        let request = ExecuteRequest::new("sleep 5").with_timeout(Duration::from_secs(2));
        let json = serde_json::to_string(&request).expect("serializes");
        assert!(json.contains("\"timeout\":2.0"));
        let back: ExecuteRequest = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(back.command, "sleep 5");
        assert_eq!(back.timeout, Some(Duration::from_secs(2)));
        assert!(!back.is_input);
    }

    #[test]
    fn test_request_deserializes_without_optional_fields() {
        let request: ExecuteRequest =
            serde_json::from_str("{\"command\": \"ls\"}").expect("deserializes");
        assert_eq!(request.command, "ls");
        assert!(!request.is_input);
        assert_eq!(request.timeout, None);
    }
}
