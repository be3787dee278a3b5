// ABOUTME: Persistent tmux-backed terminal session driver
//
// This module is the core of the crate: an agent-facing shell executor that
// keeps one long-lived tmux pane per session, detects command completion via
// an out-of-band prompt marker, and classifies every execution into
// completed / no-change-timeout / hard-timeout / still-running.
//
// Layout mirrors the data flow:
// - marker: the prompt sentinel protocol (render + scan + parse)
// - pane: the tmux surface (spawn, send keystrokes, capture, clear)
// - command: pre-flight splitting and escaping of submitted command text
// - reconcile: slicing captured text down to one command's output
// - session: the state machine tying it all together

use std::time::Duration;

pub mod command;
pub mod marker;
pub mod pane;
pub mod reconcile;
pub mod session;

pub use marker::{CommandMetadata, MarkerMatch, MarkerProtocol};
pub use pane::{Pane, PaneError, TmuxPane};
pub use session::{
    CommandObservation, CommandStatus, ExecuteRequest, SessionError, SessionOptions,
    TerminalSession,
};

/// How long a command may produce no new output before the driver gives
/// control back to the caller, when no explicit timeout was requested.
pub const DEFAULT_NO_CHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between pane captures while waiting for a command to finish.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Scrollback depth configured on the pane at spawn. Large enough that the
/// single-visible-marker truncation case stays rare, not impossible.
pub const DEFAULT_HISTORY_LIMIT: u32 = 10_000;

/// Pane geometry. Oversized on purpose so long lines are not wrapped by the
/// terminal before capture joins them back together.
pub const DEFAULT_PANE_WIDTH: u32 = 1000;
pub const DEFAULT_PANE_HEIGHT: u32 = 1000;
