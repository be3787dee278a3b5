// ABOUTME: Tmux-backed pane surface the session driver types into
//
// One pane per session: spawned detached with an oversized geometry and a
// deep scrollback, driven entirely through the tmux CLI. The trait exists so
// the state machine can be exercised against a scripted pane in tests and so
// alternate terminal backends stay possible without touching the driver.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DEFAULT_HISTORY_LIMIT, DEFAULT_PANE_HEIGHT, DEFAULT_PANE_WIDTH};

/// Errors from the terminal surface.
#[derive(Debug, Error)]
pub enum PaneError {
    /// tmux binary is not installed or not on PATH
    #[error("tmux binary not found on PATH: {0}")]
    TmuxNotFound(String),

    /// Failed to launch the tmux client process
    #[error("Failed to run tmux: {0}")]
    Io(#[from] std::io::Error),

    /// tmux accepted the invocation but reported failure
    #[error("tmux {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Operation attempted before the pane was spawned
    #[error("Pane has not been spawned")]
    NotSpawned,

    /// Working directory is not representable as a tmux argument
    #[error("Invalid working directory: {0}")]
    InvalidWorkDir(PathBuf),
}

/// A persistent terminal surface: keystrokes in, buffer text out.
#[allow(async_fn_in_trait)]
pub trait Pane {
    /// Create the backing terminal session. Must be called once before any
    /// other operation.
    async fn spawn(&mut self) -> Result<(), PaneError>;

    /// Deliver text to the foreground process. `press_enter` appends the
    /// Enter key; control keys are sent without it.
    async fn send_keys(&mut self, text: &str, press_enter: bool) -> Result<(), PaneError>;

    /// Capture the full scrollback plus visible buffer as joined,
    /// right-trimmed lines.
    async fn capture(&mut self) -> Result<String, PaneError>;

    /// Clear the visible screen and the scrollback history so the next
    /// capture starts from an empty buffer.
    async fn clear(&mut self) -> Result<(), PaneError>;

    /// Tear down the terminal session and everything running in it.
    /// Idempotent.
    async fn kill(&mut self) -> Result<(), PaneError>;
}

/// Shell invocation for the requested identity. A username other than the
/// current user is entered through a fresh `su` login; otherwise the pane
/// runs a plain bash.
pub fn shell_command_for(username: Option<&str>) -> String {
    match username {
        Some(user) if Some(user) != current_username().as_deref() => {
            format!("su {user} -")
        }
        _ => "/bin/bash".to_string(),
    }
}

fn current_username() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
}

/// Tmux implementation of [`Pane`].
pub struct TmuxPane {
    session_name: String,
    work_dir: PathBuf,
    shell_command: String,
    history_limit: u32,
    width: u32,
    height: u32,
    /// pane id (`%N`) of the working window, valid once spawned
    target: Option<String>,
    killed: bool,
}

impl std::fmt::Debug for TmuxPane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmuxPane")
            .field("session_name", &self.session_name)
            .field("work_dir", &self.work_dir)
            .field("shell_command", &self.shell_command)
            .field("target", &self.target)
            .finish()
    }
}

impl TmuxPane {
    pub fn new(work_dir: &Path, username: Option<&str>) -> Self {
        let session_name = format!(
            "shellbox-{}-{}",
            username.unwrap_or("default"),
            Uuid::new_v4()
        );
        Self {
            session_name,
            work_dir: work_dir.to_path_buf(),
            shell_command: shell_command_for(username),
            history_limit: DEFAULT_HISTORY_LIMIT,
            width: DEFAULT_PANE_WIDTH,
            height: DEFAULT_PANE_HEIGHT,
            target: None,
            killed: false,
        }
    }

    /// Override the scrollback depth before spawning.
    pub fn with_history_limit(mut self, limit: u32) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Run one tmux command and fail on a non-zero exit.
    async fn tmux(&self, args: &[&str]) -> Result<String, PaneError> {
        let output = Command::new("tmux").args(args).output().await?;
        if !output.status.success() {
            return Err(PaneError::CommandFailed {
                command: args.first().copied().unwrap_or("<none>").to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn target(&self) -> Result<&str, PaneError> {
        self.target.as_deref().ok_or(PaneError::NotSpawned)
    }
}

impl Pane for TmuxPane {
    async fn spawn(&mut self) -> Result<(), PaneError> {
        which::which("tmux").map_err(|e| PaneError::TmuxNotFound(e.to_string()))?;

        let work_dir = self
            .work_dir
            .to_str()
            .ok_or_else(|| PaneError::InvalidWorkDir(self.work_dir.clone()))?
            .to_string();
        let width = self.width.to_string();
        let height = self.height.to_string();

        debug!(
            "Spawning tmux session '{}' with shell: {}",
            self.session_name, self.shell_command
        );
        self.tmux(&[
            "new-session",
            "-d",
            "-s",
            &self.session_name,
            "-c",
            &work_dir,
            "-x",
            &width,
            "-y",
            &height,
        ])
        .await?;

        // The initial window was created before the history limit applied,
        // so raise the limit, open a fresh window for the real shell, and
        // drop the initial one.
        let history_limit = self.history_limit.to_string();
        self.tmux(&[
            "set-option",
            "-t",
            &self.session_name,
            "history-limit",
            &history_limit,
        ])
        .await?;

        let initial_window = self
            .tmux(&["list-windows", "-t", &self.session_name, "-F", "#{window_id}"])
            .await?
            .trim()
            .to_string();

        let pane_id = self
            .tmux(&[
                "new-window",
                "-t",
                &self.session_name,
                "-n",
                "shell",
                "-c",
                &work_dir,
                "-P",
                "-F",
                "#{pane_id}",
                &self.shell_command,
            ])
            .await?
            .trim()
            .to_string();
        self.target = Some(pane_id);

        if !initial_window.is_empty() {
            self.tmux(&["kill-window", "-t", &initial_window]).await?;
        }

        info!(
            "Spawned tmux session '{}' (pane {})",
            self.session_name,
            self.target().unwrap_or("?")
        );
        Ok(())
    }

    async fn send_keys(&mut self, text: &str, press_enter: bool) -> Result<(), PaneError> {
        let target = self.target()?.to_string();
        // Sent without -l on purpose: control keys like C-c must go through
        // tmux key-name lookup, and plain text falls through to literal
        // character injection. Newlines are typed as Enter keystrokes.
        let mut lines = text.split('\n').peekable();
        while let Some(line) = lines.next() {
            if !line.is_empty() {
                self.tmux(&["send-keys", "-t", &target, "--", line]).await?;
            }
            if lines.peek().is_some() {
                self.tmux(&["send-keys", "-t", &target, "Enter"]).await?;
            }
        }
        if press_enter {
            self.tmux(&["send-keys", "-t", &target, "Enter"]).await?;
        }
        Ok(())
    }

    async fn capture(&mut self) -> Result<String, PaneError> {
        let target = self.target()?.to_string();
        let raw = self
            .tmux(&["capture-pane", "-t", &target, "-J", "-p", "-S", "-"])
            .await?;
        // join with per-line right trim so wrapped captures do not leak
        // trailing pad spaces into output comparisons
        Ok(raw
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn clear(&mut self) -> Result<(), PaneError> {
        self.send_keys("C-l", false).await?;
        sleep(Duration::from_millis(100)).await;
        let target = self.target()?.to_string();
        self.tmux(&["clear-history", "-t", &target]).await?;
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), PaneError> {
        if self.killed || self.target.is_none() {
            self.killed = true;
            return Ok(());
        }
        if let Err(err) = self
            .tmux(&["kill-session", "-t", &self.session_name])
            .await
        {
            warn!("Failed to kill tmux session '{}': {}", self.session_name, err);
        } else {
            info!("Killed tmux session '{}'", self.session_name);
        }
        self.killed = true;
        Ok(())
    }
}

impl Drop for TmuxPane {
    fn drop(&mut self) {
        // safety net for callers that never reached close(); synchronous on
        // purpose since Drop cannot await
        if !self.killed && self.target.is_some() {
            let _ = std::process::Command::new("tmux")
                .args(["kill-session", "-t", &self.session_name])
                .output();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_command_for_current_user_is_plain_bash() {
        assert_eq!(shell_command_for(None), "/bin/bash");
        if let Some(me) = current_username() {
            assert_eq!(shell_command_for(Some(me.as_str())), "/bin/bash");
        }
    }

    #[test]
    fn test_shell_command_for_other_user_uses_su() {
        assert_eq!(
            shell_command_for(Some("shellbox-nonexistent-user")),
            "su shellbox-nonexistent-user -"
        );
    }

    #[test]
    fn test_session_names_are_unique() {
        let a = TmuxPane::new(Path::new("/tmp"), None);
        let b = TmuxPane::new(Path::new("/tmp"), None);
        assert_ne!(a.session_name(), b.session_name());
        assert!(a.session_name().starts_with("shellbox-default-"));
    }

    #[test]
    fn test_operations_require_spawn() {
        let pane = TmuxPane::new(Path::new("/tmp"), None);
        assert!(matches!(pane.target(), Err(PaneError::NotSpawned)));
    }
}
