// ABOUTME: Shared test utilities: a scripted pane for driving the session
// state machine without tmux

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use shellbox::terminal::{Pane, PaneError};

/// Token every scripted test pins via `MarkerProtocol::with_token`.
pub const TEST_TOKEN: &str = "ITEST";

/// Render a marker block the way the shell would print it for `TEST_TOKEN`.
pub fn marker_block(exit_code: i32, working_dir: &str) -> String {
    format!(
        "###{TEST_TOKEN}###\n{{\"pid\": \"\", \"exit_code\": \"{exit_code}\", \
         \"username\": \"tester\", \"hostname\": \"testbox\", \
         \"working_dir\": \"{working_dir}\", \"py_interpreter_path\": \"\"}}\n\
         ###{TEST_TOKEN}-END###"
    )
}

#[derive(Default)]
pub struct ScriptState {
    /// Captures handed out in order; when exhausted the last one repeats,
    /// which models a pane whose content stopped changing.
    pub captures: VecDeque<String>,
    pub last_capture: String,
    /// Every send_keys call as (text, press_enter).
    pub sent: Vec<(String, bool)>,
    pub clears: usize,
    pub kills: usize,
}

/// In-memory [`Pane`] driven by a pre-seeded capture script. Tests keep a
/// clone to push captures and inspect what the driver sent.
#[derive(Clone, Default)]
pub struct ScriptedPane {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedPane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().expect("script state lock")
    }

    pub fn push_capture(&self, content: impl Into<String>) {
        self.state().captures.push_back(content.into());
    }

    /// Commands the driver actually sent, excluding session setup traffic
    /// (the prompt override and the C-l from clears).
    pub fn sent_commands(&self) -> Vec<String> {
        self.state()
            .sent
            .iter()
            .filter(|(text, _)| !text.starts_with("export PROMPT_COMMAND") && text.as_str() != "C-l")
            .map(|(text, _)| text.clone())
            .collect()
    }
}

impl Pane for ScriptedPane {
    async fn spawn(&mut self) -> Result<(), PaneError> {
        Ok(())
    }

    async fn send_keys(&mut self, text: &str, press_enter: bool) -> Result<(), PaneError> {
        self.state().sent.push((text.to_string(), press_enter));
        Ok(())
    }

    async fn capture(&mut self) -> Result<String, PaneError> {
        let mut state = self.state();
        if let Some(next) = state.captures.pop_front() {
            state.last_capture = next.clone();
            Ok(next)
        } else {
            Ok(state.last_capture.clone())
        }
    }

    async fn clear(&mut self) -> Result<(), PaneError> {
        let mut state = self.state();
        state.clears += 1;
        state.last_capture.clear();
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), PaneError> {
        self.state().kills += 1;
        Ok(())
    }
}
