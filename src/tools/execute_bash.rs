// ABOUTME: The execute_bash tool: a persistent shell session behind a
// structured call interface
//
// Thin by design. The session driver does the real work; this layer owns
// one initialized session per tool instance and hands observations back in
// the shape the agent loop consumes.

use std::path::Path;

use crate::terminal::{
    CommandObservation, ExecuteRequest, SessionError, SessionOptions, TerminalSession,
};

pub const TOOL_NAME: &str = "execute_bash";

/// Agent-facing usage notes shipped with the tool schema.
pub const TOOL_DESCRIPTION: &str = "\
Execute a bash command in the terminal within a persistent shell session.

* One command at a time. Chain sequential commands into a single statement \
with `&&` or `;`.
* Environment variables, virtual environments, and the working directory \
persist between commands.
* If a command returns exit code `-1`, it is still running. Send an empty \
`command` to retrieve additional logs, set `is_input` to true to write to \
the process's stdin, or send a control key such as `C-c` to interrupt it.
* For commands with a known long duration, set the `timeout` parameter \
instead of waiting for the no-output pause.
* For commands that run indefinitely, start them in the background and \
redirect output to a file, e.g. `python3 app.py > server.log 2>&1 &`.";

/// One persistent shell session wrapped as an agent tool.
pub struct ExecuteBashTool {
    session: TerminalSession,
}

impl ExecuteBashTool {
    /// Spawn and initialize the backing session. The session lives until
    /// [`close`](Self::close) or drop.
    pub async fn new(
        working_dir: impl AsRef<Path>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let mut session = TerminalSession::new(working_dir, options);
        session.initialize().await?;
        Ok(Self { session })
    }

    /// Run one request through the session.
    pub async fn call(
        &mut self,
        request: &ExecuteRequest,
    ) -> Result<CommandObservation, SessionError> {
        self.session.execute(request).await
    }

    /// Working directory the session last reported.
    pub fn cwd(&self) -> &Path {
        self.session.cwd()
    }

    pub async fn close(&mut self) -> Result<(), SessionError> {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_description_covers_the_interaction_channels() {
        assert_eq!(TOOL_NAME, "execute_bash");
        assert!(TOOL_DESCRIPTION.contains("is_input"));
        assert!(TOOL_DESCRIPTION.contains("C-c"));
        assert!(TOOL_DESCRIPTION.contains("timeout"));
    }
}
