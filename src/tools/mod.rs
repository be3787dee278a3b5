// ABOUTME: Tool adapters exposing the terminal core to the agent loop
//
// Each adapter owns its execution resource and translates between the
// structured request/observation envelope the agent consumes and the
// session driver underneath.

pub mod execute_bash;

pub use execute_bash::ExecuteBashTool;
