//! Streaming subprocess transport for the Claude Code CLI.
//!
//! Spawns `claude -p --output-format stream-json`, reads NDJSON events
//! from stdout, and maps them to typed [`Message`] values. The orchestrator
//! core consumes only assistant text and the session identifier; tool-use
//! metadata is carried through untouched for callers that want it.

mod error;
mod options;
mod transport;
mod types;

pub use error::{Error, Result};
pub use options::AgentOptions;
pub use transport::{find_claude_cli, query};
pub use types::{
    AssistantMessage, ContentBlock, Message, MessageStream, ResultMessage, SystemMessage,
    parse_message,
};
