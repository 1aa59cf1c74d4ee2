//! Spawn options for the Claude CLI transport.

use std::path::PathBuf;

/// Options controlling how the Claude Code CLI is spawned for one query.
///
/// # Example
///
/// ```
/// use prompter_agent::AgentOptions;
///
/// let options = AgentOptions {
///     system_prompt: Some("You are a build fixer.".to_string()),
///     resume_session_id: Some("sess-123".to_string()),
///     ..Default::default()
/// };
/// assert!(options.model.is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    /// Appended to the CLI's system prompt verbatim.
    pub system_prompt: Option<String>,

    /// Working directory for the CLI process.
    pub cwd: Option<PathBuf>,

    /// Session identifier of a previous conversation to continue.
    pub resume_session_id: Option<String>,

    /// Model identifier override (e.g. `"claude-sonnet-4-5"`).
    pub model: Option<String>,

    /// Explicit path to the `claude` binary, bypassing PATH search.
    pub cli_path: Option<PathBuf>,

    /// Extra `--key value` (or bare `--key`) arguments passed through.
    pub extra_args: Vec<(String, Option<String>)>,

    /// Additional environment variables for the CLI process.
    pub env: Vec<(String, String)>,
}
