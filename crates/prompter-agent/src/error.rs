//! Error types for the agent transport.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the Claude CLI transport.
#[derive(Debug, Error)]
pub enum Error {
    /// The Claude Code CLI binary could not be located.
    #[error("Claude CLI not found: {0}")]
    CliNotFound(String),

    /// The CLI process exited with a non-zero status.
    #[error("Claude CLI exited with code {exit_code}{}", stderr_suffix(.stderr))]
    Process {
        /// Process exit code (`-1` when killed by a signal).
        exit_code: i32,
        /// Captured stderr output, if any.
        stderr: Option<String>,
    },

    /// A stream line could not be decoded.
    #[error("Malformed message from CLI: {0}")]
    Json(#[from] serde_json::Error),

    /// Spawning or reading the subprocess failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr {
        Some(s) if !s.is_empty() => format!(": {s}"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_include_stderr_in_process_error() {
        let err = Error::Process {
            exit_code: 1,
            stderr: Some("No conversation found".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("code 1"));
        assert!(msg.contains("No conversation found"));
    }

    #[test]
    fn test_should_omit_empty_stderr_from_process_error() {
        let err = Error::Process {
            exit_code: 2,
            stderr: None,
        };
        assert_eq!(err.to_string(), "Claude CLI exited with code 2");
    }
}
