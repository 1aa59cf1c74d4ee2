//! Error types for the core engine.

use thiserror::Error;

/// Errors that invalidate a run or a single attempt.
///
/// Attempt-scoped errors (`Session`, `VerificationFailed`) are routed
/// through the executor's flow rules; run-scoped errors (`Config`,
/// `State`, `RunawayLoop`, `DeadlockDetected`) terminate the run.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Structural or validation problems in the configuration.
    /// Accumulates every issue found, one per line.
    #[error("Configuration errors:\n{}", .0.join("\n"))]
    Config(Vec<String>),

    /// Malformed or unreadable state file; recovery is an explicit clear.
    #[error("State error: {0}")]
    State(String),

    /// Failure of a single AI interaction.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The verify command did not return the expected exit code.
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// The per-run dispatch ceiling was hit.
    #[error("Maximum iteration limit ({limit}) reached while running task '{task}'")]
    RunawayLoop {
        /// Configured ceiling.
        limit: u32,
        /// Task being dispatched when the ceiling was hit.
        task: String,
    },

    /// Tasks remain pending with no path to becoming ready.
    #[error("Deadlock detected: tasks {} cannot become ready", .0.join(", "))]
    DeadlockDetected(Vec<String>),

    /// Filesystem failure outside the state store's tolerant paths.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of one AI session interaction.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The per-task timeout elapsed before the assistant finished.
    #[error("AI session timed out after {0} seconds")]
    TimeoutExceeded(u64),

    /// The cancellation token was tripped mid-interaction.
    #[error("AI session cancelled")]
    Cancelled,

    /// Any other failure surfaced by the underlying interface.
    #[error("AI transport error: {0}")]
    TransportError(String),
}
