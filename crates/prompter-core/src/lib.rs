//! Prompter core execution engine.
//!
//! Drives an AI coding assistant through declaratively configured tasks and
//! verifies each task's effect with a local command.
//!
//! # Architecture
//!
//! - [`PrompterConfig`](config::PrompterConfig) loads and validates the TOML
//!   configuration (settings + ordered task list)
//! - [`TaskGraph`](graph::TaskGraph) validates `depends_on` and answers
//!   level/critical-path/ready queries
//! - [`StateStore`](state::StateStore) is the lock-protected, crash-safe
//!   record of per-task status and session ids
//! - [`AgentSession`](session::AgentSession) collects the streaming AI reply
//!   with timeout and cancellation, behind the
//!   [`AgentClient`](session::AgentClient) seam
//! - [`Verifier`](verify::Verifier) judges a task's effect via subprocess
//! - [`TaskExecutor`](executor::TaskExecutor) runs one task's retry loop
//! - [`ParallelCoordinator`](coordinator::ParallelCoordinator) schedules the
//!   DAG under the parallelism cap; the
//!   [`SequentialRunner`](runner::SequentialRunner) walks the list with
//!   named jumps when parallelism is off

pub mod config;
pub mod coordinator;
mod error;
pub mod executor;
pub mod graph;
pub mod pool;
pub mod progress;
pub mod runner;
pub mod session;
pub mod state;
pub mod verify;

pub use config::{ProgressMode, PrompterConfig, RunSettings, TaskConfig};
pub use coordinator::ParallelCoordinator;
pub use error::{CoreError, SessionError};
pub use executor::{FlowDecision, TaskExecutor, TaskReport, flow_decision};
pub use graph::TaskGraph;
pub use pool::ResourcePool;
pub use progress::{RunEvent, RunSummary};
pub use runner::SequentialRunner;
pub use session::{AgentClient, AgentReply, AgentRequest, AgentSession, CliAgentClient};
pub use state::{DEFAULT_STATE_FILE, RunRecord, StateStore, TaskState, TaskStatus};
pub use verify::{Verifier, VerifyResult};
