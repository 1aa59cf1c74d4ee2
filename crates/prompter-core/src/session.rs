//! AI session adapter: one prompt in, collected text and a session id out.
//!
//! [`AgentSession`] consumes the streaming message interface behind the
//! [`AgentClient`] seam, enforcing the per-task timeout and the run's
//! cancellation token, and mapping transport failures onto the session
//! error kinds the executor's retry loop understands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use prompter_agent::{AgentOptions, ContentBlock, Message, MessageStream};

use crate::error::SessionError;

/// One AI interaction request.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    /// Instruction text for the assistant.
    pub prompt: String,
    /// Optional extra system prompt, passed through verbatim.
    pub system_prompt: Option<String>,
    /// Working directory for the assistant process.
    pub working_directory: Option<PathBuf>,
    /// Conversation to continue, when resuming.
    pub resume_session_id: Option<String>,
}

/// Collected output of one successful interaction.
#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    /// Concatenated assistant text content.
    pub text: String,
    /// Session identifier actually used (new or resumed).
    pub session_id: Option<String>,
}

/// Seam between the orchestrator and the streaming AI interface.
///
/// The production implementation spawns the Claude Code CLI; tests script
/// message streams in memory.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Opens the message stream for one interaction.
    async fn open(&self, request: &AgentRequest) -> Result<MessageStream, SessionError>;
}

/// [`AgentClient`] backed by the Claude Code CLI subprocess transport.
#[derive(Debug, Clone, Default)]
pub struct CliAgentClient {
    /// Model identifier override.
    pub model: Option<String>,
    /// Explicit CLI binary path.
    pub cli_path: Option<PathBuf>,
}

#[async_trait]
impl AgentClient for CliAgentClient {
    async fn open(&self, request: &AgentRequest) -> Result<MessageStream, SessionError> {
        let options = AgentOptions {
            system_prompt: request.system_prompt.clone(),
            cwd: request.working_directory.clone(),
            resume_session_id: request.resume_session_id.clone(),
            model: self.model.clone(),
            cli_path: self.cli_path.clone(),
            ..Default::default()
        };
        Ok(prompter_agent::query(&request.prompt, &options))
    }
}

/// Streams one interaction to completion with timeout and cancellation.
pub struct AgentSession {
    client: Arc<dyn AgentClient>,
    cancel: CancellationToken,
}

impl AgentSession {
    /// Creates a session over the given client and cancellation token.
    pub fn new(client: Arc<dyn AgentClient>, cancel: CancellationToken) -> Self {
        Self { client, cancel }
    }

    /// Sends a prompt and collects the full reply.
    ///
    /// The message stream is consumed to completion on success and dropped
    /// promptly (killing the subprocess) on timeout, cancellation, or
    /// error. When `resume_session_id` is set and the transport fails, the
    /// adapter falls back to a fresh session once, with a warning.
    ///
    /// # Errors
    ///
    /// [`SessionError::TimeoutExceeded`] when `timeout` elapses first,
    /// [`SessionError::Cancelled`] when the token trips, and
    /// [`SessionError::TransportError`] for everything else.
    pub async fn send(
        &self,
        request: &AgentRequest,
        timeout: Option<Duration>,
    ) -> Result<AgentReply, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        match self.send_once(request, timeout).await {
            Err(SessionError::TransportError(e)) if request.resume_session_id.is_some() => {
                warn!(
                    resume_session = ?request.resume_session_id,
                    error = %e,
                    "Could not resume session; falling back to a fresh session",
                );
                let fresh = AgentRequest {
                    resume_session_id: None,
                    ..request.clone()
                };
                self.send_once(&fresh, timeout).await
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        request: &AgentRequest,
        timeout: Option<Duration>,
    ) -> Result<AgentReply, SessionError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut stream = self.client.open(request).await?;

        let mut reply = AgentReply::default();
        let mut saw_result = false;

        let timeout_secs = timeout.map_or(0, |t| t.as_secs());
        loop {
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return Err(SessionError::Cancelled);
                }
                item = next_before(&mut stream, deadline, timeout_secs) => item?,
            };

            let msg = match item {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Err(SessionError::TransportError(e.to_string()));
                }
                None => break,
            };

            match msg {
                Message::System(sys) => {
                    if let Some(id) = sys.session_id {
                        reply.session_id = Some(id);
                    }
                }
                Message::Assistant(assistant) => {
                    if let Some(id) = assistant.session_id {
                        reply.session_id = Some(id);
                    }
                    for block in assistant.message.content {
                        if let ContentBlock::Text { text } = block {
                            reply.text.push_str(&text);
                        }
                    }
                }
                Message::Result(result) => {
                    if result.is_error {
                        return Err(SessionError::TransportError(format!(
                            "assistant reported failure ({})",
                            result.subtype
                        )));
                    }
                    if !result.session_id.is_empty() {
                        reply.session_id = Some(result.session_id);
                    }
                    saw_result = true;
                    break;
                }
                _ => {}
            }
        }

        if !saw_result {
            return Err(SessionError::TransportError(
                "message stream ended without a result".to_string(),
            ));
        }

        // A resumed conversation keeps its identifier even if the stream
        // never restated it.
        if reply.session_id.is_none() {
            reply.session_id = request.resume_session_id.clone();
        }

        debug!(
            chars = reply.text.len(),
            session = ?reply.session_id,
            "Agent reply collected",
        );
        Ok(reply)
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession").finish_non_exhaustive()
    }
}

/// Next stream item, bounded by an optional deadline.
async fn next_before(
    stream: &mut MessageStream,
    deadline: Option<tokio::time::Instant>,
    timeout_secs: u64,
) -> Result<Option<prompter_agent::Result<Message>>, SessionError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, stream.next())
            .await
            .map_err(|_| SessionError::TimeoutExceeded(timeout_secs)),
        None => Ok(stream.next().await),
    }
}
