//! Typed messages decoded from the CLI's `stream-json` output.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Boxed message stream returned by [`query`](crate::query).
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// One event from the CLI's NDJSON stream.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Message {
    /// Session bootstrap metadata (`type: "system"`).
    System(SystemMessage),
    /// An assistant turn with content blocks.
    Assistant(AssistantMessage),
    /// Terminal result carrying the session id and metrics.
    Result(ResultMessage),
}

/// `type: "system"` event; the `init` subtype reveals the session id first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMessage {
    /// Event subtype (e.g. `"init"`).
    #[serde(default)]
    pub subtype: String,
    /// Session identifier, present on `init`.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `type: "assistant"` event wrapping the API message body.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    /// The wrapped message with its content blocks.
    pub message: MessageBody,
    /// Session this turn belongs to.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Inner message body of an assistant event.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageBody {
    /// Ordered content blocks of the turn.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// A single content block inside an assistant message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ContentBlock {
    /// Plain text content.
    Text {
        /// The text fragment.
        text: String,
    },
    /// A tool invocation; carried through but unused by the orchestrator.
    ToolUse {
        /// Tool name (e.g. `"Bash"`).
        name: String,
        /// Raw tool input.
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Anything this crate does not model explicitly.
    #[serde(other)]
    Other,
}

/// `type: "result"` event closing the stream.
///
/// # Example
///
/// ```
/// use prompter_agent::ResultMessage;
///
/// let raw = serde_json::json!({
///     "subtype": "success",
///     "is_error": false,
///     "num_turns": 3,
///     "session_id": "sess-1",
///     "total_cost_usd": 0.07
/// });
/// let result: ResultMessage = serde_json::from_value(raw).unwrap();
/// assert_eq!(result.session_id, "sess-1");
/// assert!(!result.is_error);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    /// Result subtype (`"success"`, `"error_during_execution"`, ...).
    #[serde(default)]
    pub subtype: String,
    /// Whether the CLI reported the run as failed.
    #[serde(default)]
    pub is_error: bool,
    /// Number of conversation turns used.
    #[serde(default)]
    pub num_turns: u32,
    /// Session identifier of the conversation.
    #[serde(default)]
    pub session_id: String,
    /// Cumulative cost in USD, when reported.
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    /// Raw token usage object, when reported.
    #[serde(default)]
    pub usage: Option<serde_json::Value>,
    /// Final result text, when reported.
    #[serde(default)]
    pub result: Option<String>,
}

/// Decodes one NDJSON line into a [`Message`].
///
/// Returns `Ok(None)` for event types the orchestrator does not consume
/// (user echoes, stream deltas, control traffic) so callers can skip them.
pub fn parse_message(value: &serde_json::Value) -> Result<Option<Message>> {
    let msg_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match msg_type {
        "system" => {
            let msg: SystemMessage = serde_json::from_value(value.clone())?;
            Ok(Some(Message::System(msg)))
        }
        "assistant" => {
            let msg: AssistantMessage = serde_json::from_value(value.clone())?;
            Ok(Some(Message::Assistant(msg)))
        }
        "result" => {
            let msg: ResultMessage = serde_json::from_value(value.clone())?;
            Ok(Some(Message::Result(msg)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_parse_system_init_message() {
        let value = serde_json::json!({
            "type": "system",
            "subtype": "init",
            "session_id": "sess-abc",
            "model": "claude-sonnet-4-5"
        });
        let msg = parse_message(&value).unwrap().unwrap();
        match msg {
            Message::System(sys) => {
                assert_eq!(sys.subtype, "init");
                assert_eq!(sys.session_id.as_deref(), Some("sess-abc"));
            }
            other => panic!("expected system message, got {other:?}"),
        }
    }

    #[test]
    fn test_should_parse_assistant_text_blocks() {
        let value = serde_json::json!({
            "type": "assistant",
            "session_id": "sess-abc",
            "message": {
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "Fixed the warnings."},
                    {"type": "tool_use", "id": "tu_1", "name": "Bash",
                     "input": {"command": "cargo build"}}
                ]
            }
        });
        let msg = parse_message(&value).unwrap().unwrap();
        match msg {
            Message::Assistant(a) => {
                assert_eq!(a.message.content.len(), 2);
                assert!(matches!(
                    &a.message.content[0],
                    ContentBlock::Text { text } if text == "Fixed the warnings."
                ));
                assert!(matches!(
                    &a.message.content[1],
                    ContentBlock::ToolUse { name, .. } if name == "Bash"
                ));
            }
            other => panic!("expected assistant message, got {other:?}"),
        }
    }

    #[test]
    fn test_should_parse_result_message() {
        let value = serde_json::json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "num_turns": 4,
            "session_id": "sess-abc",
            "total_cost_usd": 0.12,
            "result": "done"
        });
        let msg = parse_message(&value).unwrap().unwrap();
        match msg {
            Message::Result(r) => {
                assert_eq!(r.session_id, "sess-abc");
                assert_eq!(r.num_turns, 4);
                assert_eq!(r.result.as_deref(), Some("done"));
            }
            other => panic!("expected result message, got {other:?}"),
        }
    }

    #[test]
    fn test_should_skip_unknown_event_types() {
        let value = serde_json::json!({"type": "user", "message": {}});
        assert!(parse_message(&value).unwrap().is_none());

        let value = serde_json::json!({"type": "stream_event", "event": {}});
        assert!(parse_message(&value).unwrap().is_none());
    }

    #[test]
    fn test_should_tolerate_unknown_content_blocks() {
        let value = serde_json::json!({
            "type": "assistant",
            "message": {
                "content": [{"type": "thinking", "thinking": "hmm"}]
            }
        });
        let msg = parse_message(&value).unwrap().unwrap();
        match msg {
            Message::Assistant(a) => {
                assert!(matches!(a.message.content[0], ContentBlock::Other));
            }
            other => panic!("expected assistant message, got {other:?}"),
        }
    }
}
