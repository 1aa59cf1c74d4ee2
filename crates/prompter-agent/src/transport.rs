//! One-shot transport for `claude -p --output-format stream-json`.
//!
//! Spawns the Claude Code CLI for a single prompt, reads NDJSON events
//! from stdout, and yields typed [`Message`] values until the terminal
//! result event. Dropping the returned stream kills the subprocess.

use std::process::Stdio;

use async_stream::stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::options::AgentOptions;
use crate::types::{Message, MessageStream, parse_message};

/// Locates the Claude Code CLI binary.
///
/// Checks the explicit `cli_path` option first, then searches `PATH`.
///
/// # Errors
///
/// Returns [`Error::CliNotFound`] when no binary can be located.
pub fn find_claude_cli(options: &AgentOptions) -> Result<String> {
    if let Some(ref p) = options.cli_path {
        return Ok(p.to_string_lossy().to_string());
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for path in std::env::split_paths(&paths) {
            let full = path.join("claude");
            if full.is_file() {
                return Ok(full.to_string_lossy().to_string());
            }
        }
    }

    Err(Error::CliNotFound(
        "Claude Code CLI not found on PATH. Install with:\n  npm install -g @anthropic-ai/claude-code"
            .to_string(),
    ))
}

/// Builds the argv for a one-shot streaming query.
fn build_query_command(cli_path: &str, prompt: &str, options: &AgentOptions) -> Vec<String> {
    let mut cmd = vec![
        cli_path.to_string(),
        "-p".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    if let Some(ref id) = options.resume_session_id {
        cmd.push("--resume".to_string());
        cmd.push(id.clone());
    }

    if let Some(ref model) = options.model {
        cmd.push("--model".to_string());
        cmd.push(model.clone());
    }

    if let Some(ref sp) = options.system_prompt {
        if !sp.is_empty() {
            cmd.push("--append-system-prompt".to_string());
            cmd.push(sp.clone());
        }
    }

    for (key, value) in &options.extra_args {
        cmd.push(format!("--{key}"));
        if let Some(v) = value {
            cmd.push(v.clone());
        }
    }

    cmd.push(prompt.to_string());

    cmd
}

/// Executes a one-shot query, returning a stream of decoded messages.
///
/// The stream ends after the CLI's terminal `result` event. A non-zero
/// exit status yields [`Error::Process`] with whatever stderr produced.
/// Lines that are not valid JSON, and event types the orchestrator does
/// not consume, are skipped.
pub fn query(prompt: &str, options: &AgentOptions) -> MessageStream {
    let prompt = prompt.to_string();
    let options = options.clone();

    let stream = stream! {
        let cli_path = match find_claude_cli(&options) {
            Ok(p) => p,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        let cmd = build_query_command(&cli_path, &prompt, &options);
        debug!(cli = %cli_path, resume = ?options.resume_session_id, "Spawning Claude CLI");

        let mut child_cmd = Command::new(&cmd[0]);
        child_cmd
            .args(&cmd[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref cwd) = options.cwd {
            child_cmd.current_dir(cwd);
        }
        for (k, v) in &options.env {
            child_cmd.env(k, v);
        }

        let mut process = match child_cmd.spawn() {
            Ok(p) => p,
            Err(e) => {
                yield Err(Error::CliNotFound(format!(
                    "Failed to spawn Claude CLI at {cli_path}: {e}"
                )));
                return;
            }
        };

        let stdout = match process.stdout.take() {
            Some(s) => s,
            None => {
                yield Err(Error::Other("Failed to capture stdout".to_string()));
                return;
            }
        };

        // Drain stderr in the background so the child never blocks on a
        // full pipe; the collected text feeds the process-exit error.
        let stderr_handle = process.stderr.take().map(|s| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(s).lines();
                let mut output = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&line);
                }
                output
            })
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut saw_result = false;

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let value: serde_json::Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(_) => {
                    trace!(line, "Skipping non-JSON line from CLI");
                    continue;
                }
            };

            match parse_message(&value) {
                Ok(Some(msg)) => {
                    if matches!(msg, Message::Result(_)) {
                        saw_result = true;
                    }
                    yield Ok(msg);
                }
                Ok(None) => continue,
                Err(e) => {
                    yield Err(e);
                    continue;
                }
            }
        }

        match process.wait().await {
            Ok(status) => {
                if !status.success() {
                    let stderr_output = match stderr_handle {
                        Some(handle) => handle.await.ok(),
                        None => None,
                    };
                    yield Err(Error::Process {
                        exit_code: status.code().unwrap_or(-1),
                        stderr: stderr_output,
                    });
                } else if !saw_result {
                    warn!("Claude CLI exited cleanly without a result event");
                    yield Err(Error::Other(
                        "CLI stream ended without a result event".to_string(),
                    ));
                }
            }
            Err(e) => {
                yield Err(Error::Other(format!("Failed to wait for process: {e}")));
            }
        }
    };

    Box::pin(stream)
}
