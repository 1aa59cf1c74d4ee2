//! Verification subprocess runner.
//!
//! Judges a task's post-effect by running its `verify_command` and
//! comparing the exit code against the expected value. Commands that use
//! shell features run under `sh -c`; plain commands are word-split and
//! spawned directly.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, info};

/// Timeout for a single verification command, in seconds.
const VERIFICATION_TIMEOUT_SECS: u64 = 300;

/// Maximum bytes captured per stream, to bound stored diagnostics.
const MAX_OUTPUT_BYTES: usize = 50 * 1024;

/// Outcome of one verification run.
///
/// `success` is true iff the process terminated normally with the expected
/// exit code. Signals, launch failures, and timeouts are failures with a
/// diagnostic in `output`.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    /// Whether the expected exit code was observed.
    pub success: bool,
    /// Observed exit code; `None` for signals, timeouts, launch failures.
    pub exit_code: Option<i32>,
    /// Combined diagnostic output (exit code, stdout, stderr).
    pub output: String,
}

/// Runs verification commands in a fixed working directory.
///
/// # Example
///
/// ```no_run
/// # async fn example() {
/// use std::path::PathBuf;
/// use prompter_core::verify::Verifier;
///
/// let verifier = Verifier::new(PathBuf::from("/tmp/project"));
/// let result = verifier.run("cargo build", 0).await;
/// assert!(result.success);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Verifier {
    working_directory: PathBuf,
}

impl Verifier {
    /// Creates a verifier rooted at `working_directory`.
    pub fn new(working_directory: PathBuf) -> Self {
        Self { working_directory }
    }

    /// The directory verification commands run in.
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Executes `command` and classifies the exit status.
    pub async fn run(&self, command: &str, expected_code: i32) -> VerifyResult {
        info!(command, expected_code, "Running verification");
        let start = Instant::now();

        let mut cmd = if looks_like_shell(command) {
            debug!(command, "Shell features detected; using sh -c");
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        } else {
            let words = match split_words(command) {
                Ok(words) if !words.is_empty() => words,
                Ok(_) => {
                    return failure(None, "Verification command is empty".to_string());
                }
                Err(e) => {
                    return failure(None, format!("Could not parse verification command: {e}"));
                }
            };
            let mut c = Command::new(&words[0]);
            c.args(&words[1..]);
            c
        };
        cmd.current_dir(&self.working_directory).kill_on_drop(true);

        let output = tokio::time::timeout(
            Duration::from_secs(VERIFICATION_TIMEOUT_SECS),
            cmd.output(),
        )
        .await;

        match output {
            Ok(Ok(output)) => {
                let exit_code = output.status.code();
                let success = exit_code == Some(expected_code);
                let stdout = truncate_output(&output.stdout);
                let stderr = truncate_output(&output.stderr);

                debug!(
                    command,
                    success,
                    exit_code = ?exit_code,
                    duration_ms = start.elapsed().as_millis(),
                    "Verification completed",
                );

                let code_desc = exit_code
                    .map_or_else(|| "killed by signal".to_string(), |c| c.to_string());
                VerifyResult {
                    success,
                    exit_code,
                    output: format!("Exit code: {code_desc}\nStdout: {stdout}\nStderr: {stderr}"),
                }
            }
            Ok(Err(e)) => failure(None, format!("Error running verification command: {e}")),
            Err(_) => {
                info!(command, "Verification command timed out");
                failure(
                    None,
                    format!("Verification command timed out after {VERIFICATION_TIMEOUT_SECS}s"),
                )
            }
        }
    }
}

fn failure(exit_code: Option<i32>, output: String) -> VerifyResult {
    VerifyResult {
        success: false,
        exit_code,
        output,
    }
}

/// Whether `command` uses shell features and must run under `sh -c`.
///
/// Detection is the documented character heuristic; quoted metacharacters
/// still select the shell path, which is harmless (the shell preserves
/// them) but means quoting alone cannot force direct execution.
pub fn looks_like_shell(command: &str) -> bool {
    command
        .chars()
        .any(|c| matches!(c, '|' | '>' | '<' | '&' | ';' | '$' | '`' | '*' | '?' | '[' | ']'))
}

/// POSIX-style word splitting for direct argv execution.
///
/// Handles single quotes (literal), double quotes (backslash escapes for
/// `"` and `\`), and bare backslash escapes. Returns an error on an
/// unterminated quote or trailing backslash.
pub fn split_words(command: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(next @ ('"' | '\\')) => current.push(next),
                            Some(next) => {
                                current.push('\\');
                                current.push(next);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(c) => current.push(c),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(next) => current.push(next),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Lossy UTF-8 conversion truncated at [`MAX_OUTPUT_BYTES`].
fn truncate_output(bytes: &[u8]) -> String {
    let limited = if bytes.len() > MAX_OUTPUT_BYTES {
        &bytes[..MAX_OUTPUT_BYTES]
    } else {
        bytes
    };
    let mut s = String::from_utf8_lossy(limited).into_owned();
    if bytes.len() > MAX_OUTPUT_BYTES {
        s.push_str("\n... [output truncated]");
    }
    s
}
