//! Agent executor boundary.
//!
//! An executor turns `(role, model, context)` into raw text. It knows
//! nothing about rounds, claims or retries; the worker owns those. The
//! worker bounds every call with a hard timeout by dropping the future, so
//! implementations must release their resources on drop.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use debate_state::{Role, TaskId};

/// Exit status an external agent uses to ask for a retry (`EX_TEMPFAIL`).
pub const EXIT_TRANSIENT: i32 = 75;

/// One executor invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub task_id: TaskId,
    pub round_number: u32,
    pub role: Role,
    /// Configured agent fulfilling the role.
    pub agent: String,
    pub model: String,
    /// Executions of this run started so far, including this one.
    pub attempt: u32,
    /// Round context, JSON encoded.
    pub context: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentFailure {
    /// Network or rate-limit class; worth retrying.
    #[error("transient agent failure: {0}")]
    Transient(String),

    /// The executor gave up; retrying the same input will not help.
    #[error("agent failure: {0}")]
    Permanent(String),

    /// The agent answered with something that is not usable output.
    #[error("validation failure: {0}")]
    InvalidOutput(String),
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, request: &AgentRequest) -> Result<String, AgentFailure>;
}

/// Runs an external program once per agent run.
///
/// The round context is written to stdin; the role, model, agent, task id
/// and round number are passed as `DEBATE_*` environment variables. Stdout
/// is the raw output. The child is killed when the call is dropped.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn execute(&self, request: &AgentRequest) -> Result<String, AgentFailure> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("DEBATE_ROLE", request.role.as_str())
            .env("DEBATE_AGENT", &request.agent)
            .env("DEBATE_MODEL", &request.model)
            .env("DEBATE_TASK_ID", request.task_id.as_str())
            .env("DEBATE_ROUND", request.round_number.to_string())
            .env("DEBATE_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentFailure::Permanent(format!("cannot spawn {}: {e}", self.program.display()))
            })?;

        // Feed stdin while draining stdout and stderr; a child that fills a
        // pipe before reading all of its input would otherwise stall us both.
        let stdin = child.stdin.take();
        let context = &request.context;
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A child that exits without reading its input is not an error here.
                if let Err(e) = stdin.write_all(context).await {
                    tracing::debug!(error = %e, "agent closed stdin early");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| AgentFailure::Transient(format!("waiting for agent: {e}")))?;

        if output.status.success() {
            return String::from_utf8(output.stdout).map_err(|e| {
                AgentFailure::InvalidOutput(format!("agent output is not valid UTF-8: {e}"))
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = format!(
            "{} exited with {}: {}",
            self.program.display(),
            output.status,
            stderr.trim()
        );
        match output.status.code() {
            Some(EXIT_TRANSIENT) => Err(AgentFailure::Transient(detail)),
            _ => Err(AgentFailure::Permanent(detail)),
        }
    }
}
