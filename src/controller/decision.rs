//! The decision-function seam.
//!
//! The controller knows nothing about how decisions are made; it hands a
//! [`DecisionContext`] to a [`DecisionFunction`] after every step and gets
//! back either a tool call or a terminal answer.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::tools::{ToolCall, ToolResult, ToolSpec};

/// What the decision function wants to happen next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// Invoke a tool.
    Call(ToolCall),
    /// Declare the repair complete.
    Finish { answer: String },
}

impl Decision {
    /// Shorthand for a tool call.
    pub fn call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Decision::Call(ToolCall::new(name, arguments))
    }

    /// Shorthand for a terminal answer.
    pub fn finish(answer: impl Into<String>) -> Self {
        Decision::Finish {
            answer: answer.into(),
        }
    }
}

/// One entry of the episode history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    /// A tool call and its result.
    Tool {
        call: ToolCall,
        result: ToolResult,
    },
    /// A claimed completion and the verification run that followed it.
    Verification {
        answer: String,
        passed: bool,
        report: String,
    },
    /// The decision function itself failed.
    DecisionError { message: String },
}

/// Everything the decision function sees on one turn.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionContext<'a> {
    pub system_prompt: &'a str,
    pub tools: &'a [ToolSpec],
    pub history: &'a [Turn],
    /// 1-based index of this turn.
    pub attempt: u32,
    pub budget: u32,
}

/// Chooses the next step of a repair episode.
///
/// Implementations may be non-deterministic. They are queried again after
/// every tool result.
#[async_trait]
pub trait DecisionFunction: Send + Sync {
    async fn decide(&self, context: &DecisionContext<'_>) -> Result<Decision>;

    /// Returns the name of this decision function.
    fn name(&self) -> &str;
}

/// Delegates decisions to an external process.
///
/// The context is written to the process's stdin as JSON; its stdout must
/// hold one [`Decision`] JSON object.
pub struct CommandDecision {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandDecision {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(600),
        }
    }

    /// Adds arguments passed to the program.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Bounds each invocation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DecisionFunction for CommandDecision {
    async fn decide(&self, context: &DecisionContext<'_>) -> Result<Decision> {
        let input = serde_json::to_vec(context).map_err(|e| Error::Decision(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Decision(format!("failed to run {}: {}", self.program, e)))?;

        let stdin = child.stdin.take();
        let exchange = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
            }
            child.wait_with_output().await
        };
        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
            .map_err(|e| Error::Decision(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(Error::Decision(format!(
                "{} exited with {}: {}",
                self.program,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::Decision(format!(
                "unparseable decision from {}: {}",
                self.program, e
            ))
        })
    }

    fn name(&self) -> &str {
        &self.program
    }
}
