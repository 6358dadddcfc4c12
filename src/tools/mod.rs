//! The closed set of tools through which the decision function acts.
//!
//! Every tool maps onto one session, harness, diff or reporting operation.
//! Names outside [`ToolName`] are rejected before anything touches the
//! sandbox, and every call is written to the [`AuditLog`] before and after it
//! runs.

pub mod audit;

pub use audit::{AuditLog, InvocationPhase, ToolInvocation};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::diff::DiffEngine;
use crate::error::{Error, Result};
use crate::harness::{TestHarness, TestOutcome};
use crate::sandbox::{Session, Snapshot};

/// Tool output is cut to this many bytes before it is returned.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Names of the available tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ReadFile,
    WriteFile,
    WriteDirectory,
    Ls,
    Exec,
    Test,
    Diff,
    Comment,
    Container,
}

impl ToolName {
    /// Every tool, in presentation order.
    pub const ALL: [ToolName; 9] = [
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::WriteDirectory,
        ToolName::Ls,
        ToolName::Exec,
        ToolName::Test,
        ToolName::Diff,
        ToolName::Comment,
        ToolName::Container,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::ReadFile => "read_file",
            ToolName::WriteFile => "write_file",
            ToolName::WriteDirectory => "write_directory",
            ToolName::Ls => "ls",
            ToolName::Exec => "exec",
            ToolName::Test => "test",
            ToolName::Diff => "diff",
            ToolName::Comment => "comment",
            ToolName::Container => "container",
        }
    }

    /// Describes the tool for the decision function.
    pub fn spec(&self) -> ToolSpec {
        let (description, parameters) = match self {
            ToolName::ReadFile => (
                "Read a file relative to the working directory.",
                json!({"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]}),
            ),
            ToolName::WriteFile => (
                "Create or replace a file with the given contents.",
                json!({"type": "object", "properties": {"path": {"type": "string"}, "contents": {"type": "string"}}, "required": ["path", "contents"]}),
            ),
            ToolName::WriteDirectory => (
                "Write several files below a directory; keys of `files` are paths relative to `path`.",
                json!({"type": "object", "properties": {"path": {"type": "string"}, "files": {"type": "object", "additionalProperties": {"type": "string"}}}, "required": ["path", "files"]}),
            ),
            ToolName::Ls => (
                "List the entries of a directory (default: the working directory).",
                json!({"type": "object", "properties": {"path": {"type": "string"}}}),
            ),
            ToolName::Exec => (
                "Run a shell command in the working directory. File changes it makes are kept.",
                json!({"type": "object", "properties": {"command": {"type": "string"}}, "required": ["command"]}),
            ),
            ToolName::Test => (
                "Run the test suite against a fresh database. Returns PASS or FAIL with the error output.",
                json!({"type": "object", "properties": {}}),
            ),
            ToolName::Diff => (
                "Show the unified diff of all changes against the original source.",
                json!({"type": "object", "properties": {}}),
            ),
            ToolName::Comment => (
                "Draft the review comment posted once the tests pass.",
                json!({"type": "object", "properties": {"body": {"type": "string"}}, "required": ["body"]}),
            ),
            ToolName::Container => (
                "Return a reference to the current environment.",
                json!({"type": "object", "properties": {}}),
            ),
        };
        ToolSpec {
            name: self.as_str().to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ToolName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| Error::ToolArgument(format!("unknown tool '{}'", s)))
    }
}

/// Description of a tool handed to the decision function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// A tool call requested by the decision function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Result of a tool call as fed back to the decision function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub success: bool,
    pub output: String,
}

/// What a dispatched tool produced.
#[derive(Debug, Clone)]
pub struct ToolEffect {
    pub output: String,
    pub success: bool,
    /// The next session, for tools that mutate the environment.
    pub next_session: Option<Session>,
    /// Draft review comment, from `comment`.
    pub draft_comment: Option<String>,
    /// Test outcome, from `test`.
    pub test: Option<TestOutcome>,
}

impl ToolEffect {
    fn output(output: impl Into<String>) -> Self {
        Self {
            output: truncate(output.into()),
            success: true,
            next_session: None,
            draft_comment: None,
            test: None,
        }
    }

    fn with_session(mut self, session: Session) -> Self {
        self.next_session = Some(session);
        self
    }

    fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PathArgs {
    path: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionalPathArgs {
    #[serde(default)]
    path: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteFileArgs {
    path: String,
    contents: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteDirectoryArgs {
    path: String,
    files: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecArgs {
    command: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CommentArgs {
    body: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

fn parse_args<T: DeserializeOwned>(tool: ToolName, arguments: &Value) -> Result<T> {
    let arguments = match arguments {
        Value::Null => json!({}),
        other => other.clone(),
    };
    serde_json::from_value(arguments)
        .map_err(|e| Error::ToolArgument(format!("{}: {}", tool, e)))
}

/// Dispatches tool calls against a session.
pub struct Toolbox {
    harness: TestHarness,
    diff: Arc<DiffEngine>,
    call_timeout: Option<Duration>,
}

impl Toolbox {
    pub fn new(harness: TestHarness, diff: Arc<DiffEngine>) -> Self {
        Self {
            harness,
            diff,
            call_timeout: None,
        }
    }

    /// Bounds each call; an overrun fails the call with [`Error::Timeout`].
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Returns the tool descriptions.
    pub fn specs(&self) -> Vec<ToolSpec> {
        ToolName::ALL.iter().map(ToolName::spec).collect()
    }

    /// Runs one tool call, recording it in `audit` before and after.
    ///
    /// Errors are returned after being audited; the caller decides whether
    /// they end the episode.
    pub async fn dispatch(
        &self,
        session: &Session,
        call: &ToolCall,
        audit: &mut AuditLog,
    ) -> Result<ToolEffect> {
        let sequence = audit.requested(&call.name, &call.arguments);

        let result = match call.name.parse::<ToolName>() {
            Ok(tool) => match self.call_timeout {
                Some(limit) => tokio::time::timeout(limit, self.invoke(tool, session, &call.arguments))
                    .await
                    .unwrap_or(Err(Error::Timeout(limit))),
                None => self.invoke(tool, session, &call.arguments).await,
            },
            Err(e) => Err(e),
        };

        match &result {
            Ok(effect) if effect.success => {
                audit.succeeded(sequence, &call.name, summarize(&effect.output));
            }
            Ok(effect) => audit.failed(sequence, &call.name, summarize(&effect.output)),
            Err(e) => audit.failed(sequence, &call.name, e.to_string()),
        }

        tracing::info!(
            tool = %call.name,
            sequence,
            ok = matches!(&result, Ok(effect) if effect.success),
            "dispatched tool"
        );
        result
    }

    async fn invoke(&self, tool: ToolName, session: &Session, arguments: &Value) -> Result<ToolEffect> {
        match tool {
            ToolName::ReadFile => {
                let args: PathArgs = parse_args(tool, arguments)?;
                let bytes = session.read_file(&args.path)?;
                Ok(ToolEffect::output(String::from_utf8_lossy(&bytes).into_owned()))
            }
            ToolName::WriteFile => {
                let args: WriteFileArgs = parse_args(tool, arguments)?;
                let next = session.write_file(&args.path, args.contents.as_bytes())?;
                Ok(ToolEffect::output(format!(
                    "wrote {} bytes to {}",
                    args.contents.len(),
                    args.path
                ))
                .with_session(next))
            }
            ToolName::WriteDirectory => {
                let args: WriteDirectoryArgs = parse_args(tool, arguments)?;
                let count = args.files.len();
                let dir = Snapshot::from_files(args.files);
                let next = session.write_directory(&args.path, &dir)?;
                Ok(ToolEffect::output(format!("wrote {} files under {}", count, args.path))
                    .with_session(next))
            }
            ToolName::Ls => {
                let args: OptionalPathArgs = parse_args(tool, arguments)?;
                let entries = session.list_directory(&args.path)?;
                Ok(ToolEffect::output(entries.join("\n")))
            }
            ToolName::Exec => {
                let args: ExecArgs = parse_args(tool, arguments)?;
                let (next, output) = session.exec(&args.command).await?;
                let text = format!(
                    "exit code: {}\nstdout:\n{}\nstderr:\n{}",
                    output.exit_code, output.stdout, output.stderr
                );
                let effect = ToolEffect::output(text).with_session(next);
                Ok(if output.success() { effect } else { effect.failed() })
            }
            ToolName::Test => {
                let _: NoArgs = parse_args(tool, arguments)?;
                let outcome = self.harness.run(session).await?;
                let text = if outcome.passed() {
                    format!("PASS\n{}", outcome.report)
                } else {
                    format!("FAIL (exit {})\n{}", outcome.exit_code, outcome.report)
                };
                let mut effect = ToolEffect::output(text);
                effect.success = outcome.passed();
                effect.test = Some(outcome);
                Ok(effect)
            }
            ToolName::Diff => {
                let _: NoArgs = parse_args(tool, arguments)?;
                let diff = self.diff.diff(session).await?;
                Ok(ToolEffect::output(if diff.is_empty() {
                    "no changes".to_string()
                } else {
                    diff
                }))
            }
            ToolName::Comment => {
                let args: CommentArgs = parse_args(tool, arguments)?;
                if args.body.trim().is_empty() {
                    return Err(Error::ToolArgument("comment: body is empty".to_string()));
                }
                let mut effect = ToolEffect::output(
                    "comment drafted; it is posted once the tests pass".to_string(),
                );
                effect.draft_comment = Some(args.body);
                Ok(effect)
            }
            ToolName::Container => {
                let _: NoArgs = parse_args(tool, arguments)?;
                let handle = serde_json::to_string_pretty(&session.handle())
                    .map_err(|e| Error::ToolArgument(e.to_string()))?;
                Ok(ToolEffect::output(handle))
            }
        }
    }
}

/// Cuts `text` to [`MAX_OUTPUT_BYTES`] on a character boundary.
fn truncate(mut text: String) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text;
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let dropped = text.len() - end;
    text.truncate(end);
    text.push_str(&format!("\n... [{} bytes truncated]", dropped));
    text
}

/// First line of a tool output, for the audit trail.
fn summarize(output: &str) -> String {
    let first = output.lines().next().unwrap_or("");
    if first.len() < output.len() {
        format!("{} ({} bytes)", first, output.len())
    } else {
        first.to_string()
    }
}
