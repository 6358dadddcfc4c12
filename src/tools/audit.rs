//! Append-only audit trail of tool invocations.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::secrets::Redactor;

/// Stage of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationPhase {
    /// Recorded before the tool runs.
    Requested,
    /// The tool returned a result.
    Succeeded,
    /// The tool failed; `detail` holds the reason.
    Failed,
}

/// One audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Identifies the invocation; shared by its request and outcome events.
    pub sequence: u64,
    /// Tool name as requested, including names outside the tool set.
    pub tool: String,
    pub arguments: serde_json::Value,
    pub phase: InvocationPhase,
    /// Result summary or failure reason.
    pub detail: Option<String>,
    /// RFC 3339 timestamp.
    pub timestamp: String,
}

/// Audit trail for one episode. Events are only ever appended.
#[derive(Debug, Default)]
pub struct AuditLog {
    events: Vec<ToolInvocation>,
    next_sequence: u64,
    sink: Option<PathBuf>,
    redactor: Redactor,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also appends every event as a JSON line to `path`.
    pub fn with_sink(mut self, path: impl Into<PathBuf>) -> Self {
        self.sink = Some(path.into());
        self
    }

    /// Scrubs secret values from arguments and details before recording.
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Records a request and returns its sequence number.
    pub fn requested(&mut self, tool: &str, arguments: &serde_json::Value) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.push(sequence, tool, arguments.clone(), InvocationPhase::Requested, None);
        sequence
    }

    /// Records a successful outcome.
    pub fn succeeded(&mut self, sequence: u64, tool: &str, detail: impl Into<String>) {
        self.push(
            sequence,
            tool,
            serde_json::Value::Null,
            InvocationPhase::Succeeded,
            Some(detail.into()),
        );
    }

    /// Records a failed outcome.
    pub fn failed(&mut self, sequence: u64, tool: &str, reason: impl Into<String>) {
        self.push(
            sequence,
            tool,
            serde_json::Value::Null,
            InvocationPhase::Failed,
            Some(reason.into()),
        );
    }

    /// Returns all events in the order they were recorded.
    pub fn events(&self) -> &[ToolInvocation] {
        &self.events
    }

    /// Number of invocations requested so far.
    pub fn invocations(&self) -> u64 {
        self.next_sequence
    }

    /// Consumes the log, returning its events.
    pub fn into_events(self) -> Vec<ToolInvocation> {
        self.events
    }

    fn push(
        &mut self,
        sequence: u64,
        tool: &str,
        arguments: serde_json::Value,
        phase: InvocationPhase,
        detail: Option<String>,
    ) {
        let event = ToolInvocation {
            sequence,
            tool: tool.to_string(),
            arguments: self.redactor.redact_json(&arguments),
            phase,
            detail: detail.map(|d| self.redactor.redact(&d)),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        tracing::debug!(sequence, tool = %event.tool, phase = ?phase, "audit event");
        if let Some(path) = &self.sink {
            if let Err(e) = append_line(path, &event) {
                tracing::warn!(path = %path.display(), error = %e, "failed to write audit event");
            }
        }
        self.events.push(event);
    }
}

fn append_line(path: &Path, event: &ToolInvocation) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let row = serde_json::to_string(event).map_err(std::io::Error::other)?;
    writeln!(file, "{}", row)
}
