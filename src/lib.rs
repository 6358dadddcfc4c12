//! Sandbox Heal - drive a failing test suite to green inside a sandbox
//!
//! This library runs repair episodes: an external decision function edits a
//! source tree through a closed set of tools, each test run gets a fresh
//! backing service, and the final change is reported as a unified diff.

pub mod backoff;
pub mod config;
pub mod controller;
pub mod diff;
pub mod error;
pub mod harness;
pub mod prompt;
pub mod report;
pub mod sandbox;
pub mod secrets;
pub mod service;
pub mod tools;

pub use error::{Error, Result};

pub use config::{RepairConfig, RuntimeConfig, RuntimeKind, Validate, ValidationResult};
pub use controller::{
    CommandDecision, Decision, DecisionContext, DecisionFunction, EpisodeReport, EpisodeState,
    RepairController, RepairEpisode, ReportStatus, ScriptedDecision, TerminalStatus, Turn,
};
pub use diff::DiffEngine;
pub use harness::{TestHarness, TestOutcome, TestSettings, TestStatus};
pub use report::{parse_ref_number, Confirmation, GitHubReporter, ReportTarget, Reporter};
pub use sandbox::{
    CommandOutput, DockerRuntime, LocalRuntime, Runtime, Session, SessionHandle, SessionOptions,
    Snapshot,
};
pub use secrets::{Credential, Redactor, SecretSource};
pub use service::{
    DirectoryServiceProvider, DockerServiceProvider, ServiceHandle, ServiceKind, ServiceLease,
    ServiceManager, ServiceProvider, ServiceSpec,
};
pub use tools::{AuditLog, ToolCall, ToolName, ToolResult, ToolSpec, Toolbox};
