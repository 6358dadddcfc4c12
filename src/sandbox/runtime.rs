//! Execution backend seam for sandbox sessions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{Error, Result};

use super::snapshot::Snapshot;

/// Exit code reported for commands killed at their deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Captured result of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Process exit code (`-1` when killed by a signal).
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Whether the command was killed at its deadline.
    #[serde(default)]
    pub timed_out: bool,
}

impl CommandOutput {
    /// Returns true if the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// A single command to run against a materialized tree.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Immutable environment reference returned by [`Runtime::prepare`].
    pub base_image_ref: String,
    /// Host directory holding the materialized tree.
    pub host_dir: PathBuf,
    /// Working directory inside the environment.
    pub workdir: PathBuf,
    /// Shell command line.
    pub command: String,
    /// Environment variables for this command only.
    pub env: BTreeMap<String, String>,
    /// Network the command joins, if a service is bound.
    pub network: Option<String>,
    /// Wall-clock limit.
    pub timeout: Duration,
}

/// Backend that provisions the base environment and runs commands in it.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Runs the dependency-installation step against the baseline and
    /// returns an immutable reference to the resulting environment.
    async fn prepare(&self, baseline: &Snapshot, workdir: &Path) -> Result<String>;

    /// Runs one command against the tree materialized at `request.host_dir`.
    ///
    /// A non-zero exit is reported in the output, not as an error.
    async fn exec(&self, request: ExecRequest) -> Result<CommandOutput>;

    /// Returns the name of this runtime.
    fn name(&self) -> &str;
}

/// Runs a prepared command, capturing output and enforcing `timeout`.
///
/// The child is killed when the deadline passes.
pub(crate) async fn run_process(mut cmd: Command, timeout: Duration) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            })
        }
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "command timed out, killed");
            Ok(CommandOutput {
                exit_code: TIMEOUT_EXIT_CODE,
                stdout: String::new(),
                stderr: format!("command timed out after {:?}", timeout),
                timed_out: true,
            })
        }
    }
}

/// Runs a command that must succeed, returning its stdout.
pub(crate) async fn run_checked(cmd: Command, timeout: Duration, what: &str) -> Result<String> {
    let output = run_process(cmd, timeout).await?;
    if !output.success() {
        return Err(Error::EnvironmentProvision(format!(
            "{} failed (exit {}): {}",
            what,
            output.exit_code,
            output.stderr.trim()
        )));
    }
    Ok(output.stdout)
}
