//! Host-process runtime.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use crate::error::{Error, Result};

use super::runtime::{run_checked, run_process, CommandOutput, ExecRequest, Runtime};
use super::snapshot::Snapshot;

/// Host variables passed through to commands. Everything else is dropped.
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "LANG", "TMPDIR"];

/// Runtime that runs commands with `sh -c` on the host, inside a scratch
/// materialization of the session tree.
///
/// There is no image: setup commands run once against a scratch copy of the
/// baseline, so their effects outside the tree (installed tools) persist on
/// the host.
pub struct LocalRuntime {
    shell: String,
    setup: Vec<String>,
    setup_timeout: Duration,
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRuntime {
    /// Creates a local runtime using `sh`.
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            setup: Vec::new(),
            setup_timeout: Duration::from_secs(600),
        }
    }

    /// Sets the provisioning commands.
    pub fn with_setup(mut self, setup: Vec<String>) -> Self {
        self.setup = setup;
        self
    }

    fn shell_command(&self, script: &str, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(script).current_dir(dir).env_clear();
        for key in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    async fn prepare(&self, baseline: &Snapshot, _workdir: &Path) -> Result<String> {
        if !self.setup.is_empty() {
            let scratch = TempDir::new()
                .map_err(|e| Error::EnvironmentProvision(format!("scratch dir: {}", e)))?;
            baseline
                .materialize(scratch.path())
                .map_err(|e| Error::EnvironmentProvision(format!("materialize baseline: {}", e)))?;

            for step in &self.setup {
                tracing::info!(step = %step, "running local setup step");
                let cmd = self.shell_command(step, scratch.path());
                run_checked(cmd, self.setup_timeout, step).await?;
            }
        }

        Ok(format!("local:{}", self.shell))
    }

    async fn exec(&self, request: ExecRequest) -> Result<CommandOutput> {
        tracing::debug!(
            command = %request.command,
            dir = ?request.host_dir,
            "running local command"
        );
        let mut cmd = self.shell_command(&request.command, &request.host_dir);
        cmd.envs(&request.env);
        run_process(cmd, request.timeout).await
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn request(dir: &Path, command: &str) -> ExecRequest {
        ExecRequest {
            base_image_ref: "local:sh".to_string(),
            host_dir: dir.to_path_buf(),
            workdir: PathBuf::from("/app"),
            command: command.to_string(),
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            network: None,
            timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn exec_runs_in_host_dir_with_request_env() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "content").unwrap();
        let runtime = LocalRuntime::new();

        let output = runtime
            .exec(request(dir.path(), "cat f.txt; echo \" $GREETING\""))
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "content hello\n");
    }

    #[tokio::test]
    async fn exec_does_not_leak_host_environment() {
        std::env::set_var("SANDBOX_HEAL_LEAK_CHECK", "leaked");
        let dir = TempDir::new().unwrap();
        let runtime = LocalRuntime::new();

        let output = runtime
            .exec(request(dir.path(), "echo \"[$SANDBOX_HEAL_LEAK_CHECK]\""))
            .await
            .unwrap();

        std::env::remove_var("SANDBOX_HEAL_LEAK_CHECK");
        assert_eq!(output.stdout, "[]\n");
    }

    #[tokio::test]
    async fn prepare_fails_when_setup_fails() {
        let runtime = LocalRuntime::new().with_setup(vec!["exit 7".to_string()]);
        let result = runtime.prepare(&Snapshot::new(), Path::new("/app")).await;

        assert!(matches!(result, Err(Error::EnvironmentProvision(_))));
    }

    #[tokio::test]
    async fn prepare_runs_setup_against_baseline() {
        let runtime =
            LocalRuntime::new().with_setup(vec!["test -f requirements.txt".to_string()]);
        let baseline = Snapshot::from_files([("requirements.txt", "pytest\n")]);

        let base = runtime.prepare(&baseline, Path::new("/app")).await.unwrap();
        assert_eq!(base, "local:sh");
    }
}
