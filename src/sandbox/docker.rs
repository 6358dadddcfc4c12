//! Container runtime driven through the `docker` CLI.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;

use crate::error::{Error, Result};

use super::runtime::{run_checked, run_process, CommandOutput, ExecRequest, Runtime};
use super::snapshot::Snapshot;

/// Runtime that runs each command in a throwaway container.
///
/// `prepare` runs the setup commands in a container built from `image` and
/// commits the result as a new image tag. Every later command starts from
/// that tag with the session tree bind-mounted at the working directory.
pub struct DockerRuntime {
    docker: String,
    image: String,
    setup: Vec<String>,
    cache_volumes: BTreeMap<String, String>,
    setup_timeout: Duration,
}

impl DockerRuntime {
    /// Creates a runtime for the given base image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            docker: "docker".to_string(),
            image: image.into(),
            setup: Vec::new(),
            cache_volumes: BTreeMap::new(),
            setup_timeout: Duration::from_secs(1800),
        }
    }

    /// Sets the provisioning commands.
    pub fn with_setup(mut self, setup: Vec<String>) -> Self {
        self.setup = setup;
        self
    }

    /// Mounts named volumes (volume name -> container path) for setup and exec.
    pub fn with_cache_volumes(mut self, volumes: BTreeMap<String, String>) -> Self {
        self.cache_volumes = volumes;
        self
    }

    /// Uses a custom docker binary.
    pub fn with_docker_path(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    fn volume_args(&self) -> Vec<String> {
        self.cache_volumes
            .iter()
            .flat_map(|(name, mount)| ["-v".to_string(), format!("{}:{}", name, mount)])
            .collect()
    }

    /// Builds the `docker run` arguments for one exec request.
    fn run_args(&self, name: &str, request: &ExecRequest) -> Vec<String> {
        let workdir = request.workdir.display().to_string();
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-v".to_string(),
            format!("{}:{}", request.host_dir.display(), workdir),
            "-w".to_string(),
            workdir,
            "--network".to_string(),
            request.network.clone().unwrap_or_else(|| "none".to_string()),
        ];
        args.extend(self.volume_args());
        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(request.base_image_ref.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(request.command.clone());
        args
    }

}

async fn remove_container(docker: &str, name: &str) {
    let mut cmd = Command::new(docker);
    cmd.args(["rm", "-f", name]);
    if let Err(e) = run_process(cmd, Duration::from_secs(60)).await {
        tracing::warn!(container = %name, error = %e, "failed to remove container");
    }
}

/// Removes an exec container whose `docker run` client was dropped before
/// the command returned. Killing the client does not stop the container.
struct ContainerGuard {
    docker: String,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: &str, name: &str) -> Self {
        Self {
            docker: docker.to_string(),
            name: name.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let docker = std::mem::take(&mut self.docker);
        let name = std::mem::take(&mut self.name);
        tracing::warn!(container = %name, "container command abandoned, removing container");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { remove_container(&docker, &name).await });
            }
            Err(_) => {
                tracing::error!(container = %name, "no async runtime available, container leaked");
            }
        }
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn prepare(&self, baseline: &Snapshot, workdir: &Path) -> Result<String> {
        if self.setup.is_empty() {
            return Ok(self.image.clone());
        }

        let scratch = TempDir::new()
            .map_err(|e| Error::EnvironmentProvision(format!("scratch dir: {}", e)))?;
        baseline
            .materialize(scratch.path())
            .map_err(|e| Error::EnvironmentProvision(format!("materialize baseline: {}", e)))?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("sandbox-heal-prepare-{}", &id[..12]);
        let tag = format!("sandbox-heal/env:{}", &id[..12]);
        let workdir = workdir.display().to_string();

        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            name.clone(),
            "-v".to_string(),
            format!("{}:{}", scratch.path().display(), workdir),
            "-w".to_string(),
            workdir,
        ];
        args.extend(self.volume_args());
        args.push(self.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(self.setup.join(" && "));

        tracing::info!(image = %self.image, container = %name, "provisioning base environment");

        let mut run = Command::new(&self.docker);
        run.args(&args);
        let result = run_checked(run, self.setup_timeout, "environment setup").await;

        let committed = match result {
            Ok(_) => {
                let mut commit = Command::new(&self.docker);
                commit.args(["commit", &name, &tag]);
                run_checked(commit, Duration::from_secs(300), "docker commit").await
            }
            Err(e) => Err(e),
        };

        remove_container(&self.docker, &name).await;
        committed?;

        tracing::info!(base_image_ref = %tag, "base environment ready");
        Ok(tag)
    }

    async fn exec(&self, request: ExecRequest) -> Result<CommandOutput> {
        let name = format!(
            "sandbox-heal-exec-{}",
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        );
        let args = self.run_args(&name, &request);

        tracing::debug!(
            container = %name,
            image = %request.base_image_ref,
            network = ?request.network,
            "running container command"
        );

        let mut cmd = Command::new(&self.docker);
        cmd.args(&args);
        let guard = ContainerGuard::new(&self.docker, &name);
        let output = run_process(cmd, request.timeout).await;
        guard.disarm();
        let output = output?;

        if output.timed_out {
            remove_container(&self.docker, &name).await;
        }
        Ok(output)
    }

    fn name(&self) -> &str {
        "docker"
    }
}
