//! Container-backed ephemeral services.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::backoff::ExponentialBackoff;
use crate::error::{Error, Result};
use crate::sandbox::{run_checked, run_process};

use super::{ServiceHandle, ServiceProvider, ServiceSpec};

const DOCKER_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs each service instance as its own container on its own internal
/// network. The sandbox joins that network for the bound command only, and
/// reaches the service under `spec.alias`.
pub struct DockerServiceProvider {
    docker: String,
}

impl Default for DockerServiceProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerServiceProvider {
    pub fn new() -> Self {
        Self {
            docker: "docker".to_string(),
        }
    }

    /// Uses a custom docker binary.
    pub fn with_docker_path(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.docker);
        cmd.args(args);
        cmd
    }

    /// Builds the `docker run` arguments for a service container.
    fn run_args(spec: &ServiceSpec, container: &str, network: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container.to_string(),
            "--network".to_string(),
            network.to_string(),
            "--network-alias".to_string(),
            spec.alias.clone(),
            "--expose".to_string(),
            spec.port.to_string(),
        ];
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.image.clone());
        args
    }

    async fn wait_ready(&self, spec: &ServiceSpec, container: &str) -> bool {
        let Some(ready) = &spec.ready_command else {
            return true;
        };
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(250), Duration::from_secs(5));
        let deadline = Instant::now() + spec.ready_timeout();
        backoff
            .poll_until(deadline, || {
                let cmd = self.command(&[
                    "exec".to_string(),
                    container.to_string(),
                    "sh".to_string(),
                    "-c".to_string(),
                    ready.clone(),
                ]);
                async move {
                    matches!(
                        run_process(cmd, Duration::from_secs(30)).await,
                        Ok(output) if output.success()
                    )
                }
            })
            .await
    }

    async fn remove(&self, container: &str, network: &str) -> Result<()> {
        let rm = run_process(
            self.command(&["rm".to_string(), "-f".to_string(), container.to_string()]),
            DOCKER_TIMEOUT,
        )
        .await?;
        self.remove_attached(network).await?;
        let net = run_process(
            self.command(&["network".to_string(), "rm".to_string(), network.to_string()]),
            DOCKER_TIMEOUT,
        )
        .await?;

        if !rm.success() || !net.success() {
            return Err(Error::ServiceBinding(format!(
                "teardown of {} incomplete: {} {}",
                container,
                rm.stderr.trim(),
                net.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Removes sandbox containers still attached to `network`, which would
    /// otherwise keep it from being removed.
    async fn remove_attached(&self, network: &str) -> Result<()> {
        let listed = run_process(
            self.command(&[
                "ps".to_string(),
                "-aq".to_string(),
                "--filter".to_string(),
                format!("network={}", network),
            ]),
            DOCKER_TIMEOUT,
        )
        .await?;
        let attached: Vec<String> = listed.stdout.split_whitespace().map(str::to_string).collect();
        if attached.is_empty() {
            return Ok(());
        }

        tracing::warn!(network = %network, containers = ?attached, "removing containers left on service network");
        let mut args = vec!["rm".to_string(), "-f".to_string()];
        args.extend(attached);
        run_process(self.command(&args), DOCKER_TIMEOUT).await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceProvider for DockerServiceProvider {
    async fn provision(&self, spec: &ServiceSpec) -> Result<ServiceHandle> {
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let container = format!("sandbox-heal-{}-{}", spec.name, id);
        let network = format!("sandbox-heal-net-{}", id);

        run_checked(
            self.command(&[
                "network".to_string(),
                "create".to_string(),
                "--internal".to_string(),
                network.clone(),
            ]),
            DOCKER_TIMEOUT,
            "docker network create",
        )
        .await
        .map_err(|e| Error::ServiceBinding(e.to_string()))?;

        let started = run_checked(
            self.command(&Self::run_args(spec, &container, &network)),
            DOCKER_TIMEOUT,
            "docker run",
        )
        .await;

        let ready = match started {
            Ok(_) => self.wait_ready(spec, &container).await,
            Err(e) => {
                let _ = self.remove(&container, &network).await;
                return Err(Error::ServiceBinding(e.to_string()));
            }
        };

        if !ready {
            let _ = self.remove(&container, &network).await;
            return Err(Error::ServiceBinding(format!(
                "{} not ready after {:?}",
                spec.name,
                spec.ready_timeout()
            )));
        }

        Ok(ServiceHandle {
            id: container,
            host: spec.alias.clone(),
            port: spec.port,
            network: Some(network),
        })
    }

    async fn teardown(&self, handle: &ServiceHandle) -> Result<()> {
        match &handle.network {
            Some(network) => self.remove(&handle.id, network).await,
            None => Err(Error::ServiceBinding(format!(
                "service {} has no network",
                handle.id
            ))),
        }
    }

    fn name(&self) -> &str {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Writes a stand-in `docker` that logs its arguments and reports one
    /// straggler container on the service network.
    #[cfg(unix)]
    fn logging_docker(dir: &std::path::Path) -> (String, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("docker.log");
        let script = dir.join("docker");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$*\" >> {}\nif [ \"$1\" = ps ]; then echo abc123; fi\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script.display().to_string(), log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn teardown_clears_network_before_removing_it() {
        let dir = TempDir::new().unwrap();
        let (docker, log) = logging_docker(dir.path());
        let provider = DockerServiceProvider::with_docker_path(docker);
        let spec = ServiceSpec {
            ready_command: None,
            ..Default::default()
        };

        let handle = provider.provision(&spec).await.unwrap();
        provider.teardown(&handle).await.unwrap();

        let network = handle.network.clone().unwrap();
        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        let teardown = &calls[calls.len() - 4..];
        assert_eq!(teardown[0], format!("rm -f {}", handle.id));
        assert_eq!(teardown[1], format!("ps -aq --filter network={}", network));
        assert_eq!(teardown[2], "rm -f abc123");
        assert_eq!(teardown[3], format!("network rm {}", network));
    }

    #[test]
    fn run_args_attach_alias_and_env() {
        let spec = ServiceSpec::default();
        let args = DockerServiceProvider::run_args(&spec, "svc", "net");

        let alias = args.iter().position(|a| a == "--network-alias").unwrap();
        assert_eq!(args[alias + 1], "db");
        assert!(args.contains(&"POSTGRES_DB=app_test".to_string()));
        assert!(args.contains(&"POSTGRES_PASSWORD=secret".to_string()));
        assert_eq!(args.last().unwrap(), "postgres:alpine");
    }

    #[tokio::test]
    async fn provision_reports_binding_error_without_docker() {
        let provider = DockerServiceProvider::with_docker_path("/nonexistent/docker");
        let result = provider.provision(&ServiceSpec::default()).await;

        assert!(matches!(result, Err(Error::ServiceBinding(_))));
    }

    #[tokio::test]
    #[ignore] // Requires docker
    async fn provisions_postgres_and_tears_down() {
        let provider = DockerServiceProvider::new();
        let handle = provider.provision(&ServiceSpec::default()).await.unwrap();
        assert_eq!(handle.host, "db");
        provider.teardown(&handle).await.unwrap();
    }
}
