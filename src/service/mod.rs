//! Ephemeral backing services scoped to a single test run.
//!
//! A [`ServiceManager`] provisions a fresh service instance per call and
//! hands it out as a [`ServiceLease`]. The lease is released explicitly
//! after the bound execution finishes; if the holder is dropped first (a
//! panic or a cancelled future), the lease tears the instance down itself.

mod directory;
mod docker;

pub use directory::DirectoryServiceProvider;
pub use docker::DockerServiceProvider;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sandbox::Session;

/// Backend used to run the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// A container on a private network.
    #[default]
    Docker,
    /// A fresh scratch directory (file-backed databases).
    Directory,
}

/// Declaration of a backing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Short name used in container and directory names.
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub kind: ServiceKind,

    /// Image to run (docker only).
    #[serde(default = "default_image")]
    pub image: String,

    /// Environment variables passed to the service.
    #[serde(default = "default_env")]
    pub env: BTreeMap<String, String>,

    /// Port the service listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Hostname under which the sandbox reaches the service.
    #[serde(default = "default_alias")]
    pub alias: String,

    /// Variable that carries the connection string into the sandbox.
    #[serde(default = "default_connection_env")]
    pub connection_env: String,

    /// Connection string with `{host}` and `{port}` placeholders.
    #[serde(default = "default_connection_template")]
    pub connection_template: String,

    /// Command run inside the service until it succeeds.
    #[serde(default = "default_ready_command")]
    pub ready_command: Option<String>,

    /// How long to wait for `ready_command`, in seconds.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

fn default_name() -> String {
    "db".to_string()
}

fn default_image() -> String {
    "postgres:alpine".to_string()
}

fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("POSTGRES_DB".to_string(), "app_test".to_string()),
        ("POSTGRES_PASSWORD".to_string(), "secret".to_string()),
    ])
}

fn default_port() -> u16 {
    5432
}

fn default_alias() -> String {
    "db".to_string()
}

fn default_connection_env() -> String {
    "DATABASE_URL".to_string()
}

fn default_connection_template() -> String {
    "postgresql://postgres:secret@{host}:{port}/app_test".to_string()
}

fn default_ready_command() -> Option<String> {
    Some("pg_isready -U postgres".to_string())
}

fn default_ready_timeout_secs() -> u64 {
    60
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            name: default_name(),
            kind: ServiceKind::default(),
            image: default_image(),
            env: default_env(),
            port: default_port(),
            alias: default_alias(),
            connection_env: default_connection_env(),
            connection_template: default_connection_template(),
            ready_command: default_ready_command(),
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

impl ServiceSpec {
    /// Returns the readiness timeout as a Duration.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Renders the connection string for a running instance.
    pub fn connection_string(&self, handle: &ServiceHandle) -> String {
        self.connection_template
            .replace("{host}", &handle.host)
            .replace("{port}", &handle.port.to_string())
    }
}

/// A running service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHandle {
    /// Unique instance identifier; never reused.
    pub id: String,
    /// Host the sandbox uses to reach the instance.
    pub host: String,
    pub port: u16,
    /// Network the sandbox must join, if any.
    pub network: Option<String>,
}

/// Backend that starts and stops service instances.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Starts a fresh instance and waits until it is ready.
    async fn provision(&self, spec: &ServiceSpec) -> Result<ServiceHandle>;

    /// Stops the instance and discards all of its state.
    async fn teardown(&self, handle: &ServiceHandle) -> Result<()>;

    /// Returns the name of this provider.
    fn name(&self) -> &str;
}

/// Provisions one service instance per test run.
#[derive(Clone)]
pub struct ServiceManager {
    provider: Arc<dyn ServiceProvider>,
    spec: ServiceSpec,
    provisioned: Arc<AtomicU64>,
}

impl ServiceManager {
    /// Creates a manager for `spec` backed by `provider`.
    pub fn new(provider: Arc<dyn ServiceProvider>, spec: ServiceSpec) -> Self {
        Self {
            provider,
            spec,
            provisioned: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the service declaration.
    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    /// Number of instances provisioned so far.
    pub fn provisioned(&self) -> u64 {
        self.provisioned.load(Ordering::SeqCst)
    }

    /// Starts a fresh instance.
    pub async fn provision(&self) -> Result<ServiceLease> {
        let handle = self.provider.provision(&self.spec).await.map_err(|e| match e {
            Error::ServiceBinding(msg) => Error::ServiceBinding(msg),
            other => Error::ServiceBinding(other.to_string()),
        })?;
        self.provisioned.fetch_add(1, Ordering::SeqCst);

        tracing::info!(
            provider = self.provider.name(),
            service = %self.spec.name,
            id = %handle.id,
            "provisioned ephemeral service"
        );

        Ok(ServiceLease {
            provider: Arc::clone(&self.provider),
            connection_string: self.spec.connection_string(&handle),
            handle,
            released: false,
        })
    }

    /// Returns `session` bound to the leased instance under the configured
    /// connection variable. Only the returned value sees the binding.
    pub fn bind(&self, session: &Session, lease: &ServiceLease) -> Session {
        session.bind(
            &self.spec.connection_env,
            lease.connection_string(),
            lease.handle().network.clone(),
        )
    }
}

/// Ownership of one running service instance.
pub struct ServiceLease {
    provider: Arc<dyn ServiceProvider>,
    handle: ServiceHandle,
    connection_string: String,
    released: bool,
}

impl ServiceLease {
    /// Returns the instance handle.
    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }

    /// Returns the rendered connection string.
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Tears the instance down.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let result = self.provider.teardown(&self.handle).await;
        match &result {
            Ok(()) => tracing::info!(id = %self.handle.id, "tore down ephemeral service"),
            Err(e) => tracing::error!(id = %self.handle.id, error = %e, "service teardown failed"),
        }
        result
    }
}

impl Drop for ServiceLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let handle = self.handle.clone();
        tracing::warn!(id = %handle.id, "service lease dropped without release, tearing down");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let provider = Arc::clone(&self.provider);
                runtime.spawn(async move {
                    if let Err(e) = provider.teardown(&handle).await {
                        tracing::error!(id = %handle.id, error = %e, "failed to tear down service on drop");
                    }
                });
            }
            Err(_) => {
                tracing::error!(id = %handle.id, "no async runtime available, service leaked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProvider {
        events: Mutex<Vec<String>>,
        counter: AtomicU64,
    }

    #[async_trait]
    impl ServiceProvider for RecordingProvider {
        async fn provision(&self, _spec: &ServiceSpec) -> Result<ServiceHandle> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let id = format!("svc-{}", n);
            self.events.lock().unwrap().push(format!("up {}", id));
            Ok(ServiceHandle {
                id,
                host: "db".to_string(),
                port: 5432,
                network: Some(format!("net-{}", n)),
            })
        }

        async fn teardown(&self, handle: &ServiceHandle) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("down {}", handle.id));
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[test]
    fn connection_string_renders_placeholders() {
        let spec = ServiceSpec::default();
        let handle = ServiceHandle {
            id: "x".to_string(),
            host: "db".to_string(),
            port: 5432,
            network: None,
        };
        assert_eq!(
            spec.connection_string(&handle),
            "postgresql://postgres:secret@db:5432/app_test"
        );
    }

    #[test]
    fn service_spec_parses_with_defaults() {
        let spec: ServiceSpec = toml::from_str("kind = \"directory\"\nport = 0\n").unwrap();
        assert_eq!(spec.kind, ServiceKind::Directory);
        assert_eq!(spec.port, 0);
        assert_eq!(spec.connection_env, "DATABASE_URL");
        assert_eq!(spec.ready_command.as_deref(), Some("pg_isready -U postgres"));
    }

    #[tokio::test]
    async fn each_provision_is_a_fresh_instance() {
        let provider = Arc::new(RecordingProvider::default());
        let manager = ServiceManager::new(provider.clone(), ServiceSpec::default());

        let first = manager.provision().await.unwrap();
        let first_id = first.handle().id.clone();
        first.release().await.unwrap();
        let second = manager.provision().await.unwrap();
        let second_id = second.handle().id.clone();
        second.release().await.unwrap();

        assert_ne!(first_id, second_id);
        assert_eq!(manager.provisioned(), 2);
        assert_eq!(
            *provider.events.lock().unwrap(),
            vec!["up svc-0", "down svc-0", "up svc-1", "down svc-1"]
        );
    }

    #[tokio::test]
    async fn dropped_lease_still_tears_down() {
        let provider = Arc::new(RecordingProvider::default());
        let manager = ServiceManager::new(provider.clone(), ServiceSpec::default());

        let lease = manager.provision().await.unwrap();
        drop(lease);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            *provider.events.lock().unwrap(),
            vec!["up svc-0", "down svc-0"]
        );
    }
}
