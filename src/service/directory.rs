//! Scratch-directory services for file-backed databases.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::error::{Error, Result};

use super::{ServiceHandle, ServiceProvider, ServiceSpec};

/// Provides each instance as a new empty directory; its path is the
/// instance host. Teardown deletes the directory and everything written to it.
///
/// Readiness commands are not run: a directory is ready once created.
pub struct DirectoryServiceProvider {
    base_dir: Option<PathBuf>,
    live: Mutex<HashMap<String, TempDir>>,
}

impl Default for DirectoryServiceProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl DirectoryServiceProvider {
    /// Creates a provider. Directories are created under `base_dir`, or the
    /// system temp directory when `None`.
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self {
            base_dir,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Number of instances currently alive.
    pub fn live_instances(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ServiceProvider for DirectoryServiceProvider {
    async fn provision(&self, spec: &ServiceSpec) -> Result<ServiceHandle> {
        let prefix = format!("sandbox-heal-{}-", spec.name);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.base_dir {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };

        let host = dir.path().display().to_string();
        let id = dir
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| host.clone());

        self.live
            .lock()
            .map_err(|_| Error::ServiceBinding("service registry poisoned".to_string()))?
            .insert(id.clone(), dir);

        Ok(ServiceHandle {
            id,
            host,
            port: spec.port,
            network: None,
        })
    }

    async fn teardown(&self, handle: &ServiceHandle) -> Result<()> {
        let dir = self
            .live
            .lock()
            .map_err(|_| Error::ServiceBinding("service registry poisoned".to_string()))?
            .remove(&handle.id);

        match dir {
            Some(dir) => dir.close().map_err(Error::Io),
            None => Err(Error::ServiceBinding(format!(
                "unknown service instance {}",
                handle.id
            ))),
        }
    }

    fn name(&self) -> &str {
        "directory"
    }
}
