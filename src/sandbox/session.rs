//! Value-typed sandbox sessions.
//!
//! A [`Session`] is an immutable view of one execution environment: a
//! provisioned base, the baseline tree, and an overlay of mutations. Every
//! mutating operation returns the next session value and leaves the receiver
//! untouched, so two holders of a session can never observe each other's
//! writes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::error::{Error, Result};

use super::runtime::{CommandOutput, ExecRequest, Runtime};
use super::snapshot::{normalize_path, Snapshot};

/// A single overlay mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEntry {
    /// File contents replaced or created.
    Written { contents: Vec<u8>, executable: bool },
    /// File removed relative to the baseline.
    Removed,
}

/// Options fixed at session construction.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Working directory inside the environment.
    pub workdir: PathBuf,
    /// Directory names ignored when capturing command results.
    pub exclude: Vec<String>,
    /// Wall-clock limit for each command.
    pub exec_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("/app"),
            exclude: vec![".git".to_string()],
            exec_timeout: Duration::from_secs(600),
        }
    }
}

/// Opaque reference to a session's environment, handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Immutable provisioned environment.
    pub base_image_ref: String,
    /// Working directory inside the environment.
    pub workdir: PathBuf,
    /// Paths that differ from the baseline.
    pub modified_paths: Vec<PathBuf>,
    /// Exit code of the last command, if any.
    pub last_exit_code: Option<i32>,
}

struct Environment {
    runtime: Arc<dyn Runtime>,
    base_image_ref: String,
    baseline: Arc<Snapshot>,
    options: SessionOptions,
}

/// An isolated execution environment for one repair episode.
#[derive(Clone)]
pub struct Session {
    env: Arc<Environment>,
    overlay: BTreeMap<PathBuf, OverlayEntry>,
    last_command: Option<CommandOutput>,
    bound_env: BTreeMap<String, String>,
    network: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("runtime", &self.env.runtime.name())
            .field("base_image_ref", &self.env.base_image_ref)
            .field("overlay", &self.overlay.keys().collect::<Vec<_>>())
            .field("network", &self.network)
            .finish()
    }
}

impl Session {
    /// Provisions the environment and creates a session over `baseline`.
    ///
    /// Any failure here is an [`Error::EnvironmentProvision`].
    pub async fn create(
        runtime: Arc<dyn Runtime>,
        baseline: Arc<Snapshot>,
        options: SessionOptions,
    ) -> Result<Self> {
        let base_image_ref = runtime
            .prepare(&baseline, &options.workdir)
            .await
            .map_err(|e| match e {
                Error::EnvironmentProvision(msg) => Error::EnvironmentProvision(msg),
                other => Error::EnvironmentProvision(other.to_string()),
            })?;

        tracing::info!(
            runtime = runtime.name(),
            base_image_ref = %base_image_ref,
            files = baseline.len(),
            "created sandbox session"
        );

        Ok(Self {
            env: Arc::new(Environment {
                runtime,
                base_image_ref,
                baseline,
                options,
            }),
            overlay: BTreeMap::new(),
            last_command: None,
            bound_env: BTreeMap::new(),
            network: None,
        })
    }

    /// Returns the immutable base environment reference.
    pub fn base_image_ref(&self) -> &str {
        &self.env.base_image_ref
    }

    /// Returns the working directory inside the environment.
    pub fn workdir(&self) -> &Path {
        &self.env.options.workdir
    }

    /// Returns the overlay of mutations applied on top of the baseline.
    pub fn overlay(&self) -> &BTreeMap<PathBuf, OverlayEntry> {
        &self.overlay
    }

    /// Returns the result of the most recent command.
    pub fn last_command(&self) -> Option<&CommandOutput> {
        self.last_command.as_ref()
    }

    /// Returns an opaque reference for handoff.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            base_image_ref: self.env.base_image_ref.clone(),
            workdir: self.env.options.workdir.clone(),
            modified_paths: self.overlay.keys().cloned().collect(),
            last_exit_code: self.last_command.as_ref().map(|c| c.exit_code),
        }
    }

    /// Resolves a caller path to a path relative to the working directory.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        normalize_path(&self.env.options.workdir, raw)
    }

    fn resolve_file(&self, raw: &str) -> Result<PathBuf> {
        let path = self.resolve(raw)?;
        if path.as_os_str().is_empty() {
            return Err(Error::ToolArgument(format!("'{}' is a directory", raw)));
        }
        Ok(path)
    }

    fn lookup(&self, path: &Path) -> Option<&[u8]> {
        match self.overlay.get(path) {
            Some(OverlayEntry::Written { contents, .. }) => Some(contents),
            Some(OverlayEntry::Removed) => None,
            None => self.env.baseline.get(path),
        }
    }

    fn is_executable(&self, path: &Path) -> bool {
        match self.overlay.get(path) {
            Some(OverlayEntry::Written { executable, .. }) => *executable,
            Some(OverlayEntry::Removed) => false,
            None => self.env.baseline.is_executable(path),
        }
    }

    /// Reads a file's bytes.
    pub fn read_file(&self, raw: &str) -> Result<Vec<u8>> {
        let path = self.resolve_file(raw)?;
        self.lookup(&path)
            .map(<[u8]>::to_vec)
            .ok_or(Error::NotFound(path))
    }

    /// Reads a file as UTF-8 text.
    pub fn read_to_string(&self, raw: &str) -> Result<String> {
        let bytes = self.read_file(raw)?;
        String::from_utf8(bytes)
            .map_err(|_| Error::ToolArgument(format!("'{}' is not a UTF-8 text file", raw)))
    }

    /// Writes a file, returning the next session.
    ///
    /// Replacing an existing file keeps its executable bit.
    pub fn write_file(&self, raw: &str, contents: impl Into<Vec<u8>>) -> Result<Session> {
        let path = self.resolve_file(raw)?;
        let executable = self.is_executable(&path);
        let mut next = self.clone();
        next.overlay.insert(
            path,
            OverlayEntry::Written {
                contents: contents.into(),
                executable,
            },
        );
        Ok(next)
    }

    /// Writes every file of `dir` below `raw`, returning the next session.
    pub fn write_directory(&self, raw: &str, dir: &Snapshot) -> Result<Session> {
        let root = self.resolve(raw)?;
        let mut next = self.clone();
        for (relative, contents) in dir.files() {
            let path = normalize_path(Path::new("/"), &root.join(relative).to_string_lossy())?;
            next.overlay.insert(
                path,
                OverlayEntry::Written {
                    contents: contents.clone(),
                    executable: dir.is_executable(relative),
                },
            );
        }
        Ok(next)
    }

    /// Lists the entry names directly under a directory, sorted.
    pub fn list_directory(&self, raw: &str) -> Result<Vec<String>> {
        let dir = self.resolve(raw)?;
        let tree = self.tree();
        let mut entries = BTreeSet::new();
        for path in tree.files().keys() {
            if let Ok(rest) = path.strip_prefix(&dir) {
                if let Some(first) = rest.components().next() {
                    entries.insert(first.as_os_str().to_string_lossy().into_owned());
                }
            }
        }

        if entries.is_empty() && !dir.as_os_str().is_empty() {
            return Err(Error::NotFound(dir));
        }
        Ok(entries.into_iter().collect())
    }

    /// Returns the effective tree: baseline with the overlay applied.
    pub fn tree(&self) -> Snapshot {
        let mut tree = (*self.env.baseline).clone();
        for (path, entry) in &self.overlay {
            tree = match entry {
                OverlayEntry::Written {
                    contents,
                    executable,
                } => tree
                    .with_file(path.clone(), contents.clone())
                    .with_executable(path.clone(), *executable),
                OverlayEntry::Removed => tree.without_file(path),
            };
        }
        tree
    }

    /// Returns a session bound to a service for a single execution.
    ///
    /// The binding's variables are injected and the command joins the
    /// service's network. The receiver is unaffected.
    pub fn bind(
        &self,
        env_var: &str,
        connection_string: &str,
        network: Option<String>,
    ) -> Session {
        let mut bound = self.clone();
        bound
            .bound_env
            .insert(env_var.to_string(), connection_string.to_string());
        bound.network = network;
        bound
    }

    /// Returns a session with extra environment variables for its commands.
    pub fn with_env(&self, env: &BTreeMap<String, String>) -> Session {
        let mut next = self.clone();
        next.bound_env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        next
    }

    /// Runs a command, returning the next session and the command output.
    ///
    /// Files the command creates, edits or deletes become part of the next
    /// session. A non-zero exit is reported in the output, not as an error.
    pub async fn exec(&self, command: &str) -> Result<(Session, CommandOutput)> {
        let (tree, output) = self.run_scratch(command).await?;

        let mut next = self.clone();
        next.overlay = overlay_from(&self.env.baseline, &tree);
        next.last_command = Some(output.clone());
        Ok((next, output))
    }

    /// Runs a command against a scratch copy, returning the resulting tree
    /// without adopting it.
    pub(crate) async fn run_scratch(&self, command: &str) -> Result<(Snapshot, CommandOutput)> {
        let scratch = TempDir::new()?;
        self.tree().materialize(scratch.path())?;

        let request = ExecRequest {
            base_image_ref: self.env.base_image_ref.clone(),
            host_dir: scratch.path().to_path_buf(),
            workdir: self.env.options.workdir.clone(),
            command: command.to_string(),
            env: self.bound_env.clone(),
            network: self.network.clone(),
            timeout: self.env.options.exec_timeout,
        };

        let output = self.env.runtime.exec(request).await?;
        tracing::info!(
            command = %command,
            exit_code = output.exit_code,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "command finished"
        );

        let tree = Snapshot::load(scratch.path(), &self.env.options.exclude)?;
        Ok((tree, output))
    }
}

/// Computes the overlay that turns `baseline` into `tree`.
fn overlay_from(baseline: &Snapshot, tree: &Snapshot) -> BTreeMap<PathBuf, OverlayEntry> {
    let mut overlay = BTreeMap::new();
    for (path, contents) in tree.files() {
        let executable = tree.is_executable(path);
        if baseline.get(path) != Some(contents.as_slice())
            || baseline.is_executable(path) != executable
        {
            overlay.insert(
                path.clone(),
                OverlayEntry::Written {
                    contents: contents.clone(),
                    executable,
                },
            );
        }
    }
    for path in baseline.files().keys() {
        if !tree.contains(path) {
            overlay.insert(path.clone(), OverlayEntry::Removed);
        }
    }
    overlay
}
