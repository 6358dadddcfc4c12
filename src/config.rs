//! Episode configuration and validation.
//!
//! [`RepairConfig`] is read from TOML; every field has a default so an empty
//! file is a valid configuration. Validation runs before any environment is
//! provisioned to catch errors early.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::harness::TestSettings;
use crate::sandbox::{DockerRuntime, LocalRuntime, Runtime, SessionOptions};
use crate::service::{
    DirectoryServiceProvider, DockerServiceProvider, ServiceKind, ServiceProvider, ServiceSpec,
};

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Execution backend for sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Local,
}

/// How the sandbox environment is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub kind: RuntimeKind,

    /// Base image (docker only).
    #[serde(default = "default_image")]
    pub image: String,

    /// Working directory inside the environment.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// Dependency installation commands, run once per episode.
    #[serde(default = "default_setup")]
    pub setup: Vec<String>,

    /// Named cache volumes (volume name -> mount path), docker only.
    #[serde(default)]
    pub cache_volumes: BTreeMap<String, String>,

    /// Directory names left out of the baseline snapshot.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Wall-clock limit for each command, in seconds.
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
}

fn default_image() -> String {
    "python:3.11".to_string()
}

fn default_workdir() -> PathBuf {
    PathBuf::from("/app")
}

fn default_setup() -> Vec<String> {
    vec!["pip install -r requirements.txt".to_string()]
}

fn default_exclude() -> Vec<String> {
    [".git", ".dagger", "__pycache__", ".pytest_cache"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_exec_timeout_secs() -> u64 {
    600
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::default(),
            image: default_image(),
            workdir: default_workdir(),
            setup: default_setup(),
            cache_volumes: BTreeMap::new(),
            exclude: default_exclude(),
            exec_timeout_secs: default_exec_timeout_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Builds the configured runtime.
    pub fn build(&self) -> Arc<dyn Runtime> {
        match self.kind {
            RuntimeKind::Docker => Arc::new(
                DockerRuntime::new(&self.image)
                    .with_setup(self.setup.clone())
                    .with_cache_volumes(self.cache_volumes.clone()),
            ),
            RuntimeKind::Local => Arc::new(LocalRuntime::new().with_setup(self.setup.clone())),
        }
    }

    /// Returns the session options this runtime configuration implies.
    pub fn session_options(&self) -> SessionOptions {
        let mut exclude = self.exclude.clone();
        if !exclude.iter().any(|e| e == ".git") {
            exclude.push(".git".to_string());
        }
        SessionOptions {
            workdir: self.workdir.clone(),
            exclude,
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
        }
    }
}

/// Builds the provider for a service declaration.
pub fn build_provider(spec: &ServiceSpec) -> Arc<dyn ServiceProvider> {
    match spec.kind {
        ServiceKind::Docker => Arc::new(DockerServiceProvider::new()),
        ServiceKind::Directory => Arc::new(DirectoryServiceProvider::default()),
    }
}

/// Repair loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Maximum number of decision turns.
    #[serde(default = "default_budget")]
    pub budget: u32,

    /// Wall-clock limit for one decision or one tool call, in seconds.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Replaces the built-in instructions.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Appends audit events as JSON lines to this file.
    #[serde(default)]
    pub audit_path: Option<PathBuf>,
}

fn default_budget() -> u32 {
    30
}

fn default_attempt_timeout_secs() -> u64 {
    900
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            budget: default_budget(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            system_prompt: None,
            audit_path: None,
        }
    }
}

impl ControllerConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Complete configuration of a repair episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub service: ServiceSpec,
    #[serde(default)]
    pub test: TestSettings,
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl RepairConfig {
    /// Parses a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reads and parses a TOML file, then validates it.
    ///
    /// Returns the configuration with any validation warnings.
    pub fn load(path: &Path) -> Result<(Self, Vec<String>)> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_toml(&text)?;
        let warnings = config.validate().into_result()?;
        Ok((config, warnings))
    }
}

impl Validate for RuntimeConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !self.workdir.is_absolute() {
            result.add_error(format!(
                "runtime.workdir '{}' must be absolute",
                self.workdir.display()
            ));
        }

        if self.kind == RuntimeKind::Docker && self.image.trim().is_empty() {
            result.add_error("runtime.image cannot be empty for the docker runtime");
        }

        if self.exec_timeout_secs == 0 {
            result.add_error("runtime.exec_timeout_secs must be at least 1");
        }

        if self.kind == RuntimeKind::Local && !self.cache_volumes.is_empty() {
            result.add_warning("runtime.cache_volumes are ignored by the local runtime");
        }

        result
    }
}

impl Validate for ServiceSpec {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.connection_env.trim().is_empty() {
            result.add_error("service.connection_env cannot be empty");
        }

        if !self.connection_template.contains("{host}") {
            result.add_error("service.connection_template must contain {host}");
        }

        if self.kind == ServiceKind::Docker && self.image.trim().is_empty() {
            result.add_error("service.image cannot be empty for docker services");
        }

        if self.kind == ServiceKind::Directory && self.ready_command.is_some() {
            result.add_warning("service.ready_command is not run for directory services");
        }

        if self.ready_timeout_secs > 600 {
            result.add_warning("service.ready_timeout_secs over 10 minutes may indicate a misconfiguration");
        }

        result
    }
}

impl Validate for TestSettings {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.command.trim().is_empty() {
            result.add_error("test.command cannot be empty");
        }

        if self.pre_commands.iter().any(|c| c.trim().is_empty()) {
            result.add_error("test.pre_commands cannot contain empty commands");
        }

        result
    }
}

impl Validate for ControllerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.budget == 0 {
            result.add_error("controller.budget must be at least 1");
        }

        if self.budget > 100 {
            result.add_warning("controller.budget > 100 may lead to excessive decision calls");
        }

        if self.attempt_timeout_secs == 0 {
            result.add_error("controller.attempt_timeout_secs must be at least 1");
        }

        result
    }
}

impl Validate for RepairConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = self.runtime.validate();
        result.merge(self.service.validate());
        result.merge(self.test.validate());
        result.merge(self.controller.validate());

        // The bound test run must finish, or hit its own deadline, before the
        // per-attempt deadline drops it mid-execution.
        let test_run_secs = self
            .runtime
            .exec_timeout_secs
            .saturating_add(self.service.ready_timeout_secs);
        if self.controller.attempt_timeout_secs <= test_run_secs {
            result.add_error(format!(
                "controller.attempt_timeout_secs ({}) must exceed runtime.exec_timeout_secs plus service.ready_timeout_secs ({})",
                self.controller.attempt_timeout_secs, test_run_secs
            ));
        }

        if self.runtime.kind == RuntimeKind::Local && self.service.kind == ServiceKind::Docker {
            result.add_warning(
                "local runtime cannot join docker service networks; use a directory service",
            );
        }

        result
    }
}
