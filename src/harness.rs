//! Test harness: run the suite against a freshly provisioned service.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sandbox::{CommandOutput, Session};
use crate::service::ServiceManager;

/// How the suite is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSettings {
    /// The test command.
    #[serde(default = "default_command")]
    pub command: String,

    /// Commands run before the test command in the same bound execution
    /// (schema creation, fixtures).
    #[serde(default)]
    pub pre_commands: Vec<String>,

    /// Extra variables for the test execution.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_command() -> String {
    "pytest".to_string()
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            command: default_command(),
            pre_commands: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl TestSettings {
    /// Creates settings for a single test command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Returns the full script run inside the bound execution.
    pub fn script(&self) -> String {
        self.pre_commands
            .iter()
            .chain(std::iter::once(&self.command))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

/// Binary test status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
}

/// Result of one test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    pub status: TestStatus,
    pub exit_code: i32,
    /// Diagnostic payload: stdout on pass, stderr verbatim on failure
    /// (stdout when stderr is empty).
    pub report: String,
    pub stdout: String,
    pub stderr: String,
    /// Identifier of the service instance the run was bound to.
    pub service_id: String,
    pub duration: Duration,
}

impl TestOutcome {
    /// Returns true if the suite passed.
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Pass
    }

    fn classify(output: CommandOutput, service_id: String, duration: Duration) -> Self {
        let status = if output.success() {
            TestStatus::Pass
        } else {
            TestStatus::Fail
        };
        let report = match status {
            TestStatus::Pass => output.stdout.clone(),
            TestStatus::Fail if !output.stderr.is_empty() => output.stderr.clone(),
            TestStatus::Fail => output.stdout.clone(),
        };
        Self {
            status,
            exit_code: output.exit_code,
            report,
            stdout: output.stdout,
            stderr: output.stderr,
            service_id,
            duration,
        }
    }
}

/// Runs the suite inside a session bound to an ephemeral service.
#[derive(Clone)]
pub struct TestHarness {
    settings: TestSettings,
    services: ServiceManager,
}

impl TestHarness {
    pub fn new(settings: TestSettings, services: ServiceManager) -> Self {
        Self { settings, services }
    }

    /// Runs the suite once.
    ///
    /// A fresh service instance is provisioned for this run and torn down
    /// after the output is captured, on every exit path. A failing suite is
    /// an `Ok` outcome with [`TestStatus::Fail`]; errors are reserved for
    /// provisioning and execution faults. File changes the suite makes are
    /// discarded.
    pub async fn run(&self, session: &Session) -> Result<TestOutcome> {
        let lease = self.services.provision().await?;
        let service_id = lease.handle().id.clone();
        let bound = self
            .services
            .bind(session, &lease)
            .with_env(&self.settings.env);

        let started = Instant::now();
        let executed = bound.run_scratch(&self.settings.script()).await;

        if let Err(e) = lease.release().await {
            tracing::warn!(service = %service_id, error = %e, "teardown after test run failed");
        }

        let (_, output) = executed?;
        let outcome = TestOutcome::classify(output, service_id, started.elapsed());
        tracing::info!(
            status = ?outcome.status,
            exit_code = outcome.exit_code,
            duration_ms = outcome.duration.as_millis() as u64,
            "test run finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use std::path::Path;

    use crate::error::Error;
    use crate::sandbox::{ExecRequest, LocalRuntime, Runtime, SessionOptions, Snapshot};
    use crate::service::{DirectoryServiceProvider, ServiceKind, ServiceSpec};

    fn spec() -> ServiceSpec {
        ServiceSpec {
            kind: ServiceKind::Directory,
            connection_template: "{host}".to_string(),
            ready_command: None,
            ..Default::default()
        }
    }

    async fn fixture(files: &[(&str, &str)]) -> (Session, Arc<DirectoryServiceProvider>) {
        let baseline = Snapshot::from_files(files.iter().map(|(p, c)| (*p, *c)));
        let session = Session::create(
            Arc::new(LocalRuntime::new()),
            Arc::new(baseline),
            SessionOptions::default(),
        )
        .await
        .unwrap();
        (session, Arc::new(DirectoryServiceProvider::default()))
    }

    #[test]
    fn script_chains_pre_commands() {
        let settings = TestSettings {
            command: "pytest".to_string(),
            pre_commands: vec!["alembic upgrade head".to_string()],
            env: BTreeMap::new(),
        };
        assert_eq!(settings.script(), "alembic upgrade head && pytest");
        assert_eq!(TestSettings::new("make test").script(), "make test");
    }

    #[tokio::test]
    async fn zero_exit_is_pass() {
        let (session, provider) = fixture(&[("run.sh", "echo 3 passed\n")]).await;
        let harness = TestHarness::new(
            TestSettings::new("sh run.sh"),
            ServiceManager::new(provider.clone(), spec()),
        );

        let outcome = harness.run(&session).await.unwrap();

        assert!(outcome.passed());
        assert_eq!(outcome.report, "3 passed\n");
        assert_eq!(provider.live_instances(), 0);
    }

    #[tokio::test]
    async fn failure_surfaces_stderr_verbatim() {
        let (session, provider) =
            fixture(&[("run.sh", "echo collected 1 item\necho 'E  missing field' >&2\nexit 1\n")])
                .await;
        let harness = TestHarness::new(
            TestSettings::new("sh run.sh"),
            ServiceManager::new(provider.clone(), spec()),
        );

        let outcome = harness.run(&session).await.unwrap();

        assert_eq!(outcome.status, TestStatus::Fail);
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.report, "E  missing field\n");
        assert_eq!(outcome.stdout, "collected 1 item\n");
        assert_eq!(provider.live_instances(), 0);
    }

    #[tokio::test]
    async fn connection_variable_and_extra_env_are_injected() {
        let (session, provider) = fixture(&[]).await;
        let mut settings = TestSettings::new("test -d \"$DATABASE_URL\" && test \"$APP_ENV\" = test");
        settings.env.insert("APP_ENV".to_string(), "test".to_string());
        let harness = TestHarness::new(settings, ServiceManager::new(provider, spec()));

        let outcome = harness.run(&session).await.unwrap();
        assert!(outcome.passed(), "report: {}", outcome.report);
    }

    #[tokio::test]
    async fn test_run_does_not_mutate_session() {
        let (session, provider) = fixture(&[("a.txt", "a")]).await;
        let harness = TestHarness::new(
            TestSettings::new("echo junk > cache.txt"),
            ServiceManager::new(provider, spec()),
        );

        harness.run(&session).await.unwrap();

        assert!(session.overlay().is_empty());
        assert!(matches!(session.read_file("cache.txt"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn executable_test_script_runs_directly() {
        let baseline = Snapshot::from_files([("run_tests.sh", "#!/bin/sh\necho 1 passed\n")])
            .with_executable("run_tests.sh", true);
        let session = Session::create(
            Arc::new(LocalRuntime::new()),
            Arc::new(baseline),
            SessionOptions::default(),
        )
        .await
        .unwrap();
        let provider = Arc::new(DirectoryServiceProvider::default());
        let harness = TestHarness::new(
            TestSettings::new("./run_tests.sh"),
            ServiceManager::new(provider, spec()),
        );

        let outcome = harness.run(&session).await.unwrap();

        assert!(outcome.passed(), "exit {}: {}", outcome.exit_code, outcome.report);
        assert_eq!(outcome.report, "1 passed\n");
    }

    struct FailingRuntime;

    #[async_trait::async_trait]
    impl Runtime for FailingRuntime {
        async fn prepare(&self, _baseline: &Snapshot, _workdir: &Path) -> Result<String> {
            Ok("failing:1".to_string())
        }

        async fn exec(&self, _request: ExecRequest) -> Result<CommandOutput> {
            Err(Error::Io(std::io::Error::other("runtime went away")))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn execution_error_still_tears_down_service() {
        let session = Session::create(
            Arc::new(FailingRuntime),
            Arc::new(Snapshot::new()),
            SessionOptions::default(),
        )
        .await
        .unwrap();
        let provider = Arc::new(DirectoryServiceProvider::default());
        let services = ServiceManager::new(provider.clone(), spec());
        let harness = TestHarness::new(TestSettings::new("pytest"), services.clone());

        let result = harness.run(&session).await;

        match result {
            Err(Error::Io(e)) => assert!(e.to_string().contains("runtime went away")),
            other => panic!("expected runtime error, got {:?}", other.map(|o| o.status)),
        }
        assert_eq!(services.provisioned(), 1);
        assert_eq!(provider.live_instances(), 0);
    }

    #[tokio::test]
    async fn service_state_does_not_survive_between_runs() {
        let (session, provider) = fixture(&[]).await;
        let harness = TestHarness::new(
            TestSettings::new("test ! -e \"$DATABASE_URL/rows\" && echo row > \"$DATABASE_URL/rows\""),
            ServiceManager::new(provider, spec()),
        );

        let first = harness.run(&session).await.unwrap();
        let second = harness.run(&session).await.unwrap();

        assert!(first.passed(), "first run: {}", first.report);
        assert!(second.passed(), "second run: {}", second.report);
        assert_ne!(first.service_id, second.service_id);
    }
}
