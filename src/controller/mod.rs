//! The repair loop.
//!
//! A [`RepairController`] runs one episode: it builds a session from the
//! baseline, then alternates between asking the decision function for the
//! next step and executing the requested tool until the decision function
//! claims completion and a verification run passes, the attempt budget is
//! used up, or an unrecoverable error occurs.
//!
//! ```text
//! Init -> Deliberating -> ExecutingTool -> Deliberating | Converged | Exhausted | Aborted
//! ```

pub mod decision;
pub mod script;

pub use decision::{CommandDecision, Decision, DecisionContext, DecisionFunction, Turn};
pub use script::ScriptedDecision;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{ControllerConfig, RepairConfig};
use crate::diff::DiffEngine;
use crate::error::{Error, Result};
use crate::harness::{TestHarness, TestSettings};
use crate::prompt;
use crate::report::{render_comment, Confirmation, ReportTarget, Reporter};
use crate::sandbox::{Runtime, Session, SessionHandle, SessionOptions, Snapshot};
use crate::secrets::{Credential, Redactor};
use crate::service::{ServiceManager, ServiceProvider, ServiceSpec};
use crate::tools::{AuditLog, ToolCall, ToolInvocation, ToolResult, Toolbox};

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeState {
    Init,
    Deliberating,
    ExecutingTool,
    Converged,
    Exhausted,
    Aborted,
}

/// How an episode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// The decision function finished and the tests passed.
    Converged,
    /// The budget ran out without a verified pass.
    Exhausted,
    /// An unrecoverable error ended the episode.
    Aborted,
}

impl TerminalStatus {
    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminalStatus::Converged => 0,
            TerminalStatus::Exhausted => 1,
            TerminalStatus::Aborted => 2,
        }
    }
}

impl From<TerminalStatus> for EpisodeState {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Converged => EpisodeState::Converged,
            TerminalStatus::Exhausted => EpisodeState::Exhausted,
            TerminalStatus::Aborted => EpisodeState::Aborted,
        }
    }
}

/// Bookkeeping for one episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairEpisode {
    pub id: String,
    /// Decision turns taken.
    pub attempts_used: u32,
    pub budget: u32,
    /// Set once, when the episode ends.
    pub terminal_status: Option<TerminalStatus>,
    pub final_summary: Option<String>,
}

/// Outcome of the reporting step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportStatus {
    /// No reporter configured, or the episode did not converge.
    NotRequested,
    Posted { confirmation: Confirmation },
    Failed { error: String },
}

/// Everything the caller learns about a finished episode.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeReport {
    pub episode: RepairEpisode,
    pub status: TerminalStatus,
    /// Terminal answer, exhaustion notice or abort reason.
    pub summary: String,
    /// Unified diff against the baseline; empty when nothing changed or the
    /// diff could not be computed.
    pub diff: String,
    /// Report of the most recent failing test run.
    pub last_failure: Option<String>,
    /// Error that aborted the episode.
    pub error: Option<String>,
    pub report: ReportStatus,
    /// Reference to the final environment, if one was built.
    pub handle: Option<SessionHandle>,
    /// States visited, in order.
    pub transitions: Vec<EpisodeState>,
    /// Service instances provisioned during the episode.
    pub services_provisioned: u64,
    pub audit: Vec<ToolInvocation>,
    pub warnings: Vec<String>,
}

impl EpisodeReport {
    pub fn converged(&self) -> bool {
        self.status == TerminalStatus::Converged
    }
}

struct ReportSink {
    reporter: Arc<dyn Reporter>,
    target: ReportTarget,
    credential: Credential,
}

/// Drives repair episodes.
pub struct RepairController {
    runtime: Arc<dyn Runtime>,
    provider: Arc<dyn ServiceProvider>,
    decision: Arc<dyn DecisionFunction>,
    options: SessionOptions,
    service: ServiceSpec,
    test: TestSettings,
    settings: ControllerConfig,
    sink: Option<ReportSink>,
}

/// Mutable state of a running episode.
struct Progress {
    episode: RepairEpisode,
    state: EpisodeState,
    transitions: Vec<EpisodeState>,
    history: Vec<Turn>,
    draft: Option<String>,
    last_failure: Option<String>,
    warnings: Vec<String>,
}

impl Progress {
    fn transition(&mut self, to: EpisodeState) {
        if self.state != to {
            tracing::debug!(episode = %self.episode.id, from = ?self.state, to = ?to, "state transition");
        }
        self.state = to;
        self.transitions.push(to);
    }

    fn record_tool(&mut self, call: ToolCall, success: bool, output: String) {
        self.history.push(Turn::Tool {
            result: ToolResult {
                tool: call.name.clone(),
                success,
                output,
            },
            call,
        });
    }
}

/// How the loop ended, before the diff and report are produced.
struct Ending {
    status: TerminalStatus,
    summary: String,
    error: Option<String>,
}

impl RepairController {
    /// Creates a controller from a configuration.
    pub fn new(
        runtime: Arc<dyn Runtime>,
        provider: Arc<dyn ServiceProvider>,
        decision: Arc<dyn DecisionFunction>,
        config: &RepairConfig,
    ) -> Self {
        Self {
            runtime,
            provider,
            decision,
            options: config.runtime.session_options(),
            service: config.service.clone(),
            test: config.test.clone(),
            settings: config.controller.clone(),
            sink: None,
        }
    }

    /// Posts a report to `target` once an episode converges.
    pub fn with_reporter(
        mut self,
        reporter: Arc<dyn Reporter>,
        target: ReportTarget,
        credential: Credential,
    ) -> Self {
        self.sink = Some(ReportSink {
            reporter,
            target,
            credential,
        });
        self
    }

    /// Appends audit events as JSON lines to `path`.
    pub fn with_audit_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.audit_path = Some(path.into());
        self
    }

    fn redactor(&self) -> Redactor {
        let mut redactor = Redactor::new();
        for (key, value) in &self.service.env {
            if key.contains("PASSWORD") || key.contains("TOKEN") || key.contains("SECRET") {
                redactor.add(key.clone(), value.clone());
            }
        }
        match &self.sink {
            Some(sink) => redactor.with_credential(&sink.credential),
            None => redactor,
        }
    }

    fn audit_log(&self) -> AuditLog {
        let log = AuditLog::new().with_redactor(self.redactor());
        match &self.settings.audit_path {
            Some(path) => log.with_sink(path.clone()),
            None => log,
        }
    }

    /// Runs one episode over `baseline`.
    ///
    /// Never fails: every error is folded into the returned report.
    pub async fn run(&self, baseline: Snapshot) -> EpisodeReport {
        let mut progress = Progress {
            episode: RepairEpisode {
                id: uuid::Uuid::new_v4().to_string(),
                attempts_used: 0,
                budget: self.settings.budget,
                terminal_status: None,
                final_summary: None,
            },
            state: EpisodeState::Init,
            transitions: vec![EpisodeState::Init],
            history: Vec::new(),
            draft: None,
            last_failure: None,
            warnings: Vec::new(),
        };
        let mut audit = self.audit_log();

        tracing::info!(
            episode = %progress.episode.id,
            budget = self.settings.budget,
            files = baseline.len(),
            decision = self.decision.name(),
            "starting repair episode"
        );

        let diff_engine = Arc::new(DiffEngine::new(baseline.clone()));
        let services = ServiceManager::new(Arc::clone(&self.provider), self.service.clone());

        let session = match Session::create(
            Arc::clone(&self.runtime),
            Arc::new(baseline),
            self.options.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                let ending = Ending {
                    status: TerminalStatus::Aborted,
                    summary: format!("environment could not be constructed: {}", e),
                    error: Some(e.to_string()),
                };
                return self
                    .finish(progress, ending, None, &diff_engine, &services, audit)
                    .await;
            }
        };

        let toolbox = Toolbox::new(TestHarness::new(self.test.clone(), services.clone()), Arc::clone(&diff_engine))
            .with_call_timeout(self.settings.attempt_timeout());
        let tools = toolbox.specs();
        let system_prompt = prompt::assemble(self.settings.system_prompt.as_deref(), &tools);

        let (session, ending) = self
            .deliberate(session, &toolbox, &tools, &system_prompt, &mut progress, &mut audit)
            .await;

        self.finish(progress, ending, Some(session), &diff_engine, &services, audit)
            .await
    }

    async fn deliberate(
        &self,
        mut session: Session,
        toolbox: &Toolbox,
        tools: &[crate::tools::ToolSpec],
        system_prompt: &str,
        progress: &mut Progress,
        audit: &mut AuditLog,
    ) -> (Session, Ending) {
        let limit = self.settings.attempt_timeout();

        loop {
            if progress.episode.attempts_used >= progress.episode.budget {
                let summary = format!(
                    "attempt budget of {} exhausted without a passing test run",
                    progress.episode.budget
                );
                return (
                    session,
                    Ending {
                        status: TerminalStatus::Exhausted,
                        summary,
                        error: None,
                    },
                );
            }

            progress.episode.attempts_used += 1;
            progress.transition(EpisodeState::Deliberating);

            let context = DecisionContext {
                system_prompt,
                tools,
                history: &progress.history,
                attempt: progress.episode.attempts_used,
                budget: progress.episode.budget,
            };
            let decided = match tokio::time::timeout(limit, self.decision.decide(&context)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(limit)),
            };

            match decided {
                Err(e) if e.is_fatal() => {
                    return (session, aborted(e));
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = progress.episode.attempts_used,
                        error = %e,
                        "decision function failed"
                    );
                    progress.history.push(Turn::DecisionError {
                        message: e.to_string(),
                    });
                }
                Ok(Decision::Call(call)) => {
                    progress.transition(EpisodeState::ExecutingTool);
                    match toolbox.dispatch(&session, &call, audit).await {
                        Ok(effect) => {
                            if let Some(next) = effect.next_session {
                                session = next;
                            }
                            if let Some(draft) = effect.draft_comment {
                                progress.draft = Some(draft);
                            }
                            if let Some(outcome) = &effect.test {
                                if !outcome.passed() {
                                    progress.last_failure = Some(outcome.report.clone());
                                }
                            }
                            progress.record_tool(call, effect.success, effect.output);
                        }
                        Err(e) if e.is_fatal() => return (session, aborted(e)),
                        Err(e) => {
                            tracing::warn!(tool = %call.name, error = %e, "tool call failed");
                            progress.record_tool(call, false, e.to_string());
                        }
                    }
                }
                Ok(Decision::Finish { answer }) => {
                    progress.transition(EpisodeState::ExecutingTool);
                    let verify = ToolCall::new("test", json!({}));
                    match toolbox.dispatch(&session, &verify, audit).await {
                        Ok(effect) => match effect.test {
                            Some(outcome) if outcome.passed() => {
                                return (
                                    session,
                                    Ending {
                                        status: TerminalStatus::Converged,
                                        summary: answer,
                                        error: None,
                                    },
                                );
                            }
                            outcome => {
                                let report = outcome.map(|o| o.report).unwrap_or(effect.output);
                                tracing::info!(
                                    attempt = progress.episode.attempts_used,
                                    "claimed fix failed verification"
                                );
                                progress.last_failure = Some(report.clone());
                                progress.history.push(Turn::Verification {
                                    answer,
                                    passed: false,
                                    report,
                                });
                            }
                        },
                        Err(e) if e.is_fatal() => return (session, aborted(e)),
                        Err(e) => {
                            tracing::warn!(error = %e, "verification run failed");
                            progress.history.push(Turn::Verification {
                                answer,
                                passed: false,
                                report: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn finish(
        &self,
        mut progress: Progress,
        ending: Ending,
        session: Option<Session>,
        diff_engine: &DiffEngine,
        services: &ServiceManager,
        audit: AuditLog,
    ) -> EpisodeReport {
        progress.transition(ending.status.into());

        let diff = match &session {
            Some(session) => match diff_engine.diff(session).await {
                Ok(diff) => diff,
                Err(e) => {
                    tracing::warn!(error = %e, "diff unavailable, reporting empty diff");
                    progress.warnings.push(e.to_string());
                    String::new()
                }
            },
            None => String::new(),
        };

        let report = match (&self.sink, ending.status) {
            (Some(sink), TerminalStatus::Converged) => {
                let summary = progress.draft.as_deref().unwrap_or(&ending.summary);
                let body = render_comment(summary, &diff);
                match self.post(sink, &body).await {
                    Ok(confirmation) => ReportStatus::Posted { confirmation },
                    Err(e) => {
                        tracing::warn!(error = %e, "report could not be posted");
                        ReportStatus::Failed {
                            error: e.to_string(),
                        }
                    }
                }
            }
            _ => ReportStatus::NotRequested,
        };

        progress.episode.terminal_status = Some(ending.status);
        progress.episode.final_summary = Some(ending.summary.clone());

        tracing::info!(
            episode = %progress.episode.id,
            status = ?ending.status,
            attempts = progress.episode.attempts_used,
            tool_calls = audit.invocations(),
            diff_bytes = diff.len(),
            "repair episode finished"
        );

        EpisodeReport {
            status: ending.status,
            summary: ending.summary,
            diff,
            last_failure: progress.last_failure,
            error: ending.error,
            report,
            handle: session.as_ref().map(Session::handle),
            transitions: progress.transitions,
            services_provisioned: services.provisioned(),
            audit: audit.into_events(),
            warnings: progress.warnings,
            episode: progress.episode,
        }
    }

    async fn post(&self, sink: &ReportSink, body: &str) -> Result<Confirmation> {
        let limit = self.settings.attempt_timeout().min(Duration::from_secs(120));
        tokio::time::timeout(limit, sink.reporter.post(&sink.target, body, &sink.credential))
            .await
            .map_err(|_| Error::Reporting(format!("timed out after {:?}", limit)))?
    }
}

fn aborted(error: Error) -> Ending {
    tracing::error!(error = %error, "unrecoverable error, aborting episode");
    Ending {
        status: TerminalStatus::Aborted,
        summary: format!("episode aborted: {}", error),
        error: Some(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::config::RuntimeKind;
    use crate::sandbox::{ExecRequest, CommandOutput, LocalRuntime};
    use crate::service::{DirectoryServiceProvider, ServiceKind};

    fn config(budget: u32, test_command: &str) -> RepairConfig {
        let mut config = RepairConfig::default();
        config.runtime.kind = RuntimeKind::Local;
        config.runtime.setup = Vec::new();
        config.service.kind = ServiceKind::Directory;
        config.service.ready_command = None;
        config.service.connection_template = "{host}".to_string();
        config.test = TestSettings::new(test_command);
        config.controller.budget = budget;
        config
    }

    fn controller(config: &RepairConfig, decisions: Vec<Decision>) -> RepairController {
        RepairController::new(
            Arc::new(LocalRuntime::new()),
            Arc::new(DirectoryServiceProvider::default()),
            Arc::new(ScriptedDecision::new(decisions).repeat_last()),
            config,
        )
    }

    struct BrokenRuntime;

    #[async_trait]
    impl Runtime for BrokenRuntime {
        async fn prepare(&self, _baseline: &Snapshot, _workdir: &std::path::Path) -> Result<String> {
            Err(Error::EnvironmentProvision("image pull failed".to_string()))
        }

        async fn exec(&self, _request: ExecRequest) -> Result<CommandOutput> {
            Err(Error::EnvironmentProvision("unreachable".to_string()))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    struct CountingReporter {
        bodies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Reporter for CountingReporter {
        async fn post(
            &self,
            target: &ReportTarget,
            body: &str,
            _credential: &Credential,
        ) -> Result<Confirmation> {
            let number = crate::report::parse_ref_number(&target.reference)?;
            self.bodies.lock().unwrap().push(body.to_string());
            Ok(Confirmation { number, url: None })
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn provisioning_failure_aborts() {
        let controller = RepairController::new(
            Arc::new(BrokenRuntime),
            Arc::new(DirectoryServiceProvider::default()),
            Arc::new(ScriptedDecision::new(vec![Decision::finish("done")])),
            &config(3, "true"),
        );

        let report = controller.run(Snapshot::new()).await;

        assert_eq!(report.status, TerminalStatus::Aborted);
        assert!(report.error.unwrap().contains("image pull failed"));
        assert_eq!(report.diff, "");
        assert!(report.handle.is_none());
        assert_eq!(report.episode.attempts_used, 0);
        assert_eq!(
            report.transitions,
            vec![EpisodeState::Init, EpisodeState::Aborted]
        );
    }

    #[tokio::test]
    async fn passing_baseline_converges_with_empty_diff() {
        let config = config(5, "true");
        let controller = controller(
            &config,
            vec![Decision::call("test", json!({})), Decision::finish("Already green.")],
        );

        let report = controller.run(Snapshot::from_files([("a.py", "x = 1\n")])).await;

        assert_eq!(report.status, TerminalStatus::Converged);
        assert_eq!(report.summary, "Already green.");
        assert_eq!(report.diff, "");
        assert_eq!(report.episode.attempts_used, 2);
        assert_eq!(report.episode.terminal_status, Some(TerminalStatus::Converged));
        assert_eq!(report.report, ReportStatus::NotRequested);
        assert_eq!(report.services_provisioned, 2);
        assert_eq!(
            report.transitions,
            vec![
                EpisodeState::Init,
                EpisodeState::Deliberating,
                EpisodeState::ExecutingTool,
                EpisodeState::Deliberating,
                EpisodeState::ExecutingTool,
                EpisodeState::Converged,
            ]
        );
    }

    #[tokio::test]
    async fn claimed_fix_without_passing_tests_never_converges() {
        let config = config(4, "echo 'still broken' >&2; exit 1");
        let controller = controller(&config, vec![Decision::finish("Fixed!")]);

        let report = controller.run(Snapshot::new()).await;

        assert_eq!(report.status, TerminalStatus::Exhausted);
        assert_eq!(report.episode.attempts_used, 4);
        assert_eq!(report.last_failure.as_deref(), Some("still broken\n"));
        assert_eq!(report.services_provisioned, 4);
    }

    #[tokio::test]
    async fn decision_errors_are_recoverable() {
        let config = config(3, "true");
        let controller = RepairController::new(
            Arc::new(LocalRuntime::new()),
            Arc::new(DirectoryServiceProvider::default()),
            Arc::new(ScriptedDecision::new(vec![])),
            &config,
        );

        let report = controller.run(Snapshot::new()).await;

        assert_eq!(report.status, TerminalStatus::Exhausted);
        assert_eq!(report.episode.attempts_used, 3);
    }

    #[tokio::test]
    async fn report_is_posted_once_with_draft() {
        let config = config(5, "true");
        let reporter = Arc::new(CountingReporter {
            bodies: Mutex::new(Vec::new()),
        });
        let controller = controller(
            &config,
            vec![
                Decision::call("comment", json!({"body": "Drafted explanation."})),
                Decision::finish("done"),
            ],
        )
        .with_reporter(
            reporter.clone(),
            ReportTarget::new("owner/repo", "refs/pull/9/merge"),
            Credential::new("GITHUB_TOKEN", "token"),
        );

        let report = controller.run(Snapshot::new()).await;

        assert_eq!(report.status, TerminalStatus::Converged);
        assert_eq!(
            report.report,
            ReportStatus::Posted {
                confirmation: Confirmation { number: 9, url: None }
            }
        );
        let bodies = reporter.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].contains("Drafted explanation."));
    }

    #[tokio::test]
    async fn exhausted_episode_is_not_reported() {
        let config = config(2, "exit 1");
        let reporter = Arc::new(CountingReporter {
            bodies: Mutex::new(Vec::new()),
        });
        let controller = controller(&config, vec![Decision::finish("done")]).with_reporter(
            reporter.clone(),
            ReportTarget::new("owner/repo", "7"),
            Credential::new("GITHUB_TOKEN", "token"),
        );

        let report = controller.run(Snapshot::new()).await;

        assert_eq!(report.status, TerminalStatus::Exhausted);
        assert_eq!(report.report, ReportStatus::NotRequested);
        assert!(reporter.bodies.lock().unwrap().is_empty());
    }

    #[test]
    fn exit_codes_follow_status() {
        assert_eq!(TerminalStatus::Converged.exit_code(), 0);
        assert_eq!(TerminalStatus::Exhausted.exit_code(), 1);
        assert_eq!(TerminalStatus::Aborted.exit_code(), 2);
    }
}
