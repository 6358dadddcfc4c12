//! Sandbox Heal CLI
//!
//! Runs one repair episode over a source directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use sandbox_heal::config::build_provider;
use sandbox_heal::{
    CommandDecision, Credential, DecisionFunction, GitHubReporter, RepairConfig, RepairController,
    ReportStatus, ReportTarget, ScriptedDecision, SecretSource, Snapshot, Validate,
};

const USAGE: &str = "\
Usage: sandbox-heal <source-dir> [options]

Options:
  --config <file>       TOML configuration (default: built-in defaults)
  --script <file>       Replay decisions from a YAML script
  --decider <command>   Ask an external command for each decision
  --repository <owner/name>
  --ref <ref>           Post the summary to this ref once converged
  --audit <file>        Append audit events as JSON lines

Environment variables:
  GITHUB_TOKEN          Credential used when --repository/--ref are given
  RUST_LOG              Log filter (default: info)";

#[derive(Default)]
struct Args {
    source: Option<PathBuf>,
    config: Option<PathBuf>,
    script: Option<PathBuf>,
    decider: Option<String>,
    repository: Option<String>,
    reference: Option<String>,
    audit: Option<PathBuf>,
}

fn parse_args(raw: &[String]) -> Result<Args, String> {
    let mut args = Args::default();
    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{} requires a value", flag))
        };
        match arg.as_str() {
            "--config" => args.config = Some(PathBuf::from(value(arg)?)),
            "--script" => args.script = Some(PathBuf::from(value(arg)?)),
            "--decider" => args.decider = Some(value(arg)?),
            "--repository" => args.repository = Some(value(arg)?),
            "--ref" => args.reference = Some(value(arg)?),
            "--audit" => args.audit = Some(PathBuf::from(value(arg)?)),
            flag if flag.starts_with("--") => return Err(format!("unknown option {}", flag)),
            path if args.source.is_none() => args.source = Some(PathBuf::from(path)),
            extra => return Err(format!("unexpected argument {}", extra)),
        }
    }

    if args.script.is_some() == args.decider.is_some() {
        return Err("exactly one of --script or --decider is required".to_string());
    }
    if args.repository.is_some() != args.reference.is_some() {
        return Err("--repository and --ref must be given together".to_string());
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}\n\n{}", msg, USAGE);
            return ExitCode::from(2);
        }
    };
    let Some(source) = args.source.clone() else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };

    match run(args, source).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("sandbox-heal: {}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args, source: PathBuf) -> sandbox_heal::Result<u8> {
    let config = match &args.config {
        Some(path) => {
            let (config, warnings) = RepairConfig::load(path)?;
            for warning in warnings {
                tracing::warn!(warning = %warning, "configuration warning");
            }
            config
        }
        None => {
            let config = RepairConfig::default();
            config.validate().into_result()?;
            config
        }
    };

    let decision: Arc<dyn DecisionFunction> = match (&args.script, &args.decider) {
        (Some(script), _) => Arc::new(ScriptedDecision::load(script)?),
        (None, Some(command)) => {
            let mut parts = command.split_whitespace().map(str::to_string);
            let program = parts.next().unwrap_or_default();
            Arc::new(
                CommandDecision::new(program)
                    .with_args(parts.collect())
                    .with_timeout(config.controller.attempt_timeout()),
            )
        }
        (None, None) => return Err(sandbox_heal::Error::Config("no decision source".to_string())),
    };

    let baseline = Snapshot::load(&source, &config.runtime.exclude)?;
    tracing::info!(source = %source.display(), files = baseline.len(), "loaded baseline");

    let mut controller = RepairController::new(
        config.runtime.build(),
        build_provider(&config.service),
        decision,
        &config,
    );
    if let (Some(repository), Some(reference)) = (args.repository, args.reference) {
        let credential =
            Credential::load("GITHUB_TOKEN", &SecretSource::EnvVar("GITHUB_TOKEN".to_string()))?;
        controller = controller.with_reporter(
            Arc::new(GitHubReporter::new()),
            ReportTarget::new(repository, reference),
            credential,
        );
    }
    if let Some(audit) = args.audit {
        controller = controller.with_audit_path(audit);
    }

    let report = controller.run(baseline).await;

    println!("\n{}", "=".repeat(60));
    println!("Repair Episode: {}", report.episode.id);
    println!("{}", "=".repeat(60));
    println!();
    println!("Status: {:?}", report.status);
    println!(
        "Attempts: {}/{}",
        report.episode.attempts_used, report.episode.budget
    );
    println!();
    println!("Summary:");
    println!("  {}", report.summary);
    if let Some(failure) = &report.last_failure {
        if !report.converged() {
            println!();
            println!("Last failure:");
            println!("{}", failure);
        }
    }
    println!();
    if report.diff.is_empty() {
        println!("Diff: (no changes)");
    } else {
        println!("Diff:");
        println!("{}", report.diff);
    }
    match &report.report {
        ReportStatus::Posted { confirmation } => {
            println!("Report posted to #{}", confirmation.number);
        }
        ReportStatus::Failed { error } => eprintln!("Report failed: {}", error),
        ReportStatus::NotRequested => {}
    }
    for warning in &report.warnings {
        eprintln!("warning: {}", warning);
    }

    Ok(report.status.exit_code() as u8)
}
