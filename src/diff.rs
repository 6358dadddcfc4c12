//! Diff engine: unified diffs of a session against its baseline.
//!
//! The engine owns its own copy of the baseline and commits it into a
//! private scratch repository on first use. Each diff resets that working
//! copy to the committed baseline, applies the session overlay and asks git
//! for the staged difference, so the "before" side never comes from the
//! session's filesystem.

use std::path::{Component, Path};
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::sandbox::{run_process, set_executable, OverlayEntry, Session, Snapshot};

const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Computes unified diffs against an immutable baseline.
pub struct DiffEngine {
    baseline: Snapshot,
    git: String,
    repo: Mutex<Option<TempDir>>,
}

impl DiffEngine {
    /// Creates an engine over `baseline`.
    pub fn new(baseline: Snapshot) -> Self {
        Self {
            baseline,
            git: "git".to_string(),
            repo: Mutex::new(None),
        }
    }

    /// Uses a custom git binary.
    pub fn with_git_path(mut self, git: impl Into<String>) -> Self {
        self.git = git.into();
        self
    }

    /// Returns the unified diff between the baseline and `session`.
    ///
    /// An empty string means the session's tree equals the baseline.
    pub async fn diff(&self, session: &Session) -> Result<String> {
        let mut repo = self.repo.lock().await;
        if repo.is_none() {
            *repo = Some(self.init_repo().await?);
        }
        let Some(dir) = repo.as_ref() else {
            return Err(Error::DiffComputation("scratch repository missing".to_string()));
        };
        let root = dir.path();

        self.git(root, &["reset", "--hard", "-q"]).await?;
        self.git(root, &["clean", "-fdxq"]).await?;
        apply_overlay(root, session)?;
        self.git(root, &["add", "-A", "--force"]).await?;
        let diff = self
            .git(root, &["diff", "--cached", "--no-color", "--no-ext-diff"])
            .await?;

        tracing::debug!(
            overlay = session.overlay().len(),
            bytes = diff.len(),
            "computed diff"
        );
        Ok(diff)
    }

    async fn init_repo(&self) -> Result<TempDir> {
        let dir = TempDir::new().map_err(|e| Error::DiffComputation(e.to_string()))?;
        self.baseline
            .materialize(dir.path())
            .map_err(|e| Error::DiffComputation(e.to_string()))?;

        self.git(dir.path(), &["init", "-q"]).await?;
        self.git(dir.path(), &["add", "-A", "--force"]).await?;
        self.git(
            dir.path(),
            &["commit", "-q", "--allow-empty", "--no-verify", "-m", "baseline"],
        )
        .await?;

        tracing::info!(
            files = self.baseline.len(),
            path = %dir.path().display(),
            "committed diff baseline"
        );
        Ok(dir)
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.git);
        cmd.current_dir(dir)
            .args([
                "-c",
                "user.name=sandbox-heal",
                "-c",
                "user.email=sandbox-heal@localhost",
                "-c",
                "commit.gpgsign=false",
                "-c",
                "core.autocrlf=false",
                "-c",
                "core.fileMode=true",
                "-c",
                "core.excludesFile=/dev/null",
                "-c",
                "diff.noprefix=false",
            ])
            .args(args);

        let output = run_process(cmd, GIT_TIMEOUT)
            .await
            .map_err(|e| Error::DiffComputation(format!("git {}: {}", args.join(" "), e)))?;
        if !output.success() {
            return Err(Error::DiffComputation(format!(
                "git {} exited with {}: {}",
                args.join(" "),
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Writes the session's overlay into the scratch working copy.
fn apply_overlay(root: &Path, session: &Session) -> Result<()> {
    for (path, entry) in session.overlay() {
        if path.components().next() == Some(Component::Normal(".git".as_ref())) {
            tracing::warn!(path = %path.display(), "skipping version-control path in diff");
            continue;
        }
        let dest = root.join(path);
        match entry {
            OverlayEntry::Written {
                contents,
                executable,
            } => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::DiffComputation(e.to_string()))?;
                }
                std::fs::write(&dest, contents)
                    .and_then(|()| set_executable(&dest, *executable))
                    .map_err(|e| Error::DiffComputation(e.to_string()))?;
            }
            OverlayEntry::Removed => match std::fs::remove_file(&dest) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::DiffComputation(e.to_string())),
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::sandbox::{LocalRuntime, SessionOptions};

    const MODEL: &str = "class Book:\n    title: str\n";

    fn baseline() -> Snapshot {
        Snapshot::from_files([("app/models.py", MODEL), ("README.md", "# Books\n")])
    }

    async fn setup() -> (DiffEngine, Session) {
        let session = Session::create(
            Arc::new(LocalRuntime::new()),
            Arc::new(baseline()),
            SessionOptions::default(),
        )
        .await
        .unwrap();
        (DiffEngine::new(baseline()), session)
    }

    #[tokio::test]
    async fn untouched_session_has_empty_diff() {
        let (engine, session) = setup().await;
        assert_eq!(engine.diff(&session).await.unwrap(), "");
    }

    #[tokio::test]
    async fn diff_shows_one_line_addition() {
        let (engine, session) = setup().await;
        let next = session
            .write_file("app/models.py", format!("{}    author: str\n", MODEL))
            .unwrap();

        let diff = engine.diff(&next).await.unwrap();

        assert!(diff.contains("--- a/app/models.py"));
        assert!(diff.contains("+++ b/app/models.py"));
        assert!(diff.contains("+    author: str"));
        let changed: Vec<_> = diff
            .lines()
            .filter(|l| (l.starts_with('+') || l.starts_with('-')) && !l.starts_with("+++") && !l.starts_with("---"))
            .collect();
        assert_eq!(changed, vec!["+    author: str"]);
    }

    #[tokio::test]
    async fn diff_is_idempotent() {
        let (engine, session) = setup().await;
        let next = session.write_file("new.txt", "hello\n").unwrap();

        let first = engine.diff(&next).await.unwrap();
        let second = engine.diff(&next).await.unwrap();

        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn restoring_original_content_gives_empty_diff() {
        let (engine, session) = setup().await;
        let edited = session.write_file("app/models.py", "broken\n").unwrap();
        assert!(!engine.diff(&edited).await.unwrap().is_empty());

        let restored = edited.write_file("app/models.py", MODEL).unwrap();
        assert_eq!(engine.diff(&restored).await.unwrap(), "");
    }

    #[tokio::test]
    async fn deletions_made_by_commands_are_diffed() {
        let (engine, session) = setup().await;
        let (next, _) = session.exec("rm README.md").await.unwrap();

        let diff = engine.diff(&next).await.unwrap();

        assert!(diff.contains("deleted file mode"));
        assert!(diff.contains("-# Books"));
    }

    #[tokio::test]
    async fn earlier_diffs_do_not_leak_into_later_ones() {
        let (engine, session) = setup().await;
        let a = session.write_file("a.txt", "a\n").unwrap();
        let b = session.write_file("b.txt", "b\n").unwrap();

        engine.diff(&a).await.unwrap();
        let diff = engine.diff(&b).await.unwrap();

        assert!(diff.contains("b.txt"));
        assert!(!diff.contains("a.txt"));
    }

    #[tokio::test]
    async fn ignored_paths_are_still_diffed() {
        let baseline = Snapshot::from_files([
            (".gitignore", "*.env\nbuild/\n"),
            ("settings.env", "DEBUG=0\n"),
        ]);
        let session = Session::create(
            Arc::new(LocalRuntime::new()),
            Arc::new(baseline.clone()),
            SessionOptions::default(),
        )
        .await
        .unwrap();
        let engine = DiffEngine::new(baseline);

        let next = session
            .write_file("settings.env", "DEBUG=1\n")
            .unwrap()
            .write_file("build/out.txt", "artifact\n")
            .unwrap();
        let diff = engine.diff(&next).await.unwrap();

        assert!(diff.contains("--- a/settings.env"), "diff: {}", diff);
        assert!(diff.contains("-DEBUG=0"));
        assert!(diff.contains("+DEBUG=1"));
        assert!(diff.contains("+++ b/build/out.txt"));

        let restored = next
            .write_file("settings.env", "DEBUG=0\n")
            .unwrap()
            .exec("rm -r build")
            .await
            .unwrap()
            .0;
        assert_eq!(engine.diff(&restored).await.unwrap(), "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn mode_changes_are_diffed() {
        let (engine, session) = setup().await;
        let (next, _) = session.exec("chmod +x app/models.py").await.unwrap();

        let diff = engine.diff(&next).await.unwrap();

        assert!(diff.contains("diff --git a/app/models.py b/app/models.py"));
        assert!(diff.contains("old mode 100644"));
        assert!(diff.contains("new mode 100755"));
    }

    #[tokio::test]
    async fn missing_git_is_a_diff_error() {
        let (_, session) = setup().await;
        let engine = DiffEngine::new(baseline()).with_git_path("/nonexistent/git");
        assert!(matches!(
            engine.diff(&session).await,
            Err(Error::DiffComputation(_))
        ));
    }
}
