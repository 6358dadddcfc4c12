//! Reporting sink: post the final summary to a review surface.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::secrets::Credential;

const GH_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the report goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTarget {
    /// Repository identifier, e.g. `owner/name`.
    pub repository: String,
    /// Ref carrying the numeric identifier, e.g. `refs/pull/42/merge`.
    pub reference: String,
}

impl ReportTarget {
    pub fn new(repository: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            reference: reference.into(),
        }
    }
}

/// Confirmation returned by a successful post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Numeric identifier the comment was posted to.
    pub number: u64,
    /// Location of the created comment, when the surface reports one.
    pub url: Option<String>,
}

/// Destination for final episode reports.
///
/// Posting is not idempotent: each call creates a new comment.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn post(
        &self,
        target: &ReportTarget,
        body: &str,
        credential: &Credential,
    ) -> Result<Confirmation>;

    /// Returns the name of this reporter.
    fn name(&self) -> &str;
}

/// Extracts the first decimal number embedded in `reference`.
pub fn parse_ref_number(reference: &str) -> Result<u64> {
    static NUMBER: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = NUMBER
        .get_or_init(|| Regex::new(r"(\d+)").ok())
        .as_ref()
        .ok_or_else(|| Error::Reporting("ref pattern failed to compile".to_string()))?;

    pattern
        .captures(reference)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| Error::MalformedRef(reference.to_string()))
}

/// Renders the comment body for a converged episode.
pub fn render_comment(summary: &str, diff: &str) -> String {
    let mut body = String::new();

    body.push_str("## Automated Repair\n\n");
    body.push_str(summary.trim());
    body.push_str("\n\n");

    let files = changed_files(diff);
    if !files.is_empty() {
        body.push_str("### Files Changed\n\n");
        for file in &files {
            body.push_str(&format!("- `{}`\n", file));
        }
        body.push('\n');

        body.push_str("<details>\n<summary>Diff</summary>\n\n");
        body.push_str("```diff\n");
        body.push_str(diff);
        if !diff.ends_with('\n') {
            body.push('\n');
        }
        body.push_str("```\n\n</details>\n\n");
    }

    body.push_str("---\n");
    body.push_str("*Created by sandbox-heal*\n");
    body
}

/// Lists the files a unified diff touches, in order of appearance.
fn changed_files(diff: &str) -> Vec<String> {
    diff.lines()
        .filter_map(|line| line.strip_prefix("diff --git a/"))
        .filter_map(|rest| rest.split(" b/").next())
        .map(str::to_string)
        .collect()
}

/// Posts issue comments through the `gh` CLI.
pub struct GitHubReporter {
    gh: String,
}

impl Default for GitHubReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl GitHubReporter {
    pub fn new() -> Self {
        Self {
            gh: "gh".to_string(),
        }
    }

    /// Uses a custom gh binary.
    pub fn with_gh_path(gh: impl Into<String>) -> Self {
        Self { gh: gh.into() }
    }
}

#[derive(Deserialize)]
struct CommentResponse {
    html_url: Option<String>,
}

#[async_trait]
impl Reporter for GitHubReporter {
    async fn post(
        &self,
        target: &ReportTarget,
        body: &str,
        credential: &Credential,
    ) -> Result<Confirmation> {
        let number = parse_ref_number(&target.reference)?;
        let endpoint = format!("repos/{}/issues/{}/comments", target.repository, number);

        let mut child = Command::new(&self.gh)
            .args(["api", "--method", "POST", &endpoint, "-F", "body=@-"])
            .env("GH_TOKEN", credential.expose())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Reporting(format!("failed to run {}: {}", self.gh, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(body.as_bytes())
                .await
                .map_err(|e| Error::Reporting(e.to_string()))?;
        }

        let output = tokio::time::timeout(GH_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::Reporting(format!("gh api timed out after {:?}", GH_TIMEOUT)))?
            .map_err(|e| Error::Reporting(e.to_string()))?;

        if !output.status.success() {
            return Err(Error::Reporting(format!(
                "failed to post comment: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let url = serde_json::from_slice::<CommentResponse>(&output.stdout)
            .ok()
            .and_then(|r| r.html_url);

        tracing::info!(
            repository = %target.repository,
            number,
            url = ?url,
            "posted repair report"
        );
        Ok(Confirmation { number, url })
    }

    fn name(&self) -> &str {
        "github"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ref_number_extracts_pull_number() {
        assert_eq!(parse_ref_number("refs/pull/42/merge").unwrap(), 42);
        assert_eq!(parse_ref_number("7").unwrap(), 7);
        assert_eq!(parse_ref_number("pr-1234-fix").unwrap(), 1234);
    }

    #[test]
    fn parse_ref_number_without_digits_is_malformed() {
        match parse_ref_number("refs/heads/main") {
            Err(Error::MalformedRef(reference)) => assert_eq!(reference, "refs/heads/main"),
            other => panic!("expected MalformedRef, got {:?}", other),
        }
    }

    #[test]
    fn render_comment_includes_summary_and_diff() {
        let diff = "diff --git a/app/models.py b/app/models.py\n--- a/app/models.py\n+++ b/app/models.py\n@@ -1 +1,2 @@\n class Book:\n+    author: str\n";
        let body = render_comment("Added the missing field.", diff);

        assert!(body.starts_with("## Automated Repair\n\nAdded the missing field."));
        assert!(body.contains("- `app/models.py`"));
        assert!(body.contains("<details>"));
        assert!(body.contains("+    author: str"));
    }

    #[test]
    fn render_comment_without_diff_omits_details() {
        let body = render_comment("Tests already pass.", "");
        assert!(!body.contains("<details>"));
        assert!(!body.contains("Files Changed"));
    }

    #[tokio::test]
    async fn github_reporter_rejects_malformed_ref_before_calling_gh() {
        let reporter = GitHubReporter::with_gh_path("/nonexistent/gh");
        let result = reporter
            .post(
                &ReportTarget::new("owner/repo", "main"),
                "body",
                &Credential::new("GITHUB_TOKEN", "t"),
            )
            .await;
        assert!(matches!(result, Err(Error::MalformedRef(_))));
    }

    #[tokio::test]
    async fn github_reporter_surfaces_missing_gh_as_reporting_error() {
        let reporter = GitHubReporter::with_gh_path("/nonexistent/gh");
        let result = reporter
            .post(
                &ReportTarget::new("owner/repo", "refs/pull/3/merge"),
                "body",
                &Credential::new("GITHUB_TOKEN", "t"),
            )
            .await;
        assert!(matches!(result, Err(Error::Reporting(_))));
    }
}
