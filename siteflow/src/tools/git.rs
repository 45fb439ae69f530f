//! `vcs.commit`: commit generated files to a local repository.
//!
//! Also hosts the `git` CLI runner and stderr classification shared with
//! the remote publish tool.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use super::definitions::{EffectTool, ToolId, ToolInvocation, ToolResult};
use crate::core::schema::require_relative_path;
use crate::errors::ToolError;

const TOOL: &str = "vcs.commit";
const DEFAULT_AUTHOR_NAME: &str = "siteflow";
const DEFAULT_AUTHOR_EMAIL: &str = "siteflow@localhost";
const BRANCH_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._/-]*$";

/// Captured output of one `git` command.
#[derive(Debug, Clone)]
pub(crate) struct GitOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Returns stdout and stderr joined, for classification.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Runs `git` in `repo`.
///
/// Spawn failures are transient; the exit status is left to the caller.
pub(crate) async fn run_git(tool: &str, repo: &Path, args: &[&str]) -> Result<GitOutput, ToolError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ToolError::transient(tool, format!("failed to run git: {e}")))?;

    Ok(GitOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Maps `git` failure output to a tool error kind.
pub(crate) fn classify_git_failure(tool: &str, message: &str) -> ToolError {
    let lower = message.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(&["not a git repository"]) {
        ToolError::not_found(tool, message)
    } else if any(&[
        "conflict",
        "unmerged",
        "merging is not possible",
        "[rejected]",
        "non-fast-forward",
        "fetch first",
        "updates were rejected",
    ]) {
        ToolError::conflict(tool, message)
    } else if any(&[
        "authentication failed",
        "permission denied",
        "could not read username",
        "access denied",
        "403",
    ]) {
        ToolError::permission_denied(tool, message)
    } else if any(&[
        "repository not found",
        "does not appear to be a git repository",
        "did not match any",
        "does not exist",
        "no such file",
    ]) {
        ToolError::not_found(tool, message)
    } else {
        ToolError::transient(tool, message)
    }
}

/// Checks that `repo` exists and is a work tree.
pub(crate) async fn ensure_repository(tool: &str, repo: &Path) -> Result<(), ToolError> {
    if tokio::fs::metadata(repo).await.is_err() {
        return Err(ToolError::not_found(
            tool,
            format!("repository path {} does not exist", repo.display()),
        ));
    }
    let out = run_git(tool, repo, &["rev-parse", "--is-inside-work-tree"]).await?;
    if !out.success || out.stdout != "true" {
        return Err(ToolError::not_found(
            tool,
            format!("{} is not a git repository", repo.display()),
        ));
    }
    Ok(())
}

/// Validates a branch name.
pub(crate) fn validate_branch(tool: &str, branch: &str) -> Result<(), ToolError> {
    let pattern = Regex::new(BRANCH_PATTERN)
        .map_err(|e| ToolError::invalid_arguments(tool, e.to_string()))?;
    let valid = pattern.is_match(branch)
        && !branch.contains("..")
        && !branch.contains("//")
        && !branch.ends_with('/')
        && !branch.ends_with(".lock");
    if !valid {
        return Err(ToolError::invalid_arguments(
            tool,
            format!("'{branch}' is not a valid branch name"),
        ));
    }
    Ok(())
}

/// Returns true if `refs/heads/<branch>` exists.
pub(crate) async fn branch_exists(tool: &str, repo: &Path, branch: &str) -> Result<bool, ToolError> {
    let reference = format!("refs/heads/{branch}");
    let out = run_git(tool, repo, &["show-ref", "--verify", "--quiet", &reference]).await?;
    Ok(out.success)
}

#[derive(Debug, Deserialize)]
struct CommitArgs {
    message: String,
    #[serde(default)]
    changed_paths: Vec<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    author_name: Option<String>,
    #[serde(default)]
    author_email: Option<String>,
}

/// Commits changed paths in a local repository.
///
/// If nothing is staged after adding the paths, no commit is created and
/// the result reports `nothing to commit`.
#[derive(Debug)]
pub struct GitCommitTool {
    repo: PathBuf,
    author_name: String,
    author_email: String,
    lock: Mutex<()>,
}

impl GitCommitTool {
    /// Creates a tool for the repository at `repo`.
    #[must_use]
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            author_name: DEFAULT_AUTHOR_NAME.to_string(),
            author_email: DEFAULT_AUTHOR_EMAIL.to_string(),
            lock: Mutex::new(()),
        }
    }

    /// Sets the default commit author.
    #[must_use]
    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    /// Returns the repository path.
    #[must_use]
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    async fn git(&self, args: &[&str]) -> Result<GitOutput, ToolError> {
        let out = run_git(TOOL, &self.repo, args).await?;
        if out.success {
            Ok(out)
        } else {
            Err(classify_git_failure(TOOL, &out.combined()))
        }
    }

    async fn switch_branch(&self, branch: &str) -> Result<(), ToolError> {
        let current = run_git(TOOL, &self.repo, &["symbolic-ref", "--short", "HEAD"]).await?;
        if current.success && current.stdout == branch {
            return Ok(());
        }
        if branch_exists(TOOL, &self.repo, branch).await? {
            self.git(&["checkout", "-q", branch]).await?;
        } else {
            self.git(&["checkout", "-q", "-b", branch]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EffectTool for GitCommitTool {
    fn id(&self) -> ToolId {
        ToolId::VcsCommit
    }

    async fn apply(&self, invocation: &ToolInvocation) -> Result<ToolResult, ToolError> {
        let args: CommitArgs = invocation.parse_arguments()?;
        if args.message.trim().is_empty() {
            return Err(ToolError::invalid_arguments(TOOL, "commit message must not be empty"));
        }
        for path in &args.changed_paths {
            require_relative_path("changed_paths", path)
                .map_err(|e| ToolError::permission_denied(TOOL, e.to_string()))?;
        }
        if let Some(ref branch) = args.branch {
            validate_branch(TOOL, branch)?;
        }

        let _guard = self.lock.lock().await;
        ensure_repository(TOOL, &self.repo).await?;

        if let Some(ref branch) = args.branch {
            self.switch_branch(branch).await?;
        }

        let mut add: Vec<&str> = vec!["add", "-A"];
        if !args.changed_paths.is_empty() {
            add.push("--");
            add.extend(args.changed_paths.iter().map(String::as_str));
        }
        self.git(&add).await?;

        let diff = run_git(TOOL, &self.repo, &["diff", "--cached", "--quiet"]).await?;
        match diff.code {
            Some(0) => {
                debug!(repo = %self.repo.display(), "Nothing to commit");
                return Ok(ToolResult::ok("nothing to commit").with_data(json!({
                    "committed": false,
                    "branch": args.branch,
                })));
            }
            Some(1) => {}
            _ => return Err(classify_git_failure(TOOL, &diff.combined())),
        }

        let name = format!(
            "user.name={}",
            args.author_name.as_deref().unwrap_or(&self.author_name)
        );
        let email = format!(
            "user.email={}",
            args.author_email.as_deref().unwrap_or(&self.author_email)
        );
        self.git(&[
            "-c",
            &name,
            "-c",
            &email,
            "-c",
            "commit.gpgsign=false",
            "commit",
            "-q",
            "-m",
            &args.message,
        ])
        .await?;

        let head = self.git(&["rev-parse", "HEAD"]).await?;
        debug!(repo = %self.repo.display(), commit = %head.stdout, "Committed");
        Ok(ToolResult::ok("committed").with_data(json!({
            "committed": true,
            "commit": head.stdout,
            "branch": args.branch,
            "changed_paths": args.changed_paths,
        })))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{git_available, init_repo};
    use super::*;
    use tempfile::TempDir;

    fn commit(message: &str, paths: &[&str]) -> ToolInvocation {
        let paths: Vec<String> = paths.iter().map(ToString::to_string).collect();
        ToolInvocation::vcs_commit(message, &paths)
    }

    #[tokio::test]
    async fn test_commit_then_nothing_to_commit() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("index.html"), "<h1>Hi</h1>").unwrap();
        let tool = GitCommitTool::new(dir.path());

        let first = tool.apply(&commit("Add site", &["index.html"])).await.unwrap();
        assert_eq!(first.status, "committed");
        assert_eq!(first.data.as_ref().unwrap()["committed"], true);

        let second = tool.apply(&commit("Add site", &["index.html"])).await.unwrap();
        assert_eq!(second.status, "nothing to commit");
        assert_eq!(second.data.unwrap()["committed"], false);
    }

    #[tokio::test]
    async fn test_commit_creates_branch() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("style.css"), "body{}").unwrap();
        let tool = GitCommitTool::new(dir.path()).with_author("Site Bot", "bot@example.com");

        let invocation = ToolInvocation::new(
            ToolId::VcsCommit,
            json!({"message": "Styles", "changed_paths": ["style.css"], "branch": "site/initial"}),
        );
        let result = tool.apply(&invocation).await.unwrap();
        assert_eq!(result.data.unwrap()["branch"], "site/initial");
        assert!(branch_exists(TOOL, dir.path(), "site/initial").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_outside_repository_is_not_found() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let tool = GitCommitTool::new(dir.path().join("missing"));
        let err = tool.apply(&commit("x", &[])).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_commit_rejects_escaping_paths() {
        let tool = GitCommitTool::new("/nonexistent");
        let err = tool.apply(&commit("x", &["../etc"])).await.unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[test]
    fn test_classify_git_failure() {
        assert_eq!(
            classify_git_failure(TOOL, "fatal: not a git repository (or any parent)").kind(),
            "not_found"
        );
        assert_eq!(
            classify_git_failure(TOOL, "CONFLICT (content): Merge conflict in index.html").kind(),
            "conflict"
        );
        assert_eq!(
            classify_git_failure(TOOL, " ! [rejected] main -> main (non-fast-forward)").kind(),
            "conflict"
        );
        assert_eq!(
            classify_git_failure(TOOL, "remote: Permission denied to bot.").kind(),
            "permission_denied"
        );
        assert_eq!(
            classify_git_failure(TOOL, "fatal: unable to access: Could not resolve host").kind(),
            "transient"
        );
    }

    #[test]
    fn test_validate_branch() {
        assert!(validate_branch(TOOL, "main").is_ok());
        assert!(validate_branch(TOOL, "feature/site-v2").is_ok());
        for bad in ["", "-x", "a..b", "a b", "a/", "x.lock", "a//b", "a;rm"] {
            assert!(validate_branch(TOOL, bad).is_err(), "{bad}");
        }
    }
}
