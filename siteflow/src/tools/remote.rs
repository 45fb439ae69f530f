//! `remote.publish`: push a local branch to a remote repository.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::definitions::{EffectTool, ToolId, ToolInvocation, ToolResult};
use super::git::{branch_exists, classify_git_failure, ensure_repository, run_git, validate_branch};
use crate::errors::ToolError;
use crate::utils::redact;

const TOOL: &str = "remote.publish";
const DEFAULT_BASE_URL: &str = "https://github.com";
const OWNER_NAME_PATTERN: &str = r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$";

#[derive(Debug, Deserialize)]
struct PublishArgs {
    repo_ref: String,
    branch: String,
    #[serde(default)]
    changed_paths: Vec<String>,
}

/// Publishes a branch of a local repository to a remote.
///
/// `repo_ref` is either `owner/name`, resolved against the base URL, an
/// explicit `https://`, `ssh://` or `file://` URL, or an absolute path to
/// another repository. Publishing a branch the remote already has reports
/// `up to date`.
pub struct RemotePublishTool {
    repo: PathBuf,
    base_url: String,
    token: Option<String>,
    lock: Mutex<()>,
}

impl RemotePublishTool {
    /// Creates a tool that publishes from the repository at `repo`.
    #[must_use]
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            lock: Mutex::new(()),
        }
    }

    /// Sets the base URL used for `owner/name` references.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets the access token injected into HTTPS remotes.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = (!token.is_empty()).then_some(token);
        self
    }

    /// Returns the local repository path.
    #[must_use]
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Resolves `repo_ref` to a remote URL without credentials.
    pub fn resolve_remote(&self, repo_ref: &str) -> Result<String, ToolError> {
        let owner_name = Regex::new(OWNER_NAME_PATTERN)
            .map_err(|e| ToolError::invalid_arguments(TOOL, e.to_string()))?;
        let repo_ref = repo_ref.trim();

        if owner_name.is_match(repo_ref) && !repo_ref.contains("..") {
            let name = repo_ref.trim_end_matches(".git");
            return Ok(format!("{}/{name}.git", self.base_url));
        }
        if ["https://", "ssh://", "file://"]
            .iter()
            .any(|scheme| repo_ref.starts_with(scheme))
        {
            return Ok(repo_ref.to_string());
        }
        if Path::new(repo_ref).is_absolute() {
            return Ok(repo_ref.to_string());
        }
        Err(ToolError::invalid_arguments(
            TOOL,
            format!("'{repo_ref}' is not an owner/name reference, URL or absolute path"),
        ))
    }

    fn authenticated(&self, url: &str) -> String {
        match (&self.token, url.strip_prefix("https://")) {
            (Some(token), Some(rest)) => format!("https://x-access-token:{token}@{rest}"),
            _ => url.to_string(),
        }
    }

    fn redact(&self, text: &str) -> String {
        redact(text, self.token.as_deref())
    }
}

impl std::fmt::Debug for RemotePublishTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePublishTool")
            .field("repo", &self.repo)
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EffectTool for RemotePublishTool {
    fn id(&self) -> ToolId {
        ToolId::RemotePublish
    }

    async fn apply(&self, invocation: &ToolInvocation) -> Result<ToolResult, ToolError> {
        let args: PublishArgs = invocation.parse_arguments()?;
        validate_branch(TOOL, &args.branch)?;
        let remote = self.resolve_remote(&args.repo_ref)?;

        let _guard = self.lock.lock().await;
        ensure_repository(TOOL, &self.repo).await?;
        if !branch_exists(TOOL, &self.repo, &args.branch).await? {
            return Err(ToolError::not_found(
                TOOL,
                format!("local branch '{}' does not exist", args.branch),
            ));
        }

        let refspec = format!("refs/heads/{0}:refs/heads/{0}", args.branch);
        let url = self.authenticated(&remote);
        debug!(remote = %remote, branch = %args.branch, "Pushing branch");
        let out = run_git(TOOL, &self.repo, &["push", "--porcelain", &url, &refspec]).await?;
        let combined = self.redact(&out.combined());

        if !out.success {
            let summary = combined
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(classify_git_failure(
                TOOL,
                &format!("push failed: {summary}"),
            ));
        }

        let data = json!({
            "remote": remote,
            "branch": args.branch,
            "changed_paths": args.changed_paths,
        });
        if combined.contains("[up to date]") || combined.contains("Everything up-to-date") {
            debug!(remote = %remote, branch = %args.branch, "Remote already up to date");
            let mut data = data;
            data["published"] = json!(false);
            return Ok(ToolResult::ok("up to date").with_data(data));
        }

        info!(remote = %remote, branch = %args.branch, "Branch published");
        let mut data = data;
        data["published"] = json!(true);
        Ok(ToolResult::ok("published").with_data(data))
    }
}
