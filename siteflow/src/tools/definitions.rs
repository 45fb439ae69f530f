//! Tool identifiers, invocations, results and the effect tool trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;

use super::idempotency::{generate_idempotency_key, hash_parameters};
use crate::errors::ToolError;
use crate::utils::content_hash;

/// Identifier of an effect tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ToolId {
    /// Write a file below the output root.
    #[serde(rename = "file.write")]
    FileWrite,
    /// Commit changed paths to the local repository.
    #[serde(rename = "vcs.commit")]
    VcsCommit,
    /// Push a branch to a remote repository.
    #[serde(rename = "remote.publish")]
    RemotePublish,
}

impl ToolId {
    /// Every tool identifier.
    pub const ALL: [Self; 3] = [Self::FileWrite, Self::VcsCommit, Self::RemotePublish];

    /// Returns the wire identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FileWrite => "file.write",
            Self::VcsCommit => "vcs.commit",
            Self::RemotePublish => "remote.publish",
        }
    }

    /// Returns true if results of this tool may be replayed from the
    /// idempotency store.
    ///
    /// Commits and pushes depend on repository state outside the
    /// invocation, so they are always applied and rely on their own
    /// no-op detection instead.
    #[must_use]
    pub const fn is_cacheable(self) -> bool {
        matches!(self, Self::FileWrite)
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolId {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| ToolError::not_found(s, "unknown tool"))
    }
}

/// A request to apply one effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Target tool.
    pub tool: ToolId,
    /// Tool arguments.
    pub arguments: serde_json::Value,
    /// Identifies the effect's target; repeated invocations share it.
    pub idempotency_key: String,
    /// Hash of the full arguments; equal hashes mean an identical effect.
    pub params_hash: String,
    /// SHA-256 of the written content, for `file.write`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl ToolInvocation {
    /// Creates an invocation with arbitrary arguments.
    #[must_use]
    pub fn new(tool: ToolId, arguments: serde_json::Value) -> Self {
        let params_hash = hash_parameters(&arguments);
        Self {
            tool,
            idempotency_key: generate_idempotency_key(&[tool.as_str(), &params_hash]),
            arguments,
            params_hash,
            content_hash: None,
        }
    }

    /// Creates a `file.write` invocation.
    ///
    /// The key identifies the path, so a later write of different content
    /// to the same path is recognised as a new effect.
    #[must_use]
    pub fn file_write(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = path.into();
        let content = content.into();
        let hash = content_hash(content.as_bytes());
        Self {
            tool: ToolId::FileWrite,
            idempotency_key: generate_idempotency_key(&[ToolId::FileWrite.as_str(), &path]),
            params_hash: hash.clone(),
            content_hash: Some(hash),
            arguments: json!({ "path": path, "content": content }),
        }
    }

    /// Creates a `vcs.commit` invocation.
    #[must_use]
    pub fn vcs_commit(message: impl Into<String>, changed_paths: &[String]) -> Self {
        Self::new(
            ToolId::VcsCommit,
            json!({ "message": message.into(), "changed_paths": changed_paths }),
        )
    }

    /// Creates a `remote.publish` invocation.
    #[must_use]
    pub fn remote_publish(
        repo_ref: impl Into<String>,
        branch: impl Into<String>,
        changed_paths: &[String],
    ) -> Self {
        Self::new(
            ToolId::RemotePublish,
            json!({
                "repo_ref": repo_ref.into(),
                "branch": branch.into(),
                "changed_paths": changed_paths,
            }),
        )
    }

    /// Deserializes the arguments into a tool's argument type.
    pub fn parse_arguments<T: serde::de::DeserializeOwned>(&self) -> Result<T, ToolError> {
        serde_json::from_value(self.arguments.clone())
            .map_err(|e| ToolError::invalid_arguments(self.tool.as_str(), e.to_string()))
    }

    /// Returns the arguments with bulky content fields removed, for logs
    /// and outcome records.
    #[must_use]
    pub fn summary(&self) -> serde_json::Value {
        let mut summary = self.arguments.clone();
        if let Some(obj) = summary.as_object_mut() {
            if let Some(content) = obj.remove("content") {
                let len = content.as_str().map_or(0, str::len);
                obj.insert("content_bytes".to_string(), json!(len));
            }
        }
        summary
    }
}

/// Result of applying an effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the effect holds.
    pub success: bool,
    /// Human-readable status, e.g. `written` or `nothing to commit`.
    pub status: String,
    /// Tool-specific details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// True when the result came from the idempotency store.
    #[serde(default)]
    pub replayed: bool,
}

impl ToolResult {
    /// Creates a successful result.
    #[must_use]
    pub fn ok(status: impl Into<String>) -> Self {
        Self {
            success: true,
            status: status.into(),
            data: None,
            replayed: false,
        }
    }

    /// Attaches data.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Marks the result as replayed.
    #[must_use]
    pub fn replayed(mut self) -> Self {
        self.replayed = true;
        self
    }
}

/// Record of one invocation made through the tool environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Tool applied.
    pub tool: ToolId,
    /// Idempotency key of the invocation.
    pub idempotency_key: String,
    /// Invocation arguments without file content.
    pub arguments: serde_json::Value,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    /// Calls made to the tool, zero for replays.
    pub attempts: u32,
}

impl ToolOutcome {
    /// Returns true if the invocation succeeded.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A side-effecting operation exposed to the final stage.
///
/// Tools must be idempotent for identical invocations and must serialise
/// their own writes to shared resources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EffectTool: Send + Sync {
    /// Returns the tool identifier.
    fn id(&self) -> ToolId;

    /// Applies the invocation.
    async fn apply(&self, invocation: &ToolInvocation) -> Result<ToolResult, ToolError>;
}
