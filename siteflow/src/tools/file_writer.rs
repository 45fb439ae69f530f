//! `file.write`: persist generated files below an output root.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::definitions::{EffectTool, ToolId, ToolInvocation, ToolResult};
use crate::errors::ToolError;
use crate::utils::content_hash;

const TOOL: &str = "file.write";

#[derive(Debug, Deserialize)]
struct FileWriteArgs {
    path: String,
    content: String,
}

/// Writes files below a fixed root directory.
///
/// Writing identical content twice leaves the file untouched the second
/// time and reports `unchanged`.
#[derive(Debug)]
pub struct FileWriteTool {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileWriteTool {
    /// Creates a tool rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    /// Returns the output root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a relative path below the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ToolError> {
        let path = Path::new(relative);
        if relative.trim().is_empty() {
            return Err(ToolError::invalid_arguments(TOOL, "path must not be empty"));
        }
        if path.is_absolute() || relative.starts_with('/') || relative.starts_with('\\') {
            return Err(ToolError::permission_denied(
                TOOL,
                format!("absolute path '{relative}' is outside the output root"),
            ));
        }
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ToolError::permission_denied(
                TOOL,
                format!("path '{relative}' escapes the output root"),
            ));
        }
        Ok(self.root.join(path))
    }
}

fn io_error(action: &str, path: &Path, e: &std::io::Error) -> ToolError {
    let reason = format!("{action} {}: {e}", path.display());
    match e.kind() {
        ErrorKind::PermissionDenied => ToolError::permission_denied(TOOL, reason),
        ErrorKind::NotFound => ToolError::not_found(TOOL, reason),
        ErrorKind::AlreadyExists => ToolError::conflict(TOOL, reason),
        _ => ToolError::transient(TOOL, reason),
    }
}

#[async_trait]
impl EffectTool for FileWriteTool {
    fn id(&self) -> ToolId {
        ToolId::FileWrite
    }

    async fn apply(&self, invocation: &ToolInvocation) -> Result<ToolResult, ToolError> {
        let args: FileWriteArgs = invocation.parse_arguments()?;
        let target = self.resolve(&args.path)?;
        let hash = content_hash(args.content.as_bytes());
        let data = json!({
            "path": args.path,
            "content_hash": hash,
            "bytes": args.content.len(),
        });

        let _guard = self.lock.lock().await;

        match tokio::fs::read(&target).await {
            Ok(existing) if content_hash(&existing) == hash => {
                debug!(path = %args.path, "File content unchanged");
                return Ok(ToolResult::ok("unchanged").with_data(data));
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("read", &target, &e)),
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create directory", parent, &e))?;
        }
        tokio::fs::write(&target, args.content.as_bytes())
            .await
            .map_err(|e| io_error("write", &target, &e))?;

        debug!(path = %args.path, bytes = args.content.len(), "File written");
        Ok(ToolResult::ok("written").with_data(data))
    }
}
