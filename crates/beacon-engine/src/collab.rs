//! Collaborator interfaces implemented by the host.
//!
//! The engine treats AI calls, file operations, and run permissions as
//! external seams: it resolves expressions, validates paths, and hands the
//! prepared request to whatever the host plugged in.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use beacon_core::FileOpKind;

/// Collaborator failure.
#[derive(Error, Debug)]
pub enum CollabError {
    /// Transient or provider-side failure; retryable under a policy.
    #[error("{0}")]
    Failed(String),

    /// The collaborator rejected the request outright; never retried.
    #[error("{0}")]
    Rejected(String),
}

impl CollabError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollabError::Failed(_))
    }
}

/// Invokes the host's AI provider with an already-resolved prompt.
#[async_trait]
pub trait AiInvoker: Send + Sync {
    async fn invoke(
        &self,
        prompt: &str,
        model: Option<&str>,
    ) -> Result<serde_json::Value, CollabError>;
}

/// A file operation with a boundary-validated absolute path.
#[derive(Debug, Clone)]
pub struct FileOperation {
    pub kind: FileOpKind,
    pub path: PathBuf,
    pub target: Option<PathBuf>,
    pub content: Option<String>,
}

/// Executes validated file operations.
#[async_trait]
pub trait FileOpRunner: Send + Sync {
    async fn run(&self, op: &FileOperation) -> Result<serde_json::Value, CollabError>;
}

/// Optional host gate consulted before a run starts. Binary: allow or
/// deny, nothing more.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn allow_run(&self, workflow_id: &str) -> bool;
}

/// Filesystem-backed file operations.
#[derive(Debug, Default)]
pub struct FsFileOps;

#[async_trait]
impl FileOpRunner for FsFileOps {
    async fn run(&self, op: &FileOperation) -> Result<serde_json::Value, CollabError> {
        match op.kind {
            FileOpKind::Read => {
                let content = tokio::fs::read_to_string(&op.path)
                    .await
                    .map_err(|e| CollabError::Failed(format!("read failed: {e}")))?;
                Ok(serde_json::json!({ "content": content }))
            }
            FileOpKind::Write | FileOpKind::Append => {
                let content = op
                    .content
                    .as_deref()
                    .ok_or_else(|| CollabError::Rejected("missing content".to_string()))?;
                if let Some(parent) = op.path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| CollabError::Failed(format!("mkdir failed: {e}")))?;
                }
                if op.kind == FileOpKind::Append {
                    use tokio::io::AsyncWriteExt;
                    let mut file = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&op.path)
                        .await
                        .map_err(|e| CollabError::Failed(format!("open failed: {e}")))?;
                    file.write_all(content.as_bytes())
                        .await
                        .map_err(|e| CollabError::Failed(format!("append failed: {e}")))?;
                } else {
                    tokio::fs::write(&op.path, content)
                        .await
                        .map_err(|e| CollabError::Failed(format!("write failed: {e}")))?;
                }
                Ok(serde_json::json!({ "bytes_written": content.len() }))
            }
            FileOpKind::Copy => {
                let target = op
                    .target
                    .as_ref()
                    .ok_or_else(|| CollabError::Rejected("missing copy target".to_string()))?;
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| CollabError::Failed(format!("mkdir failed: {e}")))?;
                }
                let bytes = tokio::fs::copy(&op.path, target)
                    .await
                    .map_err(|e| CollabError::Failed(format!("copy failed: {e}")))?;
                Ok(serde_json::json!({ "bytes_copied": bytes }))
            }
            FileOpKind::Delete => {
                tokio::fs::remove_file(&op.path)
                    .await
                    .map_err(|e| CollabError::Failed(format!("delete failed: {e}")))?;
                Ok(serde_json::json!({ "deleted": true }))
            }
            FileOpKind::List => {
                let mut entries = Vec::new();
                let mut dir = tokio::fs::read_dir(&op.path)
                    .await
                    .map_err(|e| CollabError::Failed(format!("list failed: {e}")))?;
                while let Some(entry) = dir
                    .next_entry()
                    .await
                    .map_err(|e| CollabError::Failed(format!("list failed: {e}")))?
                {
                    entries.push(entry.file_name().to_string_lossy().to_string());
                }
                entries.sort();
                Ok(serde_json::json!({ "entries": entries }))
            }
        }
    }
}
