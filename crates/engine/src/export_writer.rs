//! Export file storage.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExportWriteError {
    #[error("failed to write export {path}: {reason}")]
    Write { path: String, reason: String },
    #[error("failed to remove export {path}: {reason}")]
    Remove { path: String, reason: String },
}

#[async_trait]
pub trait ExportWriter: Send + Sync {
    /// Persist `document` under `file_name` and return its storage path.
    async fn write(&self, file_name: &str, document: &Value) -> Result<String, ExportWriteError>;

    /// Delete a previously written export. Missing files are not an error.
    async fn remove(&self, path: &str) -> Result<(), ExportWriteError>;
}

/// Writes pretty-printed JSON under a root directory.
#[derive(Debug, Clone)]
pub struct FsExportWriter {
    root: PathBuf,
}

impl FsExportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

#[async_trait]
impl ExportWriter for FsExportWriter {
    async fn write(&self, file_name: &str, document: &Value) -> Result<String, ExportWriteError> {
        let path = self.root.join(file_name);
        let written = path.display().to_string();
        let write_err = |reason: String| ExportWriteError::Write {
            path: written.clone(),
            reason,
        };

        let bytes = serde_json::to_vec_pretty(document).map_err(|e| write_err(e.to_string()))?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| write_err(e.to_string()))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| write_err(e.to_string()))?;

        debug!(path = %written, "export written");
        Ok(written)
    }

    async fn remove(&self, path: &str) -> Result<(), ExportWriteError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExportWriteError::Remove {
                path: path.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
