//! Hand-off of validated models to whoever consumes them

use crate::error::Result;
use crate::models::ImportedModel;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Receives finished model files.
///
/// `import_model` returns `None` while the model cannot be picked up yet;
/// the executor then calls `refresh` and asks again.
#[async_trait]
pub trait ModelImporter: Send + Sync {
    async fn import_model(&self, path: &Path) -> Result<Option<ImportedModel>>;

    /// Re-scan the output location
    async fn refresh(&self) -> Result<()>;
}

/// Importer that accepts any model already on disk
#[derive(Debug, Clone, Default)]
pub struct FileSystemImporter {
    root: Option<PathBuf>,
}

impl FileSystemImporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept models below `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }
}

#[async_trait]
impl ModelImporter for FileSystemImporter {
    async fn import_model(&self, path: &Path) -> Result<Option<ImportedModel>> {
        if let Some(root) = &self.root {
            if !path.starts_with(root) {
                tracing::warn!("{} is outside {}", path.display(), root.display());
                return Ok(None);
            }
        }

        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(ImportedModel {
                path: path.to_path_buf(),
                size_bytes: metadata.len(),
                imported_at: Utc::now(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn refresh(&self) -> Result<()> {
        tracing::trace!("Refreshing model directory view");
        Ok(())
    }
}
