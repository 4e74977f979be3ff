//! Discovery of worker pipeline configurations
//!
//! A pipeline is a JSON document in the pipeline directory. Only its path is
//! handed to the worker, so the catalog never parses the contents.

use crate::error::{ConversionError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A pipeline configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    /// File stem, used to select the pipeline
    pub name: String,
    pub path: PathBuf,
}

/// The pipelines available in one directory
#[derive(Debug, Clone)]
pub struct PipelineCatalog {
    directory: PathBuf,
}

impl PipelineCatalog {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// All `*.json` files in the directory, sorted by name
    pub fn list(&self) -> Result<Vec<Pipeline>> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut pipelines = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_json = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false);
            if !is_json || !path.is_file() {
                continue;
            }

            if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                pipelines.push(Pipeline {
                    name: name.to_string(),
                    path: path.clone(),
                });
            }
        }

        pipelines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pipelines)
    }

    /// Pick the named pipeline, or the first one when no name is given
    pub fn resolve(&self, name: Option<&str>) -> Result<Pipeline> {
        let pipelines = self.list()?;

        match name {
            Some(name) => pipelines
                .into_iter()
                .find(|pipeline| pipeline.name == name)
                .ok_or_else(|| ConversionError::UnknownPipeline {
                    name: name.to_string(),
                    directory: self.directory.clone(),
                }),
            None => pipelines
                .into_iter()
                .next()
                .ok_or_else(|| ConversionError::PipelineNotFound {
                    directory: self.directory.clone(),
                }),
        }
    }
}
