//! Error types for the conversion queue

use crate::models::{JobId, JobState};
use std::path::PathBuf;

/// Main error type for queue and conversion operations
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source image not found: {path}")]
    SourceNotFound { path: PathBuf },

    #[error("Failed to stage input {path}: {message}")]
    StagingFailed { path: PathBuf, message: String },

    #[error("Worker executable not found: {executable}")]
    WorkerNotFound { executable: PathBuf },

    #[error("Failed to launch worker {executable}: {source}")]
    WorkerLaunch {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No pipeline configuration found in {directory}")]
    PipelineNotFound { directory: PathBuf },

    #[error("Unknown pipeline '{name}' in {directory}")]
    UnknownPipeline { name: String, directory: PathBuf },

    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    #[error("Job already queued: {id}")]
    DuplicateJob { id: JobId },

    #[error("Job {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition { id: JobId, from: JobState, to: JobState },

    #[error("Job {id} gave up while {stage} after {attempts} attempts")]
    TimedOut {
        id: JobId,
        stage: &'static str,
        attempts: u32,
    },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Logging initialization failed: {message}")]
    LoggingError { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConversionError {
    /// Get the error type as a string for categorization
    pub fn error_type(&self) -> &'static str {
        match self {
            ConversionError::Io(_) => "io_error",
            ConversionError::SourceNotFound { .. } => "source_not_found",
            ConversionError::StagingFailed { .. } => "staging_failed",
            ConversionError::WorkerNotFound { .. } => "worker_not_found",
            ConversionError::WorkerLaunch { .. } => "worker_launch",
            ConversionError::PipelineNotFound { .. } => "pipeline_not_found",
            ConversionError::UnknownPipeline { .. } => "unknown_pipeline",
            ConversionError::JobNotFound { .. } => "job_not_found",
            ConversionError::DuplicateJob { .. } => "duplicate_job",
            ConversionError::InvalidTransition { .. } => "invalid_transition",
            ConversionError::TimedOut { .. } => "timed_out",
            ConversionError::ConfigError { .. } => "config_error",
            ConversionError::LoggingError { .. } => "logging_error",
            ConversionError::InvalidInput { .. } => "invalid_input",
            ConversionError::Serialization(_) => "serialization_error",
        }
    }

    /// Check if waiting longer could make the error go away
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConversionError::TimedOut { .. })
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ConversionError>;
