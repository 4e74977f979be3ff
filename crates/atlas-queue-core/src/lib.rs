//! # Atlas Queue Core
//!
//! Serialized execution of image-to-3D conversion jobs against a single
//! external worker process. Jobs take a ticket, wait their turn without
//! blocking the runtime, and are finished by watching for the worker's output
//! file rather than trusting its exit status.

pub mod config;
pub mod error;
pub mod executor;
pub mod import;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod staging;
pub mod validation;
pub mod watcher;
pub mod worker;

// Re-export commonly used types
pub use config::*;
pub use error::*;
pub use executor::{ExecutorSettings, JobExecutor};
pub use import::{FileSystemImporter, ModelImporter};
pub use logging::*;
pub use models::*;
pub use pipeline::{Pipeline, PipelineCatalog};
pub use queue::{JobStatusUpdate, QueueCoordinator, QueueEntry, QueueStats};
pub use staging::{is_supported_image, AssetLayout};
pub use validation::{validate_output, OutputValidation, MIN_OUTPUT_BYTES};
pub use watcher::OutputWatcher;
pub use worker::{ConversionWorker, WorkerInvocation, WorkerOutput, WorkerProcess};

/// Initialize the conversion queue core library
pub async fn init() -> Result<()> {
    logging::init_logging()?;

    tracing::info!("Atlas queue core initialized");
    Ok(())
}

/// Get the version of the conversion queue core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
