//! Command-line interface for the conversion queue

use anyhow::{bail, Context, Result};
use atlas_queue_core::{
    format_elapsed, init_logging_with, is_supported_image, validate_output, version, AppConfig,
    ConfigManager,
    ConversionRequest, FileSystemImporter, JobExecutor, JobState, JobStatusUpdate,
    QueueCoordinator, RequestKind, WorkerProcess,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "atlas-queue")]
#[command(about = "Queue image-to-3D conversions through a single external worker")]
#[command(version = version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert source images into 3D models, one job at a time
    Convert {
        /// Asset names or image paths, converted in the order given
        #[arg(required = true)]
        assets: Vec<String>,

        /// Output model format
        #[arg(short, long, value_enum)]
        kind: Option<KindArg>,

        /// Pipeline configuration to use instead of the active one
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Print the results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage worker pipeline configurations
    Pipelines {
        #[command(subcommand)]
        action: PipelineCommand,
    },

    /// Check that a generated model file is complete
    Validate {
        /// Model file path
        path: PathBuf,

        /// Expected format; inferred from the extension when omitted
        #[arg(short, long, value_enum)]
        kind: Option<KindArg>,
    },

    /// Show configuration and system information
    Info,
}

#[derive(Subcommand)]
enum PipelineCommand {
    /// List available pipelines
    List,
    /// Make a pipeline the default for conversions
    Select {
        /// Pipeline name (file stem)
        name: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Obj,
    Fbx,
}

impl From<KindArg> for RequestKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Obj => RequestKind::GenerateObj,
            KindArg::Fbx => RequestKind::GenerateFbx,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    }
    .context("Failed to load configuration")?;

    let mut logging = manager.config().logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    let _log_guard = init_logging_with(&logging)?;

    info!("Atlas queue CLI v{} starting", version());

    match cli.command {
        Commands::Convert {
            assets,
            kind,
            pipeline,
            json,
        } => {
            let config = manager.config();
            let kind = kind.map(RequestKind::from).unwrap_or(config.worker.default_request);
            convert(config, assets, kind, pipeline, json).await?;
        }

        Commands::Pipelines { action } => match action {
            PipelineCommand::List => list_pipelines(manager.config())?,
            PipelineCommand::Select { name } => {
                let pipeline = manager
                    .config()
                    .worker
                    .pipeline_catalog()
                    .resolve(Some(name.as_str()))?;

                let mut config = manager.config().clone();
                config.worker.active_pipeline = Some(pipeline.name.clone());
                manager.update_config(config)?;
                println!("Active pipeline set to {}", pipeline.name);
            }
        },

        Commands::Validate { path, kind } => {
            let kind = kind
                .map(RequestKind::from)
                .unwrap_or_else(|| infer_kind(&path, manager.config().worker.default_request));

            let verdict = validate_output(&path, kind).await?;
            if !verdict.is_valid() {
                bail!("{}: {}", path.display(), verdict.describe());
            }
            println!("{}: valid {} output", path.display(), kind.extension());
        }

        Commands::Info => print_info(&manager),
    }

    Ok(())
}

async fn convert(
    config: &AppConfig,
    assets: Vec<String>,
    kind: RequestKind,
    pipeline: Option<String>,
    json: bool,
) -> Result<()> {
    let layout = config.storage.layout();
    let sources: Vec<PathBuf> = assets
        .iter()
        .map(|asset| layout.resolve_source(asset))
        .collect();
    if let Some(unsupported) = sources.iter().find(|source| !is_supported_image(source)) {
        bail!("Unsupported source image: {}", unsupported.display());
    }

    let catalog = config.worker.pipeline_catalog();
    let selected = pipeline
        .as_deref()
        .or(config.worker.active_pipeline.as_deref());
    let pipeline = catalog.resolve(selected)?;
    let worker = WorkerProcess::locate(&config.worker.executable)?;
    info!("Using pipeline {} ({})", pipeline.name, pipeline.path.display());

    let queue = Arc::new(QueueCoordinator::new());
    let printer = tokio::spawn(print_updates(
        queue.subscribe(),
        Arc::downgrade(&queue),
        json,
    ));

    let executor = JobExecutor::new(
        queue,
        Arc::new(worker),
        Arc::new(FileSystemImporter::with_root(&layout.output_directory)),
        layout.clone(),
        pipeline.path,
    )
    .with_settings(config.polling.executor_settings());

    let requests: Vec<ConversionRequest> = sources
        .into_iter()
        .map(|source| ConversionRequest::new(source, kind))
        .collect();
    let total = requests.len();
    let results = executor.run_batch(requests).await;

    // Closing the queue ends the update stream
    drop(executor);
    if let Err(e) = printer.await {
        error!("Status printer stopped: {}", e);
    }

    let mut failures = 0;
    let mut outcomes = Vec::new();
    for (asset, result) in assets.iter().zip(results) {
        match result {
            Ok(outcome) => {
                if !json {
                    println!(
                        "{:<32} completed  {}  {}",
                        outcome.job_id,
                        format_elapsed(outcome.elapsed),
                        outcome.output_path.display()
                    );
                }
                outcomes.push(outcome);
            }
            Err(e) => {
                failures += 1;
                eprintln!("{}: {}", asset, e);
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    }

    if failures > 0 {
        bail!("{} of {} conversions failed", failures, total);
    }
    Ok(())
}

async fn print_updates(
    mut updates: broadcast::Receiver<JobStatusUpdate>,
    queue: Weak<QueueCoordinator>,
    quiet: bool,
) {
    loop {
        match updates.recv().await {
            Ok(update) => {
                if quiet {
                    continue;
                }
                println!(
                    "[{:>3}] {:<32} {} -> {}",
                    update.ticket, update.job_id, update.old_state, update.new_state
                );
                if update.new_state == JobState::Executing {
                    if let Some(queue) = queue.upgrade() {
                        print_queue(&queue).await;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Skipped {} status updates", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_queue(queue: &QueueCoordinator) {
    let stats = queue.stats().await;
    println!(
        "      queue: {} live, {} running, {} waiting",
        stats.live_jobs, stats.active_jobs, stats.waiting_jobs
    );
    for entry in queue.view().await {
        let elapsed = entry
            .elapsed
            .map(format_elapsed)
            .unwrap_or_else(|| "--:--".to_string());
        println!(
            "      {:>3}  {:<32} {:<16} {}",
            entry.ticket,
            entry.job_id,
            entry.state.label(),
            elapsed
        );
    }
}

fn list_pipelines(config: &AppConfig) -> Result<()> {
    let catalog = config.worker.pipeline_catalog();
    let pipelines = catalog.list()?;
    if pipelines.is_empty() {
        println!("No pipelines found in {}", catalog.directory().display());
        return Ok(());
    }

    let active = catalog
        .resolve(config.worker.active_pipeline.as_deref())
        .ok()
        .map(|pipeline| pipeline.name);

    for pipeline in pipelines {
        let marker = if active.as_deref() == Some(pipeline.name.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{} {}  {}", marker, pipeline.name, pipeline.path.display());
    }
    Ok(())
}

fn infer_kind(path: &Path, fallback: RequestKind) -> RequestKind {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("fbx") => RequestKind::GenerateFbx,
        Some(ext) if ext.eq_ignore_ascii_case("obj") => RequestKind::GenerateObj,
        _ => fallback,
    }
}

fn print_info(manager: &ConfigManager) {
    let config = manager.config();

    println!("Atlas Queue v{}", version());
    println!("Serialized image-to-3D conversion queue");
    println!("\nConfiguration:");
    println!("  Config file: {}", manager.config_path().display());
    let worker = match WorkerProcess::locate(&config.worker.executable) {
        Ok(worker) => worker.executable().display().to_string(),
        Err(_) => format!("{} (not found)", config.worker.executable.display()),
    };
    println!("  Worker: {}", worker);
    println!("  Pipelines: {}", config.worker.pipeline_directory.display());
    println!(
        "  Active pipeline: {}",
        config.worker.active_pipeline.as_deref().unwrap_or("(first available)")
    );
    println!("  Default request: {}", config.worker.default_request);
    println!("  Source images: {}", config.storage.source_directory.display());
    println!("  Staged images: {}", config.storage.temp_directory.display());
    println!("  Generated models: {}", config.storage.output_directory.display());
    println!("  Poll interval: {} ms", config.polling.poll_interval_ms);
    println!("\nSystem Information:");
    println!("  CPU cores: {}", num_cpus::get());
    println!("  Platform: {}", std::env::consts::OS);
    println!("  Architecture: {}", std::env::consts::ARCH);
}
