//! End-to-end lifecycle of a conversion job
//!
//! A job waits for its ticket, stages its input, runs the worker, waits for
//! the output file to settle, validates it and hands it to the importer.
//! Every path out of `run` releases the job's ticket exactly once.

use crate::error::{ConversionError, Result};
use crate::import::ModelImporter;
use crate::models::{
    format_elapsed, ConversionJob, ConversionRequest, ImportedModel, JobId, JobOutcome, JobState,
};
use crate::queue::QueueCoordinator;
use crate::staging::{prepare_output_directory, stage_input, AssetLayout};
use crate::validation::validate_output;
use crate::watcher::OutputWatcher;
use crate::worker::{ConversionWorker, WorkerInvocation};
use chrono::Local;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Timing and retry limits for job execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Interval between output file size samples
    pub poll_interval: Duration,
    /// Pause after asking the importer to refresh
    pub refresh_interval: Duration,
    /// Pause between validation attempts
    pub validation_retry_interval: Duration,
    /// Bound on one output wait. `None` waits forever.
    pub output_wait_timeout: Option<Duration>,
    /// Number of timed-out output waits before giving up
    pub max_output_waits: Option<u32>,
    /// Number of failed validation or import attempts before giving up
    pub max_validation_attempts: Option<u32>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            refresh_interval: Duration::from_millis(1000),
            validation_retry_interval: Duration::from_millis(1000),
            output_wait_timeout: None,
            max_output_waits: None,
            max_validation_attempts: None,
        }
    }
}

/// Drives conversion jobs through the shared queue
pub struct JobExecutor {
    queue: Arc<QueueCoordinator>,
    worker: Arc<dyn ConversionWorker>,
    importer: Arc<dyn ModelImporter>,
    layout: AssetLayout,
    pipeline_config: PathBuf,
    settings: ExecutorSettings,
}

impl JobExecutor {
    pub fn new(
        queue: Arc<QueueCoordinator>,
        worker: Arc<dyn ConversionWorker>,
        importer: Arc<dyn ModelImporter>,
        layout: AssetLayout,
        pipeline_config: impl Into<PathBuf>,
    ) -> Self {
        Self {
            queue,
            worker,
            importer,
            layout,
            pipeline_config: pipeline_config.into(),
            settings: ExecutorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn queue(&self) -> &Arc<QueueCoordinator> {
        &self.queue
    }

    pub fn layout(&self) -> &AssetLayout {
        &self.layout
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Create a job for `request` and put it in line
    pub async fn submit(&self, request: ConversionRequest) -> Result<JobId> {
        let base = JobId::generate(&request.asset_name(), Local::now());
        let mut suffix = 0;

        loop {
            let id = if suffix == 0 {
                base.clone()
            } else {
                base.with_suffix(suffix)
            };

            match self.queue.enqueue(self.build_job(id.clone(), &request)).await {
                Ok(_) => return Ok(id),
                Err(ConversionError::DuplicateJob { .. }) => suffix += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Submit and run a single request
    pub async fn convert(&self, request: ConversionRequest) -> Result<JobOutcome> {
        let id = self.submit(request).await?;
        self.run(&id).await
    }

    /// Submit every request in order, then run them all concurrently.
    ///
    /// Results come back in request order.
    pub async fn run_batch(&self, requests: Vec<ConversionRequest>) -> Vec<Result<JobOutcome>> {
        let mut submitted = Vec::with_capacity(requests.len());
        for request in requests {
            submitted.push(self.submit(request).await);
        }

        let runs = submitted.into_iter().map(|submission| async move {
            match submission {
                Ok(id) => self.run(&id).await,
                Err(e) => Err(e),
            }
        });

        join_all(runs).await
    }

    /// Wait for the job's turn and carry it to a terminal state
    pub async fn run(&self, job_id: &JobId) -> Result<JobOutcome> {
        self.queue.await_turn(job_id).await?;

        match self.execute(job_id).await {
            Ok(model) => {
                let released = self.queue.release(job_id, JobState::Completed, None).await?;
                let (elapsed, validation_attempts) = released
                    .map(|job| (job.elapsed().unwrap_or_default(), job.validation_attempts))
                    .unwrap_or_default();

                tracing::info!(
                    "Job {} completed in {}: {}",
                    job_id,
                    format_elapsed(elapsed),
                    model.path.display()
                );

                Ok(JobOutcome {
                    job_id: job_id.clone(),
                    output_path: model.path.clone(),
                    model,
                    elapsed,
                    validation_attempts,
                })
            }
            Err(e) => {
                let final_state = if e.is_recoverable() {
                    JobState::TimedOut
                } else {
                    JobState::Failed
                };
                tracing::error!("Job {} {}: {}", job_id, final_state, e);

                if let Err(release_error) = self
                    .queue
                    .release(job_id, final_state, Some(e.to_string()))
                    .await
                {
                    tracing::error!("Failed to release job {}: {}", job_id, release_error);
                }
                Err(e)
            }
        }
    }

    fn build_job(&self, id: JobId, request: &ConversionRequest) -> ConversionJob {
        let temp_image_path = self.layout.temp_path(&id, &request.source_image);
        let expected_output_path = self.layout.output_path(&id, request.kind);

        ConversionJob::new(
            id,
            request.kind,
            request.source_image.clone(),
            temp_image_path,
            expected_output_path,
        )
    }

    async fn execute(&self, job_id: &JobId) -> Result<ImportedModel> {
        let job = self
            .queue
            .job(job_id)
            .await
            .ok_or_else(|| ConversionError::JobNotFound { id: job_id.clone() })?;

        prepare_output_directory(&job.expected_output_path).await?;
        stage_input(&job.source_image_path, &job.temp_image_path).await?;

        let invocation = WorkerInvocation {
            input_image: job.temp_image_path.clone(),
            pipeline_config: self.pipeline_config.clone(),
            kind: job.kind,
            output_path: job.expected_output_path.clone(),
        };
        let output = self.worker.run(&invocation).await?;
        tracing::debug!("Worker for {} exited with {:?}", job_id, output.exit_code);

        self.queue.transition(job_id, JobState::AwaitingOutput).await?;
        self.await_output(&job).await?;

        self.queue.transition(job_id, JobState::Validating).await?;
        self.await_valid_output(&job).await?;

        self.import(&job).await
    }

    async fn await_output(&self, job: &ConversionJob) -> Result<()> {
        let watcher = OutputWatcher::new(self.settings.poll_interval)
            .with_timeout(self.settings.output_wait_timeout);
        let mut waits = 0;

        loop {
            waits += 1;
            if watcher.wait_for_stable_file(&job.expected_output_path).await? {
                return Ok(());
            }

            if let Some(max) = self.settings.max_output_waits {
                if waits >= max {
                    return Err(ConversionError::TimedOut {
                        id: job.id.clone(),
                        stage: "awaiting output",
                        attempts: waits,
                    });
                }
            }

            tracing::debug!("Output for {} not ready, refreshing", job.id);
            self.importer.refresh().await?;
            tokio::time::sleep(self.settings.refresh_interval).await;
        }
    }

    async fn await_valid_output(&self, job: &ConversionJob) -> Result<()> {
        loop {
            let attempts = self.queue.record_validation_attempt(&job.id).await?;
            let verdict = validate_output(&job.expected_output_path, job.kind).await?;
            if verdict.is_valid() {
                return Ok(());
            }

            tracing::warn!(
                "Output for {} is invalid ({}), attempt {}",
                job.id,
                verdict.describe(),
                attempts
            );

            if let Some(max) = self.settings.max_validation_attempts {
                if attempts >= max {
                    return Err(ConversionError::TimedOut {
                        id: job.id.clone(),
                        stage: "validating",
                        attempts,
                    });
                }
            }

            tokio::time::sleep(self.settings.validation_retry_interval).await;
        }
    }

    async fn import(&self, job: &ConversionJob) -> Result<ImportedModel> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            if let Some(model) = self.importer.import_model(&job.expected_output_path).await? {
                return Ok(model);
            }

            if let Some(max) = self.settings.max_validation_attempts {
                if attempts >= max {
                    return Err(ConversionError::TimedOut {
                        id: job.id.clone(),
                        stage: "importing",
                        attempts,
                    });
                }
            }

            tracing::debug!("Model for {} not importable yet", job.id);
            self.importer.refresh().await?;
            tokio::time::sleep(self.settings.refresh_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::FileSystemImporter;
    use crate::models::RequestKind;
    use crate::worker::WorkerOutput;
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    /// Worker double that writes a model and records what it was asked to do
    struct FakeWorker {
        calls: StdMutex<Vec<PathBuf>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
        contents: Vec<u8>,
    }

    impl FakeWorker {
        fn new(contents: Vec<u8>) -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                gate: None,
                contents,
            }
        }

        fn gated(contents: Vec<u8>, gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(contents)
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|path| path.file_stem().unwrap().to_string_lossy().into_owned())
                .collect()
        }
    }

    #[async_trait]
    impl ConversionWorker for FakeWorker {
        async fn run(&self, invocation: &WorkerInvocation) -> Result<WorkerOutput> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            self.calls.lock().unwrap().push(invocation.output_path.clone());

            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }

            tokio::fs::write(&invocation.output_path, &self.contents).await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            Ok(WorkerOutput::default())
        }
    }

    struct FailingWorker;

    #[async_trait]
    impl ConversionWorker for FailingWorker {
        async fn run(&self, _invocation: &WorkerInvocation) -> Result<WorkerOutput> {
            Err(ConversionError::WorkerLaunch {
                executable: PathBuf::from("client3D"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
            })
        }
    }

    fn valid_obj() -> Vec<u8> {
        let mut bytes = b"# model\n".to_vec();
        bytes.resize(2048, b' ');
        bytes
    }

    fn fast_settings() -> ExecutorSettings {
        ExecutorSettings {
            poll_interval: Duration::from_millis(5),
            refresh_interval: Duration::from_millis(5),
            validation_retry_interval: Duration::from_millis(10),
            ..ExecutorSettings::default()
        }
    }

    fn create_layout(temp_dir: &TempDir, assets: &[&str]) -> AssetLayout {
        let layout = AssetLayout::new(
            temp_dir.path().join("original"),
            temp_dir.path().join("temp"),
            temp_dir.path().join("generated"),
        );
        std::fs::create_dir_all(&layout.source_directory).unwrap();

        for asset in assets {
            let img = RgbaImage::from_pixel(2, 2, Rgba([200, 100, 50, 255]));
            DynamicImage::ImageRgba8(img)
                .save_with_format(
                    layout.source_directory.join(format!("{}.png", asset)),
                    ImageFormat::Png,
                )
                .unwrap();
        }
        layout
    }

    fn create_executor(layout: AssetLayout, worker: Arc<dyn ConversionWorker>) -> JobExecutor {
        JobExecutor::new(
            Arc::new(QueueCoordinator::new()),
            worker,
            Arc::new(FileSystemImporter::new()),
            layout,
            "pipelines/default.json",
        )
        .with_settings(fast_settings())
    }

    fn request(layout: &AssetLayout, asset: &str) -> ConversionRequest {
        ConversionRequest::new(layout.resolve_source(asset), RequestKind::GenerateObj)
    }

    fn stem(id: &JobId) -> String {
        id.to_string()
    }

    async fn wait_for_state(queue: &QueueCoordinator, id: &JobId, state: JobState) {
        for _ in 0..400 {
            if queue.job(id).await.map(|job| job.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached {:?}", id, state);
    }

    #[tokio::test]
    async fn test_batch_runs_in_order_one_at_a_time() {
        let temp_dir = TempDir::new().unwrap();
        let layout = create_layout(&temp_dir, &["alpha", "bravo", "charlie"]);
        let worker = Arc::new(FakeWorker::new(valid_obj()));
        let executor = create_executor(layout.clone(), worker.clone());

        let requests = ["alpha", "bravo", "charlie"]
            .iter()
            .map(|asset| request(&layout, asset))
            .collect();
        let results = executor.run_batch(requests).await;

        let outcomes: Vec<JobOutcome> = results.into_iter().map(|r| r.unwrap()).collect();
        let order: Vec<String> = outcomes.iter().map(|o| stem(&o.job_id)).collect();
        assert_eq!(worker.calls(), order);
        assert!(order[0].starts_with("alpha-"));
        assert!(order[1].starts_with("bravo-"));
        assert!(order[2].starts_with("charlie-"));

        assert_eq!(worker.max_active.load(Ordering::SeqCst), 1);
        assert!(executor.queue().is_empty().await);

        for outcome in &outcomes {
            assert!(outcome.output_path.exists());
            assert_eq!(outcome.validation_attempts, 1);
            assert_eq!(outcome.model.size_bytes, 2048);
        }
    }

    #[tokio::test]
    async fn test_tickets_advance_as_jobs_finish() {
        let temp_dir = TempDir::new().unwrap();
        let layout = create_layout(&temp_dir, &["a", "b", "c"]);
        let gate = Arc::new(Semaphore::new(0));
        let worker = Arc::new(FakeWorker::gated(valid_obj(), gate.clone()));
        let executor = Arc::new(create_executor(layout.clone(), worker.clone()));

        let mut ids = Vec::new();
        for asset in ["a", "b", "c"] {
            ids.push(executor.submit(request(&layout, asset)).await.unwrap());
        }

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let executor = executor.clone();
                tokio::spawn(async move { executor.run(&id).await })
            })
            .collect();

        let queue = executor.queue();
        wait_for_state(queue, &ids[0], JobState::Executing).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.calls().len(), 1);
        assert_eq!(queue.ticket(&ids[1]).await, Some(2));
        assert_eq!(queue.ticket(&ids[2]).await, Some(3));
        assert_eq!(queue.job(&ids[2]).await.unwrap().state, JobState::Waiting);

        gate.add_permits(1);
        wait_for_state(queue, &ids[1], JobState::Executing).await;
        assert!(queue.job(&ids[0]).await.is_none());
        assert_eq!(queue.ticket(&ids[1]).await, Some(1));
        assert_eq!(queue.ticket(&ids[2]).await, Some(2));

        gate.add_permits(2);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(worker.calls(), ids.iter().map(stem).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_staging_failure_fails_job_and_frees_queue() {
        let temp_dir = TempDir::new().unwrap();
        let layout = create_layout(&temp_dir, &["bravo", "charlie"]);
        let worker = Arc::new(FakeWorker::new(valid_obj()));
        let executor = create_executor(layout.clone(), worker.clone());
        let mut updates = executor.queue().subscribe();

        let requests = ["ghost", "bravo", "charlie"]
            .iter()
            .map(|asset| request(&layout, asset))
            .collect();
        let results = executor.run_batch(requests).await;

        assert!(matches!(results[0], Err(ConversionError::SourceNotFound { .. })));
        assert!(results[1].is_ok());
        assert!(results[2].is_ok());
        assert_eq!(worker.calls().len(), 2);
        assert!(executor.queue().is_empty().await);

        let mut failed_releases = 0;
        while let Ok(update) = updates.try_recv() {
            if update.job_id.as_str().starts_with("ghost-") && update.new_state == JobState::Failed {
                failed_releases += 1;
            }
        }
        assert_eq!(failed_releases, 1);
    }

    #[tokio::test]
    async fn test_launch_failure_marks_failed() {
        let temp_dir = TempDir::new().unwrap();
        let layout = create_layout(&temp_dir, &["alpha"]);
        let executor = create_executor(layout.clone(), Arc::new(FailingWorker));

        let result = executor.convert(request(&layout, "alpha")).await;
        assert!(matches!(result, Err(ConversionError::WorkerLaunch { .. })));
        assert!(executor.queue().is_empty().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deleted_staged_input_fails_job() {
        use crate::worker::WorkerProcess;
        use std::os::unix::fs::PermissionsExt;

        /// Loses the staged image of the first job before the process starts
        struct LosingWorker {
            inner: WorkerProcess,
            victim: String,
        }

        #[async_trait]
        impl ConversionWorker for LosingWorker {
            async fn run(&self, invocation: &WorkerInvocation) -> Result<WorkerOutput> {
                let stem = invocation.input_image.file_stem().unwrap().to_string_lossy();
                if stem.starts_with(&self.victim) {
                    std::fs::remove_file(&invocation.input_image).unwrap();
                }
                self.inner.run(invocation).await
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("worker.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n[ -f \"$1\" ] || exit 9\nhead -c 2048 /dev/zero | tr '\\0' 'v' > \"$4\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let layout = create_layout(&temp_dir, &["alpha", "bravo"]);
        let worker = LosingWorker {
            inner: WorkerProcess::new(&script),
            victim: "alpha-".to_string(),
        };
        let executor = create_executor(layout.clone(), Arc::new(worker));
        let mut updates = executor.queue().subscribe();

        let results = tokio::time::timeout(
            Duration::from_secs(10),
            executor.run_batch(vec![request(&layout, "alpha"), request(&layout, "bravo")]),
        )
        .await
        .expect("jobs should not hang on a missing staged input");

        assert!(matches!(results[0], Err(ConversionError::StagingFailed { .. })));
        assert!(results[1].is_ok());
        assert!(executor.queue().is_empty().await);

        let mut alpha_states = Vec::new();
        let mut bravo_tickets = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if update.job_id.as_str().starts_with("alpha-") {
                alpha_states.push(update.new_state);
            } else if update.new_state == JobState::Executing {
                bravo_tickets.push(update.ticket);
            }
        }
        assert_eq!(alpha_states.last(), Some(&JobState::Failed));
        assert_eq!(alpha_states.iter().filter(|s| s.is_terminal()).count(), 1);
        assert!(!alpha_states.contains(&JobState::AwaitingOutput));
        assert_eq!(bravo_tickets, vec![1]);
    }

    #[tokio::test]
    async fn test_invalid_output_is_revalidated() {
        let temp_dir = TempDir::new().unwrap();
        let layout = create_layout(&temp_dir, &["alpha"]);
        let worker = Arc::new(FakeWorker::new(b"partial".to_vec()));
        let executor = create_executor(layout.clone(), worker.clone());

        let id = executor.submit(request(&layout, "alpha")).await.unwrap();
        let output = layout.output_path(&id, RequestKind::GenerateObj);
        let fixer = tokio::spawn(async move {
            while !output.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(60)).await;
            tokio::fs::write(&output, valid_obj()).await.unwrap();
        });

        let outcome = executor.run(&id).await.unwrap();
        fixer.await.unwrap();

        assert!(outcome.validation_attempts >= 2);
        assert_eq!(worker.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_bound_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let layout = create_layout(&temp_dir, &["alpha", "bravo"]);
        let worker = Arc::new(FakeWorker::new(b"partial".to_vec()));
        let executor = create_executor(layout.clone(), worker.clone()).with_settings(
            ExecutorSettings {
                max_validation_attempts: Some(3),
                ..fast_settings()
            },
        );

        let results = executor
            .run_batch(vec![request(&layout, "alpha"), request(&layout, "bravo")])
            .await;

        for result in results {
            match result {
                Err(ConversionError::TimedOut { stage, attempts, .. }) => {
                    assert_eq!(stage, "validating");
                    assert_eq!(attempts, 3);
                }
                other => panic!("expected timeout, got {:?}", other.map(|o| o.job_id)),
            }
        }
        assert!(executor.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_output_times_out_when_bounded() {
        struct SilentWorker;

        #[async_trait]
        impl ConversionWorker for SilentWorker {
            async fn run(&self, _invocation: &WorkerInvocation) -> Result<WorkerOutput> {
                Ok(WorkerOutput::default())
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let layout = create_layout(&temp_dir, &["alpha"]);
        let executor = create_executor(layout.clone(), Arc::new(SilentWorker)).with_settings(
            ExecutorSettings {
                output_wait_timeout: Some(Duration::from_millis(20)),
                max_output_waits: Some(2),
                ..fast_settings()
            },
        );

        let result = executor.convert(request(&layout, "alpha")).await;
        assert!(matches!(
            result,
            Err(ConversionError::TimedOut {
                stage: "awaiting output",
                attempts: 2,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_repeated_submissions_get_distinct_ids() {
        let temp_dir = TempDir::new().unwrap();
        let layout = create_layout(&temp_dir, &["alpha"]);
        let executor = create_executor(layout.clone(), Arc::new(FakeWorker::new(valid_obj())));

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(executor.submit(request(&layout, "alpha")).await.unwrap());
        }
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 5);

        let tickets: Vec<Option<u32>> = {
            let mut tickets = Vec::new();
            for id in &ids {
                tickets.push(executor.queue().ticket(id).await);
            }
            tickets
        };
        assert_eq!(tickets, vec![Some(1), Some(2), Some(3), Some(4), Some(5)]);
    }

    #[test]
    fn test_staged_paths_follow_job_id() {
        let layout = AssetLayout::new("/src", "/stage", "/out");
        let executor = create_executor(layout, Arc::new(FailingWorker));
        let job = executor.build_job(
            JobId::from("lamp-12-00-00-000"),
            &ConversionRequest::new("/src/lamp.jpg", RequestKind::GenerateFbx),
        );

        assert_eq!(job.temp_image_path, Path::new("/stage/lamp-12-00-00-000.jpg"));
        assert_eq!(
            job.expected_output_path,
            Path::new("/out/lamp-12-00-00-000/lamp-12-00-00-000.fbx")
        );
        assert_eq!(job.state, JobState::Created);
    }
}
