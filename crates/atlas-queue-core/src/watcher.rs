//! Polling detection of a finished output file
//!
//! The worker gives no completion signal beyond writing its result to disk.
//! A file counts as finished once it exists and two consecutive size samples
//! taken one poll interval apart agree.

use crate::error::Result;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks consecutive size samples of a file being written
#[derive(Debug, Clone, Default)]
pub struct StabilityCheck {
    last: Option<u64>,
}

impl StabilityCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample. Returns `true` when it matches the previous one.
    pub fn observe(&mut self, size: u64) -> bool {
        let stable = self.last == Some(size);
        self.last = Some(size);
        stable
    }

    /// Forget the previous sample, e.g. after the file disappeared
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Waits for an output artifact to appear and stop growing
#[derive(Debug, Clone)]
pub struct OutputWatcher {
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl OutputWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            timeout: None,
        }
    }

    /// Bound the whole wait. Without a timeout the wait is unbounded.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Poll until `path` exists and its size holds still across one interval.
    ///
    /// Returns `Ok(false)` when the configured timeout elapses first. At
    /// least two samples are always taken, however short the timeout.
    pub async fn wait_for_stable_file(&self, path: &Path) -> Result<bool> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut check = StabilityCheck::new();
        let mut samples = 0u32;

        loop {
            samples += 1;
            match tokio::fs::metadata(path).await {
                Ok(metadata) => {
                    let size = metadata.len();
                    if check.observe(size) {
                        tracing::debug!("Output {} stable at {} bytes", path.display(), size);
                        return Ok(true);
                    }
                    tracing::trace!("Output {} at {} bytes", path.display(), size);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    check.reset();
                    tracing::trace!("Output {} not present yet", path.display());
                }
                Err(e) => return Err(e.into()),
            }

            if let Some(deadline) = deadline {
                if samples >= 2 && Instant::now() + self.poll_interval > deadline {
                    tracing::debug!("Gave up waiting for {}", path.display());
                    return Ok(false);
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl Default for OutputWatcher {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}
