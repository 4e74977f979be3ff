//! Ticket queue that serializes access to the external worker
//!
//! Every live job is registered here at enqueue time and removed on release.
//! A job's ticket is its position in the queue plus one, so ticket `1` marks
//! the only job allowed to drive the worker. Waiters suspend on a watch
//! channel that is bumped whenever the head of the queue changes.

use crate::error::{ConversionError, Result};
use crate::models::{ConversionJob, JobId, JobState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};

/// Capacity of the status update broadcast channel
const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Coordinates ticket assignment and turn-taking for conversion jobs
#[derive(Debug)]
pub struct QueueCoordinator {
    /// Live jobs and their order
    inner: Mutex<QueueInner>,
    /// Bumped on every release so waiters re-check their ticket
    turn_sender: watch::Sender<u64>,
    /// Channel for job status updates
    status_sender: broadcast::Sender<JobStatusUpdate>,
}

#[derive(Debug, Default)]
struct QueueInner {
    order: VecDeque<JobId>,
    jobs: HashMap<JobId, ConversionJob>,
}

impl QueueInner {
    fn max_live_ticket(&self) -> u32 {
        self.jobs.values().map(|job| job.ticket).max().unwrap_or(0)
    }

    fn job_mut(&mut self, job_id: &JobId) -> Result<&mut ConversionJob> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| ConversionError::JobNotFound { id: job_id.clone() })
    }
}

/// Job status update message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub job_id: JobId,
    pub old_state: JobState,
    pub new_state: JobState,
    pub ticket: u32,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
}

/// One row of the queue view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub ticket: u32,
    pub state: JobState,
    /// Time since the job started executing
    pub elapsed: Option<Duration>,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub live_jobs: usize,
    pub waiting_jobs: usize,
    pub active_jobs: usize,
}

impl QueueCoordinator {
    /// Create an empty queue
    pub fn new() -> Self {
        let (turn_sender, _) = watch::channel(0);
        let (status_sender, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        Self {
            inner: Mutex::new(QueueInner::default()),
            turn_sender,
            status_sender,
        }
    }

    /// Register a job and give it the next ticket
    pub async fn enqueue(&self, mut job: ConversionJob) -> Result<u32> {
        let job_id = job.id.clone();
        let old_state = job.state;

        let ticket = {
            let mut inner = self.inner.lock().await;
            if inner.jobs.contains_key(&job_id) {
                return Err(ConversionError::DuplicateJob { id: job_id });
            }
            if !old_state.can_transition_to(JobState::Enqueued) {
                return Err(ConversionError::InvalidTransition {
                    id: job_id,
                    from: old_state,
                    to: JobState::Enqueued,
                });
            }

            let ticket = inner.max_live_ticket() + 1;
            job.ticket = ticket;
            job.state = JobState::Enqueued;
            inner.order.push_back(job_id.clone());
            inner.jobs.insert(job_id.clone(), job);
            ticket
        };

        self.publish(JobStatusUpdate {
            job_id: job_id.clone(),
            old_state,
            new_state: JobState::Enqueued,
            ticket,
            timestamp: Utc::now(),
            message: Some("Job added to queue".to_string()),
        });

        tracing::info!("Job {} enqueued with ticket {}", job_id, ticket);
        Ok(ticket)
    }

    /// Suspend until the job holds ticket `1`, then mark it `Executing`
    pub async fn await_turn(&self, job_id: &JobId) -> Result<()> {
        // Subscribe before the first check so a release in between is not missed
        let mut turn = self.turn_sender.subscribe();
        self.transition(job_id, JobState::Waiting).await?;

        loop {
            {
                let mut inner = self.inner.lock().await;
                let job = inner.job_mut(job_id)?;
                if job.ticket == 1 {
                    job.state = JobState::Executing;
                    job.started_at = Some(Utc::now());
                    break;
                }
                tracing::debug!("Job {} waiting with ticket {}", job_id, job.ticket);
            }

            turn.changed()
                .await
                .map_err(|_| ConversionError::InvalidInput {
                    message: "Queue coordinator shut down".to_string(),
                })?;
        }

        self.publish(JobStatusUpdate {
            job_id: job_id.clone(),
            old_state: JobState::Waiting,
            new_state: JobState::Executing,
            ticket: 1,
            timestamp: Utc::now(),
            message: Some("Job holds the worker".to_string()),
        });

        tracing::info!("Job {} is first in line", job_id);
        Ok(())
    }

    /// Move a live job to a non-terminal state
    pub async fn transition(&self, job_id: &JobId, next: JobState) -> Result<()> {
        if next.is_terminal() {
            return Err(ConversionError::InvalidInput {
                message: format!("Job {} must be released to reach {:?}", job_id, next),
            });
        }

        let (old_state, ticket) = {
            let mut inner = self.inner.lock().await;
            let job = inner.job_mut(job_id)?;
            let old_state = job.state;
            if !old_state.can_transition_to(next) {
                return Err(ConversionError::InvalidTransition {
                    id: job_id.clone(),
                    from: old_state,
                    to: next,
                });
            }
            job.state = next;
            (old_state, job.ticket)
        };

        self.publish(JobStatusUpdate {
            job_id: job_id.clone(),
            old_state,
            new_state: next,
            ticket,
            timestamp: Utc::now(),
            message: None,
        });

        Ok(())
    }

    /// Count one more validation pass for a job, returning the new total
    pub async fn record_validation_attempt(&self, job_id: &JobId) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(job_id)?;
        job.validation_attempts += 1;
        Ok(job.validation_attempts)
    }

    /// Remove a finished job and move every job behind it up by one.
    ///
    /// Releasing a job that is no longer queued is a no-op and returns `None`.
    pub async fn release(
        &self,
        job_id: &JobId,
        final_state: JobState,
        error: Option<String>,
    ) -> Result<Option<ConversionJob>> {
        if !final_state.is_terminal() {
            return Err(ConversionError::InvalidInput {
                message: format!("Cannot release job {} into {:?}", job_id, final_state),
            });
        }

        let (mut job, old_state) = {
            let mut inner = self.inner.lock().await;
            let Some(position) = inner.order.iter().position(|id| id == job_id) else {
                tracing::debug!("Job {} already released", job_id);
                return Ok(None);
            };
            inner.order.remove(position);

            let job = inner
                .jobs
                .remove(job_id)
                .ok_or_else(|| ConversionError::JobNotFound { id: job_id.clone() })?;

            for other in inner.jobs.values_mut() {
                if other.ticket > job.ticket {
                    other.ticket = other.ticket.saturating_sub(1);
                }
            }

            let old_state = job.state;
            (job, old_state)
        };

        let released_ticket = job.ticket;
        job.ticket = 0;
        job.state = final_state;
        job.finished_at = Some(Utc::now());
        job.error = error.clone();

        self.turn_sender.send_modify(|generation| *generation = generation.wrapping_add(1));

        self.publish(JobStatusUpdate {
            job_id: job_id.clone(),
            old_state,
            new_state: final_state,
            ticket: 0,
            timestamp: Utc::now(),
            message: error,
        });

        tracing::info!(
            "Job {} released from ticket {} as {}",
            job_id,
            released_ticket,
            final_state
        );
        Ok(Some(job))
    }

    /// Current ticket of a live job
    pub async fn ticket(&self, job_id: &JobId) -> Option<u32> {
        let inner = self.inner.lock().await;
        inner.jobs.get(job_id).map(|job| job.ticket)
    }

    /// Copy of a live job record
    pub async fn job(&self, job_id: &JobId) -> Option<ConversionJob> {
        let inner = self.inner.lock().await;
        inner.jobs.get(job_id).cloned()
    }

    /// All live jobs ordered by ticket
    pub async fn snapshot(&self) -> Vec<ConversionJob> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    /// Ticket, state and elapsed time of every live job, head first
    pub async fn view(&self) -> Vec<QueueEntry> {
        self.snapshot()
            .await
            .into_iter()
            .map(|job| QueueEntry {
                elapsed: job.elapsed(),
                job_id: job.id,
                ticket: job.ticket,
                state: job.state,
            })
            .collect()
    }

    /// Get queue statistics
    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats {
            live_jobs: inner.jobs.len(),
            ..QueueStats::default()
        };

        for job in inner.jobs.values() {
            if job.state.holds_worker() {
                stats.active_jobs += 1;
            } else if matches!(job.state, JobState::Enqueued | JobState::Waiting) {
                stats.waiting_jobs += 1;
            }
        }

        stats
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.order.is_empty()
    }

    /// Subscribe to job status updates
    pub fn subscribe(&self) -> broadcast::Receiver<JobStatusUpdate> {
        self.status_sender.subscribe()
    }

    fn publish(&self, update: JobStatusUpdate) {
        if self.status_sender.send(update).is_err() {
            tracing::trace!("No subscribers for job status updates");
        }
    }
}

impl Default for QueueCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
