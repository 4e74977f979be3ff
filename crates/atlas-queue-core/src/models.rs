//! Core data models for conversion jobs

use crate::error::{ConversionError, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Unique identifier for conversion jobs.
///
/// Built from the source asset name and the local wall-clock time of
/// creation, so it doubles as the stem of every file the job produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Derive an id from an asset name and a creation timestamp
    pub fn generate(asset_name: &str, at: DateTime<Local>) -> Self {
        let name: String = asset_name
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '/' && *c != '\\')
            .collect();
        let name = if name.is_empty() { "asset".to_string() } else { name };

        Self(format!("{}-{}", name, at.format("%H-%M-%S-%3f")))
    }

    /// Disambiguate an id that collided with a live job
    pub fn with_suffix(&self, suffix: u32) -> Self {
        Self(format!("{}-{}", self.0, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Conversion mode passed to the worker, selecting the output container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    #[default]
    GenerateObj,
    GenerateFbx,
}

impl RequestKind {
    /// The argument the worker expects
    pub fn as_arg(&self) -> &'static str {
        match self {
            RequestKind::GenerateObj => "generate-obj",
            RequestKind::GenerateFbx => "generate-fbx",
        }
    }

    /// File extension of the produced model
    pub fn extension(&self) -> &'static str {
        match self {
            RequestKind::GenerateObj => "obj",
            RequestKind::GenerateFbx => "fbx",
        }
    }

    /// Text expected in the first line of a valid output, if the format has one
    pub fn signature(&self) -> Option<&'static str> {
        match self {
            RequestKind::GenerateObj => None,
            RequestKind::GenerateFbx => Some("FBX"),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

impl FromStr for RequestKind {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "obj" | "generate-obj" => Ok(RequestKind::GenerateObj),
            "fbx" | "generate-fbx" => Ok(RequestKind::GenerateFbx),
            other => Err(ConversionError::InvalidInput {
                message: format!("Unknown request kind '{}'", other),
            }),
        }
    }
}

/// Lifecycle state of a conversion job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Enqueued,
    Waiting,
    Executing,
    AwaitingOutput,
    Validating,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::TimedOut)
    }

    /// States in which the job owns the external worker
    pub fn holds_worker(&self) -> bool {
        matches!(
            self,
            JobState::Executing | JobState::AwaitingOutput | JobState::Validating
        )
    }

    /// Whether the executor may move a job from `self` to `next`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;

        match (self, next) {
            (Created, Enqueued)
            | (Enqueued, Waiting)
            | (Waiting, Executing)
            | (Executing, AwaitingOutput)
            | (AwaitingOutput, Validating)
            | (Validating, Completed) => true,
            (Executing, Failed) | (AwaitingOutput, Failed) | (Validating, Failed) => true,
            (AwaitingOutput, TimedOut) | (Validating, TimedOut) => true,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Enqueued => "enqueued",
            JobState::Waiting => "waiting",
            JobState::Executing => "executing",
            JobState::AwaitingOutput => "awaiting output",
            JobState::Validating => "validating",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed out",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A caller's request to convert one source image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub source_image: PathBuf,
    pub kind: RequestKind,
}

impl ConversionRequest {
    pub fn new(source_image: impl Into<PathBuf>, kind: RequestKind) -> Self {
        Self {
            source_image: source_image.into(),
            kind,
        }
    }

    /// Asset name used to derive the job id
    pub fn asset_name(&self) -> String {
        self.source_image
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "asset".to_string())
    }
}

/// The unit of work tracked by the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionJob {
    pub id: JobId,
    /// `0` until enqueued, `1` when entitled to run the worker
    pub ticket: u32,
    pub kind: RequestKind,
    pub source_image_path: PathBuf,
    pub temp_image_path: PathBuf,
    pub expected_output_path: PathBuf,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub validation_attempts: u32,
    pub error: Option<String>,
}

impl ConversionJob {
    pub fn new(
        id: JobId,
        kind: RequestKind,
        source_image_path: PathBuf,
        temp_image_path: PathBuf,
        expected_output_path: PathBuf,
    ) -> Self {
        Self {
            id,
            ticket: 0,
            kind,
            source_image_path,
            temp_image_path,
            expected_output_path,
            state: JobState::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            validation_attempts: 0,
            error: None,
        }
    }

    /// Time since the job started executing
    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - started).to_std().ok()
    }
}

/// Handle returned by the import collaborator for a validated model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedModel {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub imported_at: DateTime<Utc>,
}

/// Result of a job that reached `Completed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub output_path: PathBuf,
    pub model: ImportedModel,
    pub elapsed: Duration,
    pub validation_attempts: u32,
}

/// Format a duration as `MM:SS`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
