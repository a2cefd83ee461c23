pub mod status;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use status::{JobStatus, LATTICE};

// --- Public Type Aliases ---

/// Identifier shared by the client-side record and the server-side job.
/// Uses UUID v4, assigned at submission time.
pub type JobId = Uuid;

/// Owning principal. Scopes listing queries against the job store.
pub type OwnerId = String;

/// Manifest key holding the number of sub-units a job is expected to produce.
pub const MANIFEST_EXPECTED_COUNT: &str = "expected_count";

/// Kind of generation work. Fixed at creation; drives cost and timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
  Image,
  Video,
  #[serde(rename = "3d")]
  Model3d,
  Cad,
}

impl JobType {
  pub fn as_str(self) -> &'static str {
    match self {
      JobType::Image => "image",
      JobType::Video => "video",
      JobType::Model3d => "3d",
      JobType::Cad => "cad",
    }
  }
}

impl fmt::Display for JobType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Progress stage. Mirrors [`JobStatus`] plus the post-completion
/// `Compositing` stage reported while the compositor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
  Queued,
  Running,
  Upscaling,
  Encoding,
  Compositing,
  Completed,
  Failed,
}

impl From<JobStatus> for ProgressStage {
  fn from(status: JobStatus) -> Self {
    match status {
      JobStatus::Queued => ProgressStage::Queued,
      JobStatus::Running => ProgressStage::Running,
      JobStatus::Upscaling => ProgressStage::Upscaling,
      JobStatus::Encoding => ProgressStage::Encoding,
      JobStatus::Completed => ProgressStage::Completed,
      JobStatus::Failed => ProgressStage::Failed,
    }
  }
}

/// Progress report for a job.
///
/// `percent` is clamped to `0..=100` but is not required to be monotonic:
/// generation stages may restart it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
  pub stage: ProgressStage,
  pub percent: u8,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub current_step: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub total_steps: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub eta_seconds: Option<u64>,
}

impl Progress {
  pub fn new(stage: ProgressStage, percent: u8, message: impl Into<String>) -> Self {
    Self {
      stage,
      percent: percent.min(100),
      message: message.into(),
      current_step: None,
      total_steps: None,
      eta_seconds: None,
    }
  }

  pub fn with_steps(mut self, current: u32, total: u32) -> Self {
    self.current_step = Some(current);
    self.total_steps = Some(total);
    self
  }

  pub fn with_eta(mut self, eta_seconds: u64) -> Self {
    self.eta_seconds = Some(eta_seconds);
    self
  }

  /// Fields that count as an observable change (the reconciler's no-op rule).
  pub(crate) fn same_observable(&self, other: &Progress) -> bool {
    self.stage == other.stage && self.percent == other.percent && self.message == other.message
  }
}

/// A tracked unit of asynchronous generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
  pub id: JobId,
  pub job_type: JobType,
  pub status: JobStatus,
  pub progress: Progress,
  /// Ordered content references. Grows over the job's life.
  #[serde(default)]
  pub outputs: Vec<String>,
  /// Opaque structured metadata. Only the completion dispatcher reads it.
  #[serde(default)]
  pub manifest: Value,
  /// Failure reason. Only set while `status == Failed`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Non-fatal note, e.g. a compositor failure on a completed job.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub warning: Option<String>,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  pub user_id: OwnerId,
}

impl Job {
  /// Initial record written by the submission pipeline.
  pub fn queued(
    id: JobId,
    job_type: JobType,
    user_id: impl Into<OwnerId>,
    manifest: Value,
    created_at: DateTime<Utc>,
  ) -> Self {
    Self {
      id,
      job_type,
      status: JobStatus::Queued,
      progress: Progress::new(ProgressStage::Queued, 0, "Queued"),
      outputs: Vec::new(),
      manifest,
      error: None,
      warning: None,
      created_at,
      started_at: None,
      completed_at: None,
      user_id: user_id.into(),
    }
  }

  pub fn is_terminal(&self) -> bool {
    self.status.is_terminal()
  }

  pub fn is_active(&self) -> bool {
    self.status.is_active()
  }

  /// Number of sub-units the manifest declares, if any.
  pub fn expected_count(&self) -> Option<usize> {
    self
      .manifest
      .get(MANIFEST_EXPECTED_COUNT)
      .and_then(Value::as_u64)
      .and_then(|n| usize::try_from(n).ok())
  }
}

/// Partial update to a [`Job`]. `None` fields are preserved by the merge.
///
/// Identity fields (`id`, `job_type`, `user_id`, `created_at`) are not
/// patchable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<JobStatus>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub progress: Option<Progress>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub outputs: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub manifest: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub warning: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
}

impl JobPatch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn status(mut self, status: JobStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn progress(mut self, progress: Progress) -> Self {
    self.progress = Some(progress);
    self
  }

  pub fn outputs(mut self, outputs: Vec<String>) -> Self {
    self.outputs = Some(outputs);
    self
  }

  pub fn manifest(mut self, manifest: Value) -> Self {
    self.manifest = Some(manifest);
    self
  }

  pub fn error(mut self, error: impl Into<String>) -> Self {
    self.error = Some(error.into());
    self
  }

  /// Shorthand for a failure patch.
  pub fn failed(error: impl Into<String>) -> Self {
    Self::new().status(JobStatus::Failed).error(error)
  }

  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }

  /// Every mutable field of `job`, as written through to the store and as
  /// produced when a fetched record is fed back into the reconciler.
  pub fn from_job(job: &Job) -> Self {
    Self {
      status: Some(job.status),
      progress: Some(job.progress.clone()),
      outputs: Some(job.outputs.clone()),
      manifest: Some(job.manifest.clone()),
      error: job.error.clone(),
      warning: job.warning.clone(),
      started_at: job.started_at,
      completed_at: job.completed_at,
    }
  }

  /// Like [`JobPatch::from_job`], for rows from the bulk loader. Listings
  /// carry no outputs and only `Completed` rows are hydrated, so outputs are
  /// left out for every other row.
  pub fn from_metadata(row: &Job) -> Self {
    let mut patch = Self::from_job(row);
    if row.status != JobStatus::Completed {
      patch.outputs = None;
    }
    patch
  }
}

/// Parameters for [`crate::JobEngine::submit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOptions {
  pub job_type: JobType,
  /// Optional model variant, e.g. `"hd"` for images. Affects cost.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sub_model: Option<String>,
  /// Number of sub-units requested. Recorded as the manifest's expected count.
  pub quantity: u32,
  /// Free-form generation parameters passed through to the backend.
  #[serde(default)]
  pub params: Value,
}

impl SubmitOptions {
  pub fn new(job_type: JobType, quantity: u32) -> Self {
    Self {
      job_type,
      sub_model: None,
      quantity,
      params: Value::Object(Default::default()),
    }
  }

  pub fn with_sub_model(mut self, sub_model: impl Into<String>) -> Self {
    self.sub_model = Some(sub_model.into());
    self
  }

  pub fn with_params(mut self, params: Value) -> Self {
    self.params = params;
    self
  }
}

// --- Events ---

/// How loudly a failure should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
  /// Expected outcome (e.g. a job timing out). Kept off urgent channels.
  Quiet,
  /// Non-fatal degradation (e.g. compositor failure).
  Warning,
  /// Unexpected failure reported by the backend.
  Urgent,
}

/// Notification published on the engine's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
  /// A job was inserted or changed in the local index.
  Changed(Job),
  /// A job was dropped from the local index.
  Removed(JobId),
  /// A failure or warning worth surfacing to the user.
  Alert {
    job_id: JobId,
    level: AlertLevel,
    message: String,
  },
}
