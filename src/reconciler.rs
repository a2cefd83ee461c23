//! Merges partial updates into local job records.
//!
//! Every producer (push, poll, timeout scan, bulk reload) funnels through
//! [`apply`], which is pure: it never touches the index, the store or the
//! channels. The coordinator acts on the returned [`Reconciliation`].
//!
//! Rules, in order:
//! 1. A terminal job discards every patch.
//! 2. A non-failed status ranked below the current status discards the whole
//!    patch (out-of-order delivery across channels).
//! 3. Present fields replace, absent fields are preserved.
//! 4. A merge with no observable difference is reported as `Unchanged`.
//! 5. Entering `Completed`/`Failed` is reported as a [`Terminal`] transition.

use chrono::{DateTime, Utc};

use crate::job::{Job, JobPatch, JobStatus, Progress, ProgressStage};

/// Why a patch was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
  /// The job already reached `Completed` or `Failed`.
  Terminal,
  /// The patch carried a status ranked below the current one.
  Stale,
}

/// Terminal state a job just entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
  Completed,
  Failed,
}

/// Outcome of merging a patch into a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
  Discarded(DiscardReason),
  Unchanged,
  Applied {
    job: Job,
    transition: Option<Terminal>,
  },
}

impl Reconciliation {
  pub fn is_applied(&self) -> bool {
    matches!(self, Reconciliation::Applied { .. })
  }

  /// The merged job, if the patch was accepted with an observable change.
  pub fn into_job(self) -> Option<Job> {
    match self {
      Reconciliation::Applied { job, .. } => Some(job),
      _ => None,
    }
  }
}

/// Event produced while the compositor works on a completed job.
#[derive(Debug, Clone, PartialEq)]
pub enum CompositionEvent {
  Progress { percent: u8, message: String },
  Finished { reference: String },
  Failed { message: String },
}

/// Merges `patch` into `current` under the ordering and terminal guards.
pub fn apply(current: &Job, patch: &JobPatch, now: DateTime<Utc>) -> Reconciliation {
  if current.status.is_terminal() {
    return Reconciliation::Discarded(DiscardReason::Terminal);
  }

  if let Some(next) = patch.status {
    // `current` is non-terminal here, so a failed `next` is always legal.
    if !current.status.can_transition_to(next) {
      return Reconciliation::Discarded(DiscardReason::Stale);
    }
  }

  let status = patch.status.unwrap_or(current.status);
  let mut progress = patch
    .progress
    .clone()
    .unwrap_or_else(|| current.progress.clone());
  progress.percent = progress.percent.min(100);

  let error = if status == JobStatus::Failed {
    patch.error.clone().or_else(|| current.error.clone())
  } else {
    None
  };

  let started_at = patch.started_at.or(current.started_at).or_else(|| {
    let left_queue = status.rank() > JobStatus::Queued.rank();
    left_queue.then_some(now)
  });
  let completed_at = patch
    .completed_at
    .or(current.completed_at)
    .or_else(|| status.is_terminal().then_some(now));

  let merged = Job {
    id: current.id,
    job_type: current.job_type,
    status,
    progress,
    outputs: patch
      .outputs
      .clone()
      .unwrap_or_else(|| current.outputs.clone()),
    manifest: patch
      .manifest
      .clone()
      .unwrap_or_else(|| current.manifest.clone()),
    error,
    warning: patch.warning.clone().or_else(|| current.warning.clone()),
    created_at: current.created_at,
    started_at,
    completed_at,
    user_id: current.user_id.clone(),
  };

  if !observably_differs(current, &merged) {
    return Reconciliation::Unchanged;
  }

  let transition = if status != current.status {
    match status {
      JobStatus::Completed => Some(Terminal::Completed),
      JobStatus::Failed => Some(Terminal::Failed),
      _ => None,
    }
  } else {
    None
  };

  Reconciliation::Applied {
    job: merged,
    transition,
  }
}

/// Applies a compositor event to a completed job.
///
/// Status never changes here. Events for jobs that are not `Completed` are
/// discarded (the job was deleted and re-created, or never completed).
pub fn apply_composition(current: &Job, event: &CompositionEvent) -> Reconciliation {
  if current.status != JobStatus::Completed {
    return Reconciliation::Discarded(DiscardReason::Stale);
  }

  let mut merged = current.clone();
  match event {
    CompositionEvent::Progress { percent, message } => {
      merged.progress = Progress::new(ProgressStage::Compositing, *percent, message.clone());
    }
    CompositionEvent::Finished { reference } => {
      if !merged.outputs.iter().any(|o| o == reference) {
        merged.outputs.push(reference.clone());
      }
      merged.progress = Progress::new(ProgressStage::Completed, 100, "Completed");
    }
    CompositionEvent::Failed { message } => {
      merged.warning = Some(message.clone());
      merged.progress = Progress::new(ProgressStage::Completed, 100, "Completed");
    }
  }

  if !observably_differs(current, &merged) && merged.warning == current.warning {
    return Reconciliation::Unchanged;
  }
  Reconciliation::Applied {
    job: merged,
    transition: None,
  }
}

fn observably_differs(before: &Job, after: &Job) -> bool {
  before.status != after.status
    || !before.progress.same_observable(&after.progress)
    || before.outputs != after.outputs
    || before.error != after.error
}
