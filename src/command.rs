use crate::error::{QueryError, StoreError};
use crate::job::{Job, JobId, JobPatch};
use crate::metrics::MetricsSnapshot;
use crate::reconciler::CompositionEvent;

use tokio::sync::oneshot;

/// Commands sent from the `JobEngine` handle to the coordinator task.
///
/// Each command carries a `oneshot::Sender` for the coordinator to send the
/// response back to the requesting task.
#[derive(Debug)]
pub(crate) enum EngineCommand {
  /// Start tracking a freshly submitted job: insert it into the index and
  /// arm the push listener.
  Track {
    job: Job,
    responder: oneshot::Sender<()>,
  },
  GetJob {
    job_id: JobId,
    responder: oneshot::Sender<Result<Job, QueryError>>,
  },
  /// Every tracked job, newest first.
  ListJobs {
    responder: oneshot::Sender<Vec<Job>>,
  },
  /// Merge rows fetched by the bulk loader into the index.
  /// `reset` replaces the index (keeping very recent local jobs).
  IntegratePage {
    rows: Vec<Job>,
    reset: bool,
    responder: oneshot::Sender<Vec<Job>>,
  },
  /// Drop jobs that were deleted from the store.
  Remove {
    job_ids: Vec<JobId>,
    responder: oneshot::Sender<()>,
  },
  /// Subscribe every active job that lacks a live push subscription
  /// (after a connect or reconnect). Responds with the number subscribed.
  Resubscribe {
    responder: oneshot::Sender<usize>,
  },
  GetMetricsSnapshot {
    responder: oneshot::Sender<MetricsSnapshot>,
  },
}

/// Messages produced by the coordinator's own background work (push
/// forwarders, poll fetches, compositions) and fed back into its loop.
#[derive(Debug)]
pub(crate) enum Inbound {
  /// A patch delivered by the push channel.
  Push { job_id: JobId, patch: JobPatch },
  /// Result of a single-job fetch issued by a poll tick.
  Fetched {
    job_id: JobId,
    result: Result<Option<Job>, StoreError>,
  },
  /// Progress or outcome of a compositor run.
  Composition {
    job_id: JobId,
    event: CompositionEvent,
  },
}
