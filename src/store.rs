//! Job store interface and the ordered write-through writer.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::StoreError;
use crate::job::{Job, JobId, JobPatch};
use crate::metrics::EngineMetrics;

/// One page of metadata rows returned by [`JobStore::list_by_owner`].
///
/// Rows carry every field except `outputs`, which the bulk loader hydrates in
/// a second pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
  pub rows: Vec<Job>,
  pub total: u64,
}

/// Durable record store holding the authoritative job state.
#[async_trait]
pub trait JobStore: Send + Sync {
  async fn insert(&self, job: &Job) -> Result<(), StoreError>;

  async fn update(&self, id: JobId, patch: &JobPatch) -> Result<(), StoreError>;

  async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

  /// Metadata rows for `owner`, newest first.
  async fn list_by_owner(
    &self,
    owner: &str,
    offset: usize,
    limit: usize,
  ) -> Result<ListPage, StoreError>;

  /// Heavy `outputs` payloads for the given jobs. Ids without a record are
  /// simply absent from the result.
  async fn fetch_outputs(&self, ids: &[JobId]) -> Result<Vec<(JobId, Vec<String>)>, StoreError>;

  async fn delete(&self, id: JobId) -> Result<(), StoreError>;

  async fn delete_many(&self, ids: &[JobId]) -> Result<(), StoreError>;
}

pub type SharedJobStore = Arc<dyn JobStore>;

/// Sends accepted changes to the store from a single task, so updates for
/// the same job land in the order the coordinator accepted them.
///
/// Failures are logged and counted. The in-memory index keeps the update
/// regardless.
#[derive(Debug, Clone)]
pub(crate) struct WriteThrough {
  tx: mpsc::UnboundedSender<(JobId, JobPatch)>,
}

impl WriteThrough {
  /// Spawns the writer task. It exits once every `WriteThrough` clone is
  /// dropped and the queue is drained.
  pub fn spawn(store: SharedJobStore, metrics: EngineMetrics) -> (Self, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(JobId, JobPatch)>();
    let handle = tokio::spawn(async move {
      while let Some((job_id, patch)) = rx.recv().await {
        match store.update(job_id, &patch).await {
          Ok(()) => trace!(%job_id, "Wrote job update through to store."),
          Err(e) => {
            metrics
              .write_through_failures
              .fetch_add(1, AtomicOrdering::Relaxed);
            warn!(%job_id, error = %e, "Write-through to job store failed; local state kept.");
          }
        }
      }
      debug!("Write-through queue closed, writer exiting.");
    });
    (Self { tx }, handle)
  }

  /// Queues every mutable field of `job` for persistence.
  pub fn write(&self, job: &Job) {
    if self.tx.send((job.id, JobPatch::from_job(job))).is_err() {
      warn!(job_id = %job.id, "Write-through writer has exited; update not persisted.");
    }
  }
}
