//! Debit, persist, start. In that order.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::cost;
use crate::error::{BackendError, SubmitError};
use crate::job::{Job, OwnerId, SubmitOptions, MANIFEST_EXPECTED_COUNT};
use crate::ledger::{self, Receipt, SharedLedger};
use crate::metrics::EngineMetrics;
use crate::store::SharedJobStore;

/// Starts server-side generation for a job that already has a durable record.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
  async fn start(&self, job: &Job, options: &SubmitOptions) -> Result<(), BackendError>;
}

pub type SharedBackend = Arc<dyn GenerationBackend>;

/// Runs on the caller's task; only the finished record is handed to the
/// coordinator.
#[derive(Clone)]
pub(crate) struct SubmissionPipeline {
  store: SharedJobStore,
  ledger: SharedLedger,
  backend: SharedBackend,
  owner: OwnerId,
  clock: SharedClock,
  metrics: EngineMetrics,
}

impl SubmissionPipeline {
  pub fn new(
    store: SharedJobStore,
    ledger: SharedLedger,
    backend: SharedBackend,
    owner: OwnerId,
    clock: SharedClock,
    metrics: EngineMetrics,
  ) -> Self {
    Self {
      store,
      ledger,
      backend,
      owner,
      clock,
      metrics,
    }
  }

  /// Runs the pipeline and returns the queued job record.
  ///
  /// Rejections happen before any record exists. Later failures are
  /// compensated: a failed insert refunds the debit, a failed start deletes
  /// the record and refunds.
  pub async fn submit(&self, options: &SubmitOptions) -> Result<Job, SubmitError> {
    let job_id = Uuid::new_v4();

    let estimate = cost::estimate(options.job_type, options.sub_model.as_deref(), options.quantity)
      .map_err(|e| self.rejected(e))?;

    let action = ledger::action_for(options.job_type);
    let receipt = self
      .ledger
      .debit(job_id, &action, estimate.total)
      .await
      .map_err(|e| self.rejected(e.into()))?;
    debug!(%job_id, amount = estimate.total, transaction_id = %receipt.transaction_id, "Ledger debited.");

    let job = Job::queued(
      job_id,
      options.job_type,
      self.owner.clone(),
      manifest_for(options),
      self.clock.now(),
    );

    if let Err(e) = self.store.insert(&job).await {
      warn!(%job_id, error = %e, "Failed to persist new job; refunding.");
      self.refund(&receipt).await;
      return Err(SubmitError::Store(e));
    }

    if let Err(e) = self.backend.start(&job, options).await {
      warn!(%job_id, error = %e, "Backend refused to start job; rolling back.");
      if let Err(delete_err) = self.store.delete(job_id).await {
        error!(%job_id, error = %delete_err, "Failed to delete job record during rollback.");
      }
      self.refund(&receipt).await;
      return Err(SubmitError::Backend(e));
    }

    self.metrics.jobs_submitted.fetch_add(1, AtomicOrdering::Relaxed);
    info!(%job_id, job_type = %options.job_type, quantity = options.quantity, "Job submitted.");
    Ok(job)
  }

  fn rejected(&self, err: SubmitError) -> SubmitError {
    if matches!(err, SubmitError::Validation(_) | SubmitError::Rejected(_)) {
      self
        .metrics
        .submissions_rejected
        .fetch_add(1, AtomicOrdering::Relaxed);
      info!(reason = %err, "Submission rejected.");
    }
    err
  }

  async fn refund(&self, receipt: &Receipt) {
    if let Err(e) = self.ledger.refund(receipt).await {
      error!(
        job_id = %receipt.job_id,
        transaction_id = %receipt.transaction_id,
        error = %e,
        "Refund failed; debit left without a job."
      );
    }
  }
}

/// Generation params plus the expected sub-unit count.
fn manifest_for(options: &SubmitOptions) -> Value {
  let mut manifest = match &options.params {
    Value::Object(map) => map.clone(),
    Value::Null => Map::new(),
    other => {
      let mut map = Map::new();
      map.insert("params".to_string(), other.clone());
      map
    }
  };
  if let Some(sub_model) = &options.sub_model {
    manifest.insert("sub_model".to_string(), Value::from(sub_model.clone()));
  }
  manifest.insert(MANIFEST_EXPECTED_COUNT.to_string(), Value::from(options.quantity));
  Value::Object(manifest)
}
