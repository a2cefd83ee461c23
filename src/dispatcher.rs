//! Hands completed multi-part jobs to the compositor.

use std::collections::HashSet;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use crate::command::Inbound;
use crate::error::ComposeError;
use crate::job::{Job, JobId, JobStatus};
use crate::metrics::EngineMetrics;
use crate::reconciler::CompositionEvent;

/// Combines the per-unit outputs of a job into a single artifact.
#[async_trait]
pub trait Compositor: Send + Sync {
  /// Returns a reference to the combined artifact.
  async fn compose(&self, refs: &[String], progress: ProgressReporter)
    -> Result<String, ComposeError>;
}

pub type SharedCompositor = Arc<dyn Compositor>;

/// Lets a running compositor report progress back into the engine.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
  job_id: JobId,
  inbox: mpsc::UnboundedSender<Inbound>,
}

impl ProgressReporter {
  pub fn job_id(&self) -> JobId {
    self.job_id
  }

  /// Reports are dropped silently once the engine has shut down.
  pub fn report(&self, percent: u8, message: impl Into<String>) {
    let event = CompositionEvent::Progress {
      percent: percent.min(100),
      message: message.into(),
    };
    let _ = self.inbox.send(Inbound::Composition {
      job_id: self.job_id,
      event,
    });
  }
}

/// `true` when a completed job holds exactly as many outputs as its manifest
/// expects, and expects more than one.
pub fn needs_composition(job: &Job) -> bool {
  if job.status != JobStatus::Completed {
    return false;
  }
  match job.expected_count() {
    Some(expected) if expected > 1 => job.outputs.len() == expected,
    _ => false,
  }
}

pub(crate) struct CompletionDispatcher {
  compositor: SharedCompositor,
  inbox: mpsc::UnboundedSender<Inbound>,
  in_flight: HashSet<JobId>,
  metrics: EngineMetrics,
}

impl CompletionDispatcher {
  pub fn new(
    compositor: SharedCompositor,
    inbox: mpsc::UnboundedSender<Inbound>,
    metrics: EngineMetrics,
  ) -> Self {
    Self {
      compositor,
      inbox,
      in_flight: HashSet::new(),
      metrics,
    }
  }

  /// Starts a composition for `job` if it needs one and none is running.
  /// Returns whether a composition was started.
  ///
  /// Once the combined reference is appended the output count no longer
  /// matches the manifest, so a job is composed at most once.
  pub fn evaluate(&mut self, job: &Job) -> bool {
    if !needs_composition(job) || self.in_flight.contains(&job.id) {
      return false;
    }
    self.in_flight.insert(job.id);
    self
      .metrics
      .compositions_started
      .fetch_add(1, AtomicOrdering::Relaxed);

    let job_id = job.id;
    let refs = job.outputs.clone();
    let compositor = self.compositor.clone();
    let inbox = self.inbox.clone();
    let reporter = ProgressReporter {
      job_id,
      inbox: inbox.clone(),
    };
    info!(%job_id, parts = refs.len(), "Handing completed job to compositor.");

    let span = tracing::info_span!("composition", %job_id);
    tokio::spawn(
      async move {
        let event = match compositor.compose(&refs, reporter).await {
          Ok(reference) => {
            debug!("Compositor finished.");
            CompositionEvent::Finished { reference }
          }
          Err(e) => {
            warn!(error = %e, "Compositor failed; keeping per-unit outputs.");
            CompositionEvent::Failed {
              message: e.to_string(),
            }
          }
        };
        let _ = inbox.send(Inbound::Composition { job_id, event });
      }
      .instrument(span),
    );
    true
  }

  /// Clears the in-flight mark once the final event has been handled.
  pub fn finish(&mut self, job_id: &JobId, failed: bool) {
    if self.in_flight.remove(job_id) && failed {
      self
        .metrics
        .compositions_failed
        .fetch_add(1, AtomicOrdering::Relaxed);
    }
  }

  /// Forgets a job that left the index. Its composition result is discarded
  /// when it arrives.
  pub fn forget(&mut self, job_id: &JobId) {
    self.in_flight.remove(job_id);
  }
}
