//! Per-job push subscriptions.
//!
//! A [`PushChannel`] hands back one message queue per subscribed job. The
//! [`PushListener`] spawns a forwarder per queue that moves every patch into
//! the coordinator inbox, where the reconciler applies the usual guards.

use std::collections::HashMap;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};

use crate::command::Inbound;
use crate::error::PushError;
use crate::job::{JobId, JobPatch};
use crate::metrics::EngineMetrics;

/// Best-effort push notification transport.
///
/// Delivery may be dropped silently while disconnected and is unordered with
/// respect to polling.
#[async_trait]
pub trait PushChannel: Send + Sync {
  async fn connect(&self) -> Result<(), PushError>;

  async fn disconnect(&self);

  fn is_connected(&self) -> bool;

  /// Starts delivery for `job_id`. The channel closes the returned queue when
  /// it drops the subscription (e.g. on disconnect).
  fn subscribe(&self, job_id: JobId) -> Result<mpsc::UnboundedReceiver<JobPatch>, PushError>;

  fn unsubscribe(&self, job_id: JobId);
}

pub type SharedPushChannel = Arc<dyn PushChannel>;

/// Tracks which jobs are subscribed and owns their forwarder tasks.
pub(crate) struct PushListener {
  channel: SharedPushChannel,
  inbox: mpsc::UnboundedSender<Inbound>,
  forwarders: HashMap<JobId, JoinHandle<()>>,
  metrics: EngineMetrics,
}

impl PushListener {
  pub fn new(
    channel: SharedPushChannel,
    inbox: mpsc::UnboundedSender<Inbound>,
    metrics: EngineMetrics,
  ) -> Self {
    Self {
      channel,
      inbox,
      forwarders: HashMap::new(),
      metrics,
    }
  }

  pub fn is_connected(&self) -> bool {
    self.channel.is_connected()
  }

  /// A job counts as subscribed while its forwarder is still running.
  pub fn is_subscribed(&self, job_id: &JobId) -> bool {
    self
      .forwarders
      .get(job_id)
      .is_some_and(|handle| !handle.is_finished())
  }

  pub fn subscribed_count(&self) -> usize {
    self.forwarders.len()
  }

  /// Subscribes `job_id` if the channel is connected and the job is not
  /// already subscribed. Returns whether a live subscription exists afterwards.
  pub fn subscribe(&mut self, job_id: JobId) -> bool {
    if self.is_subscribed(&job_id) {
      return true;
    }
    if !self.channel.is_connected() {
      trace!(%job_id, "Push channel not connected; job relies on polling.");
      return false;
    }
    // Finished forwarder from a dropped subscription.
    self.forwarders.remove(&job_id);

    let mut rx = match self.channel.subscribe(job_id) {
      Ok(rx) => rx,
      Err(e) => {
        warn!(%job_id, error = %e, "Push subscribe failed; job relies on polling.");
        return false;
      }
    };

    let inbox = self.inbox.clone();
    let metrics = self.metrics.clone();
    let span = tracing::debug_span!("push_forwarder", %job_id);
    let handle = tokio::spawn(
      async move {
        while let Some(patch) = rx.recv().await {
          metrics.push_messages.fetch_add(1, AtomicOrdering::Relaxed);
          if inbox.send(Inbound::Push { job_id, patch }).is_err() {
            break;
          }
        }
        trace!("Push queue closed.");
      }
      .instrument(span),
    );
    self.forwarders.insert(job_id, handle);
    debug!(%job_id, "Subscribed to push updates.");
    true
  }

  /// Idempotent: unknown or already-unsubscribed jobs are ignored.
  pub fn unsubscribe(&mut self, job_id: &JobId) {
    if let Some(handle) = self.forwarders.remove(job_id) {
      handle.abort();
      self.channel.unsubscribe(*job_id);
      debug!(%job_id, "Unsubscribed from push updates.");
    }
  }

  pub fn unsubscribe_all(&mut self) {
    let job_ids: Vec<JobId> = self.forwarders.keys().copied().collect();
    for job_id in &job_ids {
      self.unsubscribe(job_id);
    }
  }
}
