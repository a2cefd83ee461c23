//! Force-fails jobs that have been queued or running for too long.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::config::EngineConfig;
use crate::job::{Job, JobId, JobPatch, JobType};

/// Failure message written into timed-out jobs.
pub fn timeout_message(threshold: Duration) -> String {
  format!("Job timed out after {} minutes", threshold.as_secs() / 60)
}

/// Periodic wall-clock staleness scan.
///
/// Only jobs in `queued` or `running` are considered. The synthesized patches
/// go through the reconciler like any other update, so a job that completed
/// between the scan and the patch is left alone.
#[derive(Debug)]
pub struct TimeoutSentinel {
  scan_interval: Duration,
  video_timeout: Duration,
  default_timeout: Duration,
  timer: Option<Interval>,
}

impl TimeoutSentinel {
  pub fn new(config: &EngineConfig) -> Self {
    Self {
      scan_interval: config.timeout_scan_interval,
      video_timeout: config.video_timeout,
      default_timeout: config.default_timeout,
      timer: None,
    }
  }

  pub fn start(&mut self) {
    let mut timer = interval_at(Instant::now() + self.scan_interval, self.scan_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    self.timer = Some(timer);
    debug!(
      scan_interval_ms = self.scan_interval.as_millis() as u64,
      "Timeout sentinel started."
    );
  }

  pub fn stop(&mut self) {
    self.timer = None;
  }

  /// Resolves on the next scan. Never resolves while stopped.
  pub async fn tick(&mut self) {
    match self.timer.as_mut() {
      Some(timer) => {
        timer.tick().await;
      }
      None => std::future::pending::<()>().await,
    }
  }

  pub fn threshold(&self, job_type: JobType) -> Duration {
    match job_type {
      JobType::Video => self.video_timeout,
      _ => self.default_timeout,
    }
  }

  /// Failure patches for every stale job in `jobs`.
  pub fn scan<'a>(
    &self,
    jobs: impl IntoIterator<Item = &'a Job>,
    now: DateTime<Utc>,
  ) -> Vec<(JobId, JobPatch)> {
    jobs
      .into_iter()
      .filter(|job| job.status.is_timeout_candidate())
      .filter_map(|job| {
        let threshold = self.threshold(job.job_type);
        let age = (now - job.created_at).to_std().unwrap_or(Duration::ZERO);
        (age > threshold).then(|| (job.id, JobPatch::failed(timeout_message(threshold))))
      })
      .collect()
  }
}
