//! Adaptive poll cadence for locally-active jobs.
//!
//! The interval doubles for every `backoff_step` of the oldest active job's
//! observed age, capped at `max`. Backoff only throttles how often ticks fire;
//! every active job is still fetched on every tick.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::job::JobId;

/// `min(base * 2^floor(oldest_age / step), max)`.
pub fn backoff_interval(
  oldest_age: Duration,
  base: Duration,
  step: Duration,
  max: Duration,
) -> Duration {
  if step.is_zero() {
    return max;
  }
  let doublings = oldest_age.as_millis() / step.as_millis();
  let multiplier = u32::try_from(doublings)
    .ok()
    .and_then(|d| 1u64.checked_shl(d))
    .unwrap_or(u64::MAX);
  let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
  Duration::from_millis(base_ms.saturating_mul(multiplier)).min(max)
}

/// What a poll tick should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPlan {
  /// Jobs to fetch this tick.
  pub jobs: Vec<JobId>,
  /// Interval in force after this tick.
  pub interval: Duration,
  /// Whether the timer was rearmed with a new period.
  pub rearmed: bool,
}

/// Owns the poll timer, the current interval and per-job tracking start times.
#[derive(Debug)]
pub struct PollScheduler {
  base: Duration,
  max: Duration,
  step: Duration,
  interval: Duration,
  tracking: HashMap<JobId, DateTime<Utc>>,
  timer: Option<Interval>,
  clock: SharedClock,
}

impl PollScheduler {
  pub fn new(config: &EngineConfig, clock: SharedClock) -> Self {
    Self {
      base: config.poll_base_interval,
      max: config.poll_max_interval,
      step: config.poll_backoff_step,
      interval: config.poll_base_interval,
      tracking: HashMap::new(),
      timer: None,
      clock,
    }
  }

  /// Arms the timer at the current interval. The first tick fires one
  /// interval from now.
  pub fn start(&mut self) {
    self.timer = Some(make_timer(self.interval));
    debug!(interval_ms = self.interval.as_millis() as u64, "Poll scheduler started.");
  }

  /// Disarms the timer and forgets all tracking state.
  pub fn stop(&mut self) {
    self.timer = None;
    self.tracking.clear();
    self.interval = self.base;
    debug!("Poll scheduler stopped.");
  }

  pub fn is_running(&self) -> bool {
    self.timer.is_some()
  }

  /// Resolves on the next tick. Never resolves while stopped.
  pub async fn tick(&mut self) {
    match self.timer.as_mut() {
      Some(timer) => {
        timer.tick().await;
      }
      None => std::future::pending::<()>().await,
    }
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  pub fn tracked(&self) -> usize {
    self.tracking.len()
  }

  /// Drops the tracking start time of a job that left the active set.
  pub fn forget(&mut self, job_id: &JobId) {
    self.tracking.remove(job_id);
  }

  /// Computes this tick's work from the current active set and rearms the
  /// timer if the interval changed.
  pub fn plan(&mut self, active: &[JobId]) -> PollPlan {
    if active.is_empty() {
      self.tracking.clear();
      let rearmed = self.set_interval(self.base);
      return PollPlan {
        jobs: Vec::new(),
        interval: self.interval,
        rearmed,
      };
    }

    let now = self.clock.now();
    let active_set: HashSet<&JobId> = active.iter().collect();
    self.tracking.retain(|id, _| active_set.contains(id));

    let mut oldest_age = Duration::ZERO;
    for job_id in active {
      let started = *self.tracking.entry(*job_id).or_insert(now);
      let age = (now - started).to_std().unwrap_or(Duration::ZERO);
      oldest_age = oldest_age.max(age);
    }

    let next = backoff_interval(oldest_age, self.base, self.step, self.max);
    let rearmed = self.set_interval(next);
    trace!(
      active = active.len(),
      oldest_age_ms = oldest_age.as_millis() as u64,
      interval_ms = self.interval.as_millis() as u64,
      "Planned poll tick."
    );

    PollPlan {
      jobs: active.to_vec(),
      interval: self.interval,
      rearmed,
    }
  }

  fn set_interval(&mut self, next: Duration) -> bool {
    if next == self.interval {
      return false;
    }
    debug!(
      from_ms = self.interval.as_millis() as u64,
      to_ms = next.as_millis() as u64,
      "Poll interval changed, rearming timer."
    );
    self.interval = next;
    if self.timer.is_some() {
      self.timer = Some(make_timer(next));
    }
    true
  }
}

fn make_timer(period: Duration) -> Interval {
  let mut timer = interval_at(Instant::now() + period, period);
  timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
  timer
}
