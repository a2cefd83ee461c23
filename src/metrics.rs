use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without detailed percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Engine counters and gauges.
///
/// Cloning only clones the `Arc`s; the coordinator, the writer task and the
/// spawned fetch/composition tasks all update the same values.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
  // --- Counters ---
  /// Jobs that made it through the whole submission pipeline.
  pub jobs_submitted: Arc<AtomicUsize>,
  /// Submissions refused by validation or the ledger.
  pub submissions_rejected: Arc<AtomicUsize>,
  /// Patches accepted with an observable change.
  pub patches_applied: Arc<AtomicUsize>,
  /// Patches accepted but identical to the current state.
  pub patches_unchanged: Arc<AtomicUsize>,
  /// Patches dropped because the job was already terminal.
  pub patches_discarded_terminal: Arc<AtomicUsize>,
  /// Patches dropped because they carried a lower-ranked status.
  pub patches_discarded_stale: Arc<AtomicUsize>,
  /// Messages received from the push channel.
  pub push_messages: Arc<AtomicUsize>,
  pub poll_ticks: Arc<AtomicUsize>,
  /// Individual job fetches that failed during a poll tick.
  pub poll_fetch_failures: Arc<AtomicUsize>,
  /// Jobs force-failed by the timeout sentinel.
  pub jobs_timed_out: Arc<AtomicUsize>,
  pub jobs_completed: Arc<AtomicUsize>,
  pub jobs_failed: Arc<AtomicUsize>,
  pub write_through_failures: Arc<AtomicUsize>,
  pub compositions_started: Arc<AtomicUsize>,
  pub compositions_failed: Arc<AtomicUsize>,

  // --- Gauges ---
  /// Jobs currently held in the local index.
  pub jobs_tracked_current: Arc<AtomicUsize>,
  /// Jobs currently in a non-terminal state.
  pub jobs_active_current: Arc<AtomicUsize>,
  /// Current poll interval in milliseconds.
  pub poll_interval_ms_current: Arc<AtomicUsize>,

  // --- Histograms ---
  /// Latency of single-job store fetches issued by the poll scheduler.
  pub poll_fetch_duration: Arc<SimpleHistogram>,
}

impl EngineMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  /// Point-in-time copy of every metric.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      jobs_submitted: self.jobs_submitted.load(order),
      submissions_rejected: self.submissions_rejected.load(order),
      patches_applied: self.patches_applied.load(order),
      patches_unchanged: self.patches_unchanged.load(order),
      patches_discarded_terminal: self.patches_discarded_terminal.load(order),
      patches_discarded_stale: self.patches_discarded_stale.load(order),
      push_messages: self.push_messages.load(order),
      poll_ticks: self.poll_ticks.load(order),
      poll_fetch_failures: self.poll_fetch_failures.load(order),
      jobs_timed_out: self.jobs_timed_out.load(order),
      jobs_completed: self.jobs_completed.load(order),
      jobs_failed: self.jobs_failed.load(order),
      write_through_failures: self.write_through_failures.load(order),
      compositions_started: self.compositions_started.load(order),
      compositions_failed: self.compositions_failed.load(order),
      jobs_tracked_current: self.jobs_tracked_current.load(order),
      jobs_active_current: self.jobs_active_current.load(order),
      poll_interval_ms_current: self.poll_interval_ms_current.load(order),
      poll_fetch_duration_count: self.poll_fetch_duration.get_count(),
      poll_fetch_duration_sum_micros: self.poll_fetch_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of the engine's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
  // Counters
  pub jobs_submitted: usize,
  pub submissions_rejected: usize,
  pub patches_applied: usize,
  pub patches_unchanged: usize,
  pub patches_discarded_terminal: usize,
  pub patches_discarded_stale: usize,
  pub push_messages: usize,
  pub poll_ticks: usize,
  pub poll_fetch_failures: usize,
  pub jobs_timed_out: usize,
  pub jobs_completed: usize,
  pub jobs_failed: usize,
  pub write_through_failures: usize,
  pub compositions_started: usize,
  pub compositions_failed: usize,
  // Gauges
  pub jobs_tracked_current: usize,
  pub jobs_active_current: usize,
  pub poll_interval_ms_current: usize,
  // Histogram Data
  pub poll_fetch_duration_count: usize,
  pub poll_fetch_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean store fetch latency in microseconds, if any fetch completed.
  pub fn mean_fetch_duration_micros(&self) -> Option<f64> {
    if self.poll_fetch_duration_count == 0 {
      None
    } else {
      Some(self.poll_fetch_duration_sum_micros as f64 / self.poll_fetch_duration_count as f64)
    }
  }

  pub fn mean_fetch_duration(&self) -> Option<Duration> {
    self
      .mean_fetch_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }

  pub fn patches_discarded(&self) -> usize {
    self.patches_discarded_terminal + self.patches_discarded_stale
  }
}
