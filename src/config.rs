use std::time::Duration;

use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_CHANNEL_BOUND: usize = 128;
pub(crate) const DEFAULT_EVENT_BUFFER: usize = 256;

/// Tunables for the sync engine. Every field has a production default; see
/// [`EngineConfig::default`].
///
/// Usually adjusted through [`crate::EngineBuilder`] rather than built by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Poll interval while every active job is young. Also the reset value
  /// when nothing is active.
  pub poll_base_interval: Duration,
  /// Upper bound for the adaptive poll interval.
  pub poll_max_interval: Duration,
  /// Age of the oldest active job after which the poll interval doubles.
  pub poll_backoff_step: Duration,
  /// How often the timeout sentinel scans active jobs.
  pub timeout_scan_interval: Duration,
  /// Staleness threshold for video jobs.
  pub video_timeout: Duration,
  /// Staleness threshold for every other job type.
  pub default_timeout: Duration,
  /// Number of job ids per output-hydration request.
  pub hydrate_batch_size: usize,
  /// Retries of the metadata query after timeout-class errors.
  pub load_max_retries: u32,
  /// Base delay of the metadata retry backoff (`base * 2^attempt`).
  pub load_retry_base: Duration,
  /// Local jobs younger than this survive a full reload even when the
  /// server snapshot does not include them yet.
  pub recent_job_window: Duration,
  pub command_buffer_size: usize,
  pub event_buffer_size: usize,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      poll_base_interval: Duration::from_millis(2_000),
      poll_max_interval: Duration::from_millis(30_000),
      poll_backoff_step: Duration::from_millis(30_000),
      timeout_scan_interval: Duration::from_secs(30),
      video_timeout: Duration::from_secs(30 * 60),
      default_timeout: Duration::from_secs(15 * 60),
      hydrate_batch_size: 20,
      load_max_retries: 3,
      load_retry_base: Duration::from_millis(2_000),
      recent_job_window: Duration::from_secs(5),
      command_buffer_size: DEFAULT_CHANNEL_BOUND,
      event_buffer_size: DEFAULT_EVENT_BUFFER,
    }
  }
}
