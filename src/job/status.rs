use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a generation job.
///
/// The non-failed states form a chain ordered by [`JobStatus::rank`]:
/// `Queued < Running < Upscaling < Encoding < Completed`. `Failed` sits outside
/// the chain and can be entered from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Queued,
  Running,
  Upscaling,
  Encoding,
  Completed,
  Failed,
}

/// The totally ordered chain of non-failed states.
pub const LATTICE: [JobStatus; 5] = [
  JobStatus::Queued,
  JobStatus::Running,
  JobStatus::Upscaling,
  JobStatus::Encoding,
  JobStatus::Completed,
];

impl JobStatus {
  /// Position in the lattice chain. `None` for `Failed`.
  pub fn rank(self) -> Option<usize> {
    LATTICE.iter().position(|s| *s == self)
  }

  /// `Completed` and `Failed` never transition anywhere.
  pub fn is_terminal(self) -> bool {
    matches!(self, JobStatus::Completed | JobStatus::Failed)
  }

  /// Statuses that keep a job in the poll scheduler's active set.
  pub fn is_active(self) -> bool {
    !self.is_terminal()
  }

  /// Statuses the timeout sentinel watches.
  pub fn is_timeout_candidate(self) -> bool {
    matches!(self, JobStatus::Queued | JobStatus::Running)
  }

  /// Whether moving from `self` to `next` respects the lattice.
  ///
  /// Staying in place is allowed (progress-only updates). `Failed` is
  /// reachable from every non-terminal state; nothing leaves a terminal state.
  pub fn can_transition_to(self, next: JobStatus) -> bool {
    if self.is_terminal() {
      return self == next;
    }
    match (self.rank(), next.rank()) {
      (_, None) => true,
      (Some(from), Some(to)) => to >= from,
      (None, Some(_)) => false,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      JobStatus::Queued => "queued",
      JobStatus::Running => "running",
      JobStatus::Upscaling => "upscaling",
      JobStatus::Encoding => "encoding",
      JobStatus::Completed => "completed",
      JobStatus::Failed => "failed",
    }
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chain_is_ordered() {
    for pair in LATTICE.windows(2) {
      assert!(pair[0].rank() < pair[1].rank());
    }
    assert_eq!(JobStatus::Failed.rank(), None);
  }

  #[test]
  fn failed_reachable_from_any_non_terminal() {
    for status in [
      JobStatus::Queued,
      JobStatus::Running,
      JobStatus::Upscaling,
      JobStatus::Encoding,
    ] {
      assert!(status.can_transition_to(JobStatus::Failed), "{status}");
    }
    assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
  }

  #[test]
  fn terminal_states_are_absorbing() {
    for terminal in [JobStatus::Completed, JobStatus::Failed] {
      for next in LATTICE {
        if next != terminal {
          assert!(!terminal.can_transition_to(next));
        }
      }
    }
  }

  #[test]
  fn backwards_moves_rejected() {
    assert!(!JobStatus::Encoding.can_transition_to(JobStatus::Running));
    assert!(JobStatus::Running.can_transition_to(JobStatus::Encoding));
    assert!(JobStatus::Upscaling.can_transition_to(JobStatus::Upscaling));
  }
}
