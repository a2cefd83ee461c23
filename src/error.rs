use crate::job::JobId;

use thiserror::Error;

// --- Collaborator Errors ---

/// Errors reported by a [`crate::store::JobStore`].
///
/// Only the classification matters to the engine: `Timeout` is retried by the
/// bulk loader, `Other` is surfaced once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  #[error("job store query timed out: {0}")]
  Timeout(String),
  #[error("job store error: {0}")]
  Other(String),
}

impl StoreError {
  pub fn is_timeout(&self) -> bool {
    matches!(self, StoreError::Timeout(_))
  }
}

/// Closed set of reasons the ledger may refuse a debit. Surfaced verbatim.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
  #[error("insufficient balance")]
  InsufficientBalance,
  #[error("plan upgrade required")]
  PlanRequired,
  #[error("feature not available on this plan")]
  FeatureGated,
}

/// Errors reported by a [`crate::ledger::Ledger`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
  #[error("debit rejected: {0}")]
  Rejected(RejectReason),
  #[error("ledger service unavailable: {0}")]
  Unavailable(String),
}

/// Errors reported by a [`crate::push::PushChannel`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
  #[error("push channel is not connected")]
  NotConnected,
  #[error("push subscription failed: {0}")]
  Subscribe(String),
  #[error("push connection failed: {0}")]
  Connect(String),
}

/// The compositor could not produce a combined artifact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("compositor failed: {0}")]
pub struct ComposeError(pub String);

/// The generation backend refused or failed to start a job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("generation backend error: {0}")]
pub struct BackendError(pub String);

// --- Engine Errors ---

/// Errors that can occur while building the engine with `EngineBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("A job store must be provided")]
  MissingStore,
  #[error("A push channel must be provided")]
  MissingPushChannel,
  #[error("A ledger service must be provided")]
  MissingLedger,
  #[error("A generation backend must be provided")]
  MissingBackend,
  #[error("A compositor must be provided")]
  MissingCompositor,
  #[error("An owner id must be provided")]
  MissingOwner,
  #[error("Invalid configuration: {0}")]
  InvalidConfig(&'static str),
}

/// Errors surfaced by [`crate::JobEngine::submit`].
///
/// Nothing is retried automatically. Rejections happen before any job record
/// exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
  #[error("invalid submission: {0}")]
  Validation(String),
  #[error("submission rejected: {0}")]
  Rejected(RejectReason),
  #[error("ledger unavailable: {0}")]
  Ledger(String),
  #[error("failed to persist job: {0}")]
  Store(StoreError),
  #[error("failed to start job: {0}")]
  Backend(BackendError),
  #[error("Engine command channel is closed (likely shut down or panicked).")]
  EngineShutdown,
}

impl From<LedgerError> for SubmitError {
  fn from(err: LedgerError) -> Self {
    match err {
      LedgerError::Rejected(reason) => SubmitError::Rejected(reason),
      LedgerError::Unavailable(msg) => SubmitError::Ledger(msg),
    }
  }
}

/// Errors surfaced by the bulk loader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
  /// The metadata query kept timing out past the retry ceiling. Usually means
  /// the store is overloaded or the history is too large to scan.
  #[error("job store capacity exceeded: metadata query timed out {attempts} times")]
  Capacity { attempts: u32 },
  #[error("failed to load jobs: {0}")]
  Store(StoreError),
  #[error("Engine command channel is closed (likely shut down or panicked).")]
  EngineShutdown,
}

/// Errors related to querying or mutating engine state
/// (e.g., via `get_job`, `delete_job`, `metrics_snapshot`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
  #[error("Engine command channel is closed (likely shut down or panicked).")]
  EngineShutdown,
  #[error("Engine did not respond to the query (coordinator task may have panicked or shut down unexpectedly).")]
  ResponseFailed,
  #[error("Job {0} not found.")]
  JobNotFound(JobId),
  #[error("job store error: {0}")]
  Store(StoreError),
}

/// Errors related to the engine shutdown process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (engine already shut down or watch channel error).")]
  SignalFailed,
  #[error("Timed out waiting for engine tasks to complete shutdown.")]
  Timeout,
  #[error("An engine task panicked during the shutdown process.")]
  TaskPanic,
}
