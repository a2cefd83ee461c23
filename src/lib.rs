//! JobKeeper: client-side sync for long-running generation jobs
//!
//! Keeps a local view of server-executed jobs (image, video, 3D, CAD)
//! consistent with an authoritative job store, using two independent and
//! unreliable update channels: a push notification stream and an adaptive
//! poll.
//!
//! # Features
//!
//! - One reconciler for every update source. Status only moves forward along
//!   `queued → running → {upscaling, encoding} → completed`, `failed` is
//!   reachable from any non-terminal state, and terminal jobs never change.
//! - Polling backs off with the age of the oldest active job
//!   (`min(base * 2^floor(age / step), max)`).
//! - Queued or running jobs that exceed their type's threshold are
//!   force-failed by a periodic timeout scan.
//! - Submission debits a ledger before the job record exists, and refunds
//!   if persisting or starting the job fails.
//! - Paged history loading hydrates heavy output payloads in batches and
//!   retries timed-out metadata queries with exponential backoff.
//! - Multi-part jobs are handed to a compositor once every part is in.
//! - Metrics snapshots and a broadcast event stream for UIs.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use jobkeeper::{
//!     JobEngine, JobEvent, JobType, SubmitOptions,
//!     JobStore, PushChannel, Ledger, GenerationBackend, Compositor,
//! };
//!
//! # async fn run(
//! #   store: Arc<dyn JobStore>,
//! #   push: Arc<dyn PushChannel>,
//! #   ledger: Arc<dyn Ledger>,
//! #   backend: Arc<dyn GenerationBackend>,
//! #   compositor: Arc<dyn Compositor>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = JobEngine::builder()
//!     .store(store)
//!     .push_channel(push)
//!     .ledger(ledger)
//!     .backend(backend)
//!     .compositor(compositor)
//!     .owner("user-42")
//!     .build()?;
//!
//! let mut events = engine.subscribe_events();
//! engine.connect_push().await?;
//! engine.reload(50).await?;
//!
//! let job_id = engine.submit(SubmitOptions::new(JobType::Image, 4)).await?;
//! while let Ok(event) = events.recv().await {
//!     if let JobEvent::Changed(job) = event {
//!         if job.id == job_id && job.is_terminal() {
//!             println!("{} finished as {}", job.id, job.status);
//!             break;
//!         }
//!     }
//! }
//!
//! engine.shutdown(Some(Duration::from_secs(5))).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Observability
//!
//! - Retrieve metrics snapshots using [`JobEngine::metrics_snapshot`]. See [`MetricsSnapshot`].
//! - Integrate with the `tracing` crate for detailed logs. With the
//!   `tracing-subscriber` feature, [`init_tracing`] installs a formatter
//!   filtered by `RUST_LOG`.

pub mod clock;
pub(crate) mod command;
pub mod config;
pub(crate) mod coordinator;
pub mod cost;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod job;
pub mod ledger;
pub mod loader;
pub mod metrics;
pub mod poll;
pub mod push;
pub mod reconciler;
pub mod sentinel;
pub mod store;
pub mod submission;

// --- Public Re-exports ---

pub use engine::{EngineBuilder, JobEngine};

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::EngineConfig;

pub use error::{
  BackendError, BuildError, ComposeError, LedgerError, LoadError, PushError, QueryError,
  RejectReason, ShutdownError, StoreError, SubmitError,
};

pub use job::{
  AlertLevel, Job, JobEvent, JobId, JobPatch, JobStatus, JobType, OwnerId, Progress, ProgressStage,
  SubmitOptions,
};

// Collaborator interfaces
pub use dispatcher::{Compositor, ProgressReporter};
pub use ledger::{Ledger, Receipt};
pub use push::PushChannel;
pub use store::{JobStore, ListPage};
pub use submission::GenerationBackend;

pub use loader::Page;
pub use metrics::{EngineMetrics, MetricsSnapshot};

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Does nothing if a global subscriber is already set.
#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing() {
  use tracing_subscriber::EnvFilter;

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
