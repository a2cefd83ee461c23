use crate::clock::{SharedClock, SystemClock};
use crate::command::EngineCommand;
use crate::config::EngineConfig;
use crate::coordinator::{Coordinator, CoordinatorState};
use crate::dispatcher::{CompletionDispatcher, SharedCompositor};
use crate::error::{BuildError, LoadError, PushError, QueryError, ShutdownError, SubmitError};
use crate::job::{Job, JobEvent, JobId, OwnerId, SubmitOptions};
use crate::ledger::SharedLedger;
use crate::loader::{BulkLoader, Page};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::push::{PushListener, SharedPushChannel};
use crate::store::{SharedJobStore, WriteThrough};
use crate::submission::{SharedBackend, SubmissionPipeline};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Builder for configuring and creating a [`JobEngine`].
///
/// The job store, push channel, ledger, generation backend, compositor and
/// owner id are required. Every tunable defaults to [`EngineConfig::default`].
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use jobkeeper::{JobEngine, JobStore, PushChannel, Ledger, GenerationBackend, Compositor};
/// # async fn run(
/// #   store: Arc<dyn JobStore>,
/// #   push: Arc<dyn PushChannel>,
/// #   ledger: Arc<dyn Ledger>,
/// #   backend: Arc<dyn GenerationBackend>,
/// #   compositor: Arc<dyn Compositor>,
/// # ) -> Result<(), Box<dyn std::error::Error>> {
/// let engine = JobEngine::builder()
///     .store(store)
///     .push_channel(push)
///     .ledger(ledger)
///     .backend(backend)
///     .compositor(compositor)
///     .owner("user-42")
///     .poll_base_interval(Duration::from_secs(1))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct EngineBuilder {
  config: EngineConfig,
  store: Option<SharedJobStore>,
  push: Option<SharedPushChannel>,
  ledger: Option<SharedLedger>,
  backend: Option<SharedBackend>,
  compositor: Option<SharedCompositor>,
  owner: Option<OwnerId>,
  clock: Option<SharedClock>,
}

impl fmt::Debug for EngineBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EngineBuilder")
      .field("config", &self.config)
      .field("store", &self.store.is_some())
      .field("push", &self.push.is_some())
      .field("ledger", &self.ledger.is_some())
      .field("backend", &self.backend.is_some())
      .field("compositor", &self.compositor.is_some())
      .field("owner", &self.owner)
      .field("clock", &self.clock)
      .finish()
  }
}

impl EngineBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replaces every tunable at once.
  pub fn config(mut self, config: EngineConfig) -> Self {
    self.config = config;
    self
  }

  pub fn store(mut self, store: SharedJobStore) -> Self {
    self.store = Some(store);
    self
  }

  pub fn push_channel(mut self, push: SharedPushChannel) -> Self {
    self.push = Some(push);
    self
  }

  pub fn ledger(mut self, ledger: SharedLedger) -> Self {
    self.ledger = Some(ledger);
    self
  }

  pub fn backend(mut self, backend: SharedBackend) -> Self {
    self.backend = Some(backend);
    self
  }

  pub fn compositor(mut self, compositor: SharedCompositor) -> Self {
    self.compositor = Some(compositor);
    self
  }

  /// Principal whose jobs are listed and created.
  pub fn owner(mut self, owner: impl Into<OwnerId>) -> Self {
    self.owner = Some(owner.into());
    self
  }

  /// Wall-clock source for ages and timeouts. Defaults to [`SystemClock`].
  pub fn clock(mut self, clock: SharedClock) -> Self {
    self.clock = Some(clock);
    self
  }

  pub fn poll_base_interval(mut self, interval: Duration) -> Self {
    self.config.poll_base_interval = interval;
    self
  }

  pub fn poll_max_interval(mut self, interval: Duration) -> Self {
    self.config.poll_max_interval = interval;
    self
  }

  pub fn poll_backoff_step(mut self, step: Duration) -> Self {
    self.config.poll_backoff_step = step;
    self
  }

  pub fn timeout_scan_interval(mut self, interval: Duration) -> Self {
    self.config.timeout_scan_interval = interval;
    self
  }

  /// Staleness thresholds for video jobs and for everything else.
  pub fn timeouts(mut self, video: Duration, default: Duration) -> Self {
    self.config.video_timeout = video;
    self.config.default_timeout = default;
    self
  }

  pub fn hydrate_batch_size(mut self, size: usize) -> Self {
    self.config.hydrate_batch_size = size;
    self
  }

  /// Retry ceiling and base delay for timed-out metadata queries.
  pub fn load_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
    self.config.load_max_retries = max_retries;
    self.config.load_retry_base = base_delay;
    self
  }

  pub fn recent_job_window(mut self, window: Duration) -> Self {
    self.config.recent_job_window = window;
    self
  }

  /// Sets the size of the internal buffer for API commands.
  pub fn command_buffer_size(mut self, size: usize) -> Self {
    self.config.command_buffer_size = size;
    self
  }

  /// Sets how many events a slow subscriber may lag behind before it starts
  /// missing them.
  pub fn event_buffer_size(mut self, size: usize) -> Self {
    self.config.event_buffer_size = size;
    self
  }

  fn validate(config: &EngineConfig) -> Result<(), BuildError> {
    if config.poll_base_interval.is_zero() {
      return Err(BuildError::InvalidConfig("poll_base_interval must be non-zero"));
    }
    if config.poll_max_interval < config.poll_base_interval {
      return Err(BuildError::InvalidConfig(
        "poll_max_interval must not be below poll_base_interval",
      ));
    }
    if config.poll_backoff_step.is_zero() {
      return Err(BuildError::InvalidConfig("poll_backoff_step must be non-zero"));
    }
    if config.timeout_scan_interval.is_zero() {
      return Err(BuildError::InvalidConfig("timeout_scan_interval must be non-zero"));
    }
    if config.hydrate_batch_size == 0 {
      return Err(BuildError::InvalidConfig("hydrate_batch_size must be non-zero"));
    }
    if config.command_buffer_size == 0 || config.event_buffer_size == 0 {
      return Err(BuildError::InvalidConfig("buffer sizes must be non-zero"));
    }
    Ok(())
  }

  /// Builds the engine and spawns the coordinator and write-through tasks.
  ///
  /// Must be called from within a Tokio runtime.
  ///
  /// # Errors
  ///
  /// Returns a [`BuildError`] naming the first missing collaborator or the
  /// first invalid setting.
  pub fn build(self) -> Result<JobEngine, BuildError> {
    let store = self.store.ok_or(BuildError::MissingStore)?;
    let push_channel = self.push.ok_or(BuildError::MissingPushChannel)?;
    let ledger = self.ledger.ok_or(BuildError::MissingLedger)?;
    let backend = self.backend.ok_or(BuildError::MissingBackend)?;
    let compositor = self.compositor.ok_or(BuildError::MissingCompositor)?;
    let owner = self
      .owner
      .filter(|owner| !owner.is_empty())
      .ok_or(BuildError::MissingOwner)?;
    let config = self.config;
    Self::validate(&config)?;
    let clock: SharedClock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

    // --- Initialize Shared State & Channels ---
    let metrics = EngineMetrics::new();
    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(config.command_buffer_size);
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events, _) = broadcast::channel::<JobEvent>(config.event_buffer_size);

    let (writer, writer_handle) = WriteThrough::spawn(store.clone(), metrics.clone());
    let push = PushListener::new(push_channel.clone(), inbox_tx.clone(), metrics.clone());
    let dispatcher = CompletionDispatcher::new(compositor, inbox_tx.clone(), metrics.clone());

    let pipeline = SubmissionPipeline::new(
      store.clone(),
      ledger,
      backend,
      owner.clone(),
      clock.clone(),
      metrics.clone(),
    );
    let loader = BulkLoader::new(
      store.clone(),
      owner,
      config.hydrate_batch_size,
      config.load_max_retries,
      config.load_retry_base,
    );

    // --- Spawn Coordinator ---
    let coordinator_state = CoordinatorState {
      cmd_rx,
      inbox_rx,
      shutdown_rx,
      inbox_tx,
      events: events.clone(),
      store: store.clone(),
      writer,
      push,
      dispatcher,
      clock,
      metrics: metrics.clone(),
      config,
    };
    let coordinator_handle = Handle::current().spawn(async move {
      let mut coordinator = Coordinator::new(coordinator_state);
      coordinator.run().await;
      info!("Coordinator task finished.");
    });

    Ok(JobEngine {
      metrics,
      cmd_tx,
      shutdown_tx,
      events,
      pipeline,
      loader,
      store,
      push_channel,
      coordinator_handle: Arc::new(Mutex::new(Some(coordinator_handle))),
      writer_handle: Arc::new(Mutex::new(Some(writer_handle))),
    })
  }
}

/// Handle to a running sync engine.
///
/// Keeps a local view of the owner's generation jobs consistent with the job
/// store, fed by push notifications and adaptive polling, and exposes
/// submission, paged loading and deletion.
///
/// Use [`JobEngine::builder()`] to create an instance. Cloning yields another
/// handle to the same engine.
#[derive(Clone)]
pub struct JobEngine {
  metrics: EngineMetrics,
  cmd_tx: mpsc::Sender<EngineCommand>,
  shutdown_tx: watch::Sender<bool>,
  events: broadcast::Sender<JobEvent>,
  pipeline: SubmissionPipeline,
  loader: BulkLoader,
  store: SharedJobStore,
  push_channel: SharedPushChannel,
  coordinator_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
  writer_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for JobEngine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobEngine")
      .field("metrics", &self.metrics)
      .field("shut_down", &self.cmd_tx.is_closed())
      .finish_non_exhaustive()
  }
}

impl JobEngine {
  /// Returns a builder to configure and create a `JobEngine` instance.
  pub fn builder() -> EngineBuilder {
    EngineBuilder::new()
  }

  /// Sends a command built by `make` and waits for the coordinator's answer.
  async fn request<T>(
    &self,
    make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
  ) -> Result<T, QueryError> {
    let (tx, rx) = oneshot::channel();
    self
      .cmd_tx
      .send(make(tx))
      .await
      .map_err(|_| QueryError::EngineShutdown)?;
    rx.await.map_err(|_| QueryError::ResponseFailed)
  }

  /// Prices, debits, persists and starts a new job, then starts tracking it.
  ///
  /// The job is push-subscribed right away when the push channel is
  /// connected, and picked up by the next poll tick either way.
  ///
  /// # Errors
  ///
  /// - [`SubmitError::Validation`] / [`SubmitError::Rejected`]: refused before
  ///   any record was written.
  /// - [`SubmitError::Store`] / [`SubmitError::Backend`]: failed after the
  ///   debit; the debit was refunded.
  /// - [`SubmitError::EngineShutdown`]: the engine is no longer running.
  pub async fn submit(&self, options: SubmitOptions) -> Result<JobId, SubmitError> {
    if self.cmd_tx.is_closed() {
      return Err(SubmitError::EngineShutdown);
    }
    let job = self.pipeline.submit(&options).await?;
    let job_id = job.id;
    self
      .request(|responder| EngineCommand::Track { job, responder })
      .await
      .map_err(|_| SubmitError::EngineShutdown)?;
    Ok(job_id)
  }

  /// The locally held state of a job.
  pub async fn get_job(&self, job_id: JobId) -> Result<Job, QueryError> {
    self
      .request(|responder| EngineCommand::GetJob { job_id, responder })
      .await?
  }

  /// Every locally held job, newest first.
  pub async fn list_jobs(&self) -> Result<Vec<Job>, QueryError> {
    self
      .request(|responder| EngineCommand::ListJobs { responder })
      .await
  }

  /// Loads a page of history and merges it into the local view.
  ///
  /// Jobs already tracked are reconciled against the loaded rows rather than
  /// replaced, so a page never rolls back a job the push channel advanced.
  pub async fn load_page(&self, offset: usize, limit: usize) -> Result<Page, LoadError> {
    let page = self.loader.load_page(offset, limit).await?;
    self.integrate(page, false).await
  }

  /// Replaces the local view with the first `limit` jobs from the store.
  ///
  /// Local jobs younger than the recent-job window that the store does not
  /// return yet are kept and listed first.
  pub async fn reload(&self, limit: usize) -> Result<Page, LoadError> {
    let page = self.loader.load_page(0, limit).await?;
    self.integrate(page, true).await
  }

  async fn integrate(&self, page: Page, reset: bool) -> Result<Page, LoadError> {
    let Page { jobs, total } = page;
    let jobs = self
      .request(|responder| EngineCommand::IntegratePage {
        rows: jobs,
        reset,
        responder,
      })
      .await
      .map_err(|_| LoadError::EngineShutdown)?;
    Ok(Page { jobs, total })
  }

  /// Deletes a job from the store and stops tracking it.
  pub async fn delete_job(&self, job_id: JobId) -> Result<(), QueryError> {
    self.store.delete(job_id).await.map_err(QueryError::Store)?;
    self
      .request(|responder| EngineCommand::Remove {
        job_ids: vec![job_id],
        responder,
      })
      .await
  }

  /// Deletes several jobs in one store call and stops tracking them.
  pub async fn clear_jobs(&self, job_ids: Vec<JobId>) -> Result<(), QueryError> {
    if job_ids.is_empty() {
      return Ok(());
    }
    self
      .store
      .delete_many(&job_ids)
      .await
      .map_err(QueryError::Store)?;
    self
      .request(|responder| EngineCommand::Remove { job_ids, responder })
      .await
  }

  /// Stream of index changes and alerts.
  pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
    self.events.subscribe()
  }

  /// Retrieves a snapshot of the engine's metrics.
  pub async fn metrics_snapshot(&self) -> Result<MetricsSnapshot, QueryError> {
    self
      .request(|responder| EngineCommand::GetMetricsSnapshot { responder })
      .await
  }

  /// Connects the push channel and subscribes every active job that is not
  /// subscribed yet. Returns how many jobs were subscribed.
  pub async fn connect_push(&self) -> Result<usize, PushError> {
    self.push_channel.connect().await?;
    match self
      .request(|responder| EngineCommand::Resubscribe { responder })
      .await
    {
      Ok(count) => Ok(count),
      Err(e) => {
        warn!(error = %e, "Push connected but engine is not running.");
        Ok(0)
      }
    }
  }

  /// Jobs keep syncing through polling while disconnected.
  pub async fn disconnect_push(&self) {
    self.push_channel.disconnect().await;
  }

  /// Stops the engine: both timers stop, push subscriptions are released and
  /// pending store writes are flushed.
  ///
  /// Waits for all tasks to finish or until the optional timeout elapses.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::SignalFailed`]: Failed to send the shutdown signal.
  /// - [`ShutdownError::Timeout`]: Waiting for tasks exceeded the timeout.
  /// - [`ShutdownError::TaskPanic`]: An engine task panicked.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating engine shutdown...");
    self
      .shutdown_tx
      .send(true)
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(timeout).await
  }

  /// Helper to wait for task handles during shutdown.
  async fn await_shutdown(&self, timeout_duration: Option<Duration>) -> Result<(), ShutdownError> {
    let coordinator = self.coordinator_handle.lock().await.take();
    let writer = self.writer_handle.lock().await.take();

    let tasks: Vec<_> = [("coordinator", coordinator), ("writer", writer)]
      .into_iter()
      .filter_map(|(name, handle)| handle.map(|h| (name, h)))
      .map(|(name, handle)| async move {
        handle.await.map_err(|e| {
          error!(task = name, "Engine task panicked: {:?}", e);
          ShutdownError::TaskPanic
        })
      })
      .collect();

    if tasks.is_empty() {
      warn!("No tasks found to await during shutdown (already shut down?).");
      return Ok(());
    }

    let join_all_fut = try_join_all(tasks);
    let result = match timeout_duration {
      Some(timeout) => match tokio::time::timeout(timeout, join_all_fut).await {
        Ok(joined) => joined.map(|_| ()),
        Err(_) => {
          error!("Shutdown timed out after {:?}", timeout);
          Err(ShutdownError::Timeout)
        }
      },
      None => join_all_fut.await.map(|_| ()),
    };

    if result.is_ok() {
      info!("All engine tasks joined successfully.");
    }
    result
  }
}
