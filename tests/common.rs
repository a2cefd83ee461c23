//! tests/common.rs
//! Shared fakes and helpers for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobkeeper::{
  BackendError, ComposeError, Compositor, EngineBuilder, GenerationBackend, Job, JobEngine,
  JobId, JobPatch, JobStatus, JobStore, JobType, Ledger, LedgerError, ListPage, ManualClock,
  Progress, ProgressReporter, PushChannel, PushError, QueryError, Receipt, RejectReason,
  StoreError,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::fmt::TestWriter;
use uuid::Uuid;

pub const OWNER: &str = "user-1";
pub const COMPOSITE_REF: &str = "https://cdn.example/composite.png";

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// --- Job Store ---

/// In-memory job store with failure injection and call counters.
#[derive(Default)]
pub struct MemoryStore {
  jobs: Mutex<HashMap<JobId, Job>>,
  /// Ids left out of listings, as if replication had not caught up yet.
  hidden: Mutex<HashSet<JobId>>,
  pub list_timeouts: AtomicUsize,
  pub fail_list: AtomicBool,
  pub fail_insert: AtomicBool,
  pub fail_get: AtomicBool,
  pub fail_outputs: AtomicBool,
  pub fail_update: AtomicBool,
  /// Added latency for `get`, in milliseconds.
  pub get_delay_ms: AtomicU64,
  pub list_calls: AtomicUsize,
  pub get_calls: AtomicUsize,
  pub output_calls: AtomicUsize,
  pub updates: Mutex<Vec<(JobId, JobPatch)>>,
  pub deleted: Mutex<Vec<JobId>>,
}

impl MemoryStore {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn put(&self, job: Job) {
    self.jobs.lock().insert(job.id, job);
  }

  pub fn record(&self, id: JobId) -> Option<Job> {
    self.jobs.lock().get(&id).cloned()
  }

  pub fn len(&self) -> usize {
    self.jobs.lock().len()
  }

  /// Changes the remote record directly, bypassing the engine.
  pub fn modify(&self, id: JobId, f: impl FnOnce(&mut Job)) {
    if let Some(job) = self.jobs.lock().get_mut(&id) {
      f(job);
    }
  }

  pub fn hide(&self, id: JobId) {
    self.hidden.lock().insert(id);
  }

  /// Deletes the remote record behind the engine's back.
  pub fn purge(&self, id: JobId) {
    self.jobs.lock().remove(&id);
  }
}

#[async_trait]
impl JobStore for MemoryStore {
  async fn insert(&self, job: &Job) -> Result<(), StoreError> {
    if self.fail_insert.load(Ordering::SeqCst) {
      return Err(StoreError::Other("insert refused".into()));
    }
    self.put(job.clone());
    Ok(())
  }

  async fn update(&self, id: JobId, patch: &JobPatch) -> Result<(), StoreError> {
    self.updates.lock().push((id, patch.clone()));
    if self.fail_update.load(Ordering::SeqCst) {
      return Err(StoreError::Other("write conflict".into()));
    }
    let mut jobs = self.jobs.lock();
    let job = jobs
      .get_mut(&id)
      .ok_or_else(|| StoreError::Other(format!("no record for {id}")))?;
    if let Some(status) = patch.status {
      job.status = status;
    }
    if let Some(progress) = &patch.progress {
      job.progress = progress.clone();
    }
    if let Some(outputs) = &patch.outputs {
      job.outputs = outputs.clone();
    }
    if let Some(manifest) = &patch.manifest {
      job.manifest = manifest.clone();
    }
    job.error = patch.error.clone().or(job.error.take());
    job.warning = patch.warning.clone().or(job.warning.take());
    job.started_at = patch.started_at.or(job.started_at);
    job.completed_at = patch.completed_at.or(job.completed_at);
    Ok(())
  }

  async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
    self.get_calls.fetch_add(1, Ordering::SeqCst);
    let delay = self.get_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
      tokio::time::sleep(StdDuration::from_millis(delay)).await;
    }
    if self.fail_get.load(Ordering::SeqCst) {
      return Err(StoreError::Other("connection reset".into()));
    }
    Ok(self.record(id))
  }

  async fn list_by_owner(
    &self,
    owner: &str,
    offset: usize,
    limit: usize,
  ) -> Result<ListPage, StoreError> {
    self.list_calls.fetch_add(1, Ordering::SeqCst);
    if self
      .list_timeouts
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
    {
      return Err(StoreError::Timeout("statement timeout".into()));
    }
    if self.fail_list.load(Ordering::SeqCst) {
      return Err(StoreError::Other("permission denied".into()));
    }

    let hidden = self.hidden.lock().clone();
    let mut rows: Vec<Job> = self
      .jobs
      .lock()
      .values()
      .filter(|job| job.user_id == owner && !hidden.contains(&job.id))
      .cloned()
      .collect();
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let total = rows.len() as u64;
    let rows = rows
      .into_iter()
      .skip(offset)
      .take(limit)
      .map(|mut job| {
        job.outputs.clear();
        job
      })
      .collect();
    Ok(ListPage { rows, total })
  }

  async fn fetch_outputs(&self, ids: &[JobId]) -> Result<Vec<(JobId, Vec<String>)>, StoreError> {
    self.output_calls.fetch_add(1, Ordering::SeqCst);
    if self.fail_outputs.load(Ordering::SeqCst) {
      return Err(StoreError::Other("payload too large".into()));
    }
    let jobs = self.jobs.lock();
    Ok(
      ids
        .iter()
        .filter_map(|id| jobs.get(id).map(|job| (*id, job.outputs.clone())))
        .collect(),
    )
  }

  async fn delete(&self, id: JobId) -> Result<(), StoreError> {
    self.jobs.lock().remove(&id);
    self.deleted.lock().push(id);
    Ok(())
  }

  async fn delete_many(&self, ids: &[JobId]) -> Result<(), StoreError> {
    let mut jobs = self.jobs.lock();
    for id in ids {
      jobs.remove(id);
    }
    self.deleted.lock().extend_from_slice(ids);
    Ok(())
  }
}

// --- Push Channel ---

/// Push channel whose messages are sent by the test.
#[derive(Default)]
pub struct ScriptedPush {
  connected: AtomicBool,
  senders: Mutex<HashMap<JobId, mpsc::UnboundedSender<JobPatch>>>,
}

impl ScriptedPush {
  pub fn connected() -> Arc<Self> {
    let push = Self::default();
    push.connected.store(true, Ordering::SeqCst);
    Arc::new(push)
  }

  pub fn disconnected() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Marks the channel connected without going through the engine, as a
  /// transport reconnecting on its own would.
  pub fn connect_silently(&self) {
    self.connected.store(true, Ordering::SeqCst);
  }

  pub fn is_subscribed(&self, job_id: JobId) -> bool {
    self.senders.lock().contains_key(&job_id)
  }

  pub fn subscriptions(&self) -> usize {
    self.senders.lock().len()
  }

  /// Delivers `patch` if the job is subscribed. Returns whether it was sent.
  pub fn send(&self, job_id: JobId, patch: JobPatch) -> bool {
    self
      .senders
      .lock()
      .get(&job_id)
      .map(|tx| tx.send(patch).is_ok())
      .unwrap_or(false)
  }
}

#[async_trait]
impl PushChannel for ScriptedPush {
  async fn connect(&self) -> Result<(), PushError> {
    self.connected.store(true, Ordering::SeqCst);
    Ok(())
  }

  async fn disconnect(&self) {
    self.connected.store(false, Ordering::SeqCst);
    self.senders.lock().clear();
  }

  fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }

  fn subscribe(&self, job_id: JobId) -> Result<mpsc::UnboundedReceiver<JobPatch>, PushError> {
    if !self.is_connected() {
      return Err(PushError::NotConnected);
    }
    let (tx, rx) = mpsc::unbounded_channel();
    self.senders.lock().insert(job_id, tx);
    Ok(rx)
  }

  fn unsubscribe(&self, job_id: JobId) {
    self.senders.lock().remove(&job_id);
  }
}

// --- Ledger ---

#[derive(Default)]
pub struct FakeLedger {
  pub reject: Mutex<Option<RejectReason>>,
  pub debits: Mutex<Vec<(JobId, String, u64)>>,
  pub refunds: Mutex<Vec<Receipt>>,
}

#[async_trait]
impl Ledger for FakeLedger {
  async fn debit(&self, job_id: JobId, action: &str, amount: u64) -> Result<Receipt, LedgerError> {
    if let Some(reason) = *self.reject.lock() {
      return Err(LedgerError::Rejected(reason));
    }
    self.debits.lock().push((job_id, action.to_string(), amount));
    Ok(Receipt {
      job_id,
      transaction_id: format!("tx-{}", job_id.simple()),
      amount,
    })
  }

  async fn refund(&self, receipt: &Receipt) -> Result<(), LedgerError> {
    self.refunds.lock().push(receipt.clone());
    Ok(())
  }
}

// --- Backend ---

#[derive(Default)]
pub struct FakeBackend {
  pub fail: AtomicBool,
  pub started: Mutex<Vec<JobId>>,
}

#[async_trait]
impl GenerationBackend for FakeBackend {
  async fn start(&self, job: &Job, _options: &jobkeeper::SubmitOptions) -> Result<(), BackendError> {
    if self.fail.load(Ordering::SeqCst) {
      return Err(BackendError("model unavailable".into()));
    }
    self.started.lock().push(job.id);
    Ok(())
  }
}

// --- Compositor ---

#[derive(Default)]
pub struct FakeCompositor {
  pub calls: AtomicUsize,
  pub fail: AtomicBool,
  pub last_refs: Mutex<Vec<String>>,
}

#[async_trait]
impl Compositor for FakeCompositor {
  async fn compose(
    &self,
    refs: &[String],
    progress: ProgressReporter,
  ) -> Result<String, ComposeError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    *self.last_refs.lock() = refs.to_vec();
    progress.report(50, "Stitching");
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    if self.fail.load(Ordering::SeqCst) {
      return Err(ComposeError("codec mismatch".into()));
    }
    Ok(COMPOSITE_REF.to_string())
  }
}

// --- Harness ---

pub struct Harness {
  pub engine: JobEngine,
  pub store: Arc<MemoryStore>,
  pub push: Arc<ScriptedPush>,
  pub ledger: Arc<FakeLedger>,
  pub backend: Arc<FakeBackend>,
  pub compositor: Arc<FakeCompositor>,
  pub clock: ManualClock,
}

pub fn harness() -> Harness {
  harness_with(ScriptedPush::connected(), |b| b)
}

// Builds an engine wired to fresh fakes. `configure` may adjust the builder.
pub fn harness_with(
  push: Arc<ScriptedPush>,
  configure: impl FnOnce(EngineBuilder) -> EngineBuilder,
) -> Harness {
  let store = MemoryStore::new();
  let ledger = Arc::new(FakeLedger::default());
  let backend = Arc::new(FakeBackend::default());
  let compositor = Arc::new(FakeCompositor::default());
  let clock = ManualClock::default();

  let builder = JobEngine::builder()
    .store(store.clone())
    .push_channel(push.clone())
    .ledger(ledger.clone())
    .backend(backend.clone())
    .compositor(compositor.clone())
    .owner(OWNER)
    .clock(Arc::new(clock.clone()));
  let engine = configure(builder).build().expect("engine should build");

  Harness {
    engine,
    store,
    push,
    ledger,
    backend,
    compositor,
    clock,
  }
}

// Lets spawned tasks drain. Under paused time this only returns once the
// runtime is idle.
pub async fn settle() {
  tokio::time::sleep(StdDuration::from_millis(10)).await;
}

// Polls the engine until `pred` holds for the job or the attempts run out.
pub async fn wait_for_job(
  engine: &JobEngine,
  job_id: JobId,
  pred: impl Fn(&Job) -> bool,
) -> Result<Job, QueryError> {
  let mut last = engine.get_job(job_id).await?;
  for _ in 0..50 {
    if pred(&last) {
      break;
    }
    settle().await;
    last = engine.get_job(job_id).await?;
  }
  Ok(last)
}

// --- Builders ---

pub fn remote_job(job_type: JobType, status: JobStatus, created_at: DateTime<Utc>) -> Job {
  let mut job = Job::queued(
    Uuid::new_v4(),
    job_type,
    OWNER,
    json!({ "expected_count": 1 }),
    created_at,
  );
  job.status = status;
  job.progress = Progress::new(status.into(), if status.is_terminal() { 100 } else { 0 }, status.as_str());
  job
}

pub fn running(percent: u8) -> JobPatch {
  JobPatch::new()
    .status(JobStatus::Running)
    .progress(Progress::new(jobkeeper::ProgressStage::Running, percent, "Generating"))
}

pub fn completed_with(outputs: &[&str]) -> JobPatch {
  JobPatch::new()
    .status(JobStatus::Completed)
    .progress(Progress::new(jobkeeper::ProgressStage::Completed, 100, "Completed"))
    .outputs(outputs.iter().map(|s| s.to_string()).collect())
}
