use crate::clock::SharedClock;
use crate::command::{EngineCommand, Inbound};
use crate::config::EngineConfig;
use crate::dispatcher::CompletionDispatcher;
use crate::error::QueryError;
use crate::job::{AlertLevel, Job, JobEvent, JobId, JobPatch};
use crate::loader;
use crate::metrics::EngineMetrics;
use crate::poll::PollScheduler;
use crate::push::PushListener;
use crate::reconciler::{self, CompositionEvent, DiscardReason, Reconciliation, Terminal};
use crate::sentinel::TimeoutSentinel;
use crate::store::{SharedJobStore, WriteThrough};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, trace, warn, Instrument};

/// Where a patch came from. Drives write-through and alert levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchSource {
  Push,
  Poll,
  Timeout,
  Composition,
  /// Rows from a bulk load are already the store's state.
  Reload,
}

/// Channels and collaborators handed to the Coordinator task.
pub(crate) struct CoordinatorState {
  // Receivers
  pub cmd_rx: mpsc::Receiver<EngineCommand>,
  pub inbox_rx: mpsc::UnboundedReceiver<Inbound>,
  pub shutdown_rx: watch::Receiver<bool>,
  // Senders
  pub inbox_tx: mpsc::UnboundedSender<Inbound>,
  pub events: broadcast::Sender<JobEvent>,
  // Collaborators
  pub store: SharedJobStore,
  pub writer: WriteThrough,
  pub push: PushListener,
  pub dispatcher: CompletionDispatcher,
  pub clock: SharedClock,
  pub metrics: EngineMetrics,
  pub config: EngineConfig,
}

/// The single owner of the local job index.
///
/// Poll ticks, timeout scans, push messages, fetch results, composition
/// events and API commands are all serialized through [`Coordinator::run`].
/// Store reads and compositions run in spawned tasks that report back through
/// the inbox.
pub(crate) struct Coordinator {
  state: CoordinatorState,
  index: HashMap<JobId, Job>,
  poll: PollScheduler,
  sentinel: TimeoutSentinel,
  fetches_in_flight: HashSet<JobId>,
}

impl Coordinator {
  pub fn new(state: CoordinatorState) -> Self {
    let poll = PollScheduler::new(&state.config, state.clock.clone());
    let sentinel = TimeoutSentinel::new(&state.config);
    Self {
      state,
      index: HashMap::new(),
      poll,
      sentinel,
      fetches_in_flight: HashSet::new(),
    }
  }

  /// Runs the main event loop until shutdown is signalled or every engine
  /// handle is dropped.
  pub async fn run(&mut self) {
    info!("Coordinator started.");
    self.poll.start();
    self.sentinel.start();

    loop {
      self.update_gauge_metrics();

      tokio::select! {
        biased; // Shutdown wins over pending work

        Ok(()) = self.state.shutdown_rx.changed() => {
          if *self.state.shutdown_rx.borrow() {
            info!("Coordinator received shutdown signal.");
            break;
          }
        },

        maybe_cmd = self.state.cmd_rx.recv() => {
          match maybe_cmd {
            Some(cmd) => self.handle_command(cmd),
            None => {
              warn!("Command channel closed (all engine handles dropped). Coordinator exiting.");
              break;
            }
          }
        },

        Some(msg) = self.state.inbox_rx.recv() => {
          self.handle_inbound(msg);
        },

        _ = self.poll.tick() => {
          self.on_poll_tick();
        },

        _ = self.sentinel.tick() => {
          self.on_timeout_scan();
        },
      }
    }

    self.teardown();
    info!("Coordinator task shutting down.");
  }

  fn update_gauge_metrics(&self) {
    let metrics = &self.state.metrics;
    metrics
      .jobs_tracked_current
      .store(self.index.len(), AtomicOrdering::Relaxed);
    metrics.jobs_active_current.store(
      self.index.values().filter(|job| job.is_active()).count(),
      AtomicOrdering::Relaxed,
    );
    metrics.poll_interval_ms_current.store(
      usize::try_from(self.poll.interval().as_millis()).unwrap_or(usize::MAX),
      AtomicOrdering::Relaxed,
    );
  }

  fn teardown(&mut self) {
    self.poll.stop();
    self.sentinel.stop();
    let subscribed = self.state.push.subscribed_count();
    self.state.push.unsubscribe_all();
    self.fetches_in_flight.clear();
    debug!(
      tracked = self.index.len(),
      released = subscribed,
      "Timers stopped and push subscriptions released."
    );
  }

  // --- Commands ---

  fn handle_command(&mut self, cmd: EngineCommand) {
    match cmd {
      EngineCommand::Track { job, responder } => {
        let job_id = job.id;
        if self.index.contains_key(&job_id) {
          warn!(%job_id, "Job already tracked; ignoring duplicate track request.");
        } else {
          self.index.insert(job_id, job.clone());
          self.publish(JobEvent::Changed(job));
          self.state.push.subscribe(job_id);
          debug!(%job_id, "Tracking new job.");
        }
        let _ = responder.send(());
      }
      EngineCommand::GetJob { job_id, responder } => {
        let result = self
          .index
          .get(&job_id)
          .cloned()
          .ok_or(QueryError::JobNotFound(job_id));
        let _ = responder.send(result);
      }
      EngineCommand::ListJobs { responder } => {
        let mut jobs: Vec<Job> = self.index.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let _ = responder.send(jobs);
      }
      EngineCommand::IntegratePage {
        rows,
        reset,
        responder,
      } => {
        let jobs = self.integrate_page(rows, reset);
        let _ = responder.send(jobs);
      }
      EngineCommand::Remove { job_ids, responder } => {
        for job_id in &job_ids {
          self.drop_job(job_id);
        }
        let _ = responder.send(());
      }
      EngineCommand::Resubscribe { responder } => {
        let count = self.resubscribe_active();
        let _ = responder.send(count);
      }
      EngineCommand::GetMetricsSnapshot { responder } => {
        let _ = responder.send(self.state.metrics.snapshot());
      }
    }
  }

  /// Merges a loaded page into the index and returns the page as the caller
  /// should display it.
  ///
  /// With `reset`, local jobs missing from the page are dropped unless they
  /// are younger than the recent-job window; those survive and come first.
  fn integrate_page(&mut self, rows: Vec<Job>, reset: bool) -> Vec<Job> {
    let now = self.state.clock.now();
    let mut result = Vec::with_capacity(rows.len());

    if reset {
      let fetched: HashSet<JobId> = rows.iter().map(|job| job.id).collect();
      let preserved = loader::recent_local_jobs(
        self.index.values(),
        &fetched,
        now,
        self.state.config.recent_job_window,
      );
      let keep: HashSet<JobId> = preserved.iter().map(|job| job.id).collect();
      let dropped: Vec<JobId> = self
        .index
        .keys()
        .filter(|id| !fetched.contains(id) && !keep.contains(id))
        .copied()
        .collect();
      for job_id in &dropped {
        self.drop_job(job_id);
      }
      debug!(
        fetched = fetched.len(),
        preserved = preserved.len(),
        dropped = dropped.len(),
        "Reloading job index."
      );
      result.extend(preserved);
    }

    for row in rows {
      let job_id = row.id;
      if self.index.contains_key(&job_id) {
        self.reconcile(job_id, &JobPatch::from_metadata(&row), PatchSource::Reload);
      } else {
        self.index.insert(job_id, row.clone());
        self.publish(JobEvent::Changed(row.clone()));
      }
      match self.index.get(&job_id) {
        Some(job) => {
          if job.is_active() {
            self.state.push.subscribe(job_id);
          }
          result.push(job.clone());
        }
        // Only reachable if a terminal transition above dropped the job.
        None => result.push(row),
      }
    }
    result
  }

  fn drop_job(&mut self, job_id: &JobId) {
    if self.index.remove(job_id).is_some() {
      self.state.push.unsubscribe(job_id);
      self.poll.forget(job_id);
      self.state.dispatcher.forget(job_id);
      self.publish(JobEvent::Removed(*job_id));
      debug!(%job_id, "Job removed from index.");
    }
  }

  fn resubscribe_active(&mut self) -> usize {
    if !self.state.push.is_connected() {
      return 0;
    }
    let missing: Vec<JobId> = self
      .index
      .values()
      .filter(|job| job.is_active() && !self.state.push.is_subscribed(&job.id))
      .map(|job| job.id)
      .collect();
    let mut subscribed = 0;
    for job_id in missing {
      if self.state.push.subscribe(job_id) {
        subscribed += 1;
      }
    }
    if subscribed > 0 {
      debug!(subscribed, "Re-armed push subscriptions for active jobs.");
    }
    subscribed
  }

  // --- Inbound ---

  fn handle_inbound(&mut self, msg: Inbound) {
    match msg {
      Inbound::Push { job_id, patch } => {
        trace!(%job_id, "Push update received.");
        self.reconcile(job_id, &patch, PatchSource::Push);
      }
      Inbound::Fetched { job_id, result } => {
        self.fetches_in_flight.remove(&job_id);
        match result {
          Ok(Some(remote)) => {
            self.reconcile(job_id, &JobPatch::from_job(&remote), PatchSource::Poll);
          }
          Ok(None) => {
            debug!(%job_id, "Polled job has no remote record; ignoring.");
          }
          Err(e) => {
            self
              .state
              .metrics
              .poll_fetch_failures
              .fetch_add(1, AtomicOrdering::Relaxed);
            warn!(%job_id, error = %e, "Poll fetch failed; retrying next tick.");
          }
        }
      }
      Inbound::Composition { job_id, event } => self.handle_composition(job_id, event),
    }
  }

  fn handle_composition(&mut self, job_id: JobId, event: CompositionEvent) {
    let finished = match &event {
      CompositionEvent::Progress { .. } => None,
      CompositionEvent::Finished { .. } => Some(false),
      CompositionEvent::Failed { .. } => Some(true),
    };
    if let Some(failed) = finished {
      self.state.dispatcher.finish(&job_id, failed);
    }

    let Some(current) = self.index.get(&job_id) else {
      debug!(%job_id, "Composition event for untracked job; discarding.");
      return;
    };

    match reconciler::apply_composition(current, &event) {
      Reconciliation::Applied { job, .. } => {
        self.commit(job, PatchSource::Composition);
        if let CompositionEvent::Failed { message } = event {
          self.alert(job_id, AlertLevel::Warning, message);
        } else if finished.is_some() {
          info!(%job_id, "Composite output appended.");
        }
      }
      Reconciliation::Unchanged => {}
      Reconciliation::Discarded(_) => {
        debug!(%job_id, "Composition event for a job that is no longer completed; discarding.");
      }
    }
  }

  // --- Timers ---

  fn on_poll_tick(&mut self) {
    self.state.metrics.poll_ticks.fetch_add(1, AtomicOrdering::Relaxed);
    let active: Vec<JobId> = self
      .index
      .values()
      .filter(|job| job.is_active())
      .map(|job| job.id)
      .collect();
    let plan = self.poll.plan(&active);
    if plan.jobs.is_empty() {
      return;
    }

    // Picks up late connects and dropped subscriptions.
    self.resubscribe_active();

    for job_id in plan.jobs {
      if !self.fetches_in_flight.insert(job_id) {
        trace!(%job_id, "Previous fetch still in flight; skipping.");
        continue;
      }
      self.spawn_fetch(job_id);
    }
  }

  fn spawn_fetch(&self, job_id: JobId) {
    let store = self.state.store.clone();
    let inbox = self.state.inbox_tx.clone();
    let metrics = self.state.metrics.clone();
    let span = tracing::debug_span!("poll_fetch", %job_id);
    tokio::spawn(
      async move {
        let started = Instant::now();
        let result = store.get(job_id).await;
        metrics.poll_fetch_duration.record(started.elapsed());
        let _ = inbox.send(Inbound::Fetched { job_id, result });
      }
      .instrument(span),
    );
  }

  fn on_timeout_scan(&mut self) {
    let now = self.state.clock.now();
    let stale = self.sentinel.scan(self.index.values(), now);
    if stale.is_empty() {
      return;
    }
    debug!(count = stale.len(), "Timeout scan found stale jobs.");
    for (job_id, patch) in stale {
      self.reconcile(job_id, &patch, PatchSource::Timeout);
    }
  }

  // --- Reconciliation ---

  /// Runs `patch` through the reconciler and commits the outcome.
  fn reconcile(&mut self, job_id: JobId, patch: &JobPatch, source: PatchSource) {
    let Some(current) = self.index.get(&job_id) else {
      trace!(%job_id, ?source, "Update for untracked job; discarding.");
      return;
    };
    let metrics = &self.state.metrics;

    match reconciler::apply(current, patch, self.state.clock.now()) {
      Reconciliation::Discarded(DiscardReason::Terminal) => {
        metrics
          .patches_discarded_terminal
          .fetch_add(1, AtomicOrdering::Relaxed);
        trace!(%job_id, ?source, "Job already terminal; update discarded.");
      }
      Reconciliation::Discarded(DiscardReason::Stale) => {
        metrics
          .patches_discarded_stale
          .fetch_add(1, AtomicOrdering::Relaxed);
        debug!(%job_id, ?source, current = %current.status, incoming = ?patch.status, "Out-of-order update discarded.");
      }
      Reconciliation::Unchanged => {
        metrics.patches_unchanged.fetch_add(1, AtomicOrdering::Relaxed);
      }
      Reconciliation::Applied { job, transition } => {
        metrics.patches_applied.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(%job_id, ?source, status = %job.status, percent = job.progress.percent, "Update applied.");
        self.commit(job, source);
        if let Some(terminal) = transition {
          self.on_terminal(job_id, terminal, source);
        }
      }
    }
  }

  fn commit(&mut self, job: Job, source: PatchSource) {
    if source != PatchSource::Reload {
      self.state.writer.write(&job);
    }
    self.index.insert(job.id, job.clone());
    self.publish(JobEvent::Changed(job));
  }

  fn on_terminal(&mut self, job_id: JobId, terminal: Terminal, source: PatchSource) {
    self.state.push.unsubscribe(&job_id);
    self.poll.forget(&job_id);
    let Some(job) = self.index.get(&job_id).cloned() else {
      return;
    };

    match terminal {
      Terminal::Completed => {
        self
          .state
          .metrics
          .jobs_completed
          .fetch_add(1, AtomicOrdering::Relaxed);
        info!(%job_id, outputs = job.outputs.len(), "Job completed.");
        self.state.dispatcher.evaluate(&job);
      }
      Terminal::Failed => {
        self.state.metrics.jobs_failed.fetch_add(1, AtomicOrdering::Relaxed);
        let message = job.error.clone().unwrap_or_else(|| "Job failed".to_string());
        if source == PatchSource::Timeout {
          self
            .state
            .metrics
            .jobs_timed_out
            .fetch_add(1, AtomicOrdering::Relaxed);
          info!(%job_id, job_type = %job.job_type, "Job timed out.");
          self.alert(job_id, AlertLevel::Quiet, message);
        } else {
          error!(%job_id, ?source, error = %message, "Job failed.");
          self.alert(job_id, AlertLevel::Urgent, message);
        }
      }
    }
  }

  fn alert(&self, job_id: JobId, level: AlertLevel, message: String) {
    self.publish(JobEvent::Alert {
      job_id,
      level,
      message,
    });
  }

  /// No receivers is fine; the event is simply dropped.
  fn publish(&self, event: JobEvent) {
    let _ = self.state.events.send(event);
  }
}
