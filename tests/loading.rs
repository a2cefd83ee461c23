//! tests/loading.rs
//! Paged loading, reload merging and metadata retry.

mod common;

use crate::common::{harness, remote_job, settle, setup_tracing, Harness};
use chrono::{Duration as ChronoDuration, Utc};
use jobkeeper::{
  Clock, Job, JobEvent, JobPatch, JobStatus, JobType, LoadError, Progress, ProgressStage,
  SubmitOptions,
};
use std::sync::atomic::Ordering;
use std::time::Duration as StdDuration;
use tokio::time::Instant;

fn seed_completed(h: &Harness, count: usize) -> Vec<Job> {
  let now = h.clock.now();
  (0..count)
    .map(|i| {
      let mut job = remote_job(
        JobType::Image,
        JobStatus::Completed,
        now - ChronoDuration::minutes(60 + i as i64),
      );
      job.outputs = vec![format!("https://cdn.example/{i}.png")];
      h.store.put(job.clone());
      job
    })
    .collect()
}

#[tokio::test(start_paused = true)]
async fn test_reload_preserves_recent_local_jobs() {
  setup_tracing();
  let h = harness();
  seed_completed(&h, 10);

  let fresh = h.engine.submit(SubmitOptions::new(JobType::Video, 1)).await.unwrap();
  // The listing has not caught up with the new record yet.
  h.store.hide(fresh);
  h.clock.advance(ChronoDuration::seconds(2));

  let page = h.engine.reload(20).await.unwrap();
  assert_eq!(page.jobs.len(), 11);
  assert_eq!(page.jobs[0].id, fresh, "recent local job comes first");
  assert_eq!(page.total, 10);
  assert_eq!(h.engine.list_jobs().await.unwrap().len(), 11);

  // Once it is older than the window and still missing, it is dropped.
  let mut events = h.engine.subscribe_events();
  h.clock.advance(ChronoDuration::seconds(10));
  let page = h.engine.reload(20).await.unwrap();
  assert_eq!(page.jobs.len(), 10);
  assert!(!page.jobs.iter().any(|j| j.id == fresh));
  assert!(!h.push.is_subscribed(fresh));

  let mut removed = false;
  while let Ok(event) = events.try_recv() {
    if event == JobEvent::Removed(fresh) {
      removed = true;
    }
  }
  assert!(removed);
}

#[tokio::test(start_paused = true)]
async fn test_reload_does_not_regress_pushed_job() {
  setup_tracing();
  let h = harness();
  let job_id = h.engine.submit(SubmitOptions::new(JobType::Video, 1)).await.unwrap();
  h.push.send(
    job_id,
    JobPatch::new()
      .status(JobStatus::Encoding)
      .progress(Progress::new(ProgressStage::Encoding, 70, "Encoding")),
  );
  settle().await;

  // Remote snapshot lags behind the push channel.
  h.store.modify(job_id, |job| {
    job.status = JobStatus::Running;
    job.progress = Progress::new(ProgressStage::Running, 20, "Generating");
  });

  let page = h.engine.reload(10).await.unwrap();
  assert_eq!(page.jobs.len(), 1);
  assert_eq!(page.jobs[0].status, JobStatus::Encoding);
  assert_eq!(page.jobs[0].progress.percent, 70);
  assert!(h.push.is_subscribed(job_id), "active job stays subscribed");
}

#[tokio::test(start_paused = true)]
async fn test_reload_keeps_outputs_of_active_jobs() {
  setup_tracing();
  let h = harness();
  let job_id = h.engine.submit(SubmitOptions::new(JobType::Image, 3)).await.unwrap();
  let parts = vec![
    "https://cdn.example/p0.png".to_string(),
    "https://cdn.example/p1.png".to_string(),
  ];
  h.push.send(
    job_id,
    JobPatch::new()
      .status(JobStatus::Upscaling)
      .outputs(parts.clone()),
  );
  settle().await;
  assert_eq!(h.store.record(job_id).unwrap().outputs, parts);

  // Listings carry no outputs for rows that are still running.
  let page = h.engine.reload(10).await.unwrap();
  assert_eq!(page.jobs[0].outputs, parts);
  assert_eq!(h.engine.get_job(job_id).await.unwrap().outputs, parts);

  let page = h.engine.load_page(0, 10).await.unwrap();
  assert_eq!(page.jobs[0].outputs, parts);
}

#[tokio::test(start_paused = true)]
async fn test_load_page_merges_without_dropping() {
  setup_tracing();
  let h = harness();
  let seeded = seed_completed(&h, 5);
  let local = h.engine.submit(SubmitOptions::new(JobType::Cad, 1)).await.unwrap();
  h.store.hide(local);

  let page = h.engine.load_page(2, 2).await.unwrap();
  let ids: Vec<_> = page.jobs.iter().map(|j| j.id).collect();
  assert_eq!(ids, vec![seeded[2].id, seeded[3].id]);
  assert_eq!(page.total, 5);

  // Non-reset loads never drop local jobs.
  let all = h.engine.list_jobs().await.unwrap();
  assert_eq!(all.len(), 3);
  assert!(all.iter().any(|j| j.id == local));
}

#[tokio::test(start_paused = true)]
async fn test_metadata_timeouts_hit_capacity_after_three_retries() {
  setup_tracing();
  let h = harness();
  h.store.list_timeouts.store(usize::MAX, Ordering::SeqCst);

  let started = Instant::now();
  let result = h.engine.load_page(0, 20).await;
  assert_eq!(result, Err(LoadError::Capacity { attempts: 4 }));
  assert_eq!(h.store.list_calls.load(Ordering::SeqCst), 4);
  // 2s + 4s + 8s of backoff, no fourth retry.
  let waited = started.elapsed();
  assert!(waited >= StdDuration::from_secs(14) && waited < StdDuration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn test_transient_timeouts_recover() {
  setup_tracing();
  let h = harness();
  seed_completed(&h, 3);
  h.store.list_timeouts.store(2, Ordering::SeqCst);

  let page = h.engine.load_page(0, 20).await.unwrap();
  assert_eq!(page.jobs.len(), 3);
  assert_eq!(h.store.list_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_generic_store_error_surfaces_once() {
  setup_tracing();
  let h = harness();
  h.store.fail_list.store(true, Ordering::SeqCst);

  let result = h.engine.load_page(0, 20).await;
  assert!(matches!(result, Err(LoadError::Store(_))));
  assert_eq!(h.store.list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hydration_drops_inline_outputs() {
  setup_tracing();
  let h = harness();
  let mut job = remote_job(JobType::Image, JobStatus::Completed, Utc::now());
  job.outputs = vec![
    "data:image/png;base64,iVBORw0KGgoAAAANSUhEUg==".to_string(),
    "https://cdn.example/keep.png".to_string(),
  ];
  h.store.put(job.clone());

  let page = h.engine.load_page(0, 10).await.unwrap();
  assert_eq!(page.jobs[0].outputs, vec!["https://cdn.example/keep.png"]);
}

#[tokio::test(start_paused = true)]
async fn test_hydration_runs_in_batches_for_completed_rows_only() {
  setup_tracing();
  let h = harness();
  seed_completed(&h, 45);
  h.store
    .put(remote_job(JobType::Video, JobStatus::Running, Utc::now()));

  let page = h.engine.load_page(0, 100).await.unwrap();
  assert_eq!(page.jobs.len(), 46);
  // 45 completed rows at 20 per batch.
  assert_eq!(h.store.output_calls.load(Ordering::SeqCst), 3);
  assert!(page
    .jobs
    .iter()
    .filter(|j| j.status == JobStatus::Completed)
    .all(|j| j.outputs.len() == 1));
}

#[tokio::test(start_paused = true)]
async fn test_hydration_failure_surfaces_as_store_error() {
  setup_tracing();
  let h = harness();
  seed_completed(&h, 2);
  h.store.fail_outputs.store(true, Ordering::SeqCst);

  let result = h.engine.load_page(0, 10).await;
  assert!(matches!(result, Err(LoadError::Store(_))));
  assert!(h.engine.list_jobs().await.unwrap().is_empty());
}
