//! Paged history loading with batched output hydration.
//!
//! Metadata rows are fetched first and are cheap. The `outputs` of completed
//! rows are fetched afterwards in fixed-size batches, and anything that is
//! not a dereferenceable reference is dropped on the way in.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::{debug, info, warn};

use crate::error::LoadError;
use crate::job::{Job, JobId, JobStatus, OwnerId};
use crate::store::{ListPage, SharedJobStore};

/// Longest output reference kept during hydration.
pub const MAX_REFERENCE_LEN: usize = 4096;

/// A page of jobs as seen by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
  pub jobs: Vec<Job>,
  /// Total number of jobs the owner has in the store.
  pub total: u64,
}

/// Whether `reference` points at content rather than embedding it.
pub fn is_dereferenceable(reference: &str) -> bool {
  if reference.len() > MAX_REFERENCE_LEN {
    return false;
  }
  let head: String = reference.chars().take(8).collect::<String>().to_ascii_lowercase();
  head.starts_with("https://") || head.starts_with("http://")
}

/// Keeps only dereferenceable references, preserving order.
pub fn filter_outputs(outputs: Vec<String>) -> Vec<String> {
  let before = outputs.len();
  let kept: Vec<String> = outputs.into_iter().filter(|o| is_dereferenceable(o)).collect();
  if kept.len() < before {
    debug!(dropped = before - kept.len(), "Dropped non-dereferenceable outputs.");
  }
  kept
}

/// Local jobs younger than `window` that the fetched snapshot does not know
/// about yet, newest first. These survive a full reload.
pub fn recent_local_jobs<'a>(
  local: impl IntoIterator<Item = &'a Job>,
  fetched: &HashSet<JobId>,
  now: DateTime<Utc>,
  window: Duration,
) -> Vec<Job> {
  let mut recent: Vec<Job> = local
    .into_iter()
    .filter(|job| !fetched.contains(&job.id))
    .filter(|job| {
      (now - job.created_at)
        .to_std()
        .map(|age| age < window)
        // Clock skew puts created_at in the future; that is as recent as it gets.
        .unwrap_or(true)
    })
    .cloned()
    .collect();
  recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
  recent
}

/// Reads pages of the owner's history from the store.
#[derive(Clone)]
pub(crate) struct BulkLoader {
  store: SharedJobStore,
  owner: OwnerId,
  batch_size: usize,
  max_retries: u32,
  retry_base: Duration,
}

impl BulkLoader {
  pub fn new(
    store: SharedJobStore,
    owner: OwnerId,
    batch_size: usize,
    max_retries: u32,
    retry_base: Duration,
  ) -> Self {
    Self {
      store,
      owner,
      batch_size: batch_size.max(1),
      max_retries,
      retry_base,
    }
  }

  pub async fn load_page(&self, offset: usize, limit: usize) -> Result<Page, LoadError> {
    let ListPage { mut rows, total } = self.fetch_metadata(offset, limit).await?;
    self.hydrate(&mut rows).await?;
    debug!(offset, limit, rows = rows.len(), total, "Loaded job page.");
    Ok(Page { jobs: rows, total })
  }

  /// Retries timeout-class errors with `base * 2^attempt` delays. Any other
  /// error surfaces immediately.
  async fn fetch_metadata(&self, offset: usize, limit: usize) -> Result<ListPage, LoadError> {
    let mut attempt: u32 = 0;
    loop {
      match self.store.list_by_owner(&self.owner, offset, limit).await {
        Ok(page) => return Ok(page),
        Err(e) if e.is_timeout() => {
          if attempt >= self.max_retries {
            warn!(attempts = attempt + 1, error = %e, "Metadata query kept timing out; giving up.");
            return Err(LoadError::Capacity {
              attempts: attempt + 1,
            });
          }
          let delay = self.retry_base.saturating_mul(2u32.saturating_pow(attempt));
          info!(attempt, delay_ms = delay.as_millis() as u64, "Metadata query timed out; retrying.");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) => {
          warn!(error = %e, "Metadata query failed.");
          return Err(LoadError::Store(e));
        }
      }
    }
  }

  async fn hydrate(&self, rows: &mut [Job]) -> Result<(), LoadError> {
    let completed: Vec<JobId> = rows
      .iter()
      .filter(|job| job.status == JobStatus::Completed)
      .map(|job| job.id)
      .collect();
    if completed.is_empty() {
      return Ok(());
    }

    let batches = completed
      .chunks(self.batch_size)
      .map(|ids| self.store.fetch_outputs(ids));
    let fetched: HashMap<JobId, Vec<String>> = try_join_all(batches)
      .await
      .map_err(|e| {
        warn!(error = %e, "Output hydration failed.");
        LoadError::Store(e)
      })?
      .into_iter()
      .flatten()
      .collect();

    for job in rows.iter_mut() {
      if let Some(outputs) = fetched.get(&job.id) {
        job.outputs = filter_outputs(outputs.clone());
      }
    }
    Ok(())
  }
}
