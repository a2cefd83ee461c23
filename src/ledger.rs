use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::job::{JobId, JobType};

/// Proof of a successful debit. Carries the job id so a debit whose job
/// record never got written can be matched up later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
  pub job_id: JobId,
  pub transaction_id: String,
  pub amount: u64,
}

/// Credit ledger consulted before any job is created.
#[async_trait]
pub trait Ledger: Send + Sync {
  /// Debits `amount` credits for `action` (e.g. `"generate_video"`), tagged
  /// with `job_id`.
  async fn debit(&self, job_id: JobId, action: &str, amount: u64) -> Result<Receipt, LedgerError>;

  /// Returns the credits of a debit whose job could not be created.
  async fn refund(&self, receipt: &Receipt) -> Result<(), LedgerError>;
}

pub type SharedLedger = Arc<dyn Ledger>;

/// Ledger action name for a job type.
pub fn action_for(job_type: JobType) -> String {
  format!("generate_{}", job_type.as_str())
}
