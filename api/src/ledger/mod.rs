#[cfg(test)]
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use coach_core::quota::{DebitReceipt, QuotaAccount, QuotaError, QuotaLimits};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("ledger inconsistency: {0}")]
    Inconsistent(String),
}

/// Sole mutator of quota accounts.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Current account state, creating a Free row on first use.
    async fn account(&self, owner_id: Uuid) -> Result<QuotaAccount, LedgerError>;

    /// Re-check availability and consume one unit under an exclusive lock on the account.
    async fn debit(
        &self,
        owner_id: Uuid,
        job_id: Uuid,
        today: NaiveDate,
        limits: &QuotaLimits,
    ) -> Result<DebitReceipt, LedgerError>;

    /// Reverse the debit described by `receipt`; returns the restored credit balance.
    async fn refund(&self, receipt: DebitReceipt) -> Result<i64, LedgerError>;

    /// Refund the job's credit debit if it is still outstanding, for workers whose
    /// receipt was lost (aborted task, restarted process). Daily usage stays consumed.
    /// Returns the restored balance, or `None` when there was nothing to refund.
    async fn refund_outstanding(&self, job_id: Uuid) -> Result<Option<i64>, LedgerError>;
}
