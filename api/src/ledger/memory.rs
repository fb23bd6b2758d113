use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use coach_core::quota::{DebitKind, DebitReceipt, QuotaAccount, QuotaError, QuotaLimits};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LedgerError, QuotaLedger};

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<Uuid, QuotaAccount>,
    /// Debits not yet refunded, keyed by job id.
    outstanding: HashMap<Uuid, (Uuid, DebitKind)>,
    refunds: u32,
}

impl LedgerState {
    fn account_mut(&mut self, owner_id: Uuid, starting_credits: i64) -> &mut QuotaAccount {
        self.accounts
            .entry(owner_id)
            .or_insert_with(|| QuotaAccount::new_free(owner_id, starting_credits))
    }

    fn restore(&mut self, owner_id: Uuid, kind: DebitKind) -> Result<i64, LedgerError> {
        let account = self.accounts.get_mut(&owner_id).ok_or_else(|| {
            LedgerError::Inconsistent(format!("account {owner_id} vanished"))
        })?;
        let balance = account.apply_refund(kind)?;
        self.refunds += 1;
        Ok(balance)
    }
}

/// In-process ledger. A single mutex over all accounts makes check+debit atomic.
#[derive(Default)]
pub struct MemoryQuotaLedger {
    state: Mutex<LedgerState>,
    free_starting_credits: i64,
}

impl MemoryQuotaLedger {
    /// Accounts created on first use start Free with `free_starting_credits`.
    pub fn new(free_starting_credits: i64) -> Self {
        Self {
            state: Mutex::default(),
            free_starting_credits,
        }
    }

    pub fn with_account(account: QuotaAccount) -> Self {
        let mut state = LedgerState::default();
        state.accounts.insert(account.owner_id, account);
        Self {
            state: Mutex::new(state),
            free_starting_credits: 0,
        }
    }

    pub async fn snapshot(&self, owner_id: Uuid) -> Option<QuotaAccount> {
        self.state.lock().await.accounts.get(&owner_id).cloned()
    }

    pub async fn refund_count(&self) -> u32 {
        self.state.lock().await.refunds
    }
}

#[async_trait]
impl QuotaLedger for MemoryQuotaLedger {
    async fn account(&self, owner_id: Uuid) -> Result<QuotaAccount, LedgerError> {
        let mut state = self.state.lock().await;
        Ok(state
            .account_mut(owner_id, self.free_starting_credits)
            .clone())
    }

    async fn debit(
        &self,
        owner_id: Uuid,
        job_id: Uuid,
        today: NaiveDate,
        limits: &QuotaLimits,
    ) -> Result<DebitReceipt, LedgerError> {
        let mut state = self.state.lock().await;
        if state.outstanding.contains_key(&job_id) {
            return Err(LedgerError::Inconsistent(format!(
                "job {job_id} was already debited"
            )));
        }
        let (kind, balance_after) = state
            .account_mut(owner_id, self.free_starting_credits)
            .apply_debit(today, limits)?;
        state.outstanding.insert(job_id, (owner_id, kind));
        Ok(DebitReceipt::new(job_id, owner_id, kind, balance_after))
    }

    async fn refund(&self, receipt: DebitReceipt) -> Result<i64, LedgerError> {
        if !receipt.is_refundable() {
            return Err(QuotaError::NotRefundable.into());
        }
        let mut state = self.state.lock().await;
        match state.outstanding.get(&receipt.job_id()) {
            Some((owner_id, _)) if *owner_id == receipt.owner_id() => {}
            _ => {
                return Err(LedgerError::Inconsistent(format!(
                    "no outstanding debit for job {}",
                    receipt.job_id()
                )));
            }
        }
        state.outstanding.remove(&receipt.job_id());
        state.restore(receipt.owner_id(), receipt.kind())
    }

    async fn refund_outstanding(&self, job_id: Uuid) -> Result<Option<i64>, LedgerError> {
        let mut state = self.state.lock().await;
        let Some(&(owner_id, kind)) = state.outstanding.get(&job_id) else {
            return Ok(None);
        };
        if kind != DebitKind::Credit {
            return Ok(None);
        }
        state.outstanding.remove(&job_id);
        state.restore(owner_id, kind).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;
    use coach_core::quota::{
        AccountTier, DebitKind, DebitReceipt, QuotaAccount, QuotaError, QuotaLimits,
    };
    use uuid::Uuid;

    use super::MemoryQuotaLedger;
    use crate::ledger::{LedgerError, QuotaLedger};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, 1).unwrap()
    }

    #[tokio::test]
    async fn concurrent_debits_never_overdraw() {
        let owner = Uuid::now_v7();
        let ledger = Arc::new(MemoryQuotaLedger::with_account(QuotaAccount::new_free(
            owner, 3,
        )));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .debit(owner, Uuid::now_v7(), today(), &QuotaLimits::default())
                    .await
                    .is_ok()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 3);
        assert_eq!(ledger.snapshot(owner).await.unwrap().credit_balance, 0);
    }

    #[tokio::test]
    async fn refund_restores_exactly_one_credit() {
        let owner = Uuid::now_v7();
        let ledger = MemoryQuotaLedger::with_account(QuotaAccount::new_free(owner, 2));
        let receipt = ledger
            .debit(owner, Uuid::now_v7(), today(), &QuotaLimits::default())
            .await
            .unwrap();
        assert_eq!(receipt.balance_after(), 1);

        assert_eq!(ledger.refund(receipt).await.unwrap(), 2);
        assert_eq!(ledger.refund_count().await, 1);
    }

    #[tokio::test]
    async fn refund_without_debit_is_rejected() {
        let owner = Uuid::now_v7();
        let ledger = MemoryQuotaLedger::with_account(QuotaAccount::new_free(owner, 2));
        let forged = DebitReceipt::new(Uuid::now_v7(), owner, DebitKind::Credit, 1);

        let err = ledger.refund(forged).await.unwrap_err();
        assert!(matches!(err, LedgerError::Inconsistent(_)));
        assert_eq!(ledger.snapshot(owner).await.unwrap().credit_balance, 2);
    }

    #[tokio::test]
    async fn new_accounts_receive_starting_credits() {
        let ledger = MemoryQuotaLedger::new(2);
        let owner = Uuid::now_v7();
        assert_eq!(ledger.account(owner).await.unwrap().credit_balance, 2);

        let receipt = ledger
            .debit(Uuid::now_v7(), Uuid::now_v7(), today(), &QuotaLimits::default())
            .await
            .unwrap();
        assert_eq!(receipt.balance_after(), 1);
    }

    #[tokio::test]
    async fn outstanding_credit_is_refunded_once_by_job_id() {
        let owner = Uuid::now_v7();
        let ledger = MemoryQuotaLedger::with_account(QuotaAccount::new_free(owner, 1));
        let job_id = Uuid::now_v7();
        let receipt = ledger
            .debit(owner, job_id, today(), &QuotaLimits::default())
            .await
            .unwrap();

        assert_eq!(ledger.refund_outstanding(job_id).await.unwrap(), Some(1));
        assert_eq!(ledger.refund_outstanding(job_id).await.unwrap(), None);
        assert!(matches!(
            ledger.refund(receipt).await,
            Err(LedgerError::Inconsistent(_))
        ));
        assert_eq!(ledger.snapshot(owner).await.unwrap().credit_balance, 1);
        assert_eq!(ledger.refund_count().await, 1);
        assert_eq!(ledger.refund_outstanding(Uuid::now_v7()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn outstanding_daily_usage_is_not_refunded() {
        let mut account = QuotaAccount::new_free(Uuid::now_v7(), 0);
        account.tier = AccountTier::Premium;
        let owner = account.owner_id;
        let ledger = MemoryQuotaLedger::with_account(account);
        let job_id = Uuid::now_v7();
        ledger
            .debit(owner, job_id, today(), &QuotaLimits::default())
            .await
            .unwrap();

        assert_eq!(ledger.refund_outstanding(job_id).await.unwrap(), None);
        assert_eq!(ledger.snapshot(owner).await.unwrap().daily_usage_count, 1);
    }

    #[tokio::test]
    async fn empty_free_account_is_exhausted() {
        let ledger = MemoryQuotaLedger::default();
        let owner = Uuid::now_v7();
        assert_eq!(ledger.account(owner).await.unwrap().credit_balance, 0);

        let err = ledger
            .debit(owner, Uuid::now_v7(), today(), &QuotaLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Quota(QuotaError::Exhausted(_))));
    }
}
