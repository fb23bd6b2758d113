use async_trait::async_trait;
use chrono::NaiveDate;
use coach_core::quota::{AccountTier, DebitKind, DebitReceipt, QuotaAccount, QuotaError, QuotaLimits};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{LedgerError, QuotaLedger};

#[derive(Clone)]
pub struct PgQuotaLedger {
    pool: PgPool,
    free_starting_credits: i64,
}

impl PgQuotaLedger {
    pub fn new(pool: PgPool, free_starting_credits: i64) -> Self {
        Self {
            pool,
            free_starting_credits,
        }
    }

    async fn ensure_account(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        owner_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO quota_accounts (owner_id, tier, credit_balance)
            VALUES ($1, 'free', $2)
            ON CONFLICT (owner_id) DO NOTHING
            "#,
        )
        .bind(owner_id)
        .bind(self.free_starting_credits)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QuotaAccountRow {
    owner_id: Uuid,
    tier: String,
    credit_balance: i64,
    daily_usage_count: i32,
    last_usage_date: Option<NaiveDate>,
}

impl TryFrom<QuotaAccountRow> for QuotaAccount {
    type Error = LedgerError;

    fn try_from(row: QuotaAccountRow) -> Result<Self, Self::Error> {
        let tier = AccountTier::parse(&row.tier).ok_or_else(|| {
            LedgerError::Inconsistent(format!(
                "account {} has unknown tier '{}'",
                row.owner_id, row.tier
            ))
        })?;
        Ok(QuotaAccount {
            owner_id: row.owner_id,
            tier,
            credit_balance: row.credit_balance,
            daily_usage_count: row.daily_usage_count,
            last_usage_date: row.last_usage_date,
        })
    }
}

#[async_trait]
impl QuotaLedger for PgQuotaLedger {
    async fn account(&self, owner_id: Uuid) -> Result<QuotaAccount, LedgerError> {
        let mut tx = self.pool.begin().await?;
        self.ensure_account(&mut tx, owner_id).await?;
        let row = sqlx::query_as::<_, QuotaAccountRow>(
            r#"
            SELECT owner_id, tier, credit_balance, daily_usage_count, last_usage_date
            FROM quota_accounts
            WHERE owner_id = $1
            "#,
        )
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row.try_into()
    }

    async fn debit(
        &self,
        owner_id: Uuid,
        job_id: Uuid,
        today: NaiveDate,
        limits: &QuotaLimits,
    ) -> Result<DebitReceipt, LedgerError> {
        let mut tx = self.pool.begin().await?;
        self.ensure_account(&mut tx, owner_id).await?;

        let row = sqlx::query_as::<_, QuotaAccountRow>(
            r#"
            SELECT owner_id, tier, credit_balance, daily_usage_count, last_usage_date
            FROM quota_accounts
            WHERE owner_id = $1
            FOR UPDATE
            "#,
        )
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await?;
        let mut account: QuotaAccount = row.try_into()?;

        // Dropping `tx` on error rolls back and releases the row lock.
        let (kind, balance_after) = account.apply_debit(today, limits)?;

        sqlx::query(
            r#"
            UPDATE quota_accounts
            SET credit_balance = $2,
                daily_usage_count = $3,
                last_usage_date = $4,
                updated_at = NOW()
            WHERE owner_id = $1
            "#,
        )
        .bind(owner_id)
        .bind(account.credit_balance)
        .bind(account.daily_usage_count)
        .bind(account.last_usage_date)
        .execute(&mut *tx)
        .await?;

        let usage_date = match kind {
            DebitKind::DailyUsage { date } => Some(date),
            DebitKind::Credit => None,
        };
        sqlx::query(
            r#"
            INSERT INTO quota_debits (job_id, owner_id, kind, usage_date)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job_id)
        .bind(owner_id)
        .bind(kind.as_str())
        .bind(usage_date)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(DebitReceipt::new(job_id, owner_id, kind, balance_after))
    }

    async fn refund(&self, receipt: DebitReceipt) -> Result<i64, LedgerError> {
        if !receipt.is_refundable() {
            return Err(QuotaError::NotRefundable.into());
        }

        let mut tx = self.pool.begin().await?;
        let marked = sqlx::query(
            r#"
            UPDATE quota_debits
            SET refunded_at = NOW()
            WHERE job_id = $1
              AND owner_id = $2
              AND kind = 'credit'
              AND refunded_at IS NULL
            "#,
        )
        .bind(receipt.job_id())
        .bind(receipt.owner_id())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if marked == 0 {
            return Err(LedgerError::Inconsistent(format!(
                "no outstanding credit debit for job {}",
                receipt.job_id()
            )));
        }

        let balance: i64 = sqlx::query_scalar(
            r#"
            UPDATE quota_accounts
            SET credit_balance = credit_balance + 1,
                updated_at = NOW()
            WHERE owner_id = $1
            RETURNING credit_balance
            "#,
        )
        .bind(receipt.owner_id())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(balance)
    }

    async fn refund_outstanding(&self, job_id: Uuid) -> Result<Option<i64>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let owner_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE quota_debits
            SET refunded_at = NOW()
            WHERE job_id = $1
              AND kind = 'credit'
              AND refunded_at IS NULL
            RETURNING owner_id
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(owner_id) = owner_id else {
            return Ok(None);
        };

        let balance: i64 = sqlx::query_scalar(
            r#"
            UPDATE quota_accounts
            SET credit_balance = credit_balance + 1,
                updated_at = NOW()
            WHERE owner_id = $1
            RETURNING credit_balance
            "#,
        )
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(balance))
    }
}
