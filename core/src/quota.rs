use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub const DEFAULT_PREMIUM_DAILY_CAP: i32 = 25;

/// Billing tier of an account. Provisioned outside this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AccountTier {
    Free,
    Premium,
    BringOwnKey,
}

impl AccountTier {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountTier::Free => "free",
            AccountTier::Premium => "premium",
            AccountTier::BringOwnKey => "bring_own_key",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "free" => Some(AccountTier::Free),
            "premium" => Some(AccountTier::Premium),
            "bring_own_key" | "byok" => Some(AccountTier::BringOwnKey),
            _ => None,
        }
    }
}

/// Limits applied by the ledger. Free accounts are bounded by their balance,
/// premium accounts by a per-calendar-day cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub premium_daily_cap: i32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            premium_daily_cap: DEFAULT_PREMIUM_DAILY_CAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaAccount {
    pub owner_id: Uuid,
    pub tier: AccountTier,
    pub credit_balance: i64,
    pub daily_usage_count: i32,
    pub last_usage_date: Option<NaiveDate>,
}

/// Whether a job touches the ledger at all. Resolved once at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargePolicy {
    Charge,
    Bypass,
}

impl ChargePolicy {
    /// BringOwnKey accounts, and any caller that supplies its own provider key,
    /// never touch the ledger.
    pub fn resolve(tier: AccountTier, caller_supplied_key: bool) -> Self {
        if tier == AccountTier::BringOwnKey || caller_supplied_key {
            ChargePolicy::Bypass
        } else {
            ChargePolicy::Charge
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    NoCredits,
    DailyCapReached { cap: i32 },
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::NoCredits => write!(f, "no analysis credits remaining"),
            DenialReason::DailyCapReached { cap } => {
                write!(f, "daily limit of {cap} analyses reached")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Allowed,
    Denied(DenialReason),
}

impl Availability {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Availability::Allowed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
    #[error("quota exhausted: {0}")]
    Exhausted(DenialReason),
    #[error("account tier {0} is not metered by the ledger")]
    Unmetered(&'static str),
    #[error("refund is only applicable to credit debits")]
    NotRefundable,
}

/// What a debit consumed, so a refund can reverse exactly that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitKind {
    Credit,
    DailyUsage { date: NaiveDate },
}

impl DebitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DebitKind::Credit => "credit",
            DebitKind::DailyUsage { .. } => "daily_usage",
        }
    }
}

/// Proof that exactly one debit happened for one job.
///
/// Not `Clone`: refunding consumes the receipt, so a job cannot be refunded twice
/// and a refund cannot be issued without a debit.
#[derive(Debug, PartialEq, Eq)]
pub struct DebitReceipt {
    job_id: Uuid,
    owner_id: Uuid,
    kind: DebitKind,
    balance_after: i64,
}

impl DebitReceipt {
    pub fn new(job_id: Uuid, owner_id: Uuid, kind: DebitKind, balance_after: i64) -> Self {
        Self {
            job_id,
            owner_id,
            kind,
            balance_after,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn kind(&self) -> DebitKind {
        self.kind
    }

    /// Credit balance for free accounts, today's usage count for premium ones.
    pub fn balance_after(&self) -> i64 {
        self.balance_after
    }

    /// Only free-tier credit debits are ever refunded.
    pub fn is_refundable(&self) -> bool {
        self.kind == DebitKind::Credit
    }
}

/// Ledger-level availability check.
pub fn check_availability(
    account: &QuotaAccount,
    today: NaiveDate,
    limits: &QuotaLimits,
    caller_supplied_key: bool,
) -> Availability {
    match ChargePolicy::resolve(account.tier, caller_supplied_key) {
        ChargePolicy::Bypass => Availability::Allowed,
        ChargePolicy::Charge => account.metered_availability(today, limits),
    }
}

impl QuotaAccount {
    pub fn new_free(owner_id: Uuid, credit_balance: i64) -> Self {
        Self {
            owner_id,
            tier: AccountTier::Free,
            credit_balance,
            daily_usage_count: 0,
            last_usage_date: None,
        }
    }

    /// Usage count as of `today`; a stale date means the counter has rolled over.
    pub fn effective_daily_usage(&self, today: NaiveDate) -> i32 {
        if self.last_usage_date == Some(today) {
            self.daily_usage_count
        } else {
            0
        }
    }

    fn metered_availability(&self, today: NaiveDate, limits: &QuotaLimits) -> Availability {
        match self.tier {
            AccountTier::BringOwnKey => Availability::Allowed,
            AccountTier::Premium => {
                if self.effective_daily_usage(today) < limits.premium_daily_cap {
                    Availability::Allowed
                } else {
                    Availability::Denied(DenialReason::DailyCapReached {
                        cap: limits.premium_daily_cap,
                    })
                }
            }
            AccountTier::Free => {
                if self.credit_balance > 0 {
                    Availability::Allowed
                } else {
                    Availability::Denied(DenialReason::NoCredits)
                }
            }
        }
    }

    /// Re-check availability and consume one unit in the same step.
    ///
    /// Callers must hold exclusive access to the account (row lock or mutex) for the
    /// duration of this call; that is what makes check+debit atomic.
    pub fn apply_debit(
        &mut self,
        today: NaiveDate,
        limits: &QuotaLimits,
    ) -> Result<(DebitKind, i64), QuotaError> {
        if self.tier == AccountTier::BringOwnKey {
            return Err(QuotaError::Unmetered(self.tier.as_str()));
        }
        if let Availability::Denied(reason) = self.metered_availability(today, limits) {
            return Err(QuotaError::Exhausted(reason));
        }

        match self.tier {
            AccountTier::Premium => {
                self.daily_usage_count = self.effective_daily_usage(today) + 1;
                self.last_usage_date = Some(today);
                Ok((
                    DebitKind::DailyUsage { date: today },
                    i64::from(self.daily_usage_count),
                ))
            }
            _ => {
                self.credit_balance -= 1;
                Ok((DebitKind::Credit, self.credit_balance))
            }
        }
    }

    /// Reverse a credit debit. Premium usage is never handed back.
    pub fn apply_refund(&mut self, kind: DebitKind) -> Result<i64, QuotaError> {
        match kind {
            DebitKind::Credit => {
                self.credit_balance += 1;
                Ok(self.credit_balance)
            }
            DebitKind::DailyUsage { .. } => Err(QuotaError::NotRefundable),
        }
    }
}
