use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;

use coach_core::error::ApiError;
use coach_core::quota::{AccountTier, QuotaAccount, QuotaLimits, check_availability};

use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/quota", get(get_quota))
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct QuotaResponse {
    pub tier: AccountTier,
    /// Remaining analysis credits (free tier)
    pub credit_balance: i64,
    /// Analyses started today (premium tier)
    pub daily_usage_count: i32,
    pub premium_daily_cap: i32,
    /// Whether a job submitted now without a provider key would be accepted
    pub can_submit: bool,
    /// Bring-your-own-key accounts must send `x-provider-key`
    pub requires_provider_key: bool,
}

fn quota_response(account: &QuotaAccount, limits: &QuotaLimits) -> QuotaResponse {
    let today = Utc::now().date_naive();
    let requires_provider_key = account.tier == AccountTier::BringOwnKey;
    QuotaResponse {
        tier: account.tier,
        credit_balance: account.credit_balance,
        daily_usage_count: account.effective_daily_usage(today),
        premium_daily_cap: limits.premium_daily_cap,
        can_submit: !requires_provider_key
            && check_availability(account, today, limits, false).is_allowed(),
        requires_provider_key,
    }
}

/// Current tier, balance and daily usage for the authenticated account.
#[utoipa::path(
    get,
    path = "/v1/quota",
    responses(
        (status = 200, description = "Quota state", body = QuotaResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "analysis"
)]
pub async fn get_quota(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<QuotaResponse>, AppError> {
    let account = state.analysis.account(auth.user_id).await?;
    Ok(Json(quota_response(&account, &state.analysis.limits())))
}
