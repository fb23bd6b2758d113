use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use chrono::Utc;
use coach_core::auth::{API_KEY_PREFIX, hash_token, is_api_key, provider_key_fingerprint};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying a caller-supplied model provider key (bring-your-own-key).
pub const PROVIDER_KEY_HEADER: &str = "x-provider-key";

const MAX_PROVIDER_KEY_LEN: usize = 256;

/// Account resolved from the `Authorization: Bearer coach_sk_...` header.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub key_id: Uuid,
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized {
            message: "Missing Authorization header".to_string(),
            docs_hint: Some(format!(
                "Include 'Authorization: Bearer <token>' with an API key ({API_KEY_PREFIX}...)."
            )),
        })?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized {
            message: "Authorization header must use Bearer scheme".to_string(),
            docs_hint: Some("Format: 'Authorization: Bearer <token>'".to_string()),
        })?
        .trim();

    if !is_api_key(token) {
        return Err(AppError::Unauthorized {
            message: "Invalid token format".to_string(),
            docs_hint: Some(format!("Token must start with '{API_KEY_PREFIX}'.")),
        });
    }
    Ok(token)
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthenticatedUser>() {
            return Ok(user.clone());
        }

        let token = bearer_token(&parts.headers)?;
        let user = authenticate_api_key(token, &state.db).await?;
        parts.extensions.insert(user.clone());
        Ok(user)
    }
}

async fn authenticate_api_key(
    token: &str,
    pool: &sqlx::PgPool,
) -> Result<AuthenticatedUser, AppError> {
    let token_hash = hash_token(token);

    let row = sqlx::query_as::<_, ApiKeyRow>(
        "SELECT ak.id, ak.user_id, ak.expires_at \
         FROM api_keys ak \
         JOIN users u ON u.id = ak.user_id \
         WHERE ak.key_hash = $1 \
           AND ak.is_revoked = FALSE \
           AND u.is_active = TRUE",
    )
    .bind(&token_hash)
    .fetch_optional(pool)
    .await
    .map_err(AppError::Database)?
    .ok_or_else(|| AppError::Unauthorized {
        message: "Invalid API key".to_string(),
        docs_hint: Some("Check that the API key is correct and has not been revoked.".to_string()),
    })?;

    if let Some(expires_at) = row.expires_at
        && Utc::now() > expires_at
    {
        return Err(AppError::Unauthorized {
            message: "API key has expired".to_string(),
            docs_hint: Some("Issue a new API key for this account.".to_string()),
        });
    }

    // Fire-and-forget last_used_at update
    let pool_clone = pool.clone();
    let key_id = row.id;
    tokio::spawn(async move {
        let _ = sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(key_id)
            .execute(&pool_clone)
            .await;
    });

    Ok(AuthenticatedUser {
        user_id: row.user_id,
        key_id: row.id,
    })
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: Uuid,
    user_id: Uuid,
    expires_at: Option<chrono::DateTime<Utc>>,
}

/// Optional caller-supplied provider key. Present means the job bypasses the ledger.
pub fn provider_key(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(raw) = headers.get(PROVIDER_KEY_HEADER) else {
        return Ok(None);
    };
    let key = raw
        .to_str()
        .map(str::trim)
        .map_err(|_| AppError::Validation {
            message: format!("{PROVIDER_KEY_HEADER} must be visible ASCII"),
            field: Some(PROVIDER_KEY_HEADER.to_string()),
            received: None,
            docs_hint: None,
        })?;

    if key.is_empty() || key.len() > MAX_PROVIDER_KEY_LEN {
        return Err(AppError::Validation {
            message: format!(
                "{PROVIDER_KEY_HEADER} must be between 1 and {MAX_PROVIDER_KEY_LEN} characters"
            ),
            field: Some(PROVIDER_KEY_HEADER.to_string()),
            received: None,
            docs_hint: Some("Omit the header to analyse with platform credits.".to_string()),
        });
    }

    tracing::debug!(
        fingerprint = %provider_key_fingerprint(key),
        "caller supplied a provider key"
    );
    Ok(Some(key.to_string()))
}
