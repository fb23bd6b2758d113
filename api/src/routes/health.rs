use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get};

use crate::HealthResponse;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

fn health_body(db_ok: bool) -> (StatusCode, HealthResponse) {
    let (http_status, status, database) = if db_ok {
        (StatusCode::OK, "ok", "reachable")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded", "unreachable")
    };
    (
        http_status,
        HealthResponse {
            status: status.to_string(),
            database: database.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    )
}

/// Liveness plus a database round trip. Job workers share the same pool.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();

    let (status, body) = health_body(db_ok);
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::health_body;

    #[test]
    fn unreachable_database_degrades_health() {
        let (status, body) = health_body(false);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "degraded");

        let (status, body) = health_body(true);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.database, "reachable");
    }
}
