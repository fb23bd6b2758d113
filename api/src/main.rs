use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use coach_core::grounding::ItemCatalog;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod analysis;
mod auth;
mod config;
mod error;
mod gateway;
mod ledger;
mod middleware;
mod routes;
mod state;
mod store;
mod timeline;

const MODEL_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Rift Coach API",
        version = "0.1.0",
        description = "Grounded match analysis: submit gameplay evidence, poll for coaching feedback that only cites verified game events."
    ),
    paths(
        routes::health::health_check,
        routes::analysis_jobs::create_analysis_job,
        routes::analysis_jobs::get_analysis_job,
        routes::quota::get_quota,
    ),
    components(schemas(
        HealthResponse,
        coach_core::error::ApiError,
        coach_core::analysis::AnalysisRequest,
        coach_core::analysis::AnalysisMode,
        coach_core::analysis::EvidencePayload,
        coach_core::analysis::FrameAttachment,
        coach_core::analysis::AnalysisResult,
        coach_core::analysis::GeneratedInsight,
        coach_core::analysis::InsightKind,
        coach_core::analysis::ItemRecommendation,
        coach_core::analysis::JobStatus,
        coach_core::quota::AccountTier,
        coach_core::truth::Timeline,
        coach_core::truth::TimelineFrame,
        coach_core::truth::TimelineEvent,
        coach_core::truth::WindowSelection,
        coach_core::truth::WindowPreset,
        coach_core::truth::TimeWindow,
        routes::analysis_jobs::CreateAnalysisJobResponse,
        routes::analysis_jobs::AnalysisJobStatusResponse,
        routes::quota::QuotaResponse,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub version: String,
}

fn load_item_catalog(path: Option<&str>) -> Result<ItemCatalog, String> {
    let Some(path) = path else {
        tracing::warn!("ITEM_CATALOG_PATH not set; every item recommendation will be dropped");
        return Ok(ItemCatalog::default());
    };
    let raw = std::fs::read_to_string(path).map_err(|err| format!("{path}: {err}"))?;
    let document: serde_json::Value =
        serde_json::from_str(&raw).map_err(|err| format!("{path}: {err}"))?;
    ItemCatalog::from_data_document(&document).map_err(|err| format!("{path}: {err}"))
}

fn build_gateway(model: &config::ModelConfig, client: &reqwest::Client) -> gateway::ModelGateway {
    let retry = gateway::RetryPolicy {
        max_attempts: model.max_attempts,
        backoff_base: model.backoff_base,
    };
    model
        .order
        .iter()
        .fold(gateway::ModelGateway::new(retry), |models, model_id| {
            models.with_backend(Arc::new(gateway::http::GenerativeHttpBackend::new(
                client.clone(),
                &model.api_base_url,
                model_id,
            )))
        })
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coach_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = config::AppConfig::from_env().expect("Invalid configuration");
    tracing::info!(
        model = ?config.model,
        timeline = ?config.timeline,
        analysis = ?config.analysis,
        "configuration loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let http = reqwest::Client::builder()
        .timeout(MODEL_HTTP_TIMEOUT)
        .build()
        .expect("Failed to build HTTP client");

    let catalog = load_item_catalog(config.item_catalog_path.as_deref())
        .expect("Failed to load item catalog");
    tracing::info!(items = catalog.len(), "item catalog loaded");

    let analysis = analysis::AnalysisService::new(
        Arc::new(store::postgres::PgJobStore::new(pool.clone())),
        Arc::new(ledger::postgres::PgQuotaLedger::new(
            pool.clone(),
            config.analysis.free_starting_credits,
        )),
        Arc::new(build_gateway(&config.model, &http)),
        Arc::new(timeline::HttpTimelineSource::new(
            http.clone(),
            &config.timeline.api_base_url,
            config.timeline.api_key.clone(),
            config.timeline.cache_ttl_secs,
        )),
        Arc::new(catalog),
        analysis::AnalysisSettings {
            analysis: config.analysis.clone(),
            model_order: config.model.order.clone(),
            platform_api_key: config.model.platform_api_key.clone(),
        },
    );

    analysis
        .recover_stale_jobs()
        .await
        .expect("Failed to recover stale analysis jobs");
    // Jobs orphaned shortly before a restart only go stale once the deadline passes.
    tokio::spawn({
        let analysis = analysis.clone();
        let period = config.analysis.job_deadline.max(Duration::from_secs(1));
        async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = analysis.recover_stale_jobs().await {
                    tracing::error!(error = %err, "stale job sweep failed");
                }
            }
        }
    });

    let app_state = state::AppState { db: pool, analysis };

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(
            routes::analysis_jobs::submit_router()
                .layer(middleware::rate_limit::submit_layer()),
        )
        .merge(routes::analysis_jobs::poll_router().layer(middleware::rate_limit::poll_layer()))
        .merge(routes::quota::router().layer(middleware::rate_limit::poll_layer()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::cors::build_cors_layer(&config.cors_origins)),
        )
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Rift Coach API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}
