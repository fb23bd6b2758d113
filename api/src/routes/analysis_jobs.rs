use std::sync::LazyLock;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use coach_core::analysis::{AnalysisRequest, AnalysisResult, FrameAttachment, JobStatus};
use coach_core::error::ApiError;
use coach_core::truth::{Timeline, WindowSelection};

use crate::auth::{AuthenticatedUser, provider_key};
use crate::error::AppError;
use crate::state::AppState;
use crate::store::JobRecord;

const MIN_SUBJECT_ID: i32 = 1;
const MAX_SUBJECT_ID: i32 = 10;
const MAX_QUESTION_CHARS: usize = 1_000;
const MAX_FRAMES: usize = 8;
const MAX_MATCH_ID_CHARS: usize = 64;

/// Platform prefix, underscore, numeric game id (e.g. `EUW1_7123456789`).
static MATCH_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]+_[0-9]+$").expect("valid match id regex"));

pub fn submit_router() -> Router<AppState> {
    Router::new().route("/v1/analysis/jobs", post(create_analysis_job))
}

pub fn poll_router() -> Router<AppState> {
    Router::new().route("/v1/analysis/jobs/{job_id}", get(get_analysis_job))
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CreateAnalysisJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct AnalysisJobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for AnalysisJobStatusResponse {
    fn from(job: JobRecord) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            result: job.result,
            error: job.error,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

fn invalid(field: &str, message: String, received: Option<serde_json::Value>) -> AppError {
    AppError::Validation {
        message,
        field: Some(field.to_string()),
        received,
        docs_hint: None,
    }
}

fn validate_subject_id(subject_id: i32) -> Result<(), AppError> {
    if !(MIN_SUBJECT_ID..=MAX_SUBJECT_ID).contains(&subject_id) {
        return Err(AppError::Validation {
            message: format!(
                "subject_id must be between {MIN_SUBJECT_ID} and {MAX_SUBJECT_ID}"
            ),
            field: Some("subject_id".to_string()),
            received: Some(json!(subject_id)),
            docs_hint: Some("Use the participant id of the coached player in the match.".to_string()),
        });
    }
    Ok(())
}

fn validate_match_id(match_id: &str) -> Result<(), AppError> {
    if match_id.len() > MAX_MATCH_ID_CHARS || !MATCH_ID_RE.is_match(match_id) {
        return Err(AppError::Validation {
            message: format!(
                "match_id must look like PLATFORM_GAMEID and be at most {MAX_MATCH_ID_CHARS} characters"
            ),
            field: Some("evidence.match_id".to_string()),
            received: Some(json!(match_id)),
            docs_hint: Some("Example: EUW1_7123456789".to_string()),
        });
    }
    Ok(())
}

fn validate_timeline(timeline: Option<&Timeline>) -> Result<(), AppError> {
    let Some(timeline) = timeline else {
        return Ok(());
    };
    for (frame_index, frame) in timeline.frames.iter().enumerate() {
        if frame.timestamp < 0 {
            return Err(invalid(
                &format!("evidence.timeline.frames[{frame_index}].timestamp"),
                "timeline timestamps must be >= 0".to_string(),
                Some(json!(frame.timestamp)),
            ));
        }
        if let Some((event_index, event)) = frame
            .events
            .iter()
            .enumerate()
            .find(|(_, event)| event.timestamp < 0)
        {
            return Err(invalid(
                &format!("evidence.timeline.frames[{frame_index}].events[{event_index}].timestamp"),
                "timeline timestamps must be >= 0".to_string(),
                Some(json!(event.timestamp)),
            ));
        }
    }
    Ok(())
}

fn validate_question(question: Option<&str>) -> Result<(), AppError> {
    if let Some(question) = question
        && question.chars().count() > MAX_QUESTION_CHARS
    {
        return Err(invalid(
            "freeform_question",
            format!("freeform_question must be <= {MAX_QUESTION_CHARS} characters"),
            None,
        ));
    }
    Ok(())
}

fn validate_window(window: Option<&WindowSelection>) -> Result<(), AppError> {
    let Some(WindowSelection::Range(range)) = window else {
        return Ok(());
    };
    if range.start_ms < 0 {
        return Err(invalid(
            "time_window.start_ms",
            "start_ms must be >= 0".to_string(),
            Some(json!(range.start_ms)),
        ));
    }
    if let Some(end_ms) = range.end_ms
        && end_ms <= range.start_ms
    {
        return Err(invalid(
            "time_window.end_ms",
            "end_ms must be greater than start_ms".to_string(),
            Some(json!(end_ms)),
        ));
    }
    Ok(())
}

fn validate_frames(frames: &[FrameAttachment]) -> Result<(), AppError> {
    use base64::Engine;

    if frames.len() > MAX_FRAMES {
        return Err(invalid(
            "evidence.frames",
            format!("at most {MAX_FRAMES} frames may be attached"),
            Some(json!(frames.len())),
        ));
    }
    for (index, frame) in frames.iter().enumerate() {
        if !frame.mime_type.starts_with("image/") {
            return Err(invalid(
                &format!("evidence.frames[{index}].mime_type"),
                "frames must be images".to_string(),
                Some(json!(frame.mime_type)),
            ));
        }
        if base64::engine::general_purpose::STANDARD
            .decode(frame.data_base64.as_bytes())
            .is_err()
        {
            return Err(invalid(
                &format!("evidence.frames[{index}].data_base64"),
                "frame data must be standard base64".to_string(),
                None,
            ));
        }
    }
    Ok(())
}

fn validate_request(req: &AnalysisRequest) -> Result<(), AppError> {
    validate_subject_id(req.subject_id)?;
    validate_match_id(&req.evidence.match_id)?;
    validate_timeline(req.evidence.timeline.as_ref())?;
    validate_question(req.freeform_question.as_deref())?;
    validate_window(req.time_window.as_ref())?;
    validate_frames(&req.evidence.frames)?;
    Ok(())
}

/// Submit a grounded analysis job. Returns as soon as the job is persisted; poll for
/// the outcome.
#[utoipa::path(
    post,
    path = "/v1/analysis/jobs",
    request_body = AnalysisRequest,
    params(
        ("x-provider-key" = Option<String>, Header, description = "Caller-supplied model provider key; bypasses credits")
    ),
    responses(
        (status = 202, description = "Analysis job accepted", body = CreateAnalysisJobResponse),
        (status = 400, description = "Validation failed", body = ApiError),
        (status = 401, description = "Authentication or provider key required", body = ApiError),
        (status = 402, description = "Quota exhausted", body = ApiError),
        (status = 429, description = "Rate limited", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "analysis"
)]
pub async fn create_analysis_job(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    headers: HeaderMap,
    Json(req): Json<AnalysisRequest>,
) -> Result<(StatusCode, Json<CreateAnalysisJobResponse>), AppError> {
    validate_request(&req)?;
    let caller_key = provider_key(&headers)?;
    tracing::debug!(
        user_id = %auth.user_id,
        key_id = %auth.key_id,
        match_id = %req.evidence.match_id,
        mode = req.mode.as_str(),
        "analysis submission received"
    );

    let submitted = state
        .analysis
        .submit(auth.user_id, req, caller_key)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateAnalysisJobResponse {
            job_id: submitted.job_id,
            status: submitted.status,
            created_at: submitted.created_at,
        }),
    ))
}

/// Fetch job status and, once completed, the grounded result.
#[utoipa::path(
    get,
    path = "/v1/analysis/jobs/{job_id}",
    params(
        ("job_id" = Uuid, Path, description = "Analysis job id")
    ),
    responses(
        (status = 200, description = "Analysis job status", body = AnalysisJobStatusResponse),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "analysis"
)]
pub async fn get_analysis_job(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<AnalysisJobStatusResponse>, AppError> {
    match state.analysis.poll(auth.user_id, job_id).await? {
        Some(job) => Ok(Json(job.into())),
        None => Err(AppError::NotFound {
            resource: format!("analysis job {job_id}"),
        }),
    }
}
