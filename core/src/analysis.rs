use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use crate::truth::{Timeline, WindowSelection};

/// Lifecycle of an analysis job. `Processing` is both initial and the only
/// non-terminal state: a job is persisted already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Timeline-only review of a finished match.
    Match,
    /// Timeline plus extracted video frames.
    Vod,
}

impl AnalysisMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisMode::Match => "match",
            AnalysisMode::Vod => "vod",
        }
    }
}

/// A still frame extracted from gameplay video, base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FrameAttachment {
    pub mime_type: String,
    pub data_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
}

/// Raw gameplay evidence. The timeline is fetched by `match_id` unless supplied inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EvidencePayload {
    pub match_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Timeline>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<FrameAttachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AnalysisRequest {
    /// Participant id (1-10) of the coached player within the match
    pub subject_id: i32,
    pub mode: AnalysisMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<WindowSelection>,
    pub evidence: EvidencePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeform_question: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    Mistake,
    Strength,
    Opportunity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct GeneratedInsight {
    pub timestamp_ms: i64,
    pub title: String,
    pub description: String,
    pub kind: InsightKind,
    pub advice: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ItemRecommendation {
    pub free_text_name: String,
    pub resolved_catalog_id: Option<String>,
}

/// Structured output every model backend must produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoachingDraft {
    pub summary: String,
    #[serde(default)]
    pub insights: Vec<GeneratedInsight>,
    #[serde(default)]
    pub item_recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DraftError {
    #[error("response is not valid draft JSON: {0}")]
    Malformed(String),
    #[error("response failed draft validation: {0}")]
    Invalid(String),
}

impl CoachingDraft {
    /// Parse and validate raw model output. Models sometimes wrap JSON in a
    /// markdown fence; that wrapper is tolerated, nothing else is.
    pub fn parse(raw: &str) -> Result<Self, DraftError> {
        let body = strip_code_fence(raw.trim());
        let draft: CoachingDraft =
            serde_json::from_str(body).map_err(|err| DraftError::Malformed(err.to_string()))?;
        draft.validate()?;
        Ok(draft)
    }

    fn validate(&self) -> Result<(), DraftError> {
        if self.summary.trim().is_empty() {
            return Err(DraftError::Invalid("summary must not be empty".to_string()));
        }
        for (index, insight) in self.insights.iter().enumerate() {
            if insight.timestamp_ms < 0 {
                return Err(DraftError::Invalid(format!(
                    "insights[{index}].timestamp_ms must be >= 0"
                )));
            }
            if insight.title.trim().is_empty() {
                return Err(DraftError::Invalid(format!(
                    "insights[{index}].title must not be empty"
                )));
            }
        }
        Ok(())
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix("```") else {
        return raw;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Response schema handed to providers that support constrained JSON output.
pub fn draft_response_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "summary": { "type": "STRING" },
            "insights": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "timestamp_ms": { "type": "INTEGER" },
                        "title": { "type": "STRING" },
                        "description": { "type": "STRING" },
                        "kind": {
                            "type": "STRING",
                            "enum": ["mistake", "strength", "opportunity"]
                        },
                        "advice": { "type": "STRING" }
                    },
                    "required": ["timestamp_ms", "title", "description", "kind", "advice"]
                }
            },
            "item_recommendations": {
                "type": "ARRAY",
                "items": { "type": "STRING" }
            }
        },
        "required": ["summary", "insights", "item_recommendations"]
    })
}

/// Grounded result persisted on a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AnalysisResult {
    pub summary: String,
    pub insights: Vec<GeneratedInsight>,
    pub item_recommendations: Vec<ItemRecommendation>,
    /// Model that produced the draft
    pub model: String,
}
