use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{BackendError, GenerationRequest, ModelBackend, ProviderCredentials};

const GENERATION_TEMPERATURE: f64 = 0.4;
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Backend for a generateContent-style JSON API (one instance per model id).
pub struct GenerativeHttpBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl GenerativeHttpBackend {
    pub fn new(client: reqwest::Client, base_url: &str, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

fn build_body(request: &GenerationRequest) -> serde_json::Value {
    let mut parts = vec![json!({ "text": request.prompt })];
    for frame in &request.attachments {
        parts.push(json!({
            "inline_data": {
                "mime_type": frame.mime_type,
                "data": frame.data_base64,
            }
        }));
    }

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "temperature": GENERATION_TEMPERATURE,
            "responseMimeType": "application/json",
            "responseSchema": request.response_schema,
        }
    })
}

fn truncate_body(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

/// Providers signal throttling either with 429 or with a quota status in the body.
fn is_rate_limit_signal(status: u16, body: &str) -> bool {
    if status == 429 {
        return true;
    }
    let lowered = body.to_lowercase();
    lowered.contains("resource_exhausted")
        || lowered.contains("resource exhausted")
        || lowered.contains("too many requests")
}

fn classify_failure(status: u16, body: &str, retry_after: Option<Duration>) -> BackendError {
    if is_rate_limit_signal(status, body) {
        BackendError::RateLimited {
            message: format!("status {status}: {}", truncate_body(body)),
            retry_after,
        }
    } else {
        BackendError::Status {
            status,
            message: truncate_body(body),
        }
    }
}

fn extract_candidate_text(body: &str) -> Result<String, BackendError> {
    let parsed: GenerateContentResponse = serde_json::from_str(body)
        .map_err(|err| BackendError::MalformedResponse(err.to_string()))?;

    let text: String = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(BackendError::MalformedResponse(
            "response contained no candidate text".to_string(),
        ));
    }
    Ok(text)
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl ModelBackend for GenerativeHttpBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        credentials: &ProviderCredentials,
    ) -> Result<String, BackendError> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", credentials.api_key())
            .json(&build_body(request))
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        if !status.is_success() {
            tracing::debug!(
                model = %self.model,
                status = %status,
                "model provider returned non-success status"
            );
            return Err(classify_failure(status.as_u16(), &body, retry_after));
        }

        extract_candidate_text(&body)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coach_core::analysis::{FrameAttachment, draft_response_schema};

    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "coach me".to_string(),
            attachments: vec![FrameAttachment {
                mime_type: "image/jpeg".to_string(),
                data_base64: "aGVsbG8=".to_string(),
                timestamp_ms: Some(1_000),
            }],
            response_schema: draft_response_schema(),
        }
    }

    #[test]
    fn classifies_rate_limit_signals() {
        assert!(classify_failure(429, "", None).is_rate_limited());
        assert!(
            classify_failure(400, r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#, None)
                .is_rate_limited()
        );
        assert!(classify_failure(503, "Too Many Requests", None).is_rate_limited());
        assert!(!classify_failure(500, "internal", None).is_rate_limited());
    }

    #[test]
    fn body_carries_prompt_attachments_and_schema() {
        let body = build_body(&request());
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], "coach me");
        assert_eq!(parts[1]["inline_data"]["mime_type"], "image/jpeg");
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert_eq!(body["generationConfig"]["responseSchema"]["type"], "OBJECT");
    }

    #[test]
    fn candidate_text_is_concatenated() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"{\"a\":"},{"text":"1}"}]}}]}"#;
        assert_eq!(extract_candidate_text(body).unwrap(), "{\"a\":1}");
        assert!(matches!(
            extract_candidate_text(r#"{"candidates":[]}"#),
            Err(BackendError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn returns_text_from_successful_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/test-model:generateContent")
            .match_header("x-goog-api-key", "caller-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"candidates":[{"content":{"parts":[{"text":"{}"}]}}]}"#)
            .create_async()
            .await;

        let backend = GenerativeHttpBackend::new(reqwest::Client::new(), &server.url(), "test-model");
        let text = backend
            .generate(&request(), &ProviderCredentials::caller("caller-key"))
            .await
            .unwrap();

        assert_eq!(text, "{}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn maps_429_with_retry_hint() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1beta/models/test-model:generateContent")
            .with_status(429)
            .with_header("retry-after", "7")
            .with_body("quota exceeded")
            .create_async()
            .await;

        let backend = GenerativeHttpBackend::new(reqwest::Client::new(), &server.url(), "test-model");
        let err = backend
            .generate(&request(), &ProviderCredentials::platform("k"))
            .await
            .unwrap_err();

        match err {
            BackendError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn maps_server_error_to_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1beta/models/test-model:generateContent")
            .with_status(500)
            .with_body("internal")
            .create_async()
            .await;

        let backend = GenerativeHttpBackend::new(reqwest::Client::new(), &server.url(), "test-model");
        let err = backend
            .generate(&request(), &ProviderCredentials::platform("k"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BackendError::Status {
                status: 500,
                message: "internal".to_string()
            }
        );
    }
}
