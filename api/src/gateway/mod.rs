pub mod http;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coach_core::analysis::{CoachingDraft, DraftError, FrameAttachment};

/// Where the provider key for one job came from. Resolved once at submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Platform,
    Caller,
}

#[derive(Clone)]
pub struct ProviderCredentials {
    api_key: String,
    source: CredentialSource,
}

impl ProviderCredentials {
    pub fn platform(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            source: CredentialSource::Platform,
        }
    }

    pub fn caller(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            source: CredentialSource::Caller,
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("api_key", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub attachments: Vec<FrameAttachment>,
    pub response_schema: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("provider returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Validation(#[from] DraftError),
}

impl BackendError {
    /// Only rate limiting is worth retrying on the same model; everything else
    /// advances to the next model in the order.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, BackendError::RateLimited { .. })
    }

    /// Provider's Retry-After hint. Logged only; backoff stays exponential.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BackendError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A single generative model endpoint.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn model_id(&self) -> &str;

    /// Returns the raw text the model produced; schema parsing happens in the gateway.
    async fn generate(
        &self,
        request: &GenerationRequest,
        credentials: &ProviderCredentials,
    ) -> Result<String, BackendError>;
}

/// Exponential backoff, `base * 2^(attempt-1)`, used for every retry the gateway makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFailure {
    pub model: String,
    pub attempts: u32,
    pub reason: String,
}

impl std::fmt::Display for ModelFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.model, self.attempts, self.reason
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("no models configured")]
    NoModelsConfigured,
    #[error("all models failed: {}", summarize_failures(.failures))]
    AllModelsFailed { failures: Vec<ModelFailure> },
}

fn summarize_failures(failures: &[ModelFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub draft: CoachingDraft,
    pub model: String,
    pub attempts: u32,
}

/// Stateless fan-out over ordered model backends with per-model retry.
/// Holds no job state, so one instance is shared by all workers.
pub struct ModelGateway {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
    retry: RetryPolicy,
}

impl ModelGateway {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            backends: HashMap::new(),
            retry,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backends
            .insert(backend.model_id().to_string(), backend);
        self
    }

    /// Try each model in `model_order`, returning the first structurally valid draft.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        model_order: &[String],
        credentials: &ProviderCredentials,
    ) -> Result<Generation, GatewayError> {
        if model_order.is_empty() {
            return Err(GatewayError::NoModelsConfigured);
        }

        let mut failures = Vec::with_capacity(model_order.len());
        for model in model_order {
            let Some(backend) = self.backends.get(model) else {
                tracing::warn!(model = %model, "no backend registered for model; skipping");
                failures.push(ModelFailure {
                    model: model.clone(),
                    attempts: 0,
                    reason: "no backend registered".to_string(),
                });
                continue;
            };

            match self.attempt_model(backend.as_ref(), request, credentials).await {
                Ok((draft, attempts)) => {
                    tracing::info!(model = %model, attempts, "model produced a valid draft");
                    return Ok(Generation {
                        draft,
                        model: model.clone(),
                        attempts,
                    });
                }
                Err(failure) => {
                    tracing::warn!(
                        model = %failure.model,
                        attempts = failure.attempts,
                        reason = %failure.reason,
                        "model failed; advancing to next model"
                    );
                    failures.push(failure);
                }
            }
        }

        Err(GatewayError::AllModelsFailed { failures })
    }

    async fn attempt_model(
        &self,
        backend: &dyn ModelBackend,
        request: &GenerationRequest,
        credentials: &ProviderCredentials,
    ) -> Result<(CoachingDraft, u32), ModelFailure> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match backend.generate(request, credentials).await {
                Ok(raw) => CoachingDraft::parse(&raw).map_err(BackendError::from),
                Err(err) => Err(err),
            };

            match outcome {
                Ok(draft) => return Ok((draft, attempt)),
                Err(err) if err.is_rate_limited() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    tracing::warn!(
                        model = backend.model_id(),
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        retry_after_hint_ms = err.retry_after().map(|d| d.as_millis() as u64),
                        error = %err,
                        "model rate limited; backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    return Err(ModelFailure {
                        model: backend.model_id().to_string(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use coach_core::analysis::draft_response_schema;

    use super::testing::{ScriptedBackend, VALID_DRAFT, rate_limited};
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "coach me".to_string(),
            attachments: Vec::new(),
            response_schema: draft_response_schema(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::ZERO,
        }
    }

    fn order(models: &[&str]) -> Vec<String> {
        models.iter().map(|m| m.to_string()).collect()
    }

    #[test]
    fn backoff_is_exponential() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff_base: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn retries_rate_limits_then_falls_back() {
        let first = Arc::new(ScriptedBackend::new(
            "m1",
            vec![Err(rate_limited()), Err(rate_limited()), Err(rate_limited())],
        ));
        let second = Arc::new(ScriptedBackend::new("m2", vec![Ok(VALID_DRAFT.to_string())]));
        let gateway = ModelGateway::new(fast_policy())
            .with_backend(first.clone())
            .with_backend(second.clone());

        let generation = gateway
            .generate(&request(), &order(&["m1", "m2"]), &ProviderCredentials::platform("k"))
            .await
            .expect("second model should succeed");

        assert_eq!(generation.model, "m2");
        assert_eq!(generation.attempts, 1);
        assert_eq!(first.calls(), 3);
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test]
    async fn non_rate_limit_errors_advance_immediately() {
        let first = Arc::new(ScriptedBackend::new(
            "m1",
            vec![Ok("not json at all".to_string())],
        ));
        let second = Arc::new(ScriptedBackend::new("m2", vec![Ok(VALID_DRAFT.to_string())]));
        let gateway = ModelGateway::new(fast_policy())
            .with_backend(first.clone())
            .with_backend(second.clone());

        gateway
            .generate(&request(), &order(&["m1", "m2"]), &ProviderCredentials::platform("k"))
            .await
            .unwrap();
        assert_eq!(first.calls(), 1);
    }

    #[tokio::test]
    async fn first_success_short_circuits() {
        let first = Arc::new(ScriptedBackend::new("m1", vec![Ok(VALID_DRAFT.to_string())]));
        let second = Arc::new(ScriptedBackend::new("m2", vec![Ok(VALID_DRAFT.to_string())]));
        let gateway = ModelGateway::new(fast_policy())
            .with_backend(first.clone())
            .with_backend(second.clone());

        let generation = gateway
            .generate(&request(), &order(&["m1", "m2"]), &ProviderCredentials::platform("k"))
            .await
            .unwrap();
        assert_eq!(generation.model, "m1");
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn exhausting_every_model_aggregates_failures() {
        let first = Arc::new(ScriptedBackend::new("m1", vec![Err(rate_limited())]));
        let second = Arc::new(ScriptedBackend::new(
            "m2",
            vec![Err(BackendError::Status {
                status: 500,
                message: "boom".to_string(),
            })],
        ));
        let gateway = ModelGateway::new(fast_policy())
            .with_backend(first)
            .with_backend(second);

        let err = gateway
            .generate(
                &request(),
                &order(&["m1", "m2", "unregistered"]),
                &ProviderCredentials::platform("k"),
            )
            .await
            .expect_err("every model fails");

        match &err {
            GatewayError::AllModelsFailed { failures } => {
                assert_eq!(failures.len(), 3);
                assert_eq!(failures[0].attempts, 3);
                assert_eq!(failures[1].attempts, 1);
                assert_eq!(failures[2].attempts, 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let rendered = err.to_string();
        assert!(rendered.contains("m1 after 3 attempt(s): rate limited"));
        assert!(rendered.contains("m2 after 1 attempt(s): provider returned status 500"));
    }

    #[tokio::test]
    async fn empty_order_is_rejected() {
        let gateway = ModelGateway::new(fast_policy());
        let err = gateway
            .generate(&request(), &[], &ProviderCredentials::platform("k"))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::NoModelsConfigured);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let rendered = format!("{:?}", ProviderCredentials::caller("sk-live-123"));
        assert!(!rendered.contains("sk-live-123"));
        assert!(rendered.contains("Caller"));
    }
}
