use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use coach_core::truth::Timeline;
use serde::Deserialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimelineError {
    #[error("timeline provider is not configured")]
    NotConfigured,
    #[error("match {0} has no timeline")]
    NotFound(String),
    #[error("timeline provider rate limited the request")]
    RateLimited,
    #[error("timeline provider error: {0}")]
    Upstream(String),
    #[error("timeline payload is malformed: {0}")]
    Malformed(String),
}

/// Source of verified match timelines.
#[async_trait]
pub trait TimelineSource: Send + Sync {
    async fn fetch_timeline(&self, match_id: &str) -> Result<Timeline, TimelineError>;
}

#[derive(Debug, Deserialize)]
struct TimelineEnvelope {
    info: Timeline,
}

struct CachedTimeline {
    timeline: Timeline,
    fetched_at: DateTime<Utc>,
}

/// Fetches `/lol/match/v5/matches/{id}/timeline` and caches results for `ttl`.
/// Finished matches never change, so a short TTL only bounds memory.
pub struct HttpTimelineSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    ttl: ChronoDuration,
    cache: Arc<RwLock<HashMap<String, CachedTimeline>>>,
}

impl HttpTimelineSource {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
        ttl_secs: i64,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            ttl: ChronoDuration::seconds(ttl_secs),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// `{base}/lol/match/v5/matches/{match_id}/timeline`, with `match_id` encoded as a
    /// single path segment.
    fn timeline_url(&self, match_id: &str) -> Result<url::Url, TimelineError> {
        let mut url = url::Url::parse(&self.base_url)
            .map_err(|err| TimelineError::Upstream(format!("invalid base url: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| TimelineError::Upstream("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(["lol", "match", "v5", "matches", match_id, "timeline"]);
        Ok(url)
    }

    async fn cached(&self, match_id: &str, now: DateTime<Utc>) -> Option<Timeline> {
        let read = self.cache.read().await;
        read.get(match_id)
            .filter(|entry| now - entry.fetched_at <= self.ttl)
            .map(|entry| entry.timeline.clone())
    }

    async fn store(&self, match_id: &str, timeline: &Timeline, now: DateTime<Utc>) {
        let mut write = self.cache.write().await;
        write.retain(|_, entry| now - entry.fetched_at <= self.ttl);
        write.insert(
            match_id.to_string(),
            CachedTimeline {
                timeline: timeline.clone(),
                fetched_at: now,
            },
        );
    }
}

#[async_trait]
impl TimelineSource for HttpTimelineSource {
    async fn fetch_timeline(&self, match_id: &str) -> Result<Timeline, TimelineError> {
        let now = Utc::now();
        if let Some(timeline) = self.cached(match_id, now).await {
            tracing::debug!(match_id, "timeline cache hit");
            return Ok(timeline);
        }

        let api_key = self.api_key.as_deref().ok_or(TimelineError::NotConfigured)?;
        let response = self
            .client
            .get(self.timeline_url(match_id)?)
            .header("X-Riot-Token", api_key)
            .send()
            .await
            .map_err(|err| TimelineError::Upstream(err.to_string()))?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => {}
            404 => return Err(TimelineError::NotFound(match_id.to_string())),
            429 => return Err(TimelineError::RateLimited),
            code => return Err(TimelineError::Upstream(format!("status {code}"))),
        }

        let envelope: TimelineEnvelope = response
            .json()
            .await
            .map_err(|err| TimelineError::Malformed(err.to_string()))?;

        self.store(match_id, &envelope.info, now).await;
        Ok(envelope.info)
    }
}
