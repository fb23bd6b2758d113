use std::time::Duration;

use coach_core::grounding::DEFAULT_TOLERANCE_MS;
use coach_core::quota::{DEFAULT_PREMIUM_DAILY_CAP, QuotaLimits};
use coach_core::truth::DEFAULT_MAX_TRUTH_EVENTS;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MODEL_API_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL_ORDER: &str = "gemini-2.5-flash,gemini-2.0-flash";
const DEFAULT_MODEL_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_MODEL_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_JOB_DEADLINE_SECS: u64 = 180;
const DEFAULT_FREE_STARTING_CREDITS: i64 = 0;
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000";
const DEFAULT_TIMELINE_API_BASE_URL: &str = "https://europe.api.riotgames.com";
const DEFAULT_TIMELINE_CACHE_TTL_SECS: i64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub model: ModelConfig,
    pub analysis: AnalysisConfig,
    pub timeline: TimelineConfig,
    pub item_catalog_path: Option<String>,
    pub cors_origins: Vec<String>,
}

#[derive(Clone)]
pub struct ModelConfig {
    pub api_base_url: String,
    /// Platform-owned provider key used when the caller does not bring one.
    pub platform_api_key: Option<String>,
    pub order: Vec<String>,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("api_base_url", &self.api_base_url)
            .field(
                "platform_api_key",
                &self.platform_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("order", &self.order)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base", &self.backoff_base)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub limits: QuotaLimits,
    pub job_deadline: Duration,
    pub tolerance_ms: i64,
    pub max_truth_events: usize,
    /// Credits granted to an account row created on first use.
    pub free_starting_credits: i64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            limits: QuotaLimits::default(),
            job_deadline: Duration::from_secs(DEFAULT_JOB_DEADLINE_SECS),
            tolerance_ms: DEFAULT_TOLERANCE_MS,
            max_truth_events: DEFAULT_MAX_TRUTH_EVENTS,
            free_starting_credits: DEFAULT_FREE_STARTING_CREDITS,
        }
    }
}

#[derive(Clone)]
pub struct TimelineConfig {
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub cache_ttl_secs: i64,
}

impl std::fmt::Debug for TimelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineConfig")
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("cache_ttl_secs", &self.cache_ttl_secs)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source so tests never touch process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let database_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let order = parse_list(
            &var("MODEL_ORDER").unwrap_or_else(|| DEFAULT_MODEL_ORDER.to_string()),
        );
        if order.is_empty() {
            return Err(ConfigError::Invalid {
                name: "MODEL_ORDER",
                value: var("MODEL_ORDER").unwrap_or_default(),
                reason: "at least one model id is required".to_string(),
            });
        }

        let max_attempts: u32 =
            parse_var(&var, "MODEL_MAX_ATTEMPTS", DEFAULT_MODEL_MAX_ATTEMPTS)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "MODEL_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let premium_daily_cap: i32 =
            parse_var(&var, "PREMIUM_DAILY_CAP", DEFAULT_PREMIUM_DAILY_CAP)?;
        let tolerance_ms: i64 = parse_var(&var, "GROUNDING_TOLERANCE_MS", DEFAULT_TOLERANCE_MS)?;
        if tolerance_ms <= 0 {
            return Err(ConfigError::Invalid {
                name: "GROUNDING_TOLERANCE_MS",
                value: tolerance_ms.to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            database_url,
            port: parse_var(&var, "PORT", DEFAULT_PORT)?,
            model: ModelConfig {
                api_base_url: var("MODEL_API_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_MODEL_API_BASE_URL.to_string()),
                platform_api_key: var("MODEL_API_KEY"),
                order,
                max_attempts,
                backoff_base: Duration::from_millis(parse_var(
                    &var,
                    "MODEL_BACKOFF_BASE_MS",
                    DEFAULT_MODEL_BACKOFF_BASE_MS,
                )?),
            },
            analysis: AnalysisConfig {
                limits: QuotaLimits { premium_daily_cap },
                job_deadline: Duration::from_secs(parse_var(
                    &var,
                    "JOB_DEADLINE_SECS",
                    DEFAULT_JOB_DEADLINE_SECS,
                )?),
                tolerance_ms,
                max_truth_events: parse_var(&var, "MAX_TRUTH_EVENTS", DEFAULT_MAX_TRUTH_EVENTS)?,
                free_starting_credits: parse_var(
                    &var,
                    "FREE_STARTING_CREDITS",
                    DEFAULT_FREE_STARTING_CREDITS,
                )?,
            },
            timeline: TimelineConfig {
                api_base_url: var("TIMELINE_API_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_TIMELINE_API_BASE_URL.to_string()),
                api_key: var("TIMELINE_API_KEY"),
                cache_ttl_secs: parse_var(
                    &var,
                    "TIMELINE_CACHE_TTL_SECS",
                    DEFAULT_TIMELINE_CACHE_TTL_SECS,
                )?,
            },
            item_catalog_path: var("ITEM_CATALOG_PATH"),
            cors_origins: parse_list(
                &var("CORS_ORIGINS").unwrap_or_else(|| DEFAULT_CORS_ORIGINS.to_string()),
            ),
        })
    }
}

fn parse_var<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|err| ConfigError::Invalid {
            name,
            value: raw,
            reason: err.to_string(),
        }),
    }
}

/// Comma-separated, trimmed, first occurrence wins.
fn parse_list(raw: &str) -> Vec<String> {
    let mut out = Vec::<String>::new();
    for item in raw.split(',') {
        let entry = item.trim();
        if entry.is_empty() || out.iter().any(|existing| existing == entry) {
            continue;
        }
        out.push(entry.to_string());
    }
    out
}
