#[cfg(test)]
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coach_core::analysis::{AnalysisRequest, AnalysisResult, JobStatus};
use coach_core::grounding::GroundingDiagnostics;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job {0} already exists")]
    Duplicate(Uuid),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),
    #[error("stored job {job_id} is corrupt: {reason}")]
    Corrupt { job_id: Uuid, reason: String },
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub input: AnalysisRequest,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: JobStatus,
    pub input: AnalysisRequest,
    pub result: Option<AnalysisResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Sole writer of job records. Terminal writes are conditional on the job still
/// being `processing`, so Completed/Failed can never be overwritten.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job in `processing`. Ids are never reused.
    async fn create(&self, job: NewJob) -> Result<JobRecord, StoreError>;

    async fn complete(
        &self,
        job_id: Uuid,
        result: &AnalysisResult,
        diagnostics: &GroundingDiagnostics,
    ) -> Result<(), StoreError>;

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Read-only lookup scoped to the owning account.
    async fn find(&self, owner_id: Uuid, job_id: Uuid) -> Result<Option<JobRecord>, StoreError>;

    /// Ids of jobs still `processing` that were created before `created_before`,
    /// oldest first. Used to fail jobs whose worker died with the process.
    async fn stale_processing(&self, created_before: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;
}
