use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coach_core::analysis::{AnalysisRequest, AnalysisResult, JobStatus};
use coach_core::grounding::GroundingDiagnostics;
use sqlx::PgPool;
use uuid::Uuid;

use super::{JobRecord, JobStore, NewJob, StoreError};

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinguish "no such job" from "already terminal" after a conditional update
    /// touched zero rows.
    async fn explain_missed_update(&self, job_id: Uuid) -> StoreError {
        match sqlx::query_scalar::<_, String>("SELECT status FROM analysis_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(_)) => StoreError::AlreadyTerminal(job_id),
            Ok(None) => StoreError::NotFound(job_id),
            Err(err) => StoreError::Database(err),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AnalysisJobRow {
    id: Uuid,
    owner_id: Uuid,
    status: String,
    input: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl AnalysisJobRow {
    fn into_record(self) -> Result<JobRecord, StoreError> {
        let status = JobStatus::parse(&self.status).ok_or_else(|| StoreError::Corrupt {
            job_id: self.id,
            reason: format!("unknown status '{}'", self.status),
        })?;
        let input: AnalysisRequest = serde_json::from_value(self.input)?;
        let result: Option<AnalysisResult> = self.result.map(serde_json::from_value).transpose()?;

        Ok(JobRecord {
            id: self.id,
            owner_id: self.owner_id,
            status,
            input,
            result,
            error: self.error,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let input = serde_json::to_value(&job.input)?;

        let row = sqlx::query_as::<_, AnalysisJobRow>(
            r#"
            INSERT INTO analysis_jobs (id, owner_id, status, input, created_at)
            VALUES ($1, $2, 'processing', $3, $4)
            ON CONFLICT (id) DO NOTHING
            RETURNING id, owner_id, status, input, result, error, created_at, completed_at
            "#,
        )
        .bind(job.id)
        .bind(job.owner_id)
        .bind(&input)
        .bind(job.created_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_record(),
            None => Err(StoreError::Duplicate(job.id)),
        }
    }

    async fn complete(
        &self,
        job_id: Uuid,
        result: &AnalysisResult,
        diagnostics: &GroundingDiagnostics,
    ) -> Result<(), StoreError> {
        let result = serde_json::to_value(result)?;
        let diagnostics = serde_json::to_value(diagnostics)?;

        let updated = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'completed',
                result = $2,
                diagnostics = $3,
                completed_at = NOW()
            WHERE id = $1
              AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(&result)
        .bind(&diagnostics)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.explain_missed_update(job_id).await);
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = 'failed',
                error = $2,
                completed_at = NOW()
            WHERE id = $1
              AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.explain_missed_update(job_id).await);
        }
        Ok(())
    }

    async fn find(&self, owner_id: Uuid, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, AnalysisJobRow>(
            r#"
            SELECT id, owner_id, status, input, result, error, created_at, completed_at
            FROM analysis_jobs
            WHERE id = $1
              AND owner_id = $2
            "#,
        )
        .bind(job_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AnalysisJobRow::into_record).transpose()
    }

    async fn stale_processing(&self, created_before: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM analysis_jobs
            WHERE status = 'processing'
              AND created_at < $1
            ORDER BY created_at
            "#,
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
