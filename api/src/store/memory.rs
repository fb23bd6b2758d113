use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coach_core::analysis::{AnalysisResult, JobStatus};
use coach_core::grounding::GroundingDiagnostics;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{JobRecord, JobStore, NewJob, StoreError};

/// In-process job store mirroring the Postgres semantics.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
    diagnostics: RwLock<HashMap<Uuid, GroundingDiagnostics>>,
    fail_completions: bool,
}

impl MemoryJobStore {
    /// A store whose `complete` always errors, to exercise the persistence-failure path.
    pub fn failing_completions() -> Self {
        Self {
            fail_completions: true,
            ..Self::default()
        }
    }

    pub async fn get(&self, job_id: Uuid) -> Option<JobRecord> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn diagnostics(&self, job_id: Uuid) -> Option<GroundingDiagnostics> {
        self.diagnostics.read().await.get(&job_id).cloned()
    }

    async fn terminate(
        &self,
        job_id: Uuid,
        apply: impl FnOnce(&mut JobRecord),
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(StoreError::AlreadyTerminal(job_id));
        }
        apply(job);
        job.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        let record = JobRecord {
            id: job.id,
            owner_id: job.owner_id,
            status: JobStatus::Processing,
            input: job.input,
            result: None,
            error: None,
            created_at: job.created_at,
            completed_at: None,
        };
        jobs.insert(job.id, record.clone());
        Ok(record)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        result: &AnalysisResult,
        diagnostics: &GroundingDiagnostics,
    ) -> Result<(), StoreError> {
        if self.fail_completions {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.terminate(job_id, |job| {
            job.status = JobStatus::Completed;
            job.result = Some(result.clone());
        })
        .await?;
        self.diagnostics
            .write()
            .await
            .insert(job_id, diagnostics.clone());
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<(), StoreError> {
        self.terminate(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
        })
        .await
    }

    async fn find(&self, owner_id: Uuid, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .jobs
            .read()
            .await
            .get(&job_id)
            .filter(|job| job.owner_id == owner_id)
            .cloned())
    }

    async fn stale_processing(&self, created_before: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut stale: Vec<&JobRecord> = jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing && job.created_at < created_before)
            .collect();
        stale.sort_by_key(|job| job.created_at);
        Ok(stale.into_iter().map(|job| job.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use coach_core::analysis::{AnalysisMode, AnalysisRequest, EvidencePayload, JobStatus};
    use uuid::Uuid;

    use super::MemoryJobStore;
    use crate::store::{JobStore, NewJob, StoreError};

    fn new_job(owner_id: Uuid) -> NewJob {
        NewJob {
            id: Uuid::now_v7(),
            owner_id,
            input: AnalysisRequest {
                subject_id: 1,
                mode: AnalysisMode::Match,
                time_window: None,
                evidence: EvidencePayload {
                    match_id: "NA1_1".to_string(),
                    timeline: None,
                    frames: Vec::new(),
                },
                freeform_question: None,
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn terminal_states_are_immutable() {
        let store = MemoryJobStore::default();
        let job = store.create(new_job(Uuid::now_v7())).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);

        store.fail(job.id, "boom").await.unwrap();
        let err = store.fail(job.id, "again").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyTerminal(_)));
        assert_eq!(store.get(job.id).await.unwrap().error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn stale_processing_lists_only_old_unfinished_jobs() {
        let store = MemoryJobStore::default();
        let owner = Uuid::now_v7();
        let now = Utc::now();

        let mut oldest = new_job(owner);
        oldest.created_at = now - Duration::minutes(30);
        let mut old = new_job(owner);
        old.created_at = now - Duration::minutes(10);
        let mut old_finished = new_job(owner);
        old_finished.created_at = now - Duration::minutes(20);
        let fresh = new_job(owner);

        for job in [&old, &oldest, &old_finished, &fresh] {
            store.create(job.clone()).await.unwrap();
        }
        store.fail(old_finished.id, "boom").await.unwrap();

        let stale = store
            .stale_processing(now - Duration::minutes(3))
            .await
            .unwrap();
        assert_eq!(stale, vec![oldest.id, old.id]);
    }

    #[tokio::test]
    async fn ids_are_never_reused_and_reads_are_owner_scoped() {
        let store = MemoryJobStore::default();
        let owner = Uuid::now_v7();
        let job = new_job(owner);
        store.create(job.clone()).await.unwrap();
        assert!(matches!(
            store.create(job.clone()).await,
            Err(StoreError::Duplicate(_))
        ));
        assert!(store.find(owner, job.id).await.unwrap().is_some());
        assert!(store.find(Uuid::now_v7(), job.id).await.unwrap().is_none());
    }
}
