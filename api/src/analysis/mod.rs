pub mod prompt;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use coach_core::analysis::{
    AnalysisMode, AnalysisRequest, AnalysisResult, JobStatus, draft_response_schema,
};
use coach_core::grounding::{self, GroundingDiagnostics, ItemCatalog};
use coach_core::quota::{
    AccountTier, Availability, ChargePolicy, DebitReceipt, DenialReason, QuotaAccount,
    QuotaLimits, check_availability,
};
use coach_core::truth::{self, WindowSelection};
use uuid::Uuid;

use crate::config::AnalysisConfig;
use crate::gateway::{GatewayError, GenerationRequest, ModelGateway, ProviderCredentials};
use crate::ledger::{LedgerError, QuotaLedger};
use crate::store::{JobRecord, JobStore, NewJob, StoreError};
use crate::timeline::{TimelineError, TimelineSource};

/// Errors returned synchronously from Submit. None of them leave a job behind.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("quota exhausted: {0}")]
    QuotaExhausted(DenialReason),
    #[error("this account requires a caller-supplied provider key")]
    AuthRequired,
    #[error("no platform provider key is configured")]
    NoPlatformCredentials,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures inside the background worker. Recorded on the job, never returned to a caller.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("debit failed: {0}")]
    Debit(#[source] LedgerError),
    #[error("timeline unavailable: {0}")]
    Timeline(#[from] TimelineError),
    #[error(transparent)]
    Generation(#[from] GatewayError),
    #[error("persisting result failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("job exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
    #[error("analysis worker crashed")]
    Crashed,
}

impl JobError {
    /// Short, stable reason stored on the job and shown to the user.
    pub fn public_message(&self) -> String {
        match self {
            JobError::Debit(LedgerError::Quota(err)) => format!("quota_exhausted: {err}"),
            JobError::Debit(_) => "internal_error: could not reserve analysis quota".to_string(),
            JobError::Timeline(TimelineError::NotFound(match_id)) => {
                format!("timeline_unavailable: no timeline for match {match_id}")
            }
            JobError::Timeline(_) => {
                "timeline_unavailable: match timeline could not be retrieved".to_string()
            }
            JobError::Generation(GatewayError::NoModelsConfigured) => {
                "all_models_failed: no models configured".to_string()
            }
            JobError::Generation(GatewayError::AllModelsFailed { failures }) => format!(
                "all_models_failed: {} model(s) failed to produce a valid analysis",
                failures.len()
            ),
            JobError::Persistence(_) => "internal_error: result could not be saved".to_string(),
            JobError::DeadlineExceeded(deadline) => format!(
                "deadline_exceeded: analysis did not finish within {}s",
                deadline.as_secs()
            ),
            JobError::Crashed => "internal_error: analysis worker crashed".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PipelineOutput {
    result: AnalysisResult,
    diagnostics: GroundingDiagnostics,
}

/// The worker's debit, if it made one, and how the pipeline ended.
struct WorkerOutcome {
    receipt: Option<DebitReceipt>,
    result: Result<PipelineOutput, JobError>,
}

/// How a failed job gets its quota back.
enum Compensation {
    /// The worker returned its receipt (or never debited).
    Receipt(Option<DebitReceipt>),
    /// The worker is gone; refund whatever credit is still outstanding for the job.
    ByJobId,
}

/// Everything the worker needs, resolved once at submit.
struct AcceptedJob {
    id: Uuid,
    owner_id: Uuid,
    request: AnalysisRequest,
    credentials: ProviderCredentials,
    policy: ChargePolicy,
}

#[derive(Clone)]
pub struct AnalysisService {
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn QuotaLedger>,
    gateway: Arc<ModelGateway>,
    timelines: Arc<dyn TimelineSource>,
    catalog: Arc<ItemCatalog>,
    settings: Arc<AnalysisSettings>,
}

pub struct AnalysisSettings {
    pub analysis: AnalysisConfig,
    pub model_order: Vec<String>,
    pub platform_api_key: Option<String>,
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

impl AnalysisService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        ledger: Arc<dyn QuotaLedger>,
        gateway: Arc<ModelGateway>,
        timelines: Arc<dyn TimelineSource>,
        catalog: Arc<ItemCatalog>,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            jobs,
            ledger,
            gateway,
            timelines,
            catalog,
            settings: Arc::new(settings),
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.settings.analysis.limits
    }

    /// Check availability, persist the job as `processing` and hand it to a detached
    /// supervisor. Returns without waiting for any analysis work.
    pub async fn submit(
        &self,
        owner_id: Uuid,
        request: AnalysisRequest,
        caller_key: Option<String>,
    ) -> Result<SubmittedJob, SubmitError> {
        let account = self.ledger.account(owner_id).await?;
        let caller_supplied = caller_key.is_some();

        if account.tier == AccountTier::BringOwnKey && !caller_supplied {
            return Err(SubmitError::AuthRequired);
        }
        if let Availability::Denied(reason) =
            check_availability(&account, today(), &self.limits(), caller_supplied)
        {
            tracing::info!(owner_id = %owner_id, reason = %reason, "analysis submission denied");
            return Err(SubmitError::QuotaExhausted(reason));
        }

        let credentials = match caller_key {
            Some(key) => ProviderCredentials::caller(key),
            None => self
                .settings
                .platform_api_key
                .clone()
                .map(ProviderCredentials::platform)
                .ok_or(SubmitError::NoPlatformCredentials)?,
        };
        let policy = ChargePolicy::resolve(account.tier, caller_supplied);

        let record = self
            .jobs
            .create(NewJob {
                id: Uuid::now_v7(),
                owner_id,
                input: request.clone(),
                created_at: Utc::now(),
            })
            .await?;

        tracing::info!(
            job_id = %record.id,
            owner_id = %owner_id,
            tier = account.tier.as_str(),
            charge = ?policy,
            credentials = ?credentials.source(),
            "analysis job accepted"
        );

        tokio::spawn(self.clone().supervise(AcceptedJob {
            id: record.id,
            owner_id,
            request,
            credentials,
            policy,
        }));

        Ok(SubmittedJob {
            job_id: record.id,
            status: record.status,
            created_at: record.created_at,
        })
    }

    /// Read-only; never mutates job state.
    pub async fn poll(&self, owner_id: Uuid, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        self.jobs.find(owner_id, job_id).await
    }

    pub async fn account(&self, owner_id: Uuid) -> Result<QuotaAccount, LedgerError> {
        self.ledger.account(owner_id).await
    }

    /// Fail jobs left in `processing` past their deadline by a previous process and
    /// hand back any credit they still hold. Returns how many jobs were failed.
    pub async fn recover_stale_jobs(&self) -> Result<usize, StoreError> {
        let deadline = self.settings.analysis.job_deadline;
        let Some(cutoff) = chrono::Duration::from_std(deadline)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let mut recovered = 0;
        for job_id in self.jobs.stale_processing(cutoff).await? {
            let error = JobError::DeadlineExceeded(deadline);
            // Fail first: a live worker may still complete, and a completed job keeps its charge.
            match self.jobs.fail(job_id, &error.public_message()).await {
                Ok(()) => {}
                Err(StoreError::AlreadyTerminal(_)) => continue,
                Err(err) => return Err(err),
            }
            tracing::warn!(job_id = %job_id, error = %error, "stale analysis job failed");
            self.compensate(job_id, Compensation::ByJobId).await;
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!(recovered, "stale analysis jobs recovered");
        }
        Ok(recovered)
    }

    /// Owns one job from debit to terminal state. The deadline covers the debit too.
    async fn supervise(self, job: AcceptedJob) {
        let job_id = job.id;
        let deadline = self.settings.analysis.job_deadline;
        let mut worker = tokio::spawn(self.clone().charge_and_run(job));

        let WorkerOutcome { receipt, result } =
            match tokio::time::timeout(deadline, &mut worker).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(join_err)) => {
                    tracing::error!(job_id = %job_id, error = %join_err, "analysis worker task failed");
                    self.finish_failed(job_id, JobError::Crashed, Compensation::ByJobId)
                        .await;
                    return;
                }
                Err(_) => {
                    worker.abort();
                    // The receipt dies with the worker; wait so no debit lands after the refund.
                    let _ = worker.await;
                    self.finish_failed(
                        job_id,
                        JobError::DeadlineExceeded(deadline),
                        Compensation::ByJobId,
                    )
                    .await;
                    return;
                }
            };

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                self.finish_failed(job_id, err, Compensation::Receipt(receipt))
                    .await;
                return;
            }
        };

        match self
            .jobs
            .complete(job_id, &output.result, &output.diagnostics)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    job_id = %job_id,
                    model = %output.result.model,
                    insights = output.result.insights.len(),
                    items = output.result.item_recommendations.len(),
                    "analysis job completed"
                );
            }
            Err(StoreError::AlreadyTerminal(_)) => {
                tracing::warn!(job_id = %job_id, "job reached a terminal state elsewhere; result discarded");
            }
            Err(err) => {
                self.finish_failed(job_id, err.into(), Compensation::Receipt(receipt))
                    .await
            }
        }
    }

    /// Debit under the job's charge policy, then run the pipeline.
    async fn charge_and_run(self, job: AcceptedJob) -> WorkerOutcome {
        let receipt = match job.policy {
            ChargePolicy::Bypass => None,
            ChargePolicy::Charge => {
                match self
                    .ledger
                    .debit(job.owner_id, job.id, today(), &self.limits())
                    .await
                {
                    Ok(receipt) => {
                        tracing::debug!(
                            job_id = %job.id,
                            kind = receipt.kind().as_str(),
                            balance_after = receipt.balance_after(),
                            "quota debited"
                        );
                        Some(receipt)
                    }
                    Err(err) => {
                        return WorkerOutcome {
                            receipt: None,
                            result: Err(JobError::Debit(err)),
                        };
                    }
                }
            }
        };

        let result = self
            .run_pipeline(job.id, job.request, job.credentials)
            .await;
        WorkerOutcome { receipt, result }
    }

    /// Refund first (best effort), then record the failure.
    async fn finish_failed(&self, job_id: Uuid, error: JobError, compensation: Compensation) {
        tracing::warn!(job_id = %job_id, error = %error, "analysis job failed");

        self.compensate(job_id, compensation).await;

        match self.jobs.fail(job_id, &error.public_message()).await {
            Ok(()) => {}
            Err(StoreError::AlreadyTerminal(_)) => {
                tracing::warn!(job_id = %job_id, "job already terminal; failure not recorded");
            }
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "could not mark job failed");
            }
        }
    }

    async fn compensate(&self, job_id: Uuid, compensation: Compensation) {
        let refunded = match compensation {
            Compensation::Receipt(Some(receipt)) if receipt.is_refundable() => {
                self.ledger.refund(receipt).await.map(Some)
            }
            Compensation::Receipt(_) => Ok(None),
            Compensation::ByJobId => self.ledger.refund_outstanding(job_id).await,
        };

        match refunded {
            Ok(Some(balance)) => {
                tracing::info!(job_id = %job_id, balance, "credit refunded");
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "compensating refund failed");
            }
        }
    }

    /// Extract, generate, validate. Strictly sequential.
    async fn run_pipeline(
        self,
        job_id: Uuid,
        request: AnalysisRequest,
        credentials: ProviderCredentials,
    ) -> Result<PipelineOutput, JobError> {
        let timeline = match &request.evidence.timeline {
            Some(timeline) => timeline.clone(),
            None => {
                self.timelines
                    .fetch_timeline(&request.evidence.match_id)
                    .await?
            }
        };

        let window = request.time_window.map(WindowSelection::resolve);
        let analysis = &self.settings.analysis;
        let truth_events = truth::extract(
            &timeline,
            request.subject_id,
            window.as_ref(),
            analysis.max_truth_events,
        );
        tracing::debug!(job_id = %job_id, truth_events = truth_events.len(), "truth extracted");

        let attachments = match request.mode {
            AnalysisMode::Vod => request.evidence.frames.clone(),
            AnalysisMode::Match => Vec::new(),
        };
        let generation_request = GenerationRequest {
            prompt: prompt::build_prompt(
                &request,
                &truth_events,
                window.as_ref(),
                analysis.tolerance_ms,
            ),
            attachments,
            response_schema: draft_response_schema(),
        };

        let generation = self
            .gateway
            .generate(&generation_request, &self.settings.model_order, &credentials)
            .await?;

        let insights = grounding::filter_insights(
            generation.draft.insights,
            &truth_events,
            analysis.tolerance_ms,
        );
        let items = grounding::resolve_items(generation.draft.item_recommendations, &self.catalog);

        let diagnostics = GroundingDiagnostics {
            truth_events: truth_events.len(),
            dropped_insights: insights.dropped,
            dropped_items: items.dropped,
            model: generation.model.clone(),
            model_attempts: generation.attempts,
        };
        tracing::info!(
            job_id = %job_id,
            dropped_insights = diagnostics.dropped_insights,
            dropped_items = diagnostics.dropped_items,
            "grounding applied"
        );

        Ok(PipelineOutput {
            result: AnalysisResult {
                summary: generation.draft.summary,
                insights: insights.retained,
                item_recommendations: items.resolved,
                model: generation.model,
            },
            diagnostics,
        })
    }
}
