//! Job store: the engine's view of durable job state.
//!
//! Wraps a [`JobRepository`] with validation, security-profile resolution
//! and retry decisions. Every state change goes through the repository's
//! atomic paths; the store itself holds no mutable job state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::retry::{RetryController, RetryDecision};
use crate::database::models::{JobDbModel, NewJobAttempt};
use crate::database::repositories::{
    AttemptTransition, CancelResult, ClaimRequest, InsertOutcome, JobRepository, StatusCounts,
};
use crate::database::time::{datetime_to_ms, ms_after, ms_to_datetime, now_ms};
use crate::domain::{AttemptOutcome, ExecutionAttempt, Job, JobSpec, JobStatus, SecurityPolicy};
use crate::{Error, Result};

/// Bound on the number of waiting jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// PENDING jobs above which new enqueues are rejected.
    pub max_pending: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_pending: 1000 }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_pending == 0 {
            return Err(Error::config("queue.max_pending must be positive"));
        }
        Ok(())
    }
}

/// Result of [`JobStore::enqueue`].
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Enqueued(Job),
    /// An equivalent job is already pending or running; nothing was stored.
    Duplicate(String),
    /// Too many jobs are waiting; nothing was stored.
    QueueFull { pending: u64, max_pending: u64 },
}

impl EnqueueOutcome {
    /// The new or already active job, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Enqueued(job) => Some(&job.id),
            Self::Duplicate(id) => Some(id),
            Self::QueueFull { .. } => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}

/// Snapshot of job counts, from [`JobStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub max_pending: Option<u64>,
}

/// Result of [`JobStore::record_attempt`].
#[derive(Debug, Clone)]
pub struct RecordedAttempt {
    pub job: Job,
    pub decision: RetryDecision,
    /// The attempt moved the job into a terminal state.
    pub became_terminal: bool,
}

/// Result of [`JobStore::cancel`].
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Cancelled { job: Job, was_running: bool },
    AlreadyTerminal(Job),
}

pub struct JobStore {
    repo: Arc<dyn JobRepository>,
    retry: RetryController,
    policy: SecurityPolicy,
    max_pending: Option<u64>,
    notify: Arc<Notify>,
}

impl JobStore {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        retry: RetryController,
        policy: SecurityPolicy,
    ) -> Self {
        Self {
            repo,
            retry,
            policy,
            max_pending: None,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Reject enqueues once `config.max_pending` jobs are waiting.
    pub fn with_queue_config(mut self, config: &QueueConfig) -> Self {
        self.max_pending = Some(config.max_pending);
        self
    }

    pub fn retry_controller(&self) -> &RetryController {
        &self.retry
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Signalled whenever a job is enqueued.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Store a new PENDING job, unless an equivalent one is still active.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueOutcome> {
        spec.validate()?;

        let max_attempts = spec
            .max_attempts
            .unwrap_or(self.retry.config().max_attempts)
            .max(1);
        let profile = self.policy.resolve(&spec.repository, spec.security_profile);
        let now = now_ms();
        let row = JobDbModel {
            id: uuid::Uuid::new_v4().to_string(),
            repository: spec.repository,
            git_ref: spec.git_ref,
            kind: spec.kind.to_string(),
            payload: serde_json::to_string(&spec.payload)?,
            security_profile: profile.as_str().to_string(),
            priority: spec.priority.value(),
            status: JobStatus::Pending.as_str().to_string(),
            attempt_count: 0,
            max_attempts: i64::from(max_attempts),
            next_run_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        match self.repo.insert_job(&row, self.max_pending).await? {
            InsertOutcome::Inserted(row) => {
                let job = Job::try_from(row)?;
                info!(
                    job_id = %job.id,
                    repository = %job.repository,
                    git_ref = %job.git_ref,
                    kind = %job.kind,
                    profile = %job.security_profile,
                    "Job enqueued"
                );
                self.notify.notify_one();
                Ok(EnqueueOutcome::Enqueued(job))
            }
            InsertOutcome::Duplicate(existing) => {
                debug!(
                    job_id = %existing,
                    repository = %row.repository,
                    git_ref = %row.git_ref,
                    "Duplicate enqueue ignored"
                );
                Ok(EnqueueOutcome::Duplicate(existing))
            }
            InsertOutcome::QueueFull { pending } => {
                let max_pending = self.max_pending.unwrap_or(pending);
                warn!(
                    repository = %row.repository,
                    git_ref = %row.git_ref,
                    pending,
                    max_pending,
                    "Job queue full, rejecting job"
                );
                Ok(EnqueueOutcome::QueueFull {
                    pending,
                    max_pending,
                })
            }
        }
    }

    /// Job counts per status.
    pub async fn stats(&self) -> Result<QueueStats> {
        let StatusCounts {
            pending,
            running,
            succeeded,
            failed,
            cancelled,
        } = self.repo.count_by_status().await?;
        Ok(QueueStats {
            pending,
            running,
            succeeded,
            failed,
            cancelled,
            max_pending: self.max_pending,
        })
    }

    /// When the next claimable PENDING job that is not yet due becomes due.
    pub async fn next_due_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let after_ms = datetime_to_ms(after);
        Ok(self.repo.next_due_after(after_ms).await?.map(ms_to_datetime))
    }

    /// Atomically claim due jobs; each returned job is now RUNNING and
    /// owned by the caller.
    pub async fn claim_next(&self, request: &ClaimRequest) -> Result<Vec<Job>> {
        let rows = self.repo.claim_due(request).await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            let next_attempt = row.attempt_count.saturating_add(1);
            match Job::try_from(row) {
                Ok(job) => jobs.push(job),
                Err(e) => self.fail_unreadable(&id, next_attempt, e).await,
            }
        }
        Ok(jobs)
    }

    /// A claimed row that cannot be decoded would otherwise stay RUNNING
    /// forever.
    async fn fail_unreadable(&self, job_id: &str, attempt_number: i64, cause: Error) {
        error!(job_id, "Claimed job is unreadable: {}", cause);
        let attempt = ExecutionAttempt::new(
            u32::try_from(attempt_number).unwrap_or(1),
            AttemptOutcome::failure(format!("unreadable job: {cause}")),
        );
        let result = async {
            let new = NewJobAttempt::from_attempt(job_id, &attempt)?;
            self.repo
                .finish_attempt(
                    &new,
                    &AttemptTransition::Failed {
                        error: attempt.outcome.summary(),
                    },
                )
                .await
        }
        .await;
        if let Err(e) = result {
            error!(job_id, "Failed to mark unreadable job as failed: {}", e);
        }
    }

    /// Append `attempt` and move the job to the state the retry controller
    /// picks for its outcome.
    pub async fn record_attempt(
        &self,
        job_id: &str,
        attempt: ExecutionAttempt,
    ) -> Result<RecordedAttempt> {
        let job = Job::try_from(self.repo.get_job(job_id).await?)?;
        let decision = self
            .retry
            .decide(attempt.attempt_number, job.max_attempts, &attempt.outcome);
        let transition = match &decision {
            RetryDecision::Complete => AttemptTransition::Succeeded,
            RetryDecision::FailPermanently { reason } => AttemptTransition::Failed {
                error: reason.clone(),
            },
            RetryDecision::RetryAfter { delay, reason } => AttemptTransition::Retry {
                next_run_at: ms_after(datetime_to_ms(attempt.finished_at).max(now_ms()), *delay),
                error: reason.clone(),
            },
            RetryDecision::Cancel => AttemptTransition::Cancelled,
        };

        let new = NewJobAttempt::from_attempt(job_id, &attempt)?;
        let finished = self.repo.finish_attempt(&new, &transition).await?;
        let job = Job::try_from(finished.job)?;

        if !finished.transitioned {
            debug!(
                job_id,
                attempt = attempt.attempt_number,
                "Attempt recorded on a job cancelled while it ran"
            );
        }

        Ok(RecordedAttempt {
            became_terminal: finished.transitioned && job.status.is_terminal(),
            job,
            decision,
        })
    }

    /// Cancel a job unless it already finished.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        Ok(match self.repo.cancel_job(job_id).await? {
            CancelResult::Cancelled { job, was_running } => {
                let job = Job::try_from(job)?;
                info!(job_id, was_running, "Job cancelled");
                CancelOutcome::Cancelled { job, was_running }
            }
            CancelResult::AlreadyTerminal(job) => {
                CancelOutcome::AlreadyTerminal(Job::try_from(job)?)
            }
        })
    }

    /// Return a claimed job to PENDING without counting an attempt.
    pub async fn release(&self, job_id: &str) -> Result<bool> {
        self.repo.release_job(job_id).await
    }

    /// Return jobs left RUNNING by a previous process to PENDING. Call once
    /// at startup, before any scheduler claims.
    pub async fn recover_orphaned(&self) -> Result<u64> {
        let recovered = self.repo.reset_running_jobs().await?;
        if recovered > 0 {
            info!("Recovered {} jobs left running by a previous run", recovered);
        }
        Ok(recovered)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        Job::try_from(self.repo.get_job(job_id).await?)
    }

    pub async fn list_jobs(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.repo
            .list_jobs_by_status(status)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    pub async fn list_attempts(&self, job_id: &str) -> Result<Vec<ExecutionAttempt>> {
        self.repo
            .list_attempts(job_id)
            .await?
            .into_iter()
            .map(ExecutionAttempt::try_from)
            .collect()
    }

    /// Which of `job_ids` have been cancelled, possibly by another process.
    pub async fn cancelled_among(&self, job_ids: &[String]) -> Result<Vec<String>> {
        self.repo.cancelled_among(job_ids).await
    }

    /// Delete up to `batch_size` succeeded or cancelled jobs last updated
    /// before `older_than`. Failed jobs stay queryable.
    pub async fn purge_terminal(&self, older_than: DateTime<Utc>, batch_size: u32) -> Result<u64> {
        self.repo
            .purge_terminal(datetime_to_ms(older_than), batch_size)
            .await
    }
}
