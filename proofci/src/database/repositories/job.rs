//! Job repository.
//!
//! Every state change is a single statement or a `BEGIN IMMEDIATE`
//! transaction, so concurrent schedulers (in this or another process)
//! serialize on SQLite's write lock and never observe partial transitions.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::begin_immediate;
use crate::database::models::{JobAttemptDbModel, JobDbModel, NewJobAttempt};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::domain::JobStatus;
use crate::{Error, Result};

/// Claims a batch of due jobs.
#[derive(Debug, Clone, Default)]
pub struct ClaimRequest {
    /// Maximum number of jobs to claim.
    pub limit: usize,
    /// Maximum number of jobs claimed per repository in this batch.
    pub per_repository: usize,
    /// Repositories with no spare capacity; their jobs are skipped.
    pub exclude_repositories: Vec<String>,
}

/// Result of inserting a job.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(JobDbModel),
    /// An active job for the same (repository, ref, kind) exists.
    Duplicate(String),
    /// `pending` jobs are already waiting, at or above the bound.
    QueueFull { pending: u64 },
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Job update applied together with an attempt row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptTransition {
    Succeeded,
    Failed { error: String },
    /// Back to PENDING, claimable from `next_run_at`.
    Retry { next_run_at: i64, error: String },
    Cancelled,
}

impl AttemptTransition {
    pub fn target(&self) -> JobStatus {
        match self {
            Self::Succeeded => JobStatus::Succeeded,
            Self::Failed { .. } => JobStatus::Failed,
            Self::Retry { .. } => JobStatus::Pending,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Result of [`JobRepository::finish_attempt`].
#[derive(Debug, Clone)]
pub struct FinishedAttempt {
    /// Job row after the update.
    pub job: JobDbModel,
    /// False if the job had been cancelled while the attempt ran; the
    /// attempt was appended but the status left untouched.
    pub transitioned: bool,
}

/// Result of [`JobRepository::cancel_job`].
#[derive(Debug, Clone)]
pub enum CancelResult {
    Cancelled { job: JobDbModel, was_running: bool },
    AlreadyTerminal(JobDbModel),
}

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a PENDING job unless an equivalent one is active or
    /// `max_pending` jobs are already waiting.
    async fn insert_job(
        &self,
        job: &JobDbModel,
        max_pending: Option<u64>,
    ) -> Result<InsertOutcome>;
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>>;
    async fn count_by_status(&self) -> Result<StatusCounts>;
    /// Earliest `next_run_at` among claimable PENDING jobs.
    /// Earliest `next_run_at` of a claimable PENDING job strictly after
    /// `after_ms`.
    async fn next_due_after(&self, after_ms: i64) -> Result<Option<i64>>;
    /// Atomically move due PENDING jobs to RUNNING and return them.
    async fn claim_due(&self, request: &ClaimRequest) -> Result<Vec<JobDbModel>>;
    /// Append an attempt and apply `transition` in one transaction.
    async fn finish_attempt(
        &self,
        attempt: &NewJobAttempt,
        transition: &AttemptTransition,
    ) -> Result<FinishedAttempt>;
    async fn cancel_job(&self, id: &str) -> Result<CancelResult>;
    /// RUNNING -> PENDING without touching attempts or backoff.
    async fn release_job(&self, id: &str) -> Result<bool>;
    /// Return every RUNNING job to PENDING. Startup only.
    async fn reset_running_jobs(&self) -> Result<u64>;
    async fn cancelled_among(&self, ids: &[String]) -> Result<Vec<String>>;
    async fn list_attempts(&self, job_id: &str) -> Result<Vec<JobAttemptDbModel>>;
    /// Delete up to `batch_size` SUCCEEDED or CANCELLED jobs last updated
    /// before `older_than_ms`. FAILED jobs are kept.
    async fn purge_terminal(&self, older_than_ms: i64, batch_size: u32) -> Result<u64>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert_job_once(
        &self,
        job: &JobDbModel,
        max_pending: Option<u64>,
    ) -> Result<InsertOutcome> {
        let mut tx = begin_immediate(&self.pool).await?;

        // Under the write lock neither check can go stale before the insert.
        let existing: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM job
            WHERE repository = ? AND git_ref = ? AND kind = ?
              AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(&job.repository)
        .bind(&job.git_ref)
        .bind(&job.kind)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((id,)) = existing {
            tx.rollback().await?;
            return Ok(InsertOutcome::Duplicate(id));
        }

        if let Some(max_pending) = max_pending {
            let (pending,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM job WHERE status = 'PENDING'")
                    .fetch_one(&mut *tx)
                    .await?;
            let pending = u64::try_from(pending).unwrap_or(0);
            if pending >= max_pending {
                tx.rollback().await?;
                return Ok(InsertOutcome::QueueFull { pending });
            }
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO job (
                id, repository, git_ref, kind, payload, security_profile, priority,
                status, attempt_count, max_attempts, next_run_at, last_error,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(&job.repository)
        .bind(&job.git_ref)
        .bind(&job.kind)
        .bind(&job.payload)
        .bind(&job.security_profile)
        .bind(job.priority)
        .bind(&job.status)
        .bind(job.attempt_count)
        .bind(job.max_attempts)
        .bind(job.next_run_at)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted != 1 {
            tx.rollback().await?;
            return Err(Error::Database(format!("insert of job {} was ignored", job.id)));
        }
        tx.commit().await?;
        Ok(InsertOutcome::Inserted(job.clone()))
    }

    async fn claim_due_once(&self, request: &ClaimRequest) -> Result<Vec<JobDbModel>> {
        let now = now_ms();
        let excluded = serde_json::to_string(&request.exclude_repositories)?;
        let per_repository = i64::try_from(request.per_repository.max(1)).unwrap_or(i64::MAX);
        let limit = i64::try_from(request.limit).unwrap_or(i64::MAX);

        let mut tx = begin_immediate(&self.pool).await?;
        // The outer `status = 'PENDING'` makes the claim conditional: a job
        // already taken by another claimer is simply not returned.
        let mut claimed = sqlx::query_as::<_, JobDbModel>(
            r#"
            UPDATE job
            SET status = 'RUNNING', updated_at = ?
            WHERE status = 'PENDING'
              AND id IN (
                SELECT id FROM (
                    SELECT id, priority, next_run_at, created_at,
                           ROW_NUMBER() OVER (
                               PARTITION BY repository
                               ORDER BY priority DESC, next_run_at, created_at
                           ) AS repo_rank
                    FROM job
                    WHERE status = 'PENDING'
                      AND next_run_at <= ?
                      AND attempt_count < max_attempts
                      AND repository NOT IN (SELECT value FROM json_each(?))
                )
                WHERE repo_rank <= ?
                ORDER BY priority DESC, next_run_at, created_at
                LIMIT ?
              )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&excluded)
        .bind(per_repository)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        // RETURNING order is unspecified.
        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.next_run_at.cmp(&b.next_run_at))
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(claimed)
    }

    async fn finish_attempt_once(
        &self,
        attempt: &NewJobAttempt,
        transition: &AttemptTransition,
    ) -> Result<FinishedAttempt> {
        let mut tx = begin_immediate(&self.pool).await?;

        let current = sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(&attempt.job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("Job", &attempt.job_id))?;

        if current.attempt_count + 1 != attempt.attempt_number {
            return Err(Error::invalid_transition(
                format!("attempt {}", current.attempt_count),
                format!("attempt {}", attempt.attempt_number),
            ));
        }

        let transitioned = match current.status()? {
            JobStatus::Running => true,
            JobStatus::Cancelled => false,
            other => {
                return Err(Error::invalid_transition(
                    other.as_str(),
                    transition.target().as_str(),
                ));
            }
        };

        sqlx::query(
            r#"
            INSERT INTO job_attempt (
                job_id, attempt_number, started_at, finished_at,
                outcome, detail, resource_usage, output
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attempt.job_id)
        .bind(attempt.attempt_number)
        .bind(attempt.started_at)
        .bind(attempt.finished_at)
        .bind(&attempt.outcome)
        .bind(&attempt.detail)
        .bind(&attempt.resource_usage)
        .bind(&attempt.output)
        .execute(&mut *tx)
        .await?;

        let now = now_ms();
        if transitioned {
            let (next_run_at, last_error) = match transition {
                AttemptTransition::Succeeded => (current.next_run_at, None),
                AttemptTransition::Failed { error } => (current.next_run_at, Some(error.as_str())),
                AttemptTransition::Retry { next_run_at, error } => {
                    (*next_run_at, Some(error.as_str()))
                }
                AttemptTransition::Cancelled => (current.next_run_at, Some("cancelled")),
            };
            sqlx::query(
                r#"
                UPDATE job SET
                    status = ?,
                    attempt_count = attempt_count + 1,
                    next_run_at = ?,
                    last_error = ?,
                    updated_at = ?
                WHERE id = ? AND status = 'RUNNING'
                "#,
            )
            .bind(transition.target().as_str())
            .bind(next_run_at)
            .bind(last_error)
            .bind(now)
            .bind(&attempt.job_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE job SET attempt_count = attempt_count + 1, updated_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(&attempt.job_id)
            .execute(&mut *tx)
            .await?;
        }

        let job = sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(&attempt.job_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(FinishedAttempt { job, transitioned })
    }

    async fn cancel_job_once(&self, id: &str) -> Result<CancelResult> {
        let mut tx = begin_immediate(&self.pool).await?;

        let current = sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?;
        let status = current.status()?;
        if status.is_terminal() {
            tx.rollback().await?;
            return Ok(CancelResult::AlreadyTerminal(current));
        }

        sqlx::query(
            "UPDATE job SET status = 'CANCELLED', last_error = 'cancelled', updated_at = ? WHERE id = ?",
        )
        .bind(now_ms())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let job = sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(CancelResult::Cancelled {
            job,
            was_running: status == JobStatus::Running,
        })
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn insert_job(
        &self,
        job: &JobDbModel,
        max_pending: Option<u64>,
    ) -> Result<InsertOutcome> {
        retry_on_sqlite_busy("insert_job", || self.insert_job_once(job, max_pending)).await
    }

    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE status = ? ORDER BY priority DESC, next_run_at, created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            let status = status
                .parse::<JobStatus>()
                .map_err(|_| Error::Database(format!("unknown job status '{status}'")))?;
            match status {
                JobStatus::Pending => counts.pending = count,
                JobStatus::Running => counts.running = count,
                JobStatus::Succeeded => counts.succeeded = count,
                JobStatus::Failed => counts.failed = count,
                JobStatus::Cancelled => counts.cancelled = count,
            }
        }
        Ok(counts)
    }

    async fn next_due_after(&self, after_ms: i64) -> Result<Option<i64>> {
        let (next,): (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT MIN(next_run_at) FROM job
            WHERE status = 'PENDING' AND attempt_count < max_attempts AND next_run_at > ?
            "#,
        )
        .bind(after_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }

    async fn claim_due(&self, request: &ClaimRequest) -> Result<Vec<JobDbModel>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        retry_on_sqlite_busy("claim_due", || self.claim_due_once(request)).await
    }

    async fn finish_attempt(
        &self,
        attempt: &NewJobAttempt,
        transition: &AttemptTransition,
    ) -> Result<FinishedAttempt> {
        retry_on_sqlite_busy("finish_attempt", || {
            self.finish_attempt_once(attempt, transition)
        })
        .await
    }

    async fn cancel_job(&self, id: &str) -> Result<CancelResult> {
        retry_on_sqlite_busy("cancel_job", || self.cancel_job_once(id)).await
    }

    async fn release_job(&self, id: &str) -> Result<bool> {
        retry_on_sqlite_busy("release_job", || async {
            let result = sqlx::query(
                "UPDATE job SET status = 'PENDING', updated_at = ? WHERE id = ? AND status = 'RUNNING'",
            )
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn reset_running_jobs(&self) -> Result<u64> {
        retry_on_sqlite_busy("reset_running_jobs", || async {
            let result = sqlx::query(
                "UPDATE job SET status = 'PENDING', updated_at = ? WHERE status = 'RUNNING'",
            )
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn cancelled_among(&self, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = serde_json::to_string(ids)?;
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM job
            WHERE status = 'CANCELLED'
              AND id IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn list_attempts(&self, job_id: &str) -> Result<Vec<JobAttemptDbModel>> {
        let attempts = sqlx::query_as::<_, JobAttemptDbModel>(
            "SELECT * FROM job_attempt WHERE job_id = ? ORDER BY attempt_number",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    async fn purge_terminal(&self, older_than_ms: i64, batch_size: u32) -> Result<u64> {
        retry_on_sqlite_busy("purge_terminal", || async {
            let result = sqlx::query(
                r#"
                DELETE FROM job WHERE id IN (
                    SELECT id FROM job
                    WHERE status IN ('SUCCEEDED', 'CANCELLED')
                      AND updated_at < ?
                    ORDER BY updated_at
                    LIMIT ?
                )
                "#,
            )
            .bind(older_than_ms)
            .bind(i64::from(batch_size))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
