//! Job and attempt database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{
    AttemptOutcome, ExecutionAttempt, Job, JobPriority, JobStatus, OutcomeKind, ProverKind,
    SecurityProfile,
};
use crate::{Error, Result};

/// Job row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub repository: String,
    pub git_ref: String,
    /// Prover kind, lowercase.
    pub kind: String,
    /// JSON `PayloadRef`.
    pub payload: String,
    /// MINIMAL, STANDARD, MAXIMUM
    pub security_profile: String,
    pub priority: i64,
    /// PENDING, RUNNING, SUCCEEDED, FAILED, CANCELLED
    pub status: String,
    pub attempt_count: i64,
    pub max_attempts: i64,
    /// Epoch ms before which the job is not claimable.
    pub next_run_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobDbModel {
    pub fn status(&self) -> Result<JobStatus> {
        self.status
            .parse()
            .map_err(|_| Error::Database(format!("job {} has unknown status '{}'", self.id, self.status)))
    }
}

impl TryFrom<JobDbModel> for Job {
    type Error = Error;

    fn try_from(row: JobDbModel) -> Result<Self> {
        let status = row.status()?;
        let kind: ProverKind = row
            .kind
            .parse()
            .map_err(|_| Error::Database(format!("job {} has unknown kind '{}'", row.id, row.kind)))?;
        let security_profile: SecurityProfile = row.security_profile.parse().map_err(|_| {
            Error::Database(format!(
                "job {} has unknown security profile '{}'",
                row.id, row.security_profile
            ))
        })?;

        Ok(Job {
            payload: serde_json::from_str(&row.payload)?,
            kind,
            security_profile,
            status,
            priority: JobPriority::from_value(row.priority),
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(1),
            next_run_at: ms_to_datetime(row.next_run_at),
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
            last_error: row.last_error,
            id: row.id,
            repository: row.repository,
            git_ref: row.git_ref,
        })
    }
}

/// Attempt row. Append-only.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobAttemptDbModel {
    pub id: i64,
    pub job_id: String,
    pub attempt_number: i64,
    pub started_at: i64,
    pub finished_at: i64,
    /// SUCCESS, FAILURE, TRANSIENT_FAULT, TIMEOUT, CANCELLED
    pub outcome: String,
    /// JSON `AttemptOutcome`.
    pub detail: String,
    /// JSON `ResourceUsage`.
    pub resource_usage: Option<String>,
    /// JSON `AttemptOutput`.
    pub output: Option<String>,
}

/// Attempt row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewJobAttempt {
    pub job_id: String,
    pub attempt_number: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub outcome: String,
    pub detail: String,
    pub resource_usage: Option<String>,
    pub output: Option<String>,
}

impl NewJobAttempt {
    pub fn from_attempt(job_id: &str, attempt: &ExecutionAttempt) -> Result<Self> {
        Ok(Self {
            job_id: job_id.to_string(),
            attempt_number: i64::from(attempt.attempt_number),
            started_at: datetime_to_ms(attempt.started_at),
            finished_at: datetime_to_ms(attempt.finished_at),
            outcome: attempt.outcome.kind().to_string(),
            detail: serde_json::to_string(&attempt.outcome)?,
            resource_usage: attempt
                .resource_usage
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            output: attempt.output.as_ref().map(serde_json::to_string).transpose()?,
        })
    }
}

impl TryFrom<JobAttemptDbModel> for ExecutionAttempt {
    type Error = Error;

    fn try_from(row: JobAttemptDbModel) -> Result<Self> {
        let outcome: AttemptOutcome = serde_json::from_str(&row.detail)?;
        let stored_kind: OutcomeKind = row.outcome.parse().map_err(|_| {
            Error::Database(format!("attempt {} has unknown outcome '{}'", row.id, row.outcome))
        })?;
        if stored_kind != outcome.kind() {
            return Err(Error::Database(format!(
                "attempt {} outcome '{}' does not match its detail",
                row.id, row.outcome
            )));
        }

        Ok(ExecutionAttempt {
            attempt_number: u32::try_from(row.attempt_number).unwrap_or(0),
            started_at: ms_to_datetime(row.started_at),
            finished_at: ms_to_datetime(row.finished_at),
            outcome,
            resource_usage: row
                .resource_usage
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            output: row.output.as_deref().map(serde_json::from_str).transpose()?,
        })
    }
}
