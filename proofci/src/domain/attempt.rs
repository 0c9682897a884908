//! Execution attempts and their classified outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};

/// Infrastructure fault behind a [`AttemptOutcome::TransientFault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FaultCause {
    /// The verification backend could not be reached.
    BackendUnreachable,
    /// The backend answered but reported itself unavailable.
    BackendUnavailable,
    /// The backend timed out on its side.
    BackendTimeout,
    /// The sandbox could not be created or the runtime failed to start it.
    SandboxAllocation,
    /// The sandboxed process was killed for exceeding a resource ceiling.
    ResourceExhausted,
}

/// Classified result of one attempt.
///
/// Everything that happens inside the sandbox is reduced to one of these
/// before it leaves the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default)]
        artifacts: Vec<String>,
    },
    /// Payload-level failure, e.g. a proof that does not check.
    Failure { detail: String },
    TransientFault { cause: FaultCause, detail: String },
    Timeout { after_ms: u64 },
    Cancelled,
}

impl AttemptOutcome {
    pub fn success() -> Self {
        Self::Success {
            message: None,
            artifacts: Vec::new(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self::Failure {
            detail: detail.into(),
        }
    }

    pub fn transient(cause: FaultCause, detail: impl Into<String>) -> Self {
        Self::TransientFault {
            cause,
            detail: detail.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success { .. } => OutcomeKind::Success,
            Self::Failure { .. } => OutcomeKind::Failure,
            Self::TransientFault { .. } => OutcomeKind::TransientFault,
            Self::Timeout { .. } => OutcomeKind::Timeout,
            Self::Cancelled => OutcomeKind::Cancelled,
        }
    }

    /// One-line description, stored as the job's `last_error`.
    pub fn summary(&self) -> String {
        match self {
            Self::Success { message, .. } => message.clone().unwrap_or_else(|| "verified".into()),
            Self::Failure { detail } => format!("verification failed: {detail}"),
            Self::TransientFault { cause, detail } => format!("transient fault ({cause}): {detail}"),
            Self::Timeout { after_ms } => format!("timed out after {after_ms}ms"),
            Self::Cancelled => "cancelled".into(),
        }
    }
}

/// Discriminant of [`AttemptOutcome`], as stored in `job_attempt.outcome`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Failure,
    TransientFault,
    Timeout,
    Cancelled,
}

/// Resources consumed by an attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub wall_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

/// Captured output of an attempt, truncated to the tail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptOutput {
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub truncated: bool,
}

/// One recorded execution of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub resource_usage: Option<ResourceUsage>,
    pub output: Option<AttemptOutput>,
}

impl ExecutionAttempt {
    pub fn new(attempt_number: u32, outcome: AttemptOutcome) -> Self {
        let now = Utc::now();
        Self {
            attempt_number,
            started_at: now,
            finished_at: now,
            outcome,
            resource_usage: None,
            output: None,
        }
    }
}
