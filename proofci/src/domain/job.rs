//! Verification jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use strum::{Display, EnumString};

use super::{ProverKind, SecurityProfile};
use crate::{Error, Result};

/// Job lifecycle status.
///
/// `Pending -> Running -> {Succeeded | Failed | Cancelled}`, with
/// `Running -> Pending` for a scheduled retry or an admission refusal.
/// A transient failure awaiting retry is `Pending` with `last_error` set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Scheduling priority; higher runs first.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    pub fn value(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 10,
            Self::High => 20,
            Self::Critical => 30,
        }
    }

    /// Bucket a stored integer back into a priority.
    pub fn from_value(value: i64) -> Self {
        match value {
            v if v >= 30 => Self::Critical,
            v if v >= 20 => Self::High,
            v if v >= 10 => Self::Normal,
            _ => Self::Low,
        }
    }
}

/// Location of the content to verify.
///
/// `workspace` is a host directory holding an already checked-out tree; it
/// is only ever mounted read-only. `entry` is the file to check, relative to
/// the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    pub workspace: PathBuf,
    pub entry: PathBuf,
}

impl PayloadRef {
    pub fn new(workspace: impl Into<PathBuf>, entry: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            entry: entry.into(),
        }
    }

    /// Reject entries that could point outside the workspace.
    pub fn validate(&self) -> Result<()> {
        if self.entry.as_os_str().is_empty() {
            return Err(Error::validation("payload entry is empty"));
        }
        let escapes = self.entry.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(Error::validation(format!(
                "payload entry '{}' escapes the workspace",
                self.entry.display()
            )));
        }
        if !self.workspace.is_absolute() {
            return Err(Error::validation(format!(
                "workspace '{}' must be an absolute path",
                self.workspace.display()
            )));
        }
        Ok(())
    }

    pub fn entry_path(&self) -> &Path {
        &self.entry
    }
}

/// Request to verify one (repository, ref, kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub repository: String,
    pub git_ref: String,
    pub kind: ProverKind,
    pub payload: PayloadRef,
    /// Explicitly requested isolation; resolved against repository policy.
    pub security_profile: Option<SecurityProfile>,
    pub priority: JobPriority,
    /// Overrides the configured attempt budget.
    pub max_attempts: Option<u32>,
}

impl JobSpec {
    pub fn new(
        repository: impl Into<String>,
        git_ref: impl Into<String>,
        kind: ProverKind,
        payload: PayloadRef,
    ) -> Self {
        Self {
            repository: repository.into(),
            git_ref: git_ref.into(),
            kind,
            payload,
            security_profile: None,
            priority: JobPriority::default(),
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_security_profile(mut self, profile: SecurityProfile) -> Self {
        self.security_profile = Some(profile);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.repository.trim().is_empty() {
            return Err(Error::validation("repository is empty"));
        }
        if self.git_ref.trim().is_empty() {
            return Err(Error::validation("git ref is empty"));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::validation("max_attempts must be at least 1"));
        }
        self.payload.validate()?;
        if !self.kind.accepts(self.payload.entry_path()) {
            return Err(Error::validation(format!(
                "entry '{}' is not a {} source file",
                self.payload.entry.display(),
                self.kind
            )));
        }
        Ok(())
    }
}

/// A stored job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub repository: String,
    pub git_ref: String,
    pub kind: ProverKind,
    pub payload: PayloadRef,
    pub security_profile: SecurityProfile,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be claimed.
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Number the next attempt will carry.
    pub fn next_attempt_number(&self) -> u32 {
        self.attempt_count + 1
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }
}
