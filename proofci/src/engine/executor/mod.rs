//! Isolated execution of verification attempts.
//!
//! The [`Executor`] trait is the seam between the scheduler and whatever
//! actually runs the verifier. [`SandboxExecutor`] runs it in a container
//! hardened according to the attempt's security profile. Whatever happens
//! inside, the caller receives an [`ExecutionReport`]; nothing escapes as
//! an error or panic.

mod process;
mod report;
mod sandbox;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{
    AttemptOutcome, AttemptOutput, ExecutionAttempt, FaultCause, Job, ResourceUsage,
    SecurityProfile,
};
use crate::{Error, Result};
use process::{RunLimits, run_captured};
use sandbox::Sandbox;

/// Configuration for sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Container runtime CLI (`docker`, `podman`).
    pub container_runtime: String,
    /// Image holding the verifier toolchain.
    pub image: String,
    /// OCI runtime for Maximum isolation, e.g. `runsc`. Maximum jobs fail
    /// to allocate when unset.
    pub secure_runtime: Option<String>,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: u64,
    /// Wall-clock limit per attempt.
    pub timeout_secs: u64,
    /// Time between the stop request and the kill.
    pub grace_period_ms: u64,
    /// Size of the writable scratch area.
    pub scratch_size_mb: u64,
    /// Bytes of stdout/stderr tail kept per attempt.
    pub output_cap_bytes: usize,
    /// Verifier argv. Supports `{kind}`, `{entry}`, `{workspace}`,
    /// `{scratch}`, `{backend}` and `{job_id}`.
    pub verifier_command: Vec<String>,
    /// Parent of per-attempt scratch directories; the system temp dir if unset.
    pub scratch_root: Option<PathBuf>,
    /// Unix socket of the verification backend, exposed to the sandbox.
    pub backend_socket: Option<PathBuf>,
    /// `uid:gid` for container attempts.
    pub container_user: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            container_runtime: "docker".to_string(),
            image: "proofci/verifier:latest".to_string(),
            secure_runtime: Some("runsc".to_string()),
            memory_mb: 2048,
            cpus: 2.0,
            pids_limit: 100,
            timeout_secs: 300,
            grace_period_ms: 10_000,
            scratch_size_mb: 100,
            output_cap_bytes: 64 * 1024,
            verifier_command: vec![
                "proofci-verify".to_string(),
                "--prover".to_string(),
                "{kind}".to_string(),
                "--entry".to_string(),
                "{entry}".to_string(),
            ],
            scratch_root: None,
            backend_socket: None,
            container_user: Some("65534:65534".to_string()),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.verifier_command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(Error::config("executor.verifier_command must not be empty"));
        }
        if self.timeout_secs == 0 {
            return Err(Error::config("executor.timeout_secs must be positive"));
        }
        if self.memory_mb == 0 || self.pids_limit == 0 || self.scratch_size_mb == 0 {
            return Err(Error::config(
                "executor memory, pids and scratch limits must be positive",
            ));
        }
        if self.cpus.is_nan() || self.cpus <= 0.0 {
            return Err(Error::config("executor.cpus must be positive"));
        }
        if self.container_runtime.trim().is_empty() {
            return Err(Error::config("executor.container_runtime must not be empty"));
        }
        Ok(())
    }
}

/// What an executor hands back for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resource_usage: Option<ResourceUsage>,
    pub output: Option<AttemptOutput>,
}

impl ExecutionReport {
    /// Report for an attempt that produced no process output.
    pub fn bare(started_at: DateTime<Utc>, outcome: AttemptOutcome) -> Self {
        Self {
            outcome,
            started_at,
            finished_at: Utc::now(),
            resource_usage: None,
            output: None,
        }
    }

    pub fn into_attempt(self, attempt_number: u32) -> ExecutionAttempt {
        ExecutionAttempt {
            attempt_number,
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome: self.outcome,
            resource_usage: self.resource_usage,
            output: self.output,
        }
    }
}

/// Runs one attempt of a job in isolation.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `job` under `profile`. Must return promptly once `cancel` fires,
    /// with [`AttemptOutcome::Cancelled`], after tearing the sandbox down.
    async fn execute(
        &self,
        job: &Job,
        profile: SecurityProfile,
        cancel: CancellationToken,
    ) -> ExecutionReport;
}

/// Executor backed by a container runtime CLI.
pub struct SandboxExecutor {
    config: ExecutorConfig,
}

impl SandboxExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn run_in(
        &self,
        sandbox: &mut Sandbox,
        job: &Job,
        started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let command = match sandbox.command(&self.config, job) {
            Ok(command) => command,
            Err(e) => return ExecutionReport::bare(started_at, e.into_outcome()),
        };
        let limits = RunLimits {
            timeout: self.config.timeout(),
            grace: self.config.grace_period(),
            output_cap: self.config.output_cap_bytes,
        };

        let run = match run_captured(command, limits, cancel, Some(sandbox.container())).await {
            Ok(run) => run,
            Err(e) => {
                warn!(job_id = %job.id, "Failed to start verifier: {}", e);
                return ExecutionReport::bare(
                    started_at,
                    AttemptOutcome::transient(
                        FaultCause::SandboxAllocation,
                        format!("failed to start verifier: {e}"),
                    ),
                );
            }
        };
        sandbox.track_process_group(run.pgid);

        let stdout = run.stdout.text();
        let stderr = run.stderr.text();
        let outcome = report::classify(&run.end, &stdout, &stderr, run.elapsed);

        ExecutionReport {
            outcome,
            started_at,
            finished_at: Utc::now(),
            resource_usage: Some(ResourceUsage {
                wall_time_ms: u64::try_from(run.elapsed.as_millis()).unwrap_or(u64::MAX),
                exit_code: report::exit_code(&run.end),
                stdout_bytes: run.stdout.total_bytes,
                stderr_bytes: run.stderr.total_bytes,
            }),
            output: Some(AttemptOutput {
                truncated: run.stdout.truncated() || run.stderr.truncated(),
                stdout,
                stderr,
            }),
        }
    }
}

#[async_trait]
impl Executor for SandboxExecutor {
    async fn execute(
        &self,
        job: &Job,
        profile: SecurityProfile,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let started_at = Utc::now();
        if cancel.is_cancelled() {
            return ExecutionReport::bare(started_at, AttemptOutcome::Cancelled);
        }

        let mut sandbox = match Sandbox::allocate(&self.config, job, profile).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                warn!(job_id = %job.id, profile = %profile, "Sandbox allocation failed: {}", e);
                return ExecutionReport::bare(started_at, e.into_outcome());
            }
        };

        debug!(job_id = %job.id, kind = %job.kind, profile = %profile, "Running verifier");
        let report = self.run_in(&mut sandbox, job, started_at, &cancel).await;
        sandbox.teardown().await;

        info!(
            job_id = %job.id,
            outcome = %report.outcome.kind(),
            elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "Attempt finished"
        );
        report
    }
}
