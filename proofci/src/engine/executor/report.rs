//! Turning a finished verifier process into an [`AttemptOutcome`].
//!
//! The verifier prints a JSON report as the last line of stdout:
//! `{"status": "verified", "message": "...", "artifacts": ["..."]}`.
//! Without a usable report the exit code decides. A success report only
//! counts when the process also exited 0, since proof content can write to
//! stdout through the prover.

use serde::Deserialize;
use std::process::ExitStatus;
use std::time::Duration;

use super::process::RunEnd;
use crate::domain::{AttemptOutcome, FaultCause};

/// `EX_TEMPFAIL` from sysexits.h.
const EXIT_TEMPFAIL: i32 = 75;
/// Killed by SIGKILL (128 + 9), usually the OOM killer.
const EXIT_KILLED: i32 = 137;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub(crate) struct VerifierReport {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// Parse the report from the last non-empty stdout line.
pub(crate) fn parse_report(stdout: &str) -> Option<VerifierReport> {
    let line = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    serde_json::from_str(line).ok()
}

/// Map a report status to an outcome. Unknown statuses yield `None`.
fn outcome_from_report(report: VerifierReport, elapsed: Duration) -> Option<AttemptOutcome> {
    let detail = report
        .message
        .clone()
        .unwrap_or_else(|| report.status.clone());
    let outcome = match report.status.to_ascii_lowercase().as_str() {
        "verified" | "pass" | "success" => AttemptOutcome::Success {
            message: report.message,
            artifacts: report.artifacts,
        },
        "failed" | "fail" | "invalid" => AttemptOutcome::failure(detail),
        "unreachable" => AttemptOutcome::transient(FaultCause::BackendUnreachable, detail),
        "unavailable" | "error_backend" => {
            AttemptOutcome::transient(FaultCause::BackendUnavailable, detail)
        }
        "backend_timeout" => AttemptOutcome::transient(FaultCause::BackendTimeout, detail),
        "timeout" => AttemptOutcome::timeout(elapsed),
        _ => return None,
    };
    Some(outcome)
}

/// Exit status plus the last non-empty stderr line.
fn exit_detail(status: ExitStatus, stderr: &str) -> String {
    let last = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty());
    match last {
        Some(line) => format!("{status}: {line}"),
        None => status.to_string(),
    }
}

fn outcome_from_exit(status: ExitStatus, stderr: &str) -> AttemptOutcome {
    let detail = || exit_detail(status, stderr);

    match effective_code(status) {
        Some(0) => AttemptOutcome::success(),
        Some(1) => AttemptOutcome::failure(detail()),
        Some(EXIT_TEMPFAIL) => AttemptOutcome::transient(FaultCause::BackendUnavailable, detail()),
        Some(125..=127) => AttemptOutcome::transient(FaultCause::SandboxAllocation, detail()),
        Some(EXIT_KILLED) => AttemptOutcome::transient(FaultCause::ResourceExhausted, detail()),
        _ => AttemptOutcome::failure(detail()),
    }
}

/// Exit code, mapping death-by-signal to the shell convention `128 + n`.
fn effective_code(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return Some(128 + sig);
        }
    }
    status.code()
}

/// Classify a finished run.
pub(crate) fn classify(
    end: &RunEnd,
    stdout: &str,
    stderr: &str,
    elapsed: Duration,
) -> AttemptOutcome {
    match end {
        RunEnd::TimedOut => AttemptOutcome::timeout(elapsed),
        RunEnd::Cancelled => AttemptOutcome::Cancelled,
        RunEnd::Exited(status) => {
            match parse_report(stdout).and_then(|report| outcome_from_report(report, elapsed)) {
                Some(AttemptOutcome::Success { .. }) if effective_code(*status) != Some(0) => {
                    AttemptOutcome::failure(format!(
                        "success report with failing exit ({})",
                        exit_detail(*status, stderr)
                    ))
                }
                Some(outcome) => outcome,
                None => outcome_from_exit(*status, stderr),
            }
        }
    }
}

/// Exit code for resource accounting.
pub(crate) fn exit_code(end: &RunEnd) -> Option<i32> {
    match end {
        RunEnd::Exited(status) => effective_code(*status),
        _ => None,
    }
}
