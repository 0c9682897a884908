//! End-to-end scheduler scenarios against a real SQLite store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, ScriptedExecutor, Step, limits, retry_config, spec, wait_until};
use proofci::domain::{AttemptOutcome, FaultCause, JobStatus};
use proofci::engine::{CancelOutcome, EnqueueOutcome, JobEvent};

fn transient() -> AttemptOutcome {
    AttemptOutcome::transient(FaultCause::BackendUnreachable, "connection refused")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_faults_back_off_then_succeed() {
    let executor = ScriptedExecutor::new();
    executor.script(
        "acme/proofs",
        [
            Step::Finish(transient()),
            Step::Finish(transient()),
            Step::Finish(AttemptOutcome::success()),
        ],
    );
    let mut h = Harness::start(limits(10, 3), retry_config(3, 1000), executor.clone()).await;

    let id = h.enqueue(spec("acme/proofs", "refs/pull/7/head")).await;
    let event = h.completion(&id, Duration::from_secs(15)).await;
    let JobEvent::Completed {
        status,
        outcome,
        attempts,
        ..
    } = event;
    assert_eq!(status, JobStatus::Succeeded);
    assert_eq!(outcome, Some(AttemptOutcome::success()));
    assert_eq!(attempts, 3);

    let job = h.store.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt_count, 3);

    let recorded = h.store.list_attempts(&id).await.unwrap();
    let numbers: Vec<u32> = recorded.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    // 1s and 2s backoff, +/-25% jitter. The loop wakes when the job is due.
    let calls = executor.calls_for(&id);
    assert_eq!(calls.len(), 3);
    let first_gap = calls[1].started - calls[0].started;
    let second_gap = calls[2].started - calls[1].started;
    assert!(
        first_gap >= Duration::from_millis(700) && first_gap <= Duration::from_millis(1400),
        "first backoff was {first_gap:?}"
    );
    assert!(
        second_gap >= Duration::from_millis(1400) && second_gap <= Duration::from_millis(2700),
        "second backoff was {second_gap:?}"
    );
    assert_eq!(executor.overlaps(), 0);

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_capacity_of_one_runs_one_job_at_a_time() {
    let executor = ScriptedExecutor::new();
    let slow = Step::After(Duration::from_millis(500), AttemptOutcome::success());
    executor.script("acme/one", [slow.clone()]);
    executor.script("acme/two", [slow]);
    let mut h = Harness::start(limits(1, 3), retry_config(3, 100), executor.clone()).await;

    let first = h.enqueue(spec("acme/one", "main")).await;
    let second = h.enqueue(spec("acme/two", "main")).await;

    assert!(wait_until(Duration::from_secs(5), || async { executor.running() == 1 }).await);
    let running = h.store.list_jobs(JobStatus::Running).await.unwrap();
    let pending = h.store.list_jobs(JobStatus::Pending).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(pending.len(), 1);
    assert_eq!(h.limiter.in_use(), 1);

    h.completion(&first, Duration::from_secs(10)).await;
    h.completion(&second, Duration::from_secs(10)).await;

    assert_eq!(executor.max_running(), 1);
    let calls = executor.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].started - calls[0].started >= Duration::from_millis(500));
    assert_eq!(h.limiter.in_use(), 0);

    h.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attempt_timeouts_are_retried_then_fail_permanently() {
    use proofci::domain::{JobSpec, PayloadRef, ProverKind, SecurityProfile};
    use proofci::engine::{ExecutorConfig, SandboxExecutor};

    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("Main.lean"), "theorem t : True := trivial").unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let bin = tempfile::tempdir().unwrap();

    let executor = Arc::new(SandboxExecutor::new(ExecutorConfig {
        container_runtime: common::host_runtime(bin.path()).display().to_string(),
        verifier_command: vec!["/bin/sh".into(), "-c".into(), "sleep 30".into()],
        timeout_secs: 1,
        grace_period_ms: 200,
        scratch_root: Some(scratch.path().to_path_buf()),
        ..ExecutorConfig::default()
    }));
    let mut h = Harness::start(limits(2, 2), retry_config(2, 100), executor).await;

    let job_spec = JobSpec::new(
        "acme/slow",
        "main",
        ProverKind::Lean,
        PayloadRef::new(workspace.path(), "Main.lean"),
    )
    .with_security_profile(SecurityProfile::Minimal);
    let id = h.enqueue(job_spec).await;

    let JobEvent::Completed {
        status, outcome, ..
    } = h.completion(&id, Duration::from_secs(20)).await;
    assert_eq!(status, JobStatus::Failed);
    assert!(matches!(outcome, Some(AttemptOutcome::Timeout { .. })));

    let job = h.store.get_job(&id).await.unwrap();
    assert_eq!(job.attempt_count, 2);
    assert!(job.attempt_count <= job.max_attempts);
    let recorded = h.store.list_attempts(&id).await.unwrap();
    assert_eq!(recorded.len(), 2);
    assert!(
        recorded
            .iter()
            .all(|a| matches!(a.outcome, AttemptOutcome::Timeout { .. }))
    );
    assert_eq!(h.limiter.in_use(), 0);

    // Every scratch directory was removed.
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_mid_run_stops_the_attempt() {
    let executor = ScriptedExecutor::new();
    executor.script("acme/proofs", [Step::UntilCancelled]);
    let mut h = Harness::start(limits(10, 3), retry_config(3, 100), executor.clone()).await;

    let id = h.enqueue(spec("acme/proofs", "main")).await;
    assert!(wait_until(Duration::from_secs(5), || async { executor.running() == 1 }).await);

    let outcome = h.scheduler.cancel(&id).await.unwrap();
    assert!(matches!(
        outcome,
        CancelOutcome::Cancelled {
            was_running: true,
            ..
        }
    ));

    let JobEvent::Completed {
        status, outcome, ..
    } = h.completion(&id, Duration::from_secs(5)).await;
    assert_eq!(status, JobStatus::Cancelled);
    assert_eq!(outcome, None);

    assert!(
        wait_until(Duration::from_secs(5), || async {
            executor.running() == 0 && h.limiter.in_use() == 0
        })
        .await
    );
    assert!(
        wait_until(Duration::from_secs(5), || async {
            h.store.list_attempts(&id).await.unwrap().len() == 1
        })
        .await
    );

    // No further attempts once cancelled.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(executor.calls_for(&id).len(), 1);
    let job = h.store.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    let recorded = h.store.list_attempts(&id).await.unwrap();
    assert_eq!(recorded[0].outcome, AttemptOutcome::Cancelled);
    assert_eq!(h.scheduler.in_flight_count(), 0);

    // A second cancel is a no-op.
    assert!(matches!(
        h.scheduler.cancel(&id).await.unwrap(),
        CancelOutcome::AlreadyTerminal(_)
    ));

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_written_to_the_store_is_observed() {
    let executor = ScriptedExecutor::new();
    executor.script("acme/proofs", [Step::UntilCancelled]);
    let mut h = Harness::start(limits(10, 3), retry_config(3, 100), executor.clone()).await;

    let id = h.enqueue(spec("acme/proofs", "main")).await;
    assert!(wait_until(Duration::from_secs(5), || async { executor.running() == 1 }).await);

    // Another process cancelling through the store directly.
    h.store.cancel(&id).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || async {
            executor.running() == 0 && h.limiter.in_use() == 0
        })
        .await
    );
    let job = h.store.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_enqueue_stores_one_job() {
    let executor = ScriptedExecutor::new();
    executor.script(
        "acme/proofs",
        [Step::After(
            Duration::from_millis(300),
            AttemptOutcome::success(),
        )],
    );
    let mut h = Harness::start(limits(10, 3), retry_config(3, 100), executor.clone()).await;

    let first = h.store.enqueue(spec("acme/proofs", "main")).await.unwrap();
    let again = h.store.enqueue(spec("acme/proofs", "main")).await.unwrap();
    assert!(!first.is_duplicate());
    assert!(again.is_duplicate());
    assert_eq!(first.job_id(), again.job_id());

    let id = first.job_id().unwrap().to_string();
    h.completion(&id, Duration::from_secs(5)).await;
    assert_eq!(executor.calls().len(), 1);

    // A finished job no longer blocks a new one.
    match h.store.enqueue(spec("acme/proofs", "main")).await.unwrap() {
        EnqueueOutcome::Enqueued(job) => assert_ne!(job.id, id),
        other => panic!("expected a new job, got {other:?}"),
    }

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn permits_are_released_on_every_exit_path() {
    let executor = ScriptedExecutor::new();
    executor.script("acme/ok", [Step::Finish(AttemptOutcome::success())]);
    executor.script("acme/bad", [Step::Finish(AttemptOutcome::failure("goal not closed"))]);
    executor.script("acme/flaky", [Step::Finish(transient())]);
    executor.script(
        "acme/slow",
        [Step::Finish(AttemptOutcome::timeout(Duration::from_secs(1)))],
    );
    executor.script("acme/crash", [Step::Panic]);
    let mut h = Harness::start(limits(3, 1), retry_config(1, 100), executor.clone()).await;

    let cases = [
        ("acme/ok", JobStatus::Succeeded),
        ("acme/bad", JobStatus::Failed),
        ("acme/flaky", JobStatus::Failed),
        ("acme/slow", JobStatus::Failed),
        ("acme/crash", JobStatus::Failed),
    ];
    let mut ids = Vec::new();
    for (repository, _) in cases {
        ids.push(h.enqueue(spec(repository, "main")).await);
    }

    for (id, (repository, expected)) in ids.iter().zip(cases) {
        let JobEvent::Completed { status, .. } = h.completion(id, Duration::from_secs(10)).await;
        assert_eq!(status, expected, "{repository}");
    }

    assert!(executor.max_running() <= 3);
    assert_eq!(executor.overlaps(), 0);
    assert!(wait_until(Duration::from_secs(2), || async { h.limiter.in_use() == 0 }).await);
    assert_eq!(h.limiter.available_global(), 3);
    assert_eq!(h.scheduler.in_flight_count(), 0);

    let crashed = h.store.get_job(&ids[4]).await.unwrap();
    assert_eq!(crashed.attempt_count, 1);
    let recorded = h.store.list_attempts(&ids[4]).await.unwrap();
    assert!(matches!(
        recorded[0].outcome,
        AttemptOutcome::TransientFault {
            cause: FaultCause::SandboxAllocation,
            ..
        }
    ));

    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_returns_running_jobs_to_pending() {
    let executor = ScriptedExecutor::new();
    executor.script("acme/proofs", [Step::UntilCancelled]);
    let mut h = Harness::start(limits(10, 3), retry_config(3, 100), executor.clone()).await;

    let id = h.enqueue(spec("acme/proofs", "main")).await;
    assert!(wait_until(Duration::from_secs(5), || async { executor.running() == 1 }).await);

    h.shutdown().await;

    assert_eq!(executor.running(), 0);
    assert_eq!(h.limiter.in_use(), 0);
    let job = h.store.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 0);
    assert!(h.store.list_attempts(&id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refused_admission_leaves_the_job_untouched() {
    let executor = ScriptedExecutor::new();
    executor.script(
        "acme/proofs",
        [Step::UntilCancelled, Step::UntilCancelled, Step::Finish(AttemptOutcome::success())],
    );
    let mut h = Harness::start(limits(10, 2), retry_config(3, 100), executor.clone()).await;

    let first = h.enqueue(spec("acme/proofs", "main")).await;
    assert!(wait_until(Duration::from_secs(5), || async { executor.running() == 1 }).await);

    let second = h.enqueue(spec("acme/proofs", "feature-a")).await;
    let third = h.enqueue(spec("acme/proofs", "feature-b")).await;
    let enqueued_at = [
        h.store.get_job(&second).await.unwrap().next_run_at,
        h.store.get_job(&third).await.unwrap().next_run_at,
    ];

    assert!(wait_until(Duration::from_secs(5), || async { executor.running() == 2 }).await);
    // Several ticks pass with the repository at capacity.
    tokio::time::sleep(Duration::from_millis(common::POLL_INTERVAL_MS * 6)).await;
    assert_eq!(executor.running(), 2);
    assert_eq!(executor.max_running(), 2);
    assert_eq!(h.limiter.in_use_for("acme/proofs"), 2);

    let pending = h.store.list_jobs(JobStatus::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    let refused = &pending[0];
    let admitted = if refused.id == second { &third } else { &second };
    assert!(refused.id == second || refused.id == third);
    assert_eq!(refused.attempt_count, 0);
    let original = if refused.id == second { enqueued_at[0] } else { enqueued_at[1] };
    assert_eq!(refused.next_run_at, original);
    assert!(h.store.list_attempts(&refused.id).await.unwrap().is_empty());
    assert!(executor.calls_for(&refused.id).is_empty());

    let running = h.store.get_job(admitted).await.unwrap();
    assert_eq!(running.status, JobStatus::Running);

    // Freeing one unit lets the refused job run.
    assert!(matches!(
        h.scheduler.cancel(&first).await.unwrap(),
        CancelOutcome::Cancelled { .. }
    ));
    let JobEvent::Completed { status, attempts, .. } =
        h.completion(&refused.id, Duration::from_secs(10)).await;
    assert_eq!(status, JobStatus::Succeeded);
    assert_eq!(attempts, 1);
    assert_eq!(executor.calls_for(&refused.id).len(), 1);
    assert_eq!(executor.max_running(), 2);

    h.shutdown().await;
}
