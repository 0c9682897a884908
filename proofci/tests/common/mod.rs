#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use proofci::database::repositories::SqlxJobRepository;
use proofci::database::{init_pool_with_size, run_migrations};
use proofci::domain::{
    AttemptOutcome, Job, JobSpec, PayloadRef, ProverKind, SecurityPolicy, SecurityProfile,
};
use proofci::engine::{
    ConcurrencyLimiter, ExecutionReport, Executor, JobEvent, JobStore, LimiterConfig, RetryConfig,
    RetryController, Scheduler, SchedulerConfig,
};

/// Poll interval used by every test scheduler.
pub const POLL_INTERVAL_MS: u64 = 50;

/// One scripted attempt.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return immediately.
    Finish(AttemptOutcome),
    /// Return after a delay unless cancelled first.
    After(Duration, AttemptOutcome),
    /// Run until the attempt is cancelled.
    UntilCancelled,
    /// Panic inside the executor.
    Panic,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub job_id: String,
    pub attempt: u32,
    pub started: Instant,
}

/// Executor that plays back per-repository scripts and records what ran.
///
/// Repositories without a script (or with an exhausted one) succeed.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<Call>>,
    running_jobs: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    overlaps: AtomicUsize,
}

struct RunningGuard<'a> {
    executor: &'a ScriptedExecutor,
    job_id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.executor.running.fetch_sub(1, Ordering::SeqCst);
        let mut jobs = self.executor.running_jobs.lock();
        if let Some(pos) = jobs.iter().position(|id| id == &self.job_id) {
            jobs.remove(pos);
        }
    }
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, repository: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .entry(repository.to_string())
            .or_default()
            .extend(steps);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, job_id: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Times an attempt started while another attempt of the same job ran.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn enter(&self, job: &Job) -> RunningGuard<'_> {
        {
            let mut jobs = self.running_jobs.lock();
            if jobs.contains(&job.id) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            jobs.push(job.id.clone());
        }
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);
        self.calls.lock().push(Call {
            job_id: job.id.clone(),
            attempt: job.next_attempt_number(),
            started: Instant::now(),
        });
        RunningGuard {
            executor: self,
            job_id: job.id.clone(),
        }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(
        &self,
        job: &Job,
        _profile: SecurityProfile,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let started_at = Utc::now();
        let _guard = self.enter(job);
        let step = self
            .scripts
            .lock()
            .get_mut(&job.repository)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Finish(AttemptOutcome::success()));

        let outcome = match step {
            Step::Finish(outcome) => outcome,
            Step::After(delay, outcome) => tokio::select! {
                _ = tokio::time::sleep(delay) => outcome,
                _ = cancel.cancelled() => AttemptOutcome::Cancelled,
            },
            Step::UntilCancelled => {
                cancel.cancelled().await;
                AttemptOutcome::Cancelled
            }
            Step::Panic => panic!("scripted executor panic for {}", job.id),
        };
        ExecutionReport::bare(started_at, outcome)
    }
}

/// A running scheduler over a fresh on-disk database.
pub struct Harness {
    _dir: TempDir,
    pub store: Arc<JobStore>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub scheduler: Arc<Scheduler>,
    pub events: broadcast::Receiver<JobEvent>,
    /// Events received while waiting for another job.
    seen: Vec<JobEvent>,
    handle: Option<JoinHandle<()>>,
}

impl Harness {
    pub async fn start(
        limits: LimiterConfig,
        retry: RetryConfig,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self::start_with_policy(limits, retry, SecurityPolicy::default(), executor).await
    }

    pub async fn start_with_policy(
        limits: LimiterConfig,
        retry: RetryConfig,
        policy: SecurityPolicy,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite:{}?mode=rwc",
            dir.path().join("proofci.db").to_string_lossy().replace('\\', "/")
        );
        let pool = init_pool_with_size(&url, 4).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let store = Arc::new(JobStore::new(
            Arc::new(SqlxJobRepository::new(pool)),
            RetryController::new(retry),
            policy,
        ));
        let limiter = Arc::new(ConcurrencyLimiter::new(&limits));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&limiter),
            executor,
            SchedulerConfig {
                poll_interval_ms: POLL_INTERVAL_MS,
                store_backoff_initial_ms: 50,
                store_backoff_max_ms: 200,
            },
        ));
        let events = scheduler.subscribe();
        let handle = Some(scheduler.start());

        Self {
            _dir: dir,
            store,
            limiter,
            scheduler,
            events,
            seen: Vec::new(),
            handle,
        }
    }

    /// Enqueue and return the job id.
    pub async fn enqueue(&self, spec: JobSpec) -> String {
        self.store
            .enqueue(spec)
            .await
            .unwrap()
            .job_id()
            .unwrap()
            .to_string()
    }

    /// Wait for the terminal event of `job_id`.
    pub async fn completion(&mut self, job_id: &str, timeout: Duration) -> JobEvent {
        if let Some(pos) = self.seen.iter().position(|e| e.job_id() == job_id) {
            return self.seen.remove(pos);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("no completion event for {job_id} within {timeout:?}"));
            match received {
                Ok(event) if event.job_id() == job_id => return event,
                Ok(event) => self.seen.push(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    }

    /// Stop the scheduler and wait for in-flight attempts to settle.
    pub async fn shutdown(&mut self) {
        self.scheduler.cancellation_token().cancel();
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("scheduler did not stop")
                .unwrap();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.scheduler.cancellation_token().cancel();
    }
}

/// Lean job spec for `repository` at `git_ref`.
pub fn spec(repository: &str, git_ref: &str) -> JobSpec {
    JobSpec::new(
        repository,
        git_ref,
        ProverKind::Lean,
        PayloadRef::new("/srv/checkouts/proofs", "Main.lean"),
    )
}

pub fn retry_config(max_attempts: u32, base_backoff_ms: u64) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_backoff_ms,
        ..RetryConfig::default()
    }
}

pub fn limits(global_capacity: usize, per_repo_capacity: usize) -> LimiterConfig {
    LimiterConfig {
        global_capacity,
        per_repo_capacity,
    }
}

/// Stand-in container runtime: `run` executes the container command on the
/// host, every other subcommand succeeds without doing anything.
#[cfg(unix)]
pub fn host_runtime(dir: &std::path::Path) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    const SCRIPT: &str = r#"#!/bin/sh
[ "$1" = run ] || exit 0
shift
while [ $# -gt 0 ]; do
  case "$1" in
    --*) shift ;;
    *) break ;;
  esac
done
shift
exec "$@"
"#;
    let path = dir.join("runtime");
    std::fs::write(&path, SCRIPT).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
