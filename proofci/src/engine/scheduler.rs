//! Scheduler: the control loop composing store, limiter and executor.
//!
//! Each tick claims due jobs up to the free global capacity, asks the
//! limiter for a permit per job and spawns an attempt task for every job
//! admitted. A job refused admission goes straight back to PENDING without
//! an attempt being recorded. Mutual exclusion between schedulers (in this
//! or another process) comes only from the store's atomic claim.
//!
//! Attempt tasks run concurrently in a `JoinSet`. Each one drops its permit
//! as soon as the executor returns, then records the attempt.
//!
//! Between ticks the loop sleeps until the next backed-off job becomes due,
//! never longer than the poll interval. Enqueues and finished attempts wake
//! it early.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{JobEvent, JobEventBroadcaster};
use super::executor::{ExecutionReport, Executor};
use super::job_store::{CancelOutcome, JobStore, RecordedAttempt};
use super::limiter::{ConcurrencyLimiter, ConcurrencyPermit};
use super::retry::RetryDecision;
use crate::Result;
use crate::database::repositories::ClaimRequest;
use crate::domain::{AttemptOutcome, ExecutionAttempt, FaultCause, Job, JobStatus};

/// Default poll interval (1 second).
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Default first delay after a store failure.
const DEFAULT_STORE_BACKOFF_INITIAL_MS: u64 = 500;

/// Default cap on the store failure delay.
const DEFAULT_STORE_BACKOFF_MAX_MS: u64 = 30_000;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between ticks when nothing wakes the loop earlier.
    pub poll_interval_ms: u64,
    /// First delay after the store fails; doubles per consecutive failure.
    pub store_backoff_initial_ms: u64,
    pub store_backoff_max_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            store_backoff_initial_ms: DEFAULT_STORE_BACKOFF_INITIAL_MS,
            store_backoff_max_ms: DEFAULT_STORE_BACKOFF_MAX_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Delay after `failures` consecutive store failures.
    pub fn store_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let delay_ms = self
            .store_backoff_initial_ms
            .saturating_mul(1u64 << exponent)
            .min(self.store_backoff_max_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Cancellation handle of a running attempt.
struct InFlight {
    token: CancellationToken,
    /// Set when the job itself was cancelled, as opposed to the scheduler
    /// shutting down.
    cancel_requested: Arc<AtomicBool>,
}

impl InFlight {
    fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.token.cancel();
    }
}

pub struct Scheduler {
    store: Arc<JobStore>,
    limiter: Arc<ConcurrencyLimiter>,
    executor: Arc<dyn Executor>,
    config: SchedulerConfig,
    events: JobEventBroadcaster,
    in_flight: DashMap<String, InFlight>,
    /// Claimed jobs whose release failed; retried on the next tick.
    unreleased: Mutex<Vec<String>>,
    cancellation_token: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        limiter: Arc<ConcurrencyLimiter>,
        executor: Arc<dyn Executor>,
        config: SchedulerConfig,
    ) -> Self {
        Self::with_cancellation(store, limiter, executor, config, CancellationToken::new())
    }

    pub fn with_cancellation(
        store: Arc<JobStore>,
        limiter: Arc<ConcurrencyLimiter>,
        executor: Arc<dyn Executor>,
        config: SchedulerConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            limiter,
            executor,
            config,
            events: JobEventBroadcaster::new(),
            in_flight: DashMap::new(),
            unreleased: Mutex::new(Vec::new()),
            cancellation_token,
        }
    }

    /// Cancelling this token stops the scheduler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    /// Number of attempts currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Spawn [`Scheduler::run`] on the runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Run until the cancellation token fires, then stop in-flight
    /// attempts and wait for them to tear down.
    pub async fn run(self: Arc<Self>) {
        let notify = self.store.notifier();
        let poll_interval = self.config.poll_interval();
        let mut attempts = JoinSet::new();
        let mut store_failures = 0u32;

        info!(
            global_capacity = self.limiter.global_capacity(),
            per_repo_capacity = self.limiter.per_repo_capacity(),
            "Scheduler started"
        );

        loop {
            let tick_started = Utc::now();
            let wait = match self.tick(&mut attempts).await {
                Ok(dispatched) => {
                    store_failures = 0;
                    if dispatched > 0 {
                        debug!(dispatched, in_flight = attempts.len(), "Dispatched attempts");
                    }
                    self.idle_wait(tick_started, poll_interval).await
                }
                Err(e) => {
                    store_failures = store_failures.saturating_add(1);
                    let delay = self.config.store_backoff(store_failures);
                    if e.is_store_unavailable() {
                        warn!("Job store unavailable, next tick in {:?}: {}", delay, e);
                    } else {
                        error!("Scheduler tick failed, next tick in {:?}: {}", delay, e);
                    }
                    delay
                }
            };

            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("Scheduler received cancellation signal");
                    break;
                }
                _ = notify.notified(), if store_failures == 0 => {}
                _ = tokio::time::sleep(wait) => {}
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    log_join(joined);
                }
            }
        }

        self.drain(attempts).await;
    }

    /// One pass: settle leftovers, observe cancellations, claim and dispatch.
    /// Returns the number of attempts started.
    async fn tick(self: &Arc<Self>, attempts: &mut JoinSet<()>) -> Result<usize> {
        self.retry_unreleased().await?;
        self.observe_cancellations().await?;

        let capacity = self.limiter.available_global();
        if capacity == 0 {
            return Ok(0);
        }

        let request = ClaimRequest {
            limit: capacity,
            per_repository: self.limiter.per_repo_capacity(),
            exclude_repositories: self.limiter.saturated_repositories(),
        };
        let jobs = self.store.claim_next(&request).await?;

        let mut dispatched = 0;
        for job in jobs {
            if self.cancellation_token.is_cancelled() {
                self.release_claim(&job.id).await;
                continue;
            }
            match self.limiter.try_acquire(&job.repository) {
                Ok(permit) => {
                    self.dispatch(attempts, job, permit);
                    dispatched += 1;
                }
                Err(refusal) => {
                    warn!(job_id = %job.id, "Admission refused: {}", refusal);
                    self.release_claim(&job.id).await;
                }
            }
        }
        Ok(dispatched)
    }

    /// Jobs due at or before `tick_started` were either claimed or are
    /// waiting on capacity, which wakes the loop when it frees.
    async fn idle_wait(&self, tick_started: DateTime<Utc>, poll_interval: Duration) -> Duration {
        match self.store.next_due_after(tick_started).await {
            Ok(next_due) => wait_until_due(Utc::now(), next_due, poll_interval),
            Err(e) => {
                debug!("Failed to read next due time: {}", e);
                poll_interval
            }
        }
    }

    fn dispatch(self: &Arc<Self>, attempts: &mut JoinSet<()>, job: Job, permit: ConcurrencyPermit) {
        let token = self.cancellation_token.child_token();
        let cancel_requested = Arc::new(AtomicBool::new(false));
        self.in_flight.insert(
            job.id.clone(),
            InFlight {
                token: token.clone(),
                cancel_requested: Arc::clone(&cancel_requested),
            },
        );

        info!(
            job_id = %job.id,
            repository = %job.repository,
            attempt = job.next_attempt_number(),
            profile = %job.security_profile,
            "Dispatching attempt"
        );
        attempts.spawn(Arc::clone(self).run_attempt(job, permit, token, cancel_requested));
    }

    async fn run_attempt(
        self: Arc<Self>,
        job: Job,
        permit: ConcurrencyPermit,
        token: CancellationToken,
        cancel_requested: Arc<AtomicBool>,
    ) {
        let attempt_number = job.next_attempt_number();
        let execution = self.executor.execute(&job, job.security_profile, token);
        let report = match AssertUnwindSafe(execution).catch_unwind().await {
            Ok(report) => report,
            Err(_) => {
                error!(job_id = %job.id, attempt = attempt_number, "Executor panicked");
                ExecutionReport::bare(
                    Utc::now(),
                    AttemptOutcome::transient(FaultCause::SandboxAllocation, "executor panicked"),
                )
            }
        };

        // Leave the in-flight map before the job can be claimed again.
        self.in_flight.remove(&job.id);
        drop(permit);

        let interrupted = report.outcome == AttemptOutcome::Cancelled
            && !cancel_requested.load(Ordering::SeqCst);
        if interrupted {
            info!(job_id = %job.id, "Attempt interrupted by shutdown, releasing job");
            self.release_claim(&job.id).await;
        } else {
            self.record(&job, report.into_attempt(attempt_number)).await;
        }
    }

    /// Record an attempt, retrying while the store is unavailable.
    async fn record(&self, job: &Job, attempt: ExecutionAttempt) {
        let mut failures = 0u32;
        loop {
            match self.store.record_attempt(&job.id, attempt.clone()).await {
                Ok(recorded) => {
                    self.on_recorded(job, &attempt, recorded);
                    return;
                }
                Err(e) if e.is_store_unavailable() && !self.cancellation_token.is_cancelled() => {
                    failures = failures.saturating_add(1);
                    let delay = self.config.store_backoff(failures);
                    warn!(
                        job_id = %job.id,
                        attempt = attempt.attempt_number,
                        "Failed to record attempt, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancellation_token.cancelled() => {}
                    }
                }
                Err(e) => {
                    // The job stays RUNNING until the next startup recovers it.
                    error!(
                        job_id = %job.id,
                        attempt = attempt.attempt_number,
                        "Failed to record attempt: {}",
                        e
                    );
                    return;
                }
            }
        }
    }

    fn on_recorded(&self, job: &Job, attempt: &ExecutionAttempt, recorded: RecordedAttempt) {
        let outcome = attempt.outcome.kind();
        match &recorded.decision {
            RetryDecision::RetryAfter { delay, reason } => warn!(
                job_id = %job.id,
                attempt = attempt.attempt_number,
                %outcome,
                "Attempt failed transiently, retrying in {:?}: {}",
                delay,
                reason
            ),
            _ => info!(
                job_id = %job.id,
                attempt = attempt.attempt_number,
                %outcome,
                status = %recorded.job.status,
                "Attempt finished"
            ),
        }

        if recorded.became_terminal {
            self.events.publish(JobEvent::Completed {
                job_id: recorded.job.id.clone(),
                repository: recorded.job.repository.clone(),
                status: recorded.job.status,
                outcome: Some(attempt.outcome.clone()),
                attempts: recorded.job.attempt_count,
            });
        }
    }

    /// Cancel a job. A running attempt is signalled and its sandbox torn
    /// down within the executor's grace period.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let outcome = self.store.cancel(job_id).await?;
        if let CancelOutcome::Cancelled { job, .. } = &outcome {
            if let Some(entry) = self.in_flight.get(job_id) {
                entry.request_cancel();
            }
            self.events.publish(JobEvent::Completed {
                job_id: job.id.clone(),
                repository: job.repository.clone(),
                status: JobStatus::Cancelled,
                outcome: None,
                attempts: job.attempt_count,
            });
        }
        Ok(outcome)
    }

    /// Stop attempts whose jobs were cancelled through the store directly,
    /// e.g. by another process.
    async fn observe_cancellations(&self) -> Result<()> {
        let ids: Vec<String> = self
            .in_flight
            .iter()
            .filter(|entry| !entry.cancel_requested.load(Ordering::SeqCst))
            .map(|entry| entry.key().clone())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        for id in self.store.cancelled_among(&ids).await? {
            if let Some(entry) = self.in_flight.get(&id) {
                info!(job_id = %id, "Job cancelled elsewhere, stopping attempt");
                entry.request_cancel();
            }
        }
        Ok(())
    }

    async fn release_claim(&self, job_id: &str) {
        if let Err(e) = self.store.release(job_id).await {
            warn!(job_id, "Failed to release claimed job, will retry: {}", e);
            self.unreleased.lock().push(job_id.to_string());
        }
    }

    async fn retry_unreleased(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.unreleased.lock());
        for (i, job_id) in pending.iter().enumerate() {
            if let Err(e) = self.store.release(job_id).await {
                self.unreleased.lock().extend(pending[i..].iter().cloned());
                return Err(e);
            }
        }
        Ok(())
    }

    async fn drain(&self, mut attempts: JoinSet<()>) {
        if !attempts.is_empty() {
            info!(
                in_flight = attempts.len(),
                "Waiting for interrupted attempts to tear down"
            );
        }
        // Attempt tokens are children of the scheduler token, so every
        // attempt has already been told to stop.
        while let Some(joined) = attempts.join_next().await {
            log_join(joined);
        }
        if let Err(e) = self.retry_unreleased().await {
            warn!("Jobs left RUNNING until next startup: {}", e);
        }
        info!("Scheduler stopped");
    }
}

/// Sleep before the next tick: until `next_due`, capped by `poll_interval`.
fn wait_until_due(
    now: DateTime<Utc>,
    next_due: Option<DateTime<Utc>>,
    poll_interval: Duration,
) -> Duration {
    next_due
        .map_or(poll_interval, |due| {
            (due - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(poll_interval)
        })
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("Attempt task failed: {}", e);
    }
}
