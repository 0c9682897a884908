//! Verification job execution engine.
//!
//! Leaves first: [`limiter`] and [`retry`] are pure in-memory policy,
//! [`executor`] runs one attempt in a sandbox, [`job_store`] owns durable
//! state and [`scheduler`] is the loop tying them together.

pub mod events;
pub mod executor;
pub mod job_store;
pub mod limiter;
pub mod purge;
pub mod retry;
pub mod scheduler;

pub use events::{JobEvent, JobEventBroadcaster};
pub use executor::{ExecutionReport, Executor, ExecutorConfig, SandboxExecutor};
pub use job_store::{
    CancelOutcome, EnqueueOutcome, JobStore, QueueConfig, QueueStats, RecordedAttempt,
};
pub use limiter::{
    AdmissionError, CapacityScope, ConcurrencyLimiter, ConcurrencyPermit, LimiterConfig,
};
pub use purge::{JobPurgeService, PurgeConfig};
pub use retry::{RetryConfig, RetryController, RetryDecision};
pub use scheduler::{Scheduler, SchedulerConfig};
