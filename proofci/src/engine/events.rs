//! Job completion events.
//!
//! Only terminal transitions are published. Consumers (reporting, forge
//! status updates) subscribe through [`JobEventBroadcaster::subscribe`].

use tokio::sync::broadcast;

use crate::domain::{AttemptOutcome, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// A job reached SUCCEEDED, FAILED or CANCELLED.
    Completed {
        job_id: String,
        repository: String,
        status: JobStatus,
        /// Outcome of the last attempt. `None` when the job was cancelled.
        outcome: Option<AttemptOutcome>,
        attempts: u32,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Completed { job_id, .. } => job_id,
        }
    }

    /// Get a description of the event for logging.
    pub fn description(&self) -> String {
        match self {
            Self::Completed {
                job_id,
                status,
                attempts,
                ..
            } => format!("Job {} completed: {} after {} attempts", job_id, status, attempts),
        }
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcaster for job events.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: broadcast::Sender<JobEvent>,
}

impl JobEventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of receivers, 0 if none.
    pub fn publish(&self, event: JobEvent) -> usize {
        tracing::debug!("Publishing job event: {}", event.description());
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
