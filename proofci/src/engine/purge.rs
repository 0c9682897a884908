//! Job purge service: periodic removal of old succeeded and cancelled jobs.
//!
//! Failed jobs are never purged; they stay queryable with their attempt
//! history. Attempts go with their job through the foreign key cascade.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::job_store::JobStore;
use crate::Result;

/// Configuration for job purging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Days to keep succeeded and cancelled jobs. 0 keeps them forever.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Batch size for deletion to avoid long-running transactions.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Interval between purge checks in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_retention_days() -> u32 {
    30
}

fn default_batch_size() -> u32 {
    100
}

fn default_check_interval_secs() -> u64 {
    3600 // 1 hour
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            batch_size: default_batch_size(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl PurgeConfig {
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }
}

pub struct JobPurgeService {
    config: PurgeConfig,
    store: Arc<JobStore>,
}

impl JobPurgeService {
    pub fn new(config: PurgeConfig, store: Arc<JobStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }

    /// Run a single purge. Returns the number of jobs deleted.
    pub async fn run_purge(&self) -> Result<u64> {
        if self.config.retention_days == 0 {
            debug!("Job purging disabled (retention_days = 0)");
            return Ok(0);
        }

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.retention_days));
        let batch_size = self.config.batch_size.max(1);
        let mut total_deleted: u64 = 0;

        loop {
            let deleted = self.store.purge_terminal(cutoff, batch_size).await?;
            total_deleted += deleted;
            if deleted < u64::from(batch_size) {
                break;
            }
            // Let other writers in between batches.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if total_deleted > 0 {
            info!(
                "Purged {} old jobs (retention: {} days)",
                total_deleted, self.config.retention_days
            );
        } else {
            debug!("No jobs to purge");
        }
        Ok(total_deleted)
    }

    /// Start the background purge task.
    pub fn start_background_task(
        self: Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut check_interval =
                interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Job purge service started (retention: {} days, interval: {}s)",
                self.config.retention_days, self.config.check_interval_secs
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Job purge service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = self.run_purge().await {
                            error!("Purge cycle failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
