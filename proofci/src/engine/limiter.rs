//! Admission control: a global pool and one pool per repository.
//!
//! A [`ConcurrencyPermit`] holds one unit of each. Both units are returned
//! when the permit is dropped, so capacity cannot leak through early
//! returns, errors or cancelled tasks.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for the concurrency limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub global_capacity: usize,
    pub per_repo_capacity: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            global_capacity: 10,
            per_repo_capacity: 3,
        }
    }
}

/// Pool that refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CapacityScope {
    Global,
    Repository,
}

/// Admission refusal. Retryable, and never counted against the job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("{scope} capacity exhausted for repository {repository}")]
    CapacityExhausted {
        scope: CapacityScope,
        repository: String,
    },
}

type RepoPools = Arc<DashMap<String, Arc<Semaphore>>>;

/// Two-level concurrency limiter.
pub struct ConcurrencyLimiter {
    global: Arc<Semaphore>,
    global_capacity: usize,
    per_repo_capacity: usize,
    repos: RepoPools,
}

impl ConcurrencyLimiter {
    pub fn new(config: &LimiterConfig) -> Self {
        let global_capacity = config.global_capacity.max(1);
        Self {
            global: Arc::new(Semaphore::new(global_capacity)),
            global_capacity,
            per_repo_capacity: config.per_repo_capacity.max(1),
            repos: Arc::new(DashMap::new()),
        }
    }

    /// Take one unit from the global pool and one from `repository`'s pool,
    /// or neither. Never waits.
    pub fn try_acquire(&self, repository: &str) -> Result<ConcurrencyPermit, AdmissionError> {
        let exhausted = |scope| AdmissionError::CapacityExhausted {
            scope,
            repository: repository.to_string(),
        };

        let global = self
            .global
            .clone()
            .try_acquire_owned()
            .map_err(|_| exhausted(CapacityScope::Global))?;

        let pool = self
            .repos
            .entry(repository.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_repo_capacity)))
            .value()
            .clone();
        // On failure `global` drops here and its unit goes back.
        let repo = pool
            .try_acquire_owned()
            .map_err(|_| exhausted(CapacityScope::Repository))?;

        Ok(ConcurrencyPermit {
            repository: repository.to_string(),
            global: Some(global),
            repo: Some(repo),
            repos: Arc::clone(&self.repos),
            per_repo_capacity: self.per_repo_capacity,
        })
    }

    pub fn global_capacity(&self) -> usize {
        self.global_capacity
    }

    pub fn per_repo_capacity(&self) -> usize {
        self.per_repo_capacity
    }

    /// Free units in the global pool.
    pub fn available_global(&self) -> usize {
        self.global.available_permits()
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.global_capacity - self.global.available_permits()
    }

    /// Permits currently held for `repository`.
    pub fn in_use_for(&self, repository: &str) -> usize {
        self.repos
            .get(repository)
            .map(|pool| self.per_repo_capacity - pool.available_permits())
            .unwrap_or(0)
    }

    /// Repositories with no free units.
    pub fn saturated_repositories(&self) -> Vec<String> {
        self.repos
            .iter()
            .filter(|entry| entry.value().available_permits() == 0)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of repositories with a live pool.
    pub fn tracked_repositories(&self) -> usize {
        self.repos.len()
    }
}

/// One unit of global and one unit of per-repository capacity.
#[must_use = "capacity is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct ConcurrencyPermit {
    repository: String,
    global: Option<OwnedSemaphorePermit>,
    repo: Option<OwnedSemaphorePermit>,
    repos: RepoPools,
    per_repo_capacity: usize,
}

impl ConcurrencyPermit {
    pub fn repository(&self) -> &str {
        &self.repository
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.repo.take();
        self.global.take();
        // Forget idle repository pools so the map does not grow with every
        // repository ever seen. Only the map's own reference may remain.
        let capacity = self.per_repo_capacity;
        self.repos.remove_if(&self.repository, |_, pool| {
            Arc::strong_count(pool) == 1 && pool.available_permits() == capacity
        });
    }
}
