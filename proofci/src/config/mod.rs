//! Application configuration.
//!
//! Resolution order, later wins:
//! 1. Built-in defaults
//! 2. JSON file named by `PROOFCI_CONFIG`
//! 3. Individual `PROOFCI_*` environment variables (a `.env` file is read
//!    first via `dotenvy`)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::domain::{SecurityPolicy, SecurityProfile};
use crate::engine::{
    ExecutorConfig, LimiterConfig, PurgeConfig, QueueConfig, RetryConfig, SchedulerConfig,
};
use crate::logging::LoggingConfig;
use crate::{Error, Result};

/// Default database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:proofci.db?mode=rwc";

/// Environment variable naming the JSON config file.
pub const CONFIG_FILE_ENV: &str = "PROOFCI_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub limits: LimiterConfig,
    pub retry: RetryConfig,
    pub executor: ExecutorConfig,
    pub security: SecurityPolicy,
    pub purge: PurgeConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            limits: LimiterConfig::default(),
            retry: RetryConfig::default(),
            executor: ExecutorConfig::default(),
            security: SecurityPolicy::default(),
            purge: PurgeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from the environment of the current process.
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env file");
        }

        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::config(format!("Invalid config: {}", e)))
    }

    /// Apply `PROOFCI_*` overrides fetched through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("PROOFCI_DATABASE_URL").or_else(|| get("DATABASE_URL")) {
            self.database_url = url;
        }

        override_parsed(&get, "PROOFCI_GLOBAL_CAPACITY", &mut self.limits.global_capacity)?;
        override_parsed(&get, "PROOFCI_PER_REPO_CAPACITY", &mut self.limits.per_repo_capacity)?;

        override_parsed(&get, "PROOFCI_MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        override_parsed(&get, "PROOFCI_BASE_BACKOFF_MS", &mut self.retry.base_backoff_ms)?;
        override_parsed(&get, "PROOFCI_MAX_BACKOFF_MS", &mut self.retry.max_backoff_ms)?;
        override_parsed(&get, "PROOFCI_RETRY_JITTER", &mut self.retry.jitter)?;

        override_parsed(&get, "PROOFCI_POLL_INTERVAL_MS", &mut self.scheduler.poll_interval_ms)?;
        override_parsed(&get, "PROOFCI_MAX_PENDING", &mut self.queue.max_pending)?;

        if let Some(runtime) = get("PROOFCI_CONTAINER_RUNTIME") {
            self.executor.container_runtime = runtime;
        }
        if let Some(image) = get("PROOFCI_VERIFIER_IMAGE") {
            self.executor.image = image;
        }
        if let Some(runtime) = lookup("PROOFCI_SECURE_RUNTIME") {
            let runtime = runtime.trim();
            self.executor.secure_runtime = (!runtime.is_empty()).then(|| runtime.to_string());
        }
        override_parsed(&get, "PROOFCI_TIMEOUT_SECS", &mut self.executor.timeout_secs)?;
        override_parsed(&get, "PROOFCI_MEMORY_MB", &mut self.executor.memory_mb)?;
        override_parsed(&get, "PROOFCI_CPUS", &mut self.executor.cpus)?;
        if let Some(root) = get("PROOFCI_SCRATCH_ROOT") {
            self.executor.scratch_root = Some(root.into());
        }
        if let Some(socket) = get("PROOFCI_BACKEND_SOCKET") {
            self.executor.backend_socket = Some(socket.into());
        }

        override_parsed(
            &get,
            "PROOFCI_DEFAULT_PROFILE",
            &mut self.security.default_profile,
        )?;
        if let Some(raw) = get("PROOFCI_REPO_PROFILES") {
            self.security
                .repositories
                .extend(SecurityPolicy::parse_overrides(&raw)?);
        }

        override_parsed(&get, "PROOFCI_RETENTION_DAYS", &mut self.purge.retention_days)?;

        if let Some(filter) = get("PROOFCI_LOG_FILTER") {
            self.logging.filter = filter;
        }
        if let Some(dir) = get("PROOFCI_LOG_DIR") {
            self.logging.directory = Some(dir.into());
        }
        override_parsed(&get, "PROOFCI_LOG_JSON", &mut self.logging.json)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database_url must not be empty"));
        }
        self.queue.validate()?;
        if self.limits.global_capacity == 0 {
            return Err(Error::config("limits.global_capacity must be positive"));
        }
        if self.limits.per_repo_capacity == 0 {
            return Err(Error::config("limits.per_repo_capacity must be positive"));
        }
        if self.limits.per_repo_capacity > self.limits.global_capacity {
            warn!(
                per_repo = self.limits.per_repo_capacity,
                global = self.limits.global_capacity,
                "per_repo_capacity exceeds global_capacity; the global pool is the effective bound"
            );
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(Error::config("retry.jitter must be in [0, 1)"));
        }
        if self.retry.max_backoff_ms < self.retry.base_backoff_ms {
            return Err(Error::config(
                "retry.max_backoff_ms must not be below retry.base_backoff_ms",
            ));
        }
        if self.security.default_profile == SecurityProfile::Maximum
            && self.executor.secure_runtime.is_none()
        {
            warn!("Default profile is MAXIMUM but no secure runtime is configured; every job will fail to allocate");
        }
        self.executor.validate()
    }
}

fn override_parsed<T, G>(get: &G, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("{key}: cannot parse '{}'", raw.trim())))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert_eq!(config.limits.global_capacity, 10);
        assert_eq!(config.limits.per_repo_capacity, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_backoff_ms, 1000);
        assert_eq!(config.security.default_profile, SecurityProfile::Standard);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = AppConfig::from_json(
            r#"{
                "limits": {"global_capacity": 4},
                "security": {"default_profile": "maximum", "repositories": {"acme/kernel": "maximum"}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.limits.global_capacity, 4);
        assert_eq!(config.limits.per_repo_capacity, 3);
        assert_eq!(config.security.default_profile, SecurityProfile::Maximum);
        assert_eq!(
            config.security.repositories.get("acme/kernel"),
            Some(&SecurityProfile::Maximum)
        );
        assert!(AppConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(env(&[
                ("PROOFCI_DATABASE_URL", "sqlite::memory:"),
                ("PROOFCI_GLOBAL_CAPACITY", "1"),
                ("PROOFCI_PER_REPO_CAPACITY", " 1 "),
                ("PROOFCI_MAX_ATTEMPTS", "5"),
                ("PROOFCI_BASE_BACKOFF_MS", "250"),
                ("PROOFCI_DEFAULT_PROFILE", "minimal"),
                ("PROOFCI_REPO_PROFILES", "acme/a=standard, acme/b=MAXIMUM"),
                ("PROOFCI_SECURE_RUNTIME", ""),
                ("PROOFCI_LOG_JSON", "true"),
                ("PROOFCI_MAX_PENDING", "50"),
            ]))
            .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.limits.global_capacity, 1);
        assert_eq!(config.limits.per_repo_capacity, 1);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_backoff_ms, 250);
        assert_eq!(config.security.default_profile, SecurityProfile::Minimal);
        assert_eq!(config.security.repositories.len(), 2);
        assert_eq!(config.executor.secure_runtime, None);
        assert!(config.logging.json);
        assert_eq!(config.queue.max_pending, 50);
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env_overrides(env(&[("PROOFCI_GLOBAL_CAPACITY", "ten")]))
            .unwrap_err();
        assert!(err.to_string().contains("PROOFCI_GLOBAL_CAPACITY"));

        let mut config = AppConfig::default();
        assert!(
            config
                .apply_env_overrides(env(&[("PROOFCI_REPO_PROFILES", "acme/a=paranoid")]))
                .is_err()
        );
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = AppConfig::default();
        config.limits.global_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.queue.max_pending = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.limits.per_repo_capacity = 20;
        config.validate().unwrap();
    }
}
