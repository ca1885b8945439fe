//! Worker startup configuration.
//!
//! Immutable after startup; every knob here maps to a CLI flag or
//! environment variable. Validation failures are a misconfiguration exit.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub redis_url: String,
    pub mongodb_uri: String,
    pub mongodb_database: String,
    pub user_agent: String,

    /// Stop after this many persisted pages. None = unlimited.
    pub max_pages: Option<u64>,

    pub batch_size: usize,
    pub batch_age_seconds: u64,
    pub fetch_timeout_seconds: u64,
    pub default_crawl_delay_seconds: f64,
    pub claim_ttl_seconds: u64,
    pub lease_ttl_seconds: u64,
    pub filter_capacity: u64,
    pub filter_error_rate: f64,
    pub max_retries: u32,
    pub robots_ttl_seconds: u64,
    pub max_content_bytes: usize,

    pub idle_backoff_seconds: f64,
    pub max_idle_polls: u32,
    pub host_claim_budget: u32,
    pub sweep_interval_seconds: u64,
    pub grace_period_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: generate_worker_id(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            mongodb_uri: "mongodb://127.0.0.1:27017".to_string(),
            mongodb_database: "web_crawler".to_string(),
            user_agent: "Swarmcrawl/0.3".to_string(),
            max_pages: None,
            batch_size: 50,
            batch_age_seconds: 5,
            fetch_timeout_seconds: 10,
            default_crawl_delay_seconds: 1.0,
            claim_ttl_seconds: 600,
            lease_ttl_seconds: 30,
            filter_capacity: 10_000_000,
            filter_error_rate: 0.001,
            max_retries: 3,
            robots_ttl_seconds: 3600,
            max_content_bytes: 10 * 1024 * 1024,
            idle_backoff_seconds: 1.0,
            max_idle_polls: 30,
            host_claim_budget: 5,
            sweep_interval_seconds: 60,
            grace_period_seconds: 15,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::Invalid("worker_id must not be empty".into()));
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::Invalid("user_agent must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.fetch_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "fetch_timeout_seconds must be positive".into(),
            ));
        }
        if self.filter_capacity == 0 {
            return Err(ConfigError::Invalid(
                "filter_capacity must be positive".into(),
            ));
        }
        if !(self.filter_error_rate > 0.0 && self.filter_error_rate < 1.0) {
            return Err(ConfigError::Invalid(
                "filter_error_rate must be in (0, 1)".into(),
            ));
        }
        if self.default_crawl_delay_seconds < 0.0 {
            return Err(ConfigError::Invalid(
                "default_crawl_delay_seconds must not be negative".into(),
            ));
        }
        if self.lease_ttl_seconds == 0 || self.claim_ttl_seconds == 0 {
            return Err(ConfigError::Invalid("TTLs must be positive".into()));
        }
        if self.claim_ttl_seconds <= self.lease_ttl_seconds {
            return Err(ConfigError::Invalid(
                "claim_ttl_seconds must exceed lease_ttl_seconds".into(),
            ));
        }
        if self.max_content_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_content_bytes must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn batch_age(&self) -> Duration {
        Duration::from_secs(self.batch_age_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn default_crawl_delay(&self) -> Duration {
        Duration::from_secs_f64(self.default_crawl_delay_seconds)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_seconds)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    pub fn robots_ttl(&self) -> Duration {
        Duration::from_secs(self.robots_ttl_seconds)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.idle_backoff_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
}

/// Stable-enough worker identity: hostname, pid, and a random suffix.
pub fn generate_worker_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", hostname, std::process::id(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        WorkerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_error_rate() {
        let mut config = WorkerConfig::default();
        config.filter_error_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_batch() {
        let mut config = WorkerConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_claim_ttl_below_lease_ttl() {
        let mut config = WorkerConfig::default();
        config.claim_ttl_seconds = 10;
        config.lease_ttl_seconds = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_ids_are_unique() {
        assert_ne!(generate_worker_id(), generate_worker_id());
    }
}
