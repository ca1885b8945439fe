//! Per-host politeness: a distributed fetch lease plus adaptive crawl delay.
//!
//! At most one worker holds the lease for a host at a time. The effective
//! delay between fetches is the max of the configured floor, the robots.txt
//! crawl-delay, and an adaptive penalty driven by server responses.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coord::{CoordError, CoordStore};

/// Penalty ceiling, seconds.
const MAX_PENALTY_SECS: f64 = 120.0;
/// Additive decrease applied on each successful fetch, seconds.
const PENALTY_DECAY_SECS: f64 = 0.5;

fn lease_key(host: &str) -> String {
    format!("lease:{}", host)
}

fn domain_key(host: &str) -> String {
    format!("domain:{}", host)
}

/// Shared per-host state. Created lazily on the first fetch of a host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Epoch millis of the last completed fetch on this host.
    pub last_fetch_ms: i64,
    /// Crawl-delay advertised by robots.txt, seconds.
    pub robots_delay_secs: f64,
    /// Adaptive penalty, seconds.
    pub penalty_secs: f64,
}

/// What the fetch told us about the host's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    /// 429 or 5xx: the host is pushing back.
    Throttled,
    TransportError,
}

/// Result of a lease attempt.
#[derive(Debug)]
pub enum LeaseDecision {
    Acquired,
    /// Another worker holds the lease.
    Busy { retry_after: Duration },
    /// Lease was free but the crawl delay has not elapsed yet.
    NotYet { retry_after: Duration },
}

pub struct Politeness {
    coord: Arc<dyn CoordStore>,
    default_delay: Duration,
    lease_ttl: Duration,
}

impl Politeness {
    pub fn new(coord: Arc<dyn CoordStore>, default_delay: Duration, lease_ttl: Duration) -> Self {
        Self {
            coord,
            default_delay,
            lease_ttl,
        }
    }

    async fn domain_record(&self, host: &str) -> Result<DomainRecord, CoordError> {
        match self.coord.kv_get(&domain_key(host)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(DomainRecord::default()),
        }
    }

    async fn write_domain_record(
        &self,
        host: &str,
        record: &DomainRecord,
    ) -> Result<(), CoordError> {
        let raw =
            serde_json::to_string(record).map_err(|e| CoordError::Protocol(e.to_string()))?;
        self.coord.kv_set(&domain_key(host), &raw, None).await
    }

    /// Effective delay for a host: max(floor, robots crawl-delay, penalty).
    fn effective_delay(&self, record: &DomainRecord) -> Duration {
        let secs = self
            .default_delay
            .as_secs_f64()
            .max(record.robots_delay_secs)
            .max(record.penalty_secs);
        Duration::from_secs_f64(secs)
    }

    /// Try to become the sole fetcher for `host`.
    ///
    /// On `Acquired` the caller owns the host until `release` or lease
    /// expiry. On `Busy`/`NotYet` the caller must back off for at least
    /// `retry_after` before retrying.
    pub async fn try_acquire(&self, host: &str, worker: &str) -> Result<LeaseDecision, CoordError> {
        let acquired = self
            .coord
            .kv_set_if_absent(&lease_key(host), worker, self.lease_ttl)
            .await?;
        if !acquired {
            return Ok(LeaseDecision::Busy {
                retry_after: self.default_delay / 2,
            });
        }

        let record = self.domain_record(host).await?;
        let delay = self.effective_delay(&record);
        let elapsed_ms =
            (chrono::Utc::now().timestamp_millis() - record.last_fetch_ms).max(0) as u128;

        if record.last_fetch_ms > 0 && elapsed_ms < delay.as_millis() {
            // Hand the lease back; the host is not due yet.
            self.coord
                .kv_compare_and_delete(&lease_key(host), worker)
                .await?;
            let remaining = delay.saturating_sub(Duration::from_millis(elapsed_ms as u64));
            return Ok(LeaseDecision::NotYet {
                retry_after: remaining,
            });
        }

        Ok(LeaseDecision::Acquired)
    }

    /// Record the fetch, adjust the adaptive penalty, and free the lease.
    ///
    /// The delete is compare-and-delete on the worker id, so a slow worker
    /// whose lease already expired cannot clobber a successor's lease.
    pub async fn release(
        &self,
        host: &str,
        worker: &str,
        outcome: FetchOutcome,
    ) -> Result<(), CoordError> {
        let mut record = self.domain_record(host).await?;
        record.last_fetch_ms = chrono::Utc::now().timestamp_millis();
        record.penalty_secs = match outcome {
            FetchOutcome::Success => (record.penalty_secs - PENALTY_DECAY_SECS).max(0.0),
            FetchOutcome::Throttled | FetchOutcome::TransportError => {
                (record.penalty_secs.max(1.0) * 2.0).min(MAX_PENALTY_SECS)
            }
        };
        self.write_domain_record(host, &record).await?;

        self.coord
            .kv_compare_and_delete(&lease_key(host), worker)
            .await?;
        Ok(())
    }

    /// Record the robots.txt crawl-delay for a host.
    pub async fn set_robots_delay(&self, host: &str, delay_secs: f64) -> Result<(), CoordError> {
        let mut record = self.domain_record(host).await?;
        record.robots_delay_secs = delay_secs;
        self.write_domain_record(host, &record).await
    }

    /// Current effective delay for a host, for reporting.
    pub async fn current_delay(&self, host: &str) -> Result<Duration, CoordError> {
        let record = self.domain_record(host).await?;
        Ok(self.effective_delay(&record))
    }
}
