//! URL frontier: priority-ordered shared queue with in-flight claim
//! tracking and stale-claim recovery.
//!
//! A URL lives in exactly one of three places: the frontier sorted set, the
//! `inflight:<url>` claim map, or "completed" (approximated by the filter).
//! Lower priority scores are served first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coord::{CoordError, CoordStore};
use crate::filter::UrlFilter;
use crate::url_utils;

pub const FRONTIER_KEY: &str = "frontier";

/// Retry counters outlive individual claims but not a crawl campaign.
const RETRY_TTL: Duration = Duration::from_secs(24 * 3600);

/// How many admissions between frontier-length samples for backpressure.
const LEN_SAMPLE_INTERVAL: u64 = 128;

fn inflight_key(url: &str) -> String {
    format!("inflight:{}", url)
}

fn retry_key(url: &str) -> String {
    format!("retries:{}", url)
}

/// Claim record stored under `inflight:<url>`.
///
/// Carries the popped priority so re-enqueue paths can apply penalties
/// without consulting the frontier again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InflightRecord {
    pub worker: String,
    pub claimed_at_ms: i64,
    pub priority: f64,
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The filter already knew this URL.
    Duplicate,
    /// Not a crawlable URL (scheme, extension, length, unparseable).
    Ineligible,
    /// Backpressure: frontier over the soft bound, low-priority entry shed.
    Dropped,
}

/// A URL handed to a worker, with the priority it was queued at.
#[derive(Debug, Clone)]
pub struct Claim {
    pub url: String,
    pub priority: f64,
}

#[derive(Debug, Clone)]
pub struct FrontierConfig {
    pub claim_ttl: Duration,
    pub max_retries: u32,
    pub soft_capacity: u64,
    pub retry_penalty: f64,
    pub stale_penalty: f64,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::from_secs(600),
            max_retries: 3,
            soft_capacity: 1_000_000,
            retry_penalty: 5.0,
            stale_penalty: 10.0,
        }
    }
}

pub struct Frontier {
    coord: Arc<dyn CoordStore>,
    filter: UrlFilter,
    config: FrontierConfig,
    admissions: AtomicU64,
    cached_len: AtomicU64,
}

impl Frontier {
    pub fn new(coord: Arc<dyn CoordStore>, filter: UrlFilter, config: FrontierConfig) -> Self {
        Self {
            coord,
            filter,
            config,
            admissions: AtomicU64::new(0),
            cached_len: AtomicU64::new(0),
        }
    }

    pub fn filter(&self) -> &UrlFilter {
        &self.filter
    }

    /// Admit one URL. The filter insert is committed before the sorted-set
    /// add so a crash between the two can only lose the URL, never admit it
    /// twice.
    pub async fn enqueue(&self, url: &str, priority: f64) -> Result<Admission, CoordError> {
        let normalized = match url_utils::normalize_url(url) {
            Some(n) if url_utils::should_crawl_url(&n) => n,
            _ => return Ok(Admission::Ineligible),
        };

        if self.filter.contains(&normalized).await? {
            return Ok(Admission::Duplicate);
        }
        self.filter.insert(&normalized).await?;

        if self.over_soft_capacity().await? && priority > 0.0 {
            return Ok(Admission::Dropped);
        }

        self.coord
            .zset_add(FRONTIER_KEY, priority, &normalized)
            .await?;
        Ok(Admission::Admitted)
    }

    /// Admit a batch of discovered links, batching the filter membership
    /// probe into one pipelined round-trip.
    pub async fn enqueue_all(&self, links: &[(String, f64)]) -> Result<AdmissionStats, CoordError> {
        let mut stats = AdmissionStats::default();

        let mut eligible: Vec<(String, f64)> = Vec::with_capacity(links.len());
        for (url, priority) in links {
            match url_utils::normalize_url(url) {
                Some(n) if url_utils::should_crawl_url(&n) => eligible.push((n, *priority)),
                _ => stats.ineligible += 1,
            }
        }

        let urls: Vec<String> = eligible.iter().map(|(u, _)| u.clone()).collect();
        let seen = self.filter.contains_many(&urls).await?;

        for ((url, priority), already_seen) in eligible.into_iter().zip(seen) {
            if already_seen {
                stats.duplicates += 1;
                continue;
            }
            self.filter.insert(&url).await?;

            if self.over_soft_capacity().await? && priority > 0.0 {
                stats.dropped += 1;
                continue;
            }

            self.coord.zset_add(FRONTIER_KEY, priority, &url).await?;
            stats.admitted += 1;
        }

        Ok(stats)
    }

    async fn over_soft_capacity(&self) -> Result<bool, CoordError> {
        let attempt = self.admissions.fetch_add(1, Ordering::Relaxed);
        if attempt % LEN_SAMPLE_INTERVAL == 0 {
            let len = self.coord.zset_card(FRONTIER_KEY).await?;
            self.cached_len.store(len, Ordering::Relaxed);
        }
        Ok(self.cached_len.load(Ordering::Relaxed) > self.config.soft_capacity)
    }

    /// Pop the lowest-priority URL and record the claim under this worker.
    ///
    /// The claim record's expiry is double the staleness threshold; the
    /// sweep is the recovery path and the TTL only a backstop.
    pub async fn claim(&self, worker: &str) -> Result<Option<Claim>, CoordError> {
        let (priority, url) = match self.coord.zset_pop_min(FRONTIER_KEY).await? {
            Some(popped) => popped,
            None => return Ok(None),
        };

        let record = InflightRecord {
            worker: worker.to_string(),
            claimed_at_ms: chrono::Utc::now().timestamp_millis(),
            priority,
        };
        let raw =
            serde_json::to_string(&record).map_err(|e| CoordError::Protocol(e.to_string()))?;
        self.coord
            .kv_set(&inflight_key(&url), &raw, Some(self.config.claim_ttl * 2))
            .await?;

        Ok(Some(Claim { url, priority }))
    }

    /// Mark a claimed URL as done. Only the claim owner can complete it.
    pub async fn complete(&self, url: &str, worker: &str) -> Result<bool, CoordError> {
        let key = inflight_key(url);
        let raw = match self.coord.kv_get(&key).await? {
            Some(raw) => raw,
            None => return Ok(false),
        };

        let record: InflightRecord =
            serde_json::from_str(&raw).map_err(|e| CoordError::Protocol(e.to_string()))?;
        if record.worker != worker {
            return Ok(false);
        }

        let released = self.coord.kv_compare_and_delete(&key, &raw).await?;
        if released {
            self.coord.kv_delete(&retry_key(url)).await?;
        }
        Ok(released)
    }

    /// Give up on a claimed URL. With `requeue`, the URL returns to the
    /// frontier at a penalized priority until retries are exhausted; the
    /// filter keeps it marked as seen either way.
    pub async fn fail(&self, url: &str, worker: &str, requeue: bool) -> Result<bool, CoordError> {
        let key = inflight_key(url);
        let raw = match self.coord.kv_get(&key).await? {
            Some(raw) => raw,
            None => return Ok(false),
        };

        let record: InflightRecord =
            serde_json::from_str(&raw).map_err(|e| CoordError::Protocol(e.to_string()))?;
        if record.worker != worker {
            return Ok(false);
        }

        // Remove the claim first so the URL is never in the frontier and
        // the in-flight map at once.
        if !self.coord.kv_compare_and_delete(&key, &raw).await? {
            return Ok(false);
        }

        let retries = self.retries(url).await?;
        if requeue && retries < self.config.max_retries {
            self.bump_retries(url, retries).await?;
            self.coord
                .zset_add(
                    FRONTIER_KEY,
                    record.priority + self.config.retry_penalty,
                    url,
                )
                .await?;
            return Ok(true);
        }

        self.coord.kv_delete(&retry_key(url)).await?;
        Ok(false)
    }

    /// Return claims older than `claim_ttl` to the frontier.
    ///
    /// Run cooperatively by any worker at a jittered interval. Idempotent:
    /// the compare-and-delete serializes concurrent sweepers per entry.
    pub async fn recover_stale(&self) -> Result<u32, CoordError> {
        let keys = self.coord.kv_scan("inflight:").await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let values = self.coord.kv_get_many(&keys).await?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut recovered = 0;

        for (key, raw) in keys.iter().zip(values) {
            let raw = match raw {
                Some(raw) => raw,
                None => continue,
            };
            let record: InflightRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(_) => continue,
            };

            let age_ms = now_ms - record.claimed_at_ms;
            if age_ms < self.config.claim_ttl.as_millis() as i64 {
                continue;
            }

            if !self.coord.kv_compare_and_delete(key, &raw).await? {
                continue;
            }

            let url = key.trim_start_matches("inflight:");
            let retries = self.retries(url).await?;
            if retries < self.config.max_retries {
                self.bump_retries(url, retries).await?;
                self.coord
                    .zset_add(
                        FRONTIER_KEY,
                        record.priority + self.config.stale_penalty,
                        url,
                    )
                    .await?;
                recovered += 1;
                tracing::info!(url, worker = %record.worker, "recovered stale claim");
            } else {
                self.coord.kv_delete(&retry_key(url)).await?;
                tracing::warn!(url, "dropping stale claim, retries exhausted");
            }
        }

        Ok(recovered)
    }

    pub async fn len(&self) -> Result<u64, CoordError> {
        self.coord.zset_card(FRONTIER_KEY).await
    }

    pub async fn is_empty(&self) -> Result<bool, CoordError> {
        Ok(self.len().await? == 0)
    }

    async fn retries(&self, url: &str) -> Result<u32, CoordError> {
        Ok(self
            .coord
            .kv_get(&retry_key(url))
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    async fn bump_retries(&self, url: &str, current: u32) -> Result<(), CoordError> {
        self.coord
            .kv_set(&retry_key(url), &(current + 1).to_string(), Some(RETRY_TTL))
            .await
    }
}

/// Batch admission tally.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmissionStats {
    pub admitted: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub ineligible: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryStore;

    async fn frontier_with(config: FrontierConfig) -> Frontier {
        let coord: Arc<dyn CoordStore> = Arc::new(MemoryStore::new());
        let filter = UrlFilter::open(Arc::clone(&coord), 10_000, 0.001)
            .await
            .unwrap();
        Frontier::new(coord, filter, config)
    }

    async fn frontier() -> Frontier {
        frontier_with(FrontierConfig::default()).await
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_admits_once() {
        let frontier = frontier().await;

        assert_eq!(
            frontier.enqueue("https://a.test/x", 0.0).await.unwrap(),
            Admission::Admitted
        );
        assert_eq!(
            frontier.enqueue("https://a.test/x", 0.0).await.unwrap(),
            Admission::Duplicate
        );
        assert_eq!(
            frontier.enqueue("https://a.test/x", 3.0).await.unwrap(),
            Admission::Duplicate
        );
        assert_eq!(frontier.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_normalization_unifies_variants() {
        let frontier = frontier().await;

        frontier
            .enqueue("HTTPS://A.test:443/page#top", 0.0)
            .await
            .unwrap();
        assert_eq!(
            frontier.enqueue("https://a.test/page", 0.0).await.unwrap(),
            Admission::Duplicate
        );
    }

    #[tokio::test]
    async fn test_ineligible_urls_rejected() {
        let frontier = frontier().await;

        assert_eq!(
            frontier.enqueue("ftp://a.test/x", 0.0).await.unwrap(),
            Admission::Ineligible
        );
        assert_eq!(
            frontier.enqueue("https://a.test/img.png", 0.0).await.unwrap(),
            Admission::Ineligible
        );
        assert!(frontier.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_claims_follow_priority_order() {
        let frontier = frontier().await;
        frontier.enqueue("https://a.test/deep", 2.0).await.unwrap();
        frontier.enqueue("https://a.test/seed", 0.0).await.unwrap();
        frontier.enqueue("https://a.test/mid", 1.0).await.unwrap();

        let first = frontier.claim("w1").await.unwrap().unwrap();
        assert_eq!(first.url, "https://a.test/seed");
        assert_eq!(first.priority, 0.0);
        assert_eq!(
            frontier.claim("w1").await.unwrap().unwrap().url,
            "https://a.test/mid"
        );
    }

    #[tokio::test]
    async fn test_complete_clears_claim() {
        let frontier = frontier().await;
        frontier.enqueue("https://a.test/x", 0.0).await.unwrap();

        let claim = frontier.claim("w1").await.unwrap().unwrap();
        assert!(frontier.complete(&claim.url, "w1").await.unwrap());

        // Done: nothing left to claim, and the claim cannot complete twice.
        assert!(frontier.claim("w1").await.unwrap().is_none());
        assert!(!frontier.complete(&claim.url, "w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_requires_owner() {
        let frontier = frontier().await;
        frontier.enqueue("https://a.test/x", 0.0).await.unwrap();

        let claim = frontier.claim("w1").await.unwrap().unwrap();
        assert!(!frontier.complete(&claim.url, "w2").await.unwrap());
        assert!(frontier.complete(&claim.url, "w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_requeues_with_penalty() {
        let frontier = frontier().await;
        frontier.enqueue("https://a.test/x", 1.0).await.unwrap();

        let claim = frontier.claim("w1").await.unwrap().unwrap();
        assert!(frontier.fail(&claim.url, "w1", true).await.unwrap());

        let again = frontier.claim("w2").await.unwrap().unwrap();
        assert_eq!(again.url, claim.url);
        assert_eq!(again.priority, 1.0 + 5.0);
    }

    #[tokio::test]
    async fn test_fail_drops_after_max_retries() {
        let config = FrontierConfig {
            max_retries: 2,
            ..FrontierConfig::default()
        };
        let frontier = frontier_with(config).await;
        frontier.enqueue("https://a.test/x", 0.0).await.unwrap();

        for _ in 0..2 {
            let claim = frontier.claim("w1").await.unwrap().unwrap();
            assert!(frontier.fail(&claim.url, "w1", true).await.unwrap());
        }

        let claim = frontier.claim("w1").await.unwrap().unwrap();
        assert!(!frontier.fail(&claim.url, "w1", true).await.unwrap());
        assert!(frontier.claim("w1").await.unwrap().is_none());

        // Still counted as seen.
        assert_eq!(
            frontier.enqueue("https://a.test/x", 0.0).await.unwrap(),
            Admission::Duplicate
        );
    }

    #[tokio::test]
    async fn test_stale_claim_recovery() {
        let config = FrontierConfig {
            claim_ttl: Duration::from_millis(30),
            ..FrontierConfig::default()
        };
        let frontier = frontier_with(config).await;
        frontier.enqueue("https://a.test/slow", 1.0).await.unwrap();

        // w1 claims then "crashes".
        let claim = frontier.claim("w1").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(frontier.recover_stale().await.unwrap(), 1);

        let again = frontier.claim("w2").await.unwrap().unwrap();
        assert_eq!(again.url, claim.url);
        assert_eq!(again.priority, 1.0 + 10.0);
        assert!(frontier.complete(&again.url, "w2").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_skips_fresh_claims() {
        let frontier = frontier().await;
        frontier.enqueue("https://a.test/x", 0.0).await.unwrap();
        frontier.claim("w1").await.unwrap().unwrap();

        assert_eq!(frontier.recover_stale().await.unwrap(), 0);
        assert!(frontier.claim("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backpressure_sheds_low_priority() {
        let config = FrontierConfig {
            soft_capacity: 10,
            ..FrontierConfig::default()
        };
        let frontier = frontier_with(config).await;

        let mut dropped = 0;
        for i in 0..200 {
            let admission = frontier
                .enqueue(&format!("https://a.test/p/{}", i), 1.0)
                .await
                .unwrap();
            if admission == Admission::Dropped {
                dropped += 1;
            }
        }

        assert!(dropped > 0);
        assert!(frontier.len().await.unwrap() < 200);

        // Seeds (priority 0) are never shed.
        assert_eq!(
            frontier.enqueue("https://a.test/seed", 0.0).await.unwrap(),
            Admission::Admitted
        );
    }

    #[tokio::test]
    async fn test_enqueue_all_counts() {
        let frontier = frontier().await;
        frontier.enqueue("https://a.test/old", 0.0).await.unwrap();

        let stats = frontier
            .enqueue_all(&[
                ("https://a.test/old".to_string(), 1.0),
                ("https://a.test/new1".to_string(), 1.0),
                ("https://a.test/new2".to_string(), 1.0),
                ("mailto:x@a.test".to_string(), 1.0),
            ])
            .await
            .unwrap();

        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.ineligible, 1);
        assert_eq!(frontier.len().await.unwrap(), 3);
    }
}
