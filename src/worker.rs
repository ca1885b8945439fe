//! Worker control loop.
//!
//! Each worker is an autonomous peer: claim a URL, check robots, take the
//! host lease, fetch, release the lease, feed discovered links back into
//! the frontier, persist through the storage pipeline, complete the claim.
//! Recovery work (the stale-claim sweep) is run cooperatively at a jittered
//! interval; there is no master.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backoff::jittered;
use crate::config::WorkerConfig;
use crate::coord::CoordError;
use crate::document_store::StoreError;
use crate::frontier::{Claim, Frontier};
use crate::metrics::SharedMetrics;
use crate::network::Fetcher;
use crate::parser;
use crate::politeness::{FetchOutcome, LeaseDecision, Politeness};
use crate::robots::RobotsCache;
use crate::storage::{PageRecord, StoragePipeline};
use crate::url_utils;

/// Host-penalty ceiling added to child priorities.
const MAX_HOST_PENALTY: f64 = 4.0;
/// Floor for politeness backoff sleeps.
const MIN_LEASE_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Final accounting returned when the loop exits.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub pages_crawled: u64,
    pub pages_failed: u64,
    pub links_admitted: u64,
    pub duplicate_content: u64,
    pub claims_recovered: u64,
    pub bytes_original: u64,
    pub bytes_compressed: u64,
}

pub struct Worker {
    id: String,
    config: WorkerConfig,
    frontier: Arc<Frontier>,
    politeness: Arc<Politeness>,
    robots: Arc<RobotsCache>,
    pipeline: Arc<StoragePipeline>,
    fetcher: Arc<dyn Fetcher>,
    metrics: SharedMetrics,
    /// URLs observed per host in this process, for the popularity penalty.
    host_seen: DashMap<String, u64>,
    shutdown: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        frontier: Arc<Frontier>,
        politeness: Arc<Politeness>,
        robots: Arc<RobotsCache>,
        pipeline: Arc<StoragePipeline>,
        fetcher: Arc<dyn Fetcher>,
        metrics: SharedMetrics,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: config.worker_id.clone(),
            config,
            frontier,
            politeness,
            robots,
            pipeline,
            fetcher,
            metrics,
            host_seen: DashMap::new(),
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Seed the frontier. Seeds enter at priority 0.
    pub async fn seed(&self, urls: &[String]) -> Result<u64, WorkerError> {
        let seeds: Vec<(String, f64)> = urls.iter().map(|u| (u.clone(), 0.0)).collect();
        let stats = self.frontier.enqueue_all(&seeds).await?;
        tracing::info!(
            admitted = stats.admitted,
            duplicates = stats.duplicates,
            "seeded frontier"
        );
        Ok(stats.admitted)
    }

    /// Run until `max_pages`, sustained frontier emptiness, or shutdown.
    pub async fn run(&self) -> Result<WorkerReport, WorkerError> {
        tracing::info!(worker = %self.id, "worker started");

        let mut pages_crawled: u64 = 0;
        let mut idle_polls: u32 = 0;
        let mut last_sweep = Instant::now();
        let mut sweep_due_in = jittered(self.config.sweep_interval(), 0.25);

        while !self.shutdown.is_cancelled() {
            if let Some(max_pages) = self.config.max_pages {
                if pages_crawled >= max_pages {
                    tracing::info!(worker = %self.id, max_pages, "page budget reached");
                    break;
                }
            }

            self.pipeline.flush_if_due().await?;

            if last_sweep.elapsed() >= sweep_due_in {
                let recovered = self.frontier.recover_stale().await?;
                self.metrics.claims_recovered.add(recovered as u64);
                last_sweep = Instant::now();
                sweep_due_in = jittered(self.config.sweep_interval(), 0.25);
            }

            let claim = match self.frontier.claim(&self.id).await? {
                Some(claim) => claim,
                None => {
                    idle_polls += 1;
                    if idle_polls >= self.config.max_idle_polls {
                        tracing::info!(worker = %self.id, "frontier stayed empty, exiting");
                        break;
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(jittered(self.config.idle_backoff(), 0.25)) => {}
                    }
                    continue;
                }
            };
            idle_polls = 0;

            if self.process(&claim).await? {
                pages_crawled += 1;
            }
        }

        // Flush whatever is still batched; incomplete claims are left for
        // peer recovery.
        self.pipeline.flush().await?;

        tracing::info!(worker = %self.id, "{}", self.metrics.summary());
        Ok(self.report(pages_crawled))
    }

    fn report(&self, pages_crawled: u64) -> WorkerReport {
        use std::sync::atomic::Ordering;

        WorkerReport {
            pages_crawled,
            pages_failed: self.metrics.pages_failed.get(),
            links_admitted: self.metrics.links_admitted.get(),
            duplicate_content: self.pipeline.stats.duplicate_content.load(Ordering::Relaxed),
            claims_recovered: self.metrics.claims_recovered.get(),
            bytes_original: self.pipeline.stats.bytes_original.load(Ordering::Relaxed),
            bytes_compressed: self.pipeline.stats.bytes_compressed.load(Ordering::Relaxed),
        }
    }

    /// Natural-log popularity penalty for a child link's host.
    fn host_penalty(&self, url: &str) -> f64 {
        let host = match url_utils::extract_host(url) {
            Some(h) => h,
            None => return 0.0,
        };
        let count = self.host_seen.get(&host).map(|c| *c).unwrap_or(0);
        if count < 2 {
            0.0
        } else {
            (count as f64).ln().clamp(0.0, MAX_HOST_PENALTY)
        }
    }

    /// Drive one claimed URL through the full pipeline.
    ///
    /// Returns true when a page record was persisted for it.
    async fn process(&self, claim: &Claim) -> Result<bool, WorkerError> {
        let url = claim.url.as_str();

        let host = match url_utils::extract_host(url) {
            Some(host) => host,
            None => {
                self.frontier.complete(url, &self.id).await?;
                return Ok(false);
            }
        };

        if !self.robots.is_allowed(url).await? {
            self.metrics.robots_denied.inc();
            tracing::debug!(url, "robots disallow");
            self.frontier.complete(url, &self.id).await?;
            return Ok(false);
        }

        if !self.acquire_host(&host).await? {
            // Could not get the host within budget; hand the URL back.
            if self.frontier.fail(url, &self.id, true).await? {
                self.metrics.requeued.inc();
            }
            return Ok(false);
        }

        let fetch_started = Instant::now();
        let fetched = self.fetcher.fetch(url).await;
        let latency_ms = fetch_started.elapsed().as_millis() as f64;

        // The lease is released as soon as the fetch settles; parsing and
        // persistence never hold up the host.
        let outcome = match &fetched {
            Ok(response) if response.status == 429 || response.status >= 500 => {
                FetchOutcome::Throttled
            }
            Ok(_) => FetchOutcome::Success,
            Err(_) => FetchOutcome::TransportError,
        };
        self.politeness.release(&host, &self.id, outcome).await?;

        let response = match fetched {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(url, %error, "fetch failed");
                self.metrics.pages_failed.inc();
                if self.frontier.fail(url, &self.id, true).await? {
                    self.metrics.requeued.inc();
                }
                return Ok(false);
            }
        };

        self.metrics.record_fetch_latency(latency_ms);
        *self.host_seen.entry(host.clone()).or_insert(0) += 1;

        if response.status == 429 || response.status >= 500 {
            tracing::debug!(url, status = response.status, "server pushback");
            self.metrics.pages_failed.inc();
            if self.frontier.fail(url, &self.id, true).await? {
                self.metrics.requeued.inc();
            }
            return Ok(false);
        }

        if response.is_redirect() {
            if let Some(location) = response.location() {
                if let Ok(target) = url_utils::convert_to_absolute_url(location, url) {
                    self.frontier.enqueue(&target, claim.priority + 1.0).await?;
                }
            }
            self.frontier.complete(url, &self.id).await?;
            return Ok(false);
        }

        let is_html = response
            .content_type()
            .map(url_utils::is_html_content_type)
            .unwrap_or(false);

        let mut outbound_link_count = 0u32;
        let store_body = if response.is_success() && is_html {
            let html = String::from_utf8_lossy(&response.body).into_owned();
            let links = parser::extract_links(url, &html);
            self.metrics.links_extracted.add(links.len() as u64);
            outbound_link_count = links.len() as u32;

            let scored: Vec<(String, f64)> = links
                .into_iter()
                .map(|link| {
                    let penalty = self.host_penalty(&link);
                    (link, claim.priority + 1.0 + penalty)
                })
                .collect();
            let stats = self.frontier.enqueue_all(&scored).await?;
            self.metrics.links_admitted.add(stats.admitted);
            self.metrics.links_duplicate.add(stats.duplicates);
            self.metrics.links_dropped.add(stats.dropped);

            response.body.clone()
        } else {
            // 4xx and non-HTML responses keep their metadata but persist no
            // payload; the shared empty-content row stands in.
            Vec::new()
        };

        let record = PageRecord {
            url: claim.url.clone(),
            normalized_url: claim.url.clone(),
            status: response.status,
            content_type: response.content_type().map(|s| s.to_string()),
            headers: response.headers.clone(),
            body: store_body,
            outbound_link_count,
            truncated: response.truncated,
        };

        if let Err(error) = self.pipeline.submit(record).await {
            // Do not complete: the claim stays and peers recover it.
            tracing::warn!(url, %error, "persist failed, leaving claim for recovery");
            self.metrics.pages_failed.inc();
            return Ok(false);
        }

        self.frontier.complete(url, &self.id).await?;
        self.metrics.pages_fetched.inc();
        tracing::info!(url, status = response.status, links = outbound_link_count, "crawled");
        Ok(true)
    }

    /// Try to take the host lease within the claim budget, sleeping out the
    /// suggested backoff between attempts.
    async fn acquire_host(&self, host: &str) -> Result<bool, WorkerError> {
        for _ in 0..self.config.host_claim_budget {
            if self.shutdown.is_cancelled() {
                return Ok(false);
            }

            match self.politeness.try_acquire(host, &self.id).await? {
                LeaseDecision::Acquired => return Ok(true),
                LeaseDecision::Busy { retry_after } | LeaseDecision::NotYet { retry_after } => {
                    let wait = jittered(retry_after.max(MIN_LEASE_WAIT), 0.25);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(false),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
        Ok(false)
    }
}
