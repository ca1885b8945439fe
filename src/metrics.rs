//! Process-local counters for crawl progress.
//!
//! Cross-worker state lives in the coordination store; these counters only
//! describe what this process did, for log lines and the final report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Exponentially smoothed fetch latency.
///
/// The first observation seeds the average outright; every later sample is
/// blended in at `weight`. The average sits behind an Option so a real
/// 0 ms sample is never confused with "no data yet".
#[derive(Debug, Clone)]
pub struct SmoothedLatency {
    weight: f64,
    average_ms: Option<f64>,
}

impl SmoothedLatency {
    pub fn with_weight(weight: f64) -> Self {
        Self {
            weight: weight.clamp(0.01, 1.0),
            average_ms: None,
        }
    }

    pub fn observe(&mut self, sample_ms: f64) {
        self.average_ms = Some(match self.average_ms {
            None => sample_ms,
            Some(avg) => avg + self.weight * (sample_ms - avg),
        });
    }

    pub fn average_ms(&self) -> Option<f64> {
        self.average_ms
    }
}

pub struct Metrics {
    pub pages_fetched: Counter,
    pub pages_failed: Counter,
    pub links_extracted: Counter,
    pub links_admitted: Counter,
    pub links_duplicate: Counter,
    pub links_dropped: Counter,
    pub robots_denied: Counter,
    pub requeued: Counter,
    pub claims_recovered: Counter,
    pub fetch_latency_ms: Mutex<SmoothedLatency>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            pages_fetched: Counter::default(),
            pages_failed: Counter::default(),
            links_extracted: Counter::default(),
            links_admitted: Counter::default(),
            links_duplicate: Counter::default(),
            links_dropped: Counter::default(),
            robots_denied: Counter::default(),
            requeued: Counter::default(),
            claims_recovered: Counter::default(),
            fetch_latency_ms: Mutex::new(SmoothedLatency::with_weight(0.3)),
        }
    }

    pub fn record_fetch_latency(&self, latency_ms: f64) {
        self.fetch_latency_ms.lock().observe(latency_ms);
    }

    pub fn summary(&self) -> String {
        let latency = self
            .fetch_latency_ms
            .lock()
            .average_ms()
            .map(|ms| format!("{:.0}ms", ms))
            .unwrap_or_else(|| "n/a".to_string());

        format!(
            "fetched={} failed={} links(extracted={} admitted={} duplicate={} dropped={}) robots_denied={} requeued={} recovered={} fetch_avg={}",
            self.pages_fetched.get(),
            self.pages_failed.get(),
            self.links_extracted.get(),
            self.links_admitted.get(),
            self.links_duplicate.get(),
            self.links_dropped.get(),
            self.robots_denied.get(),
            self.requeued.get(),
            self.claims_recovered.get(),
            latency,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;
