//! robots.txt fetching, shared caching, and allow checks.
//!
//! Parsed snapshots live in the coordination store under `robots:<host>` so
//! peers share one fetch per host per TTL. The robots fetch itself bypasses
//! politeness but holds a short guard key to avoid stampedes.

use std::sync::Arc;
use std::time::Duration;

use robotstxt::DefaultMatcher;
use serde::{Deserialize, Serialize};

use crate::backoff::jittered;
use crate::coord::{CoordError, CoordStore};
use crate::network::Fetcher;
use crate::politeness::Politeness;
use crate::url_utils;

/// How long a losing fetcher waits before re-reading the cache.
const GUARD_WAIT: Duration = Duration::from_millis(250);
/// Guard TTL bounds how long a crashed fetcher can block peers.
const GUARD_TTL: Duration = Duration::from_secs(30);

fn robots_key(host: &str) -> String {
    format!("robots:{}", host)
}

fn guard_key(host: &str) -> String {
    format!("robotsfetch:{}", host)
}

/// Cached robots.txt snapshot for one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RobotsRecord {
    /// Raw robots.txt body; empty means "allow all".
    body: String,
    crawl_delay_secs: Option<f64>,
    fetched_at_ms: i64,
}

pub struct RobotsCache {
    coord: Arc<dyn CoordStore>,
    fetcher: Arc<dyn Fetcher>,
    politeness: Arc<Politeness>,
    user_agent: String,
    worker_id: String,
    cache_ttl: Duration,
}

impl RobotsCache {
    pub fn new(
        coord: Arc<dyn CoordStore>,
        fetcher: Arc<dyn Fetcher>,
        politeness: Arc<Politeness>,
        user_agent: String,
        worker_id: String,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            coord,
            fetcher,
            politeness,
            user_agent,
            worker_id,
            cache_ttl,
        }
    }

    /// Whether the crawler's user-agent may fetch `url`.
    pub async fn is_allowed(&self, url: &str) -> Result<bool, CoordError> {
        let host = match url_utils::extract_host(url) {
            Some(h) => h,
            None => return Ok(true),
        };

        if let Some(record) = self.cached(&host).await? {
            return Ok(self.matches(&record.body, url));
        }

        let record = self.fetch_and_cache(url, &host).await?;
        Ok(self.matches(&record.body, url))
    }

    async fn cached(&self, host: &str) -> Result<Option<RobotsRecord>, CoordError> {
        match self.coord.kv_get(&robots_key(host)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Fetch robots.txt for a host, guarding against peers fetching it at
    /// the same moment. A loser of the guard race re-reads the cache once
    /// and otherwise proceeds with allow-all defaults for this check.
    async fn fetch_and_cache(&self, url: &str, host: &str) -> Result<RobotsRecord, CoordError> {
        let guard = guard_key(host);
        let acquired = self
            .coord
            .kv_set_if_absent(&guard, &self.worker_id, GUARD_TTL)
            .await?;

        if !acquired {
            tokio::time::sleep(jittered(GUARD_WAIT, 0.5)).await;
            if let Some(record) = self.cached(host).await? {
                return Ok(record);
            }
            return Ok(RobotsRecord {
                body: String::new(),
                crawl_delay_secs: None,
                fetched_at_ms: chrono::Utc::now().timestamp_millis(),
            });
        }

        let body = match url_utils::robots_url(url) {
            Some(robots_url) => match self.fetcher.fetch(&robots_url).await {
                Ok(response) if response.status == 200 => {
                    String::from_utf8_lossy(&response.body).into_owned()
                }
                // Fetch failure or non-200: treat as allow-all.
                _ => String::new(),
            },
            None => String::new(),
        };

        let crawl_delay_secs = crawl_delay_for(&body, &self.user_agent);
        let record = RobotsRecord {
            body,
            crawl_delay_secs,
            fetched_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        let raw =
            serde_json::to_string(&record).map_err(|e| CoordError::Protocol(e.to_string()))?;
        self.coord
            .kv_set(&robots_key(host), &raw, Some(self.cache_ttl))
            .await?;

        if let Some(delay) = record.crawl_delay_secs {
            self.politeness.set_robots_delay(host, delay).await?;
        }

        self.coord
            .kv_compare_and_delete(&guard, &self.worker_id)
            .await?;

        tracing::debug!(host, delay = ?record.crawl_delay_secs, "robots.txt cached");
        Ok(record)
    }

    fn matches(&self, robots_body: &str, url: &str) -> bool {
        if robots_body.is_empty() {
            return true;
        }
        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(robots_body, &self.user_agent, url)
    }
}

/// Crawl-delay applying to `user_agent`, if the robots body sets one.
///
/// Directives belong to the group of User-agent lines directly above them;
/// a group naming our product token wins over the `*` group.
fn crawl_delay_for(robots_txt: &str, user_agent: &str) -> Option<f64> {
    let agent_lower = user_agent.to_ascii_lowercase();
    let mut group_agents: Vec<String> = Vec::new();
    let mut directive_seen = false;
    let mut named_delay: Option<f64> = None;
    let mut wildcard_delay: Option<f64> = None;

    for raw_line in robots_txt.lines() {
        // Comments run from '#' to end of line.
        let line = raw_line.split('#').next().unwrap_or("").trim();
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field.trim().to_ascii_lowercase(), value.trim()),
            None => continue,
        };

        if field == "user-agent" {
            // A User-agent line after other directives opens a new group.
            if directive_seen {
                group_agents.clear();
                directive_seen = false;
            }
            group_agents.push(value.to_ascii_lowercase());
            continue;
        }

        directive_seen = true;
        if field != "crawl-delay" {
            continue;
        }
        let secs = match value.parse::<f64>() {
            Ok(secs) if secs >= 0.0 => secs,
            _ => continue,
        };

        if group_agents
            .iter()
            .any(|a| !a.is_empty() && a != "*" && agent_lower.contains(a.as_str()))
        {
            named_delay.get_or_insert(secs);
        } else if group_agents.iter().any(|a| a == "*") {
            wildcard_delay.get_or_insert(secs);
        }
    }

    named_delay.or(wildcard_delay)
}
