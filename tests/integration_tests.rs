//! End-to-end crawl scenarios: real HTTP against a mock server, shared
//! in-memory coordination and document stores.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use swarmcrawl::config::WorkerConfig;
use swarmcrawl::coord::{CoordStore, MemoryStore};
use swarmcrawl::document_store::{DocumentStore, MemoryDocStore};
use swarmcrawl::filter::UrlFilter;
use swarmcrawl::frontier::{Frontier, FrontierConfig};
use swarmcrawl::metrics::Metrics;
use swarmcrawl::network::{Fetcher, HttpClient};
use swarmcrawl::politeness::Politeness;
use swarmcrawl::robots::RobotsCache;
use swarmcrawl::storage::{StorageConfig, StoragePipeline};
use swarmcrawl::worker::Worker;

struct Stack {
    coord: Arc<dyn CoordStore>,
    docs: Arc<MemoryDocStore>,
}

impl Stack {
    fn new() -> Self {
        Self {
            coord: Arc::new(MemoryStore::new()),
            docs: Arc::new(MemoryDocStore::new()),
        }
    }

    fn config(&self, worker_id: &str) -> WorkerConfig {
        let mut config = WorkerConfig::default();
        config.worker_id = worker_id.to_string();
        config.user_agent = "SwarmcrawlTest/0.3".to_string();
        config.default_crawl_delay_seconds = 0.02;
        config.idle_backoff_seconds = 0.02;
        config.max_idle_polls = 4;
        config.host_claim_budget = 20;
        config.batch_size = 4;
        config.fetch_timeout_seconds = 5;
        config
    }

    async fn frontier(&self, config: &WorkerConfig, claim_ttl: Duration) -> Arc<Frontier> {
        let filter = UrlFilter::open(Arc::clone(&self.coord), 100_000, 0.001)
            .await
            .unwrap();
        Arc::new(Frontier::new(
            Arc::clone(&self.coord),
            filter,
            FrontierConfig {
                claim_ttl,
                max_retries: config.max_retries,
                ..FrontierConfig::default()
            },
        ))
    }

    async fn worker(&self, config: WorkerConfig, claim_ttl: Duration) -> Worker {
        let fetcher: Arc<dyn Fetcher> = Arc::new(
            HttpClient::new(
                &config.user_agent,
                config.fetch_timeout(),
                config.max_content_bytes,
            )
            .unwrap(),
        );

        let frontier = self.frontier(&config, claim_ttl).await;
        let politeness = Arc::new(Politeness::new(
            Arc::clone(&self.coord),
            config.default_crawl_delay(),
            config.lease_ttl(),
        ));
        let robots = Arc::new(RobotsCache::new(
            Arc::clone(&self.coord),
            Arc::clone(&fetcher),
            Arc::clone(&politeness),
            config.user_agent.clone(),
            config.worker_id.clone(),
            config.robots_ttl(),
        ));
        let pipeline = Arc::new(StoragePipeline::new(
            Arc::clone(&self.docs) as Arc<dyn DocumentStore>,
            config.worker_id.clone(),
            StorageConfig {
                batch_size: config.batch_size,
                batch_age: config.batch_age(),
                ..StorageConfig::default()
            },
        ));

        Worker::new(
            config,
            frontier,
            politeness,
            robots,
            pipeline,
            fetcher,
            Arc::new(Metrics::new()),
            CancellationToken::new(),
        )
    }
}

async fn serve_html(server: &MockServer, url_path: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(url_path))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn seed_and_one_link_end_to_end() {
    let server = MockServer::start().await;
    serve_html(&server, "/", "<html><body><a href=\"/b\">b</a></body></html>").await;
    serve_html(&server, "/b", "<html><body>leaf</body></html>").await;

    let stack = Stack::new();
    let worker = stack
        .worker(stack.config("w1"), Duration::from_secs(600))
        .await;

    worker.seed(&[format!("{}/", server.uri())]).await.unwrap();
    let report = worker.run().await.unwrap();

    assert_eq!(report.pages_crawled, 2);
    assert_eq!(stack.docs.metadata_count(), 2);

    let root = stack
        .docs
        .get_metadata(&format!("{}/", server.uri()))
        .await
        .unwrap()
        .expect("root page stored");
    assert_eq!(root.outbound_link_count, 1);

    // Frontier drained, nothing left in flight.
    assert_eq!(stack.coord.zset_card("frontier").await.unwrap(), 0);
    assert!(stack.coord.kv_scan("inflight:").await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_seeds_store_one_row() {
    let server = MockServer::start().await;
    serve_html(&server, "/x", "<html>once</html>").await;

    let stack = Stack::new();
    let worker = stack
        .worker(stack.config("w1"), Duration::from_secs(600))
        .await;

    let url = format!("{}/x", server.uri());
    worker
        .seed(&[url.clone(), url.clone(), url.clone()])
        .await
        .unwrap();
    assert_eq!(stack.coord.zset_card("frontier").await.unwrap(), 1);

    let report = worker.run().await.unwrap();
    assert_eq!(report.pages_crawled, 1);
    assert_eq!(stack.docs.metadata_count(), 1);
}

#[tokio::test]
async fn identical_bodies_share_content_row() {
    let server = MockServer::start().await;
    serve_html(&server, "/1", "<html><body>same bytes</body></html>").await;
    serve_html(&server, "/2", "<html><body>same bytes</body></html>").await;

    let stack = Stack::new();
    let worker = stack
        .worker(stack.config("w1"), Duration::from_secs(600))
        .await;

    worker
        .seed(&[format!("{}/1", server.uri()), format!("{}/2", server.uri())])
        .await
        .unwrap();
    let report = worker.run().await.unwrap();

    assert_eq!(report.pages_crawled, 2);
    assert_eq!(stack.docs.metadata_count(), 2);
    assert_eq!(stack.docs.content_count(), 1);
    assert_eq!(report.duplicate_content, 1);

    let one = stack
        .docs
        .get_metadata(&format!("{}/1", server.uri()))
        .await
        .unwrap()
        .unwrap();
    let two = stack
        .docs
        .get_metadata(&format!("{}/2", server.uri()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(one.content_hash, two.content_hash);
}

#[tokio::test]
async fn crashed_worker_claim_is_recovered_by_peer() {
    let server = MockServer::start().await;
    serve_html(&server, "/slow", "<html>finally</html>").await;

    let stack = Stack::new();
    let claim_ttl = Duration::from_millis(100);

    // w1 claims the URL and then "crashes" without completing.
    let config = stack.config("w1");
    let frontier = stack.frontier(&config, claim_ttl).await;
    let url = format!("{}/slow", server.uri());
    frontier.enqueue(&url, 0.0).await.unwrap();
    let orphaned = frontier.claim("w1").await.unwrap().unwrap();
    assert_eq!(orphaned.url, url);

    tokio::time::sleep(Duration::from_millis(130)).await;

    // w2 sweeps on every iteration and picks the URL up.
    let mut w2_config = stack.config("w2");
    w2_config.sweep_interval_seconds = 0;
    let worker = stack.worker(w2_config, claim_ttl).await;
    let report = worker.run().await.unwrap();

    assert_eq!(report.pages_crawled, 1);
    assert!(report.claims_recovered >= 1);
    let metadata = stack.docs.get_metadata(&url).await.unwrap().unwrap();
    assert_eq!(metadata.worker_id, "w2");
}

#[tokio::test]
async fn per_host_fetches_are_serialized_by_crawl_delay() {
    let server = MockServer::start().await;
    for i in 0..4 {
        serve_html(&server, &format!("/p{}", i), "<html>page</html>").await;
    }

    let stack = Stack::new();
    let delay = 0.2;

    let mut c1 = stack.config("w1");
    c1.default_crawl_delay_seconds = delay;
    c1.max_retries = 10;
    let mut c2 = stack.config("w2");
    c2.default_crawl_delay_seconds = delay;
    c2.max_retries = 10;

    let w1 = stack.worker(c1, Duration::from_secs(600)).await;
    let w2 = stack.worker(c2, Duration::from_secs(600)).await;

    let seeds: Vec<String> = (0..4).map(|i| format!("{}/p{}", server.uri(), i)).collect();
    w1.seed(&seeds).await.unwrap();

    let started = Instant::now();
    let (r1, r2) = tokio::join!(w1.run(), w2.run());
    let elapsed = started.elapsed();

    let total = r1.unwrap().pages_crawled + r2.unwrap().pages_crawled;
    assert_eq!(total, 4);
    assert_eq!(stack.docs.metadata_count(), 4);

    // Four fetches against one host with a 200ms floor: at least three
    // inter-fetch gaps must have elapsed.
    assert!(
        elapsed >= Duration::from_millis(550),
        "politeness not enforced: finished in {:?}",
        elapsed
    );
}

#[tokio::test]
async fn robots_disallow_blocks_fetch_without_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private"),
        )
        .mount(&server)
        .await;
    serve_html(&server, "/private/page", "<html>secret</html>").await;
    serve_html(&server, "/open", "<html>public</html>").await;

    let stack = Stack::new();
    let worker = stack
        .worker(stack.config("w1"), Duration::from_secs(600))
        .await;

    worker
        .seed(&[
            format!("{}/private/page", server.uri()),
            format!("{}/open", server.uri()),
        ])
        .await
        .unwrap();
    let report = worker.run().await.unwrap();

    assert_eq!(report.pages_crawled, 1);
    assert!(stack
        .docs
        .get_metadata(&format!("{}/private/page", server.uri()))
        .await
        .unwrap()
        .is_none());
    assert!(stack
        .docs
        .get_metadata(&format!("{}/open", server.uri()))
        .await
        .unwrap()
        .is_some());

    // Disallowed URL is done, not re-queued.
    assert_eq!(stack.coord.zset_card("frontier").await.unwrap(), 0);
    assert!(stack.coord.kv_scan("inflight:").await.unwrap().is_empty());
}

#[tokio::test]
async fn oversized_body_is_truncated_and_flagged() {
    let server = MockServer::start().await;
    serve_html(&server, "/huge", &"y".repeat(64 * 1024)).await;

    let stack = Stack::new();
    let mut config = stack.config("w1");
    config.max_content_bytes = 1024;
    let worker = stack.worker(config, Duration::from_secs(600)).await;

    worker.seed(&[format!("{}/huge", server.uri())]).await.unwrap();
    let report = worker.run().await.unwrap();

    assert_eq!(report.pages_crawled, 1);
    let metadata = stack
        .docs
        .get_metadata(&format!("{}/huge", server.uri()))
        .await
        .unwrap()
        .unwrap();
    assert!(metadata.truncated);
    assert_eq!(metadata.content_length, 1024);
}

#[tokio::test]
async fn non_html_page_stores_metadata_only() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/json")
                .set_body_string("{\"k\": 1}"),
        )
        .mount(&server)
        .await;

    let stack = Stack::new();
    let worker = stack
        .worker(stack.config("w1"), Duration::from_secs(600))
        .await;

    worker
        .seed(&[format!("{}/data.json", server.uri())])
        .await
        .unwrap();
    let report = worker.run().await.unwrap();

    assert_eq!(report.pages_crawled, 1);
    let metadata = stack
        .docs
        .get_metadata(&format!("{}/data.json", server.uri()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.status, 200);
    assert_eq!(metadata.outbound_link_count, 0);
    // No payload persisted; the metadata references the empty-body row.
    assert_eq!(metadata.content_length, 0);
    assert!(stack
        .docs
        .content_exists(&metadata.content_hash)
        .await
        .unwrap());
}
