use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use swarmcrawl::cli::{self, Cli, Commands};
use swarmcrawl::config::WorkerConfig;
use swarmcrawl::coord::{CoordStore, RedisStore};
use swarmcrawl::document_store::{DocumentStore, MongoStore};
use swarmcrawl::filter::UrlFilter;
use swarmcrawl::frontier::{Frontier, FrontierConfig};
use swarmcrawl::logging;
use swarmcrawl::metrics::Metrics;
use swarmcrawl::network::{Fetcher, HttpClient};
use swarmcrawl::politeness::Politeness;
use swarmcrawl::robots::RobotsCache;
use swarmcrawl::storage::{StorageConfig, StoragePipeline};
use swarmcrawl::url_utils;
use swarmcrawl::worker::{Worker, WorkerError};

const EXIT_OK: i32 = 0;
const EXIT_MISCONFIGURED: i32 = 2;
const EXIT_COORD_UNREACHABLE: i32 = 3;
const EXIT_DOCSTORE_UNREACHABLE: i32 = 4;

#[tokio::main]
async fn main() {
    logging::init_logging();
    let cli = Cli::parse_args();

    let code = match cli.command {
        Commands::Crawl {
            seeds,
            worker_id,
            redis_url,
            mongodb_uri,
            mongodb_database,
            max_pages,
            batch_size,
            batch_age_seconds,
            fetch_timeout_seconds,
            default_crawl_delay_seconds,
            claim_ttl_seconds,
            lease_ttl_seconds,
            filter_capacity,
            filter_error_rate,
            max_retries,
            user_agent,
        } => {
            let config = cli::crawl_config(
                worker_id,
                redis_url,
                mongodb_uri,
                mongodb_database,
                max_pages,
                batch_size,
                batch_age_seconds,
                fetch_timeout_seconds,
                default_crawl_delay_seconds,
                claim_ttl_seconds,
                lease_ttl_seconds,
                filter_capacity,
                filter_error_rate,
                max_retries,
                user_agent,
            );
            run_crawl(config, seeds).await
        }
        Commands::Page {
            url,
            mongodb_uri,
            mongodb_database,
            duplicates,
        } => run_page(url, mongodb_uri, mongodb_database, duplicates).await,
    };

    std::process::exit(code);
}

async fn run_crawl(config: WorkerConfig, seeds: Vec<String>) -> i32 {
    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        return EXIT_MISCONFIGURED;
    }

    let coord: Arc<dyn CoordStore> = match RedisStore::connect(&config.redis_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("coordination store unreachable: {}", e);
            return EXIT_COORD_UNREACHABLE;
        }
    };
    if let Err(e) = coord.ping().await {
        eprintln!("coordination store unreachable: {}", e);
        return EXIT_COORD_UNREACHABLE;
    }

    let docs: Arc<dyn DocumentStore> =
        match MongoStore::connect(&config.mongodb_uri, &config.mongodb_database).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                eprintln!("document store unreachable: {}", e);
                return EXIT_DOCSTORE_UNREACHABLE;
            }
        };
    if let Err(e) = docs.ping().await {
        eprintln!("document store unreachable: {}", e);
        return EXIT_DOCSTORE_UNREACHABLE;
    }
    if let Err(e) = docs.ensure_indexes().await {
        eprintln!("document store index setup failed: {}", e);
        return EXIT_DOCSTORE_UNREACHABLE;
    }

    let fetcher: Arc<dyn Fetcher> = match HttpClient::new(
        &config.user_agent,
        config.fetch_timeout(),
        config.max_content_bytes,
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_MISCONFIGURED;
        }
    };

    let filter =
        match UrlFilter::open(Arc::clone(&coord), config.filter_capacity, config.filter_error_rate)
            .await
        {
            Ok(filter) => filter,
            Err(e) => {
                eprintln!("coordination store unreachable: {}", e);
                return EXIT_COORD_UNREACHABLE;
            }
        };

    let frontier = Arc::new(Frontier::new(
        Arc::clone(&coord),
        filter,
        FrontierConfig {
            claim_ttl: config.claim_ttl(),
            max_retries: config.max_retries,
            ..FrontierConfig::default()
        },
    ));
    let politeness = Arc::new(Politeness::new(
        Arc::clone(&coord),
        config.default_crawl_delay(),
        config.lease_ttl(),
    ));
    let robots = Arc::new(RobotsCache::new(
        Arc::clone(&coord),
        Arc::clone(&fetcher),
        Arc::clone(&politeness),
        config.user_agent.clone(),
        config.worker_id.clone(),
        config.robots_ttl(),
    ));
    let pipeline = Arc::new(StoragePipeline::new(
        docs,
        config.worker_id.clone(),
        StorageConfig {
            batch_size: config.batch_size,
            batch_age: config.batch_age(),
            ..StorageConfig::default()
        },
    ));

    let shutdown = CancellationToken::new();
    spawn_shutdown_handler(shutdown.clone(), config.grace_period());

    let worker = Arc::new(Worker::new(
        config,
        frontier,
        politeness,
        robots,
        pipeline,
        fetcher,
        Arc::new(Metrics::new()),
        shutdown,
    ));

    let seeds: Vec<String> = seeds
        .iter()
        .map(|s| url_utils::normalize_url_for_cli(s))
        .collect();
    if !seeds.is_empty() {
        if let Err(e) = worker.seed(&seeds).await {
            return exit_code_for(&e);
        }
    }

    match worker.run().await {
        Ok(report) => {
            println!(
                "crawl finished: {} pages, {} failed, {} links admitted, {} duplicate bodies, {} claims recovered",
                report.pages_crawled,
                report.pages_failed,
                report.links_admitted,
                report.duplicate_content,
                report.claims_recovered,
            );
            if report.bytes_original > 0 {
                let saved =
                    100.0 * (1.0 - report.bytes_compressed as f64 / report.bytes_original as f64);
                println!(
                    "storage: {} bytes raw, {} compressed ({:.1}% saved)",
                    report.bytes_original, report.bytes_compressed, saved
                );
            }
            EXIT_OK
        }
        Err(e) => {
            eprintln!("worker failed: {}", e);
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(error: &WorkerError) -> i32 {
    match error {
        WorkerError::Coord(_) => EXIT_COORD_UNREACHABLE,
        WorkerError::Store(_) => EXIT_DOCSTORE_UNREACHABLE,
    }
}

/// First signal drains gracefully; a second one force-quits.
fn spawn_shutdown_handler(shutdown: CancellationToken, grace_period: std::time::Duration) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, draining");
            shutdown.cancel();

            tokio::spawn(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("force quit");
                    std::process::exit(1);
                }
            });

            tokio::time::sleep(grace_period).await;
            tracing::warn!("grace period elapsed, exiting");
            std::process::exit(EXIT_OK);
        }
    });
}

async fn run_page(url: String, mongodb_uri: String, database: String, duplicates: bool) -> i32 {
    let docs: Arc<dyn DocumentStore> = match MongoStore::connect(&mongodb_uri, &database).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("document store unreachable: {}", e);
            return EXIT_DOCSTORE_UNREACHABLE;
        }
    };
    if let Err(e) = docs.ping().await {
        eprintln!("document store unreachable: {}", e);
        return EXIT_DOCSTORE_UNREACHABLE;
    }

    let normalized = match url_utils::normalize_url(&url_utils::normalize_url_for_cli(&url)) {
        Some(normalized) => normalized,
        None => {
            eprintln!("not a valid URL: {}", url);
            return EXIT_MISCONFIGURED;
        }
    };

    let pipeline = StoragePipeline::new(docs, "cli".to_string(), StorageConfig::default());
    match pipeline.get_page(&normalized).await {
        Ok(Some((metadata, body))) => {
            println!("url:            {}", metadata.url);
            println!("status:         {}", metadata.status);
            println!(
                "content-type:   {}",
                metadata.content_type.as_deref().unwrap_or("-")
            );
            println!("content-length: {}", metadata.content_length);
            println!("content-hash:   {}", metadata.content_hash);
            println!("fetched-at-ms:  {}", metadata.fetched_at_ms);
            println!("worker:         {}", metadata.worker_id);
            println!("links:          {}", metadata.outbound_link_count);
            println!("truncated:      {}", metadata.truncated);
            println!("body bytes:     {}", body.len());

            if duplicates {
                match pipeline.find_by_content_hash(&metadata.content_hash).await {
                    Ok(urls) => {
                        println!("urls sharing this content:");
                        for u in urls {
                            println!("  {}", u);
                        }
                    }
                    Err(e) => {
                        eprintln!("lookup failed: {}", e);
                        return EXIT_DOCSTORE_UNREACHABLE;
                    }
                }
            }
            EXIT_OK
        }
        Ok(None) => {
            println!("not found: {}", normalized);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("lookup failed: {}", e);
            EXIT_DOCSTORE_UNREACHABLE
        }
    }
}
