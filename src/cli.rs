use clap::{Parser, Subcommand};

use crate::config::WorkerConfig;

/// swarmcrawl cli
#[derive(Parser)]
#[command(name = "swarmcrawl")]
#[command(about = "Decentralized web crawler worker")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a crawler worker
    Crawl {
        /// Seed URLs to enqueue before crawling
        #[arg(required = false, help = "Seed URLs added to the shared frontier")]
        seeds: Vec<String>,

        /// worker identity
        #[arg(long, help = "Worker id (default: hostname-pid-random)")]
        worker_id: Option<String>,

        /// coordination store
        #[arg(
            long,
            env = "REDIS_URL",
            default_value = "redis://127.0.0.1:6379",
            help = "Redis connection URL"
        )]
        redis_url: String,

        /// document store
        #[arg(
            long,
            env = "MONGODB_URI",
            default_value = "mongodb://127.0.0.1:27017",
            help = "MongoDB connection URI"
        )]
        mongodb_uri: String,

        #[arg(
            long,
            env = "MONGO_DB",
            default_value = "web_crawler",
            help = "MongoDB database name"
        )]
        mongodb_database: String,

        /// page budget
        #[arg(long, help = "Stop after this many pages (default: unlimited)")]
        max_pages: Option<u64>,

        /// storage batching
        #[arg(long, default_value = "50", help = "Pages per storage batch")]
        batch_size: usize,

        #[arg(long, default_value = "5", help = "Max age of a pending batch in seconds")]
        batch_age_seconds: u64,

        /// request timeout
        #[arg(long, default_value = "10", help = "Per-fetch timeout in seconds")]
        fetch_timeout_seconds: u64,

        /// politeness floor
        #[arg(
            long,
            default_value = "1.0",
            help = "Minimum delay between fetches of one host, seconds"
        )]
        default_crawl_delay_seconds: f64,

        #[arg(long, default_value = "600", help = "Claim staleness threshold in seconds")]
        claim_ttl_seconds: u64,

        #[arg(long, default_value = "30", help = "Host lease TTL in seconds")]
        lease_ttl_seconds: u64,

        /// dedup filter sizing
        #[arg(long, default_value = "10000000", help = "Expected unique URLs")]
        filter_capacity: u64,

        #[arg(long, default_value = "0.001", help = "Filter false-positive rate")]
        filter_error_rate: f64,

        #[arg(long, default_value = "3", help = "Max re-fetch attempts per URL")]
        max_retries: u32,

        /// request user agent
        #[arg(
            long,
            default_value = "Swarmcrawl/0.3",
            help = "User agent string for requests"
        )]
        user_agent: String,
    },

    /// Look up a stored page by URL
    Page {
        /// page url
        url: String,

        #[arg(
            long,
            env = "MONGODB_URI",
            default_value = "mongodb://127.0.0.1:27017",
            help = "MongoDB connection URI"
        )]
        mongodb_uri: String,

        #[arg(
            long,
            env = "MONGO_DB",
            default_value = "web_crawler",
            help = "MongoDB database name"
        )]
        mongodb_database: String,

        /// show other urls with identical content
        #[arg(long, help = "List URLs sharing this page's content hash")]
        duplicates: bool,
    },
}

impl Cli {
    /// parse args
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Fold the crawl flags into a WorkerConfig.
#[allow(clippy::too_many_arguments)]
pub fn crawl_config(
    worker_id: Option<String>,
    redis_url: String,
    mongodb_uri: String,
    mongodb_database: String,
    max_pages: Option<u64>,
    batch_size: usize,
    batch_age_seconds: u64,
    fetch_timeout_seconds: u64,
    default_crawl_delay_seconds: f64,
    claim_ttl_seconds: u64,
    lease_ttl_seconds: u64,
    filter_capacity: u64,
    filter_error_rate: f64,
    max_retries: u32,
    user_agent: String,
) -> WorkerConfig {
    let mut config = WorkerConfig::default();
    if let Some(worker_id) = worker_id {
        config.worker_id = worker_id;
    }
    config.redis_url = redis_url;
    config.mongodb_uri = mongodb_uri;
    config.mongodb_database = mongodb_database;
    config.max_pages = max_pages;
    config.batch_size = batch_size;
    config.batch_age_seconds = batch_age_seconds;
    config.fetch_timeout_seconds = fetch_timeout_seconds;
    config.default_crawl_delay_seconds = default_crawl_delay_seconds;
    config.claim_ttl_seconds = claim_ttl_seconds;
    config.lease_ttl_seconds = lease_ttl_seconds;
    config.filter_capacity = filter_capacity;
    config.filter_error_rate = filter_error_rate;
    config.max_retries = max_retries;
    config.user_agent = user_agent;
    config
}
