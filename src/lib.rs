pub mod backoff;
pub mod cli;
pub mod config;
pub mod coord;
pub mod document_store;
pub mod filter;
pub mod frontier;
pub mod logging;
pub mod metrics;
pub mod network;
pub mod parser;
pub mod politeness;
pub mod robots;
pub mod storage;
pub mod url_utils;
pub mod worker;

// Re-export main types for library usage
pub use config::WorkerConfig;
pub use coord::{CoordStore, MemoryStore, RedisStore};
pub use document_store::{DocumentStore, MemoryDocStore, MongoStore, PageContent, PageMetadata};
pub use filter::UrlFilter;
pub use frontier::{Admission, Frontier, FrontierConfig};
pub use network::{FetchError, FetchResponse, Fetcher, HttpClient};
pub use parser::extract_links;
pub use politeness::{FetchOutcome, LeaseDecision, Politeness};
pub use robots::RobotsCache;
pub use storage::{PageRecord, StorageConfig, StoragePipeline};
pub use worker::{Worker, WorkerError, WorkerReport};
