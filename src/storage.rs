//! Storage pipeline: compressed, batched persistence with content-level
//! deduplication.
//!
//! Bodies are hashed (SHA-256), deflate-compressed, and queued into a
//! metadata batch and a content batch. Either batch flushes when it reaches
//! `batch_size` or when the oldest pending entry exceeds `batch_age`; each
//! flush is one round-trip per collection.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::backoff::RetrySchedule;
use crate::document_store::{DocumentStore, PageContent, PageMetadata, StoreError};

const COMPRESSION_NAME: &str = "zlib";
const COMPRESSION_LEVEL: u32 = 6;

/// A fetched page as the worker hands it over.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub url: String,
    pub normalized_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub outbound_link_count: u32,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub batch_size: usize,
    pub batch_age: Duration,
    pub max_flush_retries: u32,
    /// Entries in the in-process LRU that fronts `content_exists` lookups.
    pub hash_cache_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_age: Duration::from_secs(5),
            max_flush_retries: 3,
            hash_cache_size: 4096,
        }
    }
}

#[derive(Default)]
struct Pending {
    metadata: Vec<PageMetadata>,
    content: Vec<PageContent>,
    oldest: Option<Instant>,
}

/// Write-side accounting, surfaced in the worker's final report.
#[derive(Default)]
pub struct StorageStats {
    pub pages_submitted: AtomicU64,
    pub bytes_original: AtomicU64,
    pub bytes_compressed: AtomicU64,
    pub duplicate_content: AtomicU64,
    pub batches_flushed: AtomicU64,
}

pub struct StoragePipeline {
    store: Arc<dyn DocumentStore>,
    config: StorageConfig,
    worker_id: String,
    pending: parking_lot::Mutex<Pending>,
    hash_cache: moka::sync::Cache<String, ()>,
    pub stats: StorageStats,
}

impl StoragePipeline {
    pub fn new(store: Arc<dyn DocumentStore>, worker_id: String, config: StorageConfig) -> Self {
        let hash_cache = moka::sync::Cache::new(config.hash_cache_size);
        Self {
            store,
            config,
            worker_id,
            pending: parking_lot::Mutex::new(Pending::default()),
            hash_cache,
            stats: StorageStats::default(),
        }
    }

    pub fn content_hash(body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body);
        format!("{:x}", hasher.finalize())
    }

    fn compress(body: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
        encoder
            .write_all(body)
            .and_then(|_| encoder.finish())
            .map_err(|e| StoreError::Write(e.to_string()))
    }

    fn decompress(compressed: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut decoder = ZlibDecoder::new(compressed);
        let mut body = Vec::new();
        decoder
            .read_to_end(&mut body)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(body)
    }

    /// Queue one page for persistence; flushes when the batch fills.
    pub async fn submit(&self, record: PageRecord) -> Result<(), StoreError> {
        let content_hash = Self::content_hash(&record.body);

        // Content dedup: LRU first, then the collection itself.
        let mut need_content = false;
        if self.hash_cache.get(&content_hash).is_none() {
            if self.store.content_exists(&content_hash).await? {
                self.stats.duplicate_content.fetch_add(1, Ordering::Relaxed);
            } else {
                need_content = true;
            }
            self.hash_cache.insert(content_hash.clone(), ());
        } else {
            self.stats.duplicate_content.fetch_add(1, Ordering::Relaxed);
        }

        let content_doc = if need_content {
            let compressed = Self::compress(&record.body)?;
            self.stats
                .bytes_original
                .fetch_add(record.body.len() as u64, Ordering::Relaxed);
            self.stats
                .bytes_compressed
                .fetch_add(compressed.len() as u64, Ordering::Relaxed);
            Some(PageContent {
                content_hash: content_hash.clone(),
                compressed_body: compressed,
                original_length: record.body.len() as u64,
                compression: COMPRESSION_NAME.to_string(),
            })
        } else {
            None
        };

        let metadata = PageMetadata {
            url: record.url,
            normalized_url: record.normalized_url,
            status: record.status,
            content_type: record.content_type,
            content_length: record.body.len() as u64,
            content_hash,
            fetched_at_ms: chrono::Utc::now().timestamp_millis(),
            worker_id: self.worker_id.clone(),
            outbound_link_count: record.outbound_link_count,
            truncated: record.truncated,
            headers: record.headers.into_iter().collect::<HashMap<_, _>>(),
        };

        let should_flush = {
            let mut pending = self.pending.lock();
            pending.metadata.push(metadata);
            if let Some(doc) = content_doc {
                pending.content.push(doc);
            }
            pending.oldest.get_or_insert_with(Instant::now);
            pending.metadata.len() >= self.config.batch_size
                || pending.content.len() >= self.config.batch_size
        };

        self.stats.pages_submitted.fetch_add(1, Ordering::Relaxed);

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flush when the oldest pending entry has aged past `batch_age`.
    pub async fn flush_if_due(&self) -> Result<(), StoreError> {
        let due = {
            let pending = self.pending.lock();
            pending
                .oldest
                .map(|at| at.elapsed() >= self.config.batch_age)
                .unwrap_or(false)
        };
        if due {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write both batches, retrying with backoff. On final failure the
    /// batch is surfaced as an error; the affected URLs stay incomplete and
    /// come back through stale-claim recovery.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (metadata, content) = {
            let mut pending = self.pending.lock();
            pending.oldest = None;
            (
                std::mem::take(&mut pending.metadata),
                std::mem::take(&mut pending.content),
            )
        };

        if metadata.is_empty() && content.is_empty() {
            return Ok(());
        }

        let schedule =
            RetrySchedule::starting_at(Duration::from_millis(100), Duration::from_secs(10));
        let mut attempt = 0u32;
        loop {
            // Content lands first so metadata never references a missing row.
            let result = match self.store.insert_content(&content).await {
                Ok(()) => self.store.insert_metadata(&metadata).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        metadata = metadata.len(),
                        content = content.len(),
                        "batch flushed"
                    );
                    return Ok(());
                }
                Err(e) if attempt < self.config.max_flush_retries => {
                    let delay = schedule.delay(attempt);
                    tracing::warn!(error = %e, attempt, "batch flush failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, dropped = metadata.len(), "batch flush failed permanently");
                    return Err(e);
                }
            }
        }
    }

    /// Read path: metadata plus the decompressed body.
    pub async fn get_page(
        &self,
        normalized_url: &str,
    ) -> Result<Option<(PageMetadata, Vec<u8>)>, StoreError> {
        let metadata = match self.store.get_metadata(normalized_url).await? {
            Some(m) => m,
            None => return Ok(None),
        };

        let content = match self.store.get_content(&metadata.content_hash).await? {
            Some(c) => c,
            None => return Ok(None),
        };

        let body = Self::decompress(&content.compressed_body)?;
        Ok(Some((metadata, body)))
    }

    pub async fn find_by_content_hash(
        &self,
        content_hash: &str,
    ) -> Result<Vec<String>, StoreError> {
        self.store.find_by_content_hash(content_hash).await
    }
}
