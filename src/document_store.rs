//! Document store capability: the metadata and content collections.
//!
//! `MongoStore` is the production backend. Batch writes are unordered
//! inserts against unique natural keys, so replays and concurrent workers
//! collapse into no-ops instead of duplicates.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const METADATA_COLLECTION: &str = "pages_metadata";
pub const CONTENT_COLLECTION: &str = "pages_content";

/// Deadline applied to every individual store round-trip.
const OP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store timed out during {0}")]
    Timeout(&'static str),

    #[error("document store unreachable: {0}")]
    Connection(String),

    #[error("document store write failed: {0}")]
    Write(String),

    #[error("document store query failed: {0}")]
    Query(String),
}

/// One row per fetched URL. Key: `normalized_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMetadata {
    pub url: String,
    pub normalized_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: u64,
    /// SHA-256 of the decoded body, hex. References `pages_content`.
    pub content_hash: String,
    pub fetched_at_ms: i64,
    pub worker_id: String,
    pub outbound_link_count: u32,
    /// Body was cut at the configured size cap.
    pub truncated: bool,
    pub headers: HashMap<String, String>,
}

/// One row per distinct body. Key: `content_hash`. Many metadata rows may
/// reference the same content row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    pub content_hash: String,
    #[serde(with = "serde_bytes")]
    pub compressed_body: Vec<u8>,
    pub original_length: u64,
    pub compression: String,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;
    async fn ensure_indexes(&self) -> Result<(), StoreError>;

    /// Insert a metadata batch; rows whose key already exists are dropped.
    async fn insert_metadata(&self, docs: &[PageMetadata]) -> Result<(), StoreError>;
    /// Insert a content batch; rows whose hash already exists are dropped.
    async fn insert_content(&self, docs: &[PageContent]) -> Result<(), StoreError>;

    async fn content_exists(&self, content_hash: &str) -> Result<bool, StoreError>;
    async fn get_metadata(&self, normalized_url: &str)
        -> Result<Option<PageMetadata>, StoreError>;
    async fn get_content(&self, content_hash: &str) -> Result<Option<PageContent>, StoreError>;
    /// All normalized URLs whose metadata references this content hash.
    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Vec<String>, StoreError>;
}

/// Unordered inserts against a unique index report duplicates as write
/// errors; those are the idempotent-replay case, not failures.
fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    let message = error.to_string();
    message.contains("E11000") || message.to_lowercase().contains("duplicate key")
}

pub struct MongoStore {
    db: Database,
    metadata: Collection<PageMetadata>,
    content: Collection<PageContent>,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = tokio::time::timeout(OP_TIMEOUT, Client::with_uri_str(uri))
            .await
            .map_err(|_| StoreError::Timeout("connect"))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let db = client.database(database);
        Ok(Self {
            metadata: db.collection(METADATA_COLLECTION),
            content: db.collection(CONTENT_COLLECTION),
            db,
        })
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn ping(&self) -> Result<(), StoreError> {
        tokio::time::timeout(OP_TIMEOUT, self.db.run_command(doc! { "ping": 1 }))
            .await
            .map_err(|_| StoreError::Timeout("ping"))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let unique = IndexOptions::builder().unique(true).build();

        let metadata_indexes = vec![
            IndexModel::builder()
                .keys(doc! { "normalized_url": 1 })
                .options(unique.clone())
                .build(),
            IndexModel::builder().keys(doc! { "content_hash": 1 }).build(),
            IndexModel::builder().keys(doc! { "fetched_at_ms": -1 }).build(),
        ];
        tokio::time::timeout(OP_TIMEOUT, self.metadata.create_indexes(metadata_indexes))
            .await
            .map_err(|_| StoreError::Timeout("ensure_indexes"))?
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let content_index = IndexModel::builder()
            .keys(doc! { "content_hash": 1 })
            .options(unique)
            .build();
        tokio::time::timeout(OP_TIMEOUT, self.content.create_index(content_index))
            .await
            .map_err(|_| StoreError::Timeout("ensure_indexes"))?
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn insert_metadata(&self, docs: &[PageMetadata]) -> Result<(), StoreError> {
        if docs.is_empty() {
            return Ok(());
        }

        let result = tokio::time::timeout(
            OP_TIMEOUT,
            self.metadata.insert_many(docs).ordered(false),
        )
        .await
        .map_err(|_| StoreError::Timeout("insert_metadata"))?;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Ok(()),
            Err(e) => Err(StoreError::Write(e.to_string())),
        }
    }

    async fn insert_content(&self, docs: &[PageContent]) -> Result<(), StoreError> {
        if docs.is_empty() {
            return Ok(());
        }

        let result = tokio::time::timeout(
            OP_TIMEOUT,
            self.content.insert_many(docs).ordered(false),
        )
        .await
        .map_err(|_| StoreError::Timeout("insert_content"))?;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Ok(()),
            Err(e) => Err(StoreError::Write(e.to_string())),
        }
    }

    async fn content_exists(&self, content_hash: &str) -> Result<bool, StoreError> {
        let count = tokio::time::timeout(
            OP_TIMEOUT,
            self.content
                .count_documents(doc! { "content_hash": content_hash }),
        )
        .await
        .map_err(|_| StoreError::Timeout("content_exists"))?
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(count > 0)
    }

    async fn get_metadata(
        &self,
        normalized_url: &str,
    ) -> Result<Option<PageMetadata>, StoreError> {
        tokio::time::timeout(
            OP_TIMEOUT,
            self.metadata
                .find_one(doc! { "normalized_url": normalized_url }),
        )
        .await
        .map_err(|_| StoreError::Timeout("get_metadata"))?
        .map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn get_content(&self, content_hash: &str) -> Result<Option<PageContent>, StoreError> {
        tokio::time::timeout(
            OP_TIMEOUT,
            self.content.find_one(doc! { "content_hash": content_hash }),
        )
        .await
        .map_err(|_| StoreError::Timeout("get_content"))?
        .map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Vec<String>, StoreError> {
        let cursor = tokio::time::timeout(
            OP_TIMEOUT,
            self.metadata.find(doc! { "content_hash": content_hash }),
        )
        .await
        .map_err(|_| StoreError::Timeout("find_by_content_hash"))?
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let docs: Vec<PageMetadata> = cursor
            .try_collect()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(docs.into_iter().map(|m| m.normalized_url).collect())
    }
}

#[derive(Default)]
struct MemoryDocInner {
    metadata: HashMap<String, PageMetadata>,
    content: HashMap<String, PageContent>,
}

/// In-memory backend with the same first-write-wins semantics as the
/// unique indexes give Mongo.
#[derive(Default)]
pub struct MemoryDocStore {
    inner: parking_lot::Mutex<MemoryDocInner>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata_count(&self) -> usize {
        self.inner.lock().metadata.len()
    }

    pub fn content_count(&self) -> usize {
        self.inner.lock().content.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_metadata(&self, docs: &[PageMetadata]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for doc in docs {
            inner
                .metadata
                .entry(doc.normalized_url.clone())
                .or_insert_with(|| doc.clone());
        }
        Ok(())
    }

    async fn insert_content(&self, docs: &[PageContent]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for doc in docs {
            inner
                .content
                .entry(doc.content_hash.clone())
                .or_insert_with(|| doc.clone());
        }
        Ok(())
    }

    async fn content_exists(&self, content_hash: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().content.contains_key(content_hash))
    }

    async fn get_metadata(
        &self,
        normalized_url: &str,
    ) -> Result<Option<PageMetadata>, StoreError> {
        Ok(self.inner.lock().metadata.get(normalized_url).cloned())
    }

    async fn get_content(&self, content_hash: &str) -> Result<Option<PageContent>, StoreError> {
        Ok(self.inner.lock().content.get(content_hash).cloned())
    }

    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock();
        let mut urls: Vec<String> = inner
            .metadata
            .values()
            .filter(|m| m.content_hash == content_hash)
            .map(|m| m.normalized_url.clone())
            .collect();
        urls.sort();
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(url: &str, hash: &str) -> PageMetadata {
        PageMetadata {
            url: url.to_string(),
            normalized_url: url.to_string(),
            status: 200,
            content_type: Some("text/html".to_string()),
            content_length: 10,
            content_hash: hash.to_string(),
            fetched_at_ms: 0,
            worker_id: "w1".to_string(),
            outbound_link_count: 0,
            truncated: false,
            headers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_metadata_insert_is_first_write_wins() {
        let store = MemoryDocStore::new();
        let mut first = metadata("https://a.test/x", "h1");
        first.worker_id = "w1".to_string();
        let mut second = metadata("https://a.test/x", "h1");
        second.worker_id = "w2".to_string();

        store.insert_metadata(&[first]).await.unwrap();
        store.insert_metadata(&[second]).await.unwrap();

        assert_eq!(store.metadata_count(), 1);
        let stored = store.get_metadata("https://a.test/x").await.unwrap().unwrap();
        assert_eq!(stored.worker_id, "w1");
    }

    #[tokio::test]
    async fn test_content_unique_by_hash() {
        let store = MemoryDocStore::new();
        let content = PageContent {
            content_hash: "h1".to_string(),
            compressed_body: vec![1, 2, 3],
            original_length: 3,
            compression: "zlib".to_string(),
        };

        store.insert_content(&[content.clone()]).await.unwrap();
        store.insert_content(&[content]).await.unwrap();

        assert_eq!(store.content_count(), 1);
        assert!(store.content_exists("h1").await.unwrap());
        assert!(!store.content_exists("h2").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_by_content_hash() {
        let store = MemoryDocStore::new();
        store
            .insert_metadata(&[
                metadata("https://a.test/1", "shared"),
                metadata("https://a.test/2", "shared"),
                metadata("https://a.test/3", "other"),
            ])
            .await
            .unwrap();

        assert_eq!(
            store.find_by_content_hash("shared").await.unwrap(),
            vec!["https://a.test/1", "https://a.test/2"]
        );
    }
}
