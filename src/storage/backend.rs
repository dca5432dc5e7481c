//! Uniform storage contract over the two backend kinds.
//!
//! Business logic above this trait never cares which backend it talks to:
//! - the blob store supports per-key TTLs and paginated listing but has no
//!   atomic conditional writes and enforces a hard value-size ceiling;
//! - the object store returns an opaque version tag with every read and
//!   accepts put preconditions, giving true compare-and-swap semantics.
//!
//! Callers branch on `supports_conditional_write()` rather than on concrete
//! types. A missing key is a normal `Ok(None)` result; only real backend
//! failures surface as `StorageError`.

use async_trait::async_trait;
use thiserror::Error;

/// Storage-layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Backend(#[from] sled::Error),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    #[error("Backend does not support conditional writes")]
    ConditionalWriteUnsupported,

    #[error("Value size {size} exceeds backend limit {limit}")]
    ValueTooLarge { size: usize, limit: usize },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A stored value together with its backend version tag, when the backend
/// produces one.
#[derive(Clone, Debug)]
pub struct StoredValue {
    pub data: Vec<u8>,
    pub version_tag: Option<String>,
}

/// Precondition for a conditional put.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutCondition {
    /// Commit only if the key does not already exist.
    IfAbsent,
    /// Commit only if the existing version tag matches.
    IfMatch(String),
}

/// Options for a put operation.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Relative TTL in seconds; the backend drops the value after expiry.
    pub ttl_seconds: Option<u64>,
    /// Optional precondition; requires `supports_conditional_write()`.
    pub condition: Option<PutCondition>,
}

impl PutOptions {
    pub fn with_ttl(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds: Some(ttl_seconds),
            condition: None,
        }
    }

    pub fn with_condition(condition: PutCondition) -> Self {
        Self {
            ttl_seconds: None,
            condition: Some(condition),
        }
    }
}

/// One page of a prefix listing.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Opaque cursor for the next page; `None` when the listing is complete.
    pub next_token: Option<String>,
}

/// The uniform contract both backend kinds implement.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Whether `PutCondition` is honored atomically.
    fn supports_conditional_write(&self) -> bool;

    /// Hard value-size ceiling, if the backend has one.
    fn max_value_size(&self) -> Option<usize>;

    /// Reads a key. Missing or expired keys yield `Ok(None)`.
    async fn get(&self, key: &str) -> StorageResult<Option<StoredValue>>;

    /// Writes a key. Returns `false` when a supplied precondition failed,
    /// `true` when the value was committed.
    async fn put(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> StorageResult<bool>;

    /// Deletes a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Lists keys under a prefix, one page at a time.
    async fn list(&self, prefix: &str, page_token: Option<&str>) -> StorageResult<ListPage>;
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
