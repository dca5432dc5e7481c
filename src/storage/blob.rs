//! Size-limited blob store over a sled tree.
//!
//! Models the weaker of the two backend kinds: string keys, per-key TTL,
//! paginated prefix listing, a hard 25 MiB value ceiling, and no atomic
//! conditional writes. Values are wrapped in a small binary envelope that
//! carries the absolute expiry timestamp.
//!
//! Expiry is lazy: an expired value is treated as missing on access and
//! deleted opportunistically, instead of being swept by a background task.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::storage::backend::{
    now_ms, ListPage, PutOptions, StorageBackend, StorageError, StorageResult, StoredValue,
};

/// Hard ceiling on a single stored value.
pub const MAX_VALUE_SIZE: usize = 25 * 1024 * 1024;

/// Keys returned per listing page.
const LIST_PAGE_SIZE: usize = 256;

/// Envelope: 8-byte little-endian absolute expiry in ms (0 = no expiry),
/// followed by the raw value bytes.
const ENVELOPE_HEADER: usize = 8;

pub struct SledBlobStore {
    tree: sled::Tree,
}

impl SledBlobStore {
    pub fn new(tree: sled::Tree) -> Arc<Self> {
        Arc::new(Self { tree })
    }

    fn encode(expires_at_ms: i64, value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENVELOPE_HEADER + value.len());
        buf.extend_from_slice(&expires_at_ms.to_le_bytes());
        buf.extend_from_slice(value);
        buf
    }

    fn decode(raw: &[u8]) -> StorageResult<(i64, Vec<u8>)> {
        if raw.len() < ENVELOPE_HEADER {
            return Err(StorageError::Corrupt(
                "blob envelope shorter than header".to_string(),
            ));
        }
        let expires_at_ms = i64::from_le_bytes(raw[..ENVELOPE_HEADER].try_into().unwrap());
        Ok((expires_at_ms, raw[ENVELOPE_HEADER..].to_vec()))
    }

    fn is_expired(expires_at_ms: i64, now: i64) -> bool {
        expires_at_ms > 0 && expires_at_ms <= now
    }
}

#[async_trait]
impl StorageBackend for SledBlobStore {
    fn supports_conditional_write(&self) -> bool {
        false
    }

    fn max_value_size(&self) -> Option<usize> {
        Some(MAX_VALUE_SIZE)
    }

    async fn get(&self, key: &str) -> StorageResult<Option<StoredValue>> {
        let raw = match self.tree.get(key.as_bytes())? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let (expires_at_ms, data) = Self::decode(&raw)?;
        if Self::is_expired(expires_at_ms, now_ms()) {
            debug!(key, "blob expired, dropping on access");
            if let Err(e) = self.tree.remove(key.as_bytes()) {
                warn!(key, error = %e, "failed to drop expired blob");
            }
            return Ok(None);
        }

        Ok(Some(StoredValue {
            data,
            version_tag: None,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> StorageResult<bool> {
        if opts.condition.is_some() {
            return Err(StorageError::ConditionalWriteUnsupported);
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(StorageError::ValueTooLarge {
                size: value.len(),
                limit: MAX_VALUE_SIZE,
            });
        }

        let expires_at_ms = opts
            .ttl_seconds
            .map(|ttl| now_ms() + (ttl as i64) * 1000)
            .unwrap_or(0);

        self.tree
            .insert(key.as_bytes(), Self::encode(expires_at_ms, &value))?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    async fn list(&self, prefix: &str, page_token: Option<&str>) -> StorageResult<ListPage> {
        let now = now_ms();
        let mut keys = Vec::new();
        let mut last_raw_key: Option<String> = None;
        let mut truncated = false;

        // The cursor is the last key of the previous page; resume strictly
        // after it.
        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> =
            match page_token {
                Some(token) => {
                    let mut start = token.as_bytes().to_vec();
                    start.push(0);
                    Box::new(self.tree.range(start..))
                }
                None => Box::new(self.tree.scan_prefix(prefix.as_bytes())),
            };

        for item in iter {
            let (k, v) = item?;
            let key = String::from_utf8_lossy(&k).to_string();
            if !key.starts_with(prefix) {
                break;
            }

            if keys.len() >= LIST_PAGE_SIZE {
                truncated = true;
                break;
            }
            last_raw_key = Some(key.clone());

            // Expired entries are invisible to listings.
            match Self::decode(&v) {
                Ok((expires_at_ms, _)) if Self::is_expired(expires_at_ms, now) => {
                    if let Err(e) = self.tree.remove(&k) {
                        warn!(key, error = %e, "failed to drop expired blob during list");
                    }
                }
                Ok(_) => keys.push(key),
                Err(e) => {
                    warn!(key, error = %e, "skipping corrupt blob during list");
                }
            }
        }

        Ok(ListPage {
            keys,
            next_token: if truncated { last_raw_key } else { None },
        })
    }
}
