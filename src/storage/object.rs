//! Object store over a sled tree, with conditional writes.
//!
//! Models the stronger backend kind: every read returns an opaque version
//! tag, and a put may carry a precondition ("must not exist" or "existing
//! tag must match"). Preconditions are applied with sled's compare-and-swap
//! so they are genuinely atomic, which is what the optimistic-concurrency
//! write path builds on.
//!
//! A fresh random tag is minted on every committed put. Values here have no
//! practical size ceiling and no TTL support.

use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;

use crate::storage::backend::{
    ListPage, PutCondition, PutOptions, StorageBackend, StorageError, StorageResult, StoredValue,
};

/// Envelope: 1-byte tag length, tag bytes (hex), then the raw value.
const TAG_BYTES: usize = 8;

pub struct SledObjectStore {
    tree: sled::Tree,
}

impl SledObjectStore {
    pub fn new(tree: sled::Tree) -> Arc<Self> {
        Arc::new(Self { tree })
    }

    fn mint_tag() -> String {
        let mut raw = [0u8; TAG_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        hex::encode(raw)
    }

    fn encode(tag: &str, value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + tag.len() + value.len());
        buf.push(tag.len() as u8);
        buf.extend_from_slice(tag.as_bytes());
        buf.extend_from_slice(value);
        buf
    }

    fn decode(raw: &[u8]) -> StorageResult<(String, Vec<u8>)> {
        let tag_len = *raw
            .first()
            .ok_or_else(|| StorageError::Corrupt("empty object envelope".to_string()))?
            as usize;
        if raw.len() < 1 + tag_len {
            return Err(StorageError::Corrupt(
                "object envelope shorter than its tag".to_string(),
            ));
        }
        let tag = std::str::from_utf8(&raw[1..1 + tag_len])
            .map_err(|_| StorageError::Corrupt("non-utf8 version tag".to_string()))?
            .to_string();
        Ok((tag, raw[1 + tag_len..].to_vec()))
    }
}

#[async_trait]
impl StorageBackend for SledObjectStore {
    fn supports_conditional_write(&self) -> bool {
        true
    }

    fn max_value_size(&self) -> Option<usize> {
        None
    }

    async fn get(&self, key: &str) -> StorageResult<Option<StoredValue>> {
        match self.tree.get(key.as_bytes())? {
            Some(raw) => {
                let (tag, data) = Self::decode(&raw)?;
                Ok(Some(StoredValue {
                    data,
                    version_tag: Some(tag),
                }))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> StorageResult<bool> {
        let encoded = Self::encode(&Self::mint_tag(), &value);

        match opts.condition {
            None => {
                self.tree.insert(key.as_bytes(), encoded)?;
                Ok(true)
            }
            Some(PutCondition::IfAbsent) => {
                let swap = self
                    .tree
                    .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(encoded))?;
                Ok(swap.is_ok())
            }
            Some(PutCondition::IfMatch(expected_tag)) => {
                let current = match self.tree.get(key.as_bytes())? {
                    Some(raw) => raw,
                    // Nothing to match against.
                    None => return Ok(false),
                };
                let (tag, _) = Self::decode(&current)?;
                if tag != expected_tag {
                    return Ok(false);
                }
                let swap =
                    self.tree
                        .compare_and_swap(key.as_bytes(), Some(current), Some(encoded))?;
                Ok(swap.is_ok())
            }
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    async fn list(&self, prefix: &str, _page_token: Option<&str>) -> StorageResult<ListPage> {
        // Only the main document lives here; a single page suffices.
        let mut keys = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (k, _) = item?;
            keys.push(String::from_utf8_lossy(&k).to_string());
        }
        Ok(ListPage {
            keys,
            next_token: None,
        })
    }
}
