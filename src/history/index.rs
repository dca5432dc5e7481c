//! Denormalized, self-healing cache of the history listing.
//!
//! The authoritative state is the set of `history/` keys in the blob store;
//! this cache exists so the common read path does not have to enumerate the
//! backend. It is never the sole source of truth: `rebuild` is a pure,
//! idempotent function of the backend listing, triggered lazily whenever the
//! cached copy is missing or unreadable. Writers update it opportunistically
//! and a persistence failure never fails their primary operation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::document::{SyncDocument, SyncMeta};
use crate::storage::keys::{key_timestamp, HISTORY_INDEX_KEY, HISTORY_PREFIX};
use crate::storage::{PutOptions, StorageBackend, StorageResult};

/// Capacity of the history ring.
pub const HISTORY_RING_SIZE: usize = 20;

/// Bump when the persisted shape changes; mismatched copies are discarded
/// and rebuilt.
const INDEX_FORMAT_VERSION: u32 = 1;

/// Hard cap on listing pages per rebuild. A ring of 20 entries can never
/// legitimately need more; this bounds the cost of pathological backends.
const MAX_LIST_PAGES: usize = 16;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryIndexItem {
    pub key: String,
    pub meta: SyncMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryIndex {
    pub version: u32,
    pub items: Vec<HistoryIndexItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
}

impl HistoryIndex {
    fn empty() -> Self {
        Self {
            version: INDEX_FORMAT_VERSION,
            items: Vec::new(),
            sources: Some(vec![HISTORY_PREFIX.to_string()]),
        }
    }
}

/// Sorts newest-first by the timestamp embedded in the key, tie-broken by
/// the key itself so the order is total.
fn sort_items(items: &mut [HistoryIndexItem]) {
    items.sort_by(|a, b| {
        let ta = key_timestamp(&a.key).unwrap_or(0);
        let tb = key_timestamp(&b.key).unwrap_or(0);
        tb.cmp(&ta).then_with(|| b.key.cmp(&a.key))
    });
}

pub struct HistoryIndexCache {
    blob: Arc<dyn StorageBackend>,
}

impl HistoryIndexCache {
    pub fn new(blob: Arc<dyn StorageBackend>) -> Self {
        Self { blob }
    }

    /// Reads the cached index. Missing, unparseable, or format-mismatched
    /// copies all read as `None`; the caller is expected to rebuild.
    pub async fn read(&self) -> StorageResult<Option<HistoryIndex>> {
        let stored = match self.blob.get(HISTORY_INDEX_KEY).await? {
            Some(stored) => stored,
            None => return Ok(None),
        };
        match serde_json::from_slice::<HistoryIndex>(&stored.data) {
            Ok(index) if index.version == INDEX_FORMAT_VERSION => Ok(Some(index)),
            Ok(index) => {
                debug!(version = index.version, "history index format mismatch");
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "history index unreadable, will rebuild");
                Ok(None)
            }
        }
    }

    /// Rebuilds the index from the authoritative backend listing: paginate
    /// all history keys (bounded, cursor-deduplicated), keep the newest
    /// [`HISTORY_RING_SIZE`], delete the overflow from the backend, and
    /// fetch metadata for kept entries — reusing metas already known to the
    /// stale cached copy instead of re-fetching those bodies.
    pub async fn rebuild(&self) -> StorageResult<HistoryIndex> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        let mut seen_tokens: HashSet<String> = HashSet::new();

        for _ in 0..MAX_LIST_PAGES {
            let page = self.blob.list(HISTORY_PREFIX, token.as_deref()).await?;
            keys.extend(page.keys);
            match page.next_token {
                Some(next) => {
                    // A backend that hands back a cursor it already served
                    // would loop forever without this.
                    if !seen_tokens.insert(next.clone()) {
                        warn!("history listing repeated a cursor, stopping early");
                        break;
                    }
                    token = Some(next);
                }
                None => break,
            }
        }

        keys.sort_by(|a, b| {
            let ta = key_timestamp(a).unwrap_or(0);
            let tb = key_timestamp(b).unwrap_or(0);
            tb.cmp(&ta).then_with(|| b.cmp(a))
        });
        keys.dedup();

        let overflow: Vec<String> = keys.split_off(keys.len().min(HISTORY_RING_SIZE));
        for key in &overflow {
            if let Err(e) = self.blob.delete(key).await {
                warn!(key, error = %e, "failed to delete overflow history entry");
            }
        }

        // Harvest metas from whatever cached copy exists, format-checked or
        // not: a meta is keyed by an immutable entry, so it stays valid for
        // as long as the entry itself does.
        let mut known: HashMap<String, SyncMeta> = HashMap::new();
        if let Ok(Some(stored)) = self.blob.get(HISTORY_INDEX_KEY).await {
            if let Ok(stale) = serde_json::from_slice::<HistoryIndex>(&stored.data) {
                for item in stale.items {
                    known.insert(item.key, item.meta);
                }
            }
        }

        let mut index = HistoryIndex::empty();
        for key in keys {
            let meta = match known.remove(&key) {
                Some(meta) => meta,
                None => match self.blob.get(&key).await? {
                    Some(stored) => match SyncDocument::from_bytes(&stored.data) {
                        Ok(doc) => doc.meta,
                        Err(e) => {
                            warn!(key, error = %e, "unreadable history entry skipped");
                            continue;
                        }
                    },
                    // Expired between the listing and now.
                    None => continue,
                },
            };
            index.items.push(HistoryIndexItem { key, meta });
        }

        self.persist(&index).await;
        debug!(items = index.items.len(), "history index rebuilt");
        Ok(index)
    }

    /// Records a freshly written history entry: prepend, dedup, re-sort,
    /// truncate to the ring size, delete overflow entries, persist. Never
    /// fails the caller — every error is logged and swallowed.
    pub async fn update(&self, key: &str, meta: SyncMeta) {
        let index = match self.read().await {
            Ok(Some(index)) => Some(index),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "history index read failed during update");
                None
            }
        };

        let mut index = match index {
            Some(index) => index,
            // No usable cache: a rebuild already observes the new entry,
            // which was persisted before this call.
            None => match self.rebuild().await {
                Ok(index) => return self.ensure_contains(index, key, meta).await,
                Err(e) => {
                    warn!(error = %e, "history index rebuild failed during update");
                    return;
                }
            },
        };

        index.items.retain(|item| item.key != key);
        index.items.insert(
            0,
            HistoryIndexItem {
                key: key.to_string(),
                meta,
            },
        );
        sort_items(&mut index.items);

        let overflow: Vec<HistoryIndexItem> = index
            .items
            .split_off(index.items.len().min(HISTORY_RING_SIZE));
        for item in &overflow {
            if let Err(e) = self.blob.delete(&item.key).await {
                warn!(key = %item.key, error = %e, "failed to delete overflow history entry");
            }
        }

        self.persist(&index).await;
    }

    /// Drops one entry from the cached index; a no-op when absent.
    pub async fn remove(&self, key: &str) {
        let mut index = match self.read().await {
            Ok(Some(index)) => index,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "history index read failed during remove");
                return;
            }
        };

        let before = index.items.len();
        index.items.retain(|item| item.key != key);
        if index.items.len() != before {
            self.persist(&index).await;
        }
    }

    async fn ensure_contains(&self, mut index: HistoryIndex, key: &str, meta: SyncMeta) {
        if !index.items.iter().any(|item| item.key == key) {
            index.items.insert(
                0,
                HistoryIndexItem {
                    key: key.to_string(),
                    meta,
                },
            );
            sort_items(&mut index.items);
            index
                .items
                .truncate(HISTORY_RING_SIZE);
            self.persist(&index).await;
        }
    }

    async fn persist(&self, index: &HistoryIndex) {
        let bytes = match serde_json::to_vec(index) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "history index serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .blob
            .put(HISTORY_INDEX_KEY, bytes, PutOptions::default())
            .await
        {
            warn!(error = %e, "history index persistence failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::keys::history_key;
    use crate::storage::SledBlobStore;
    use tempfile::TempDir;

    fn setup() -> (HistoryIndexCache, Arc<SledBlobStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let blob = SledBlobStore::new(db.open_tree("blob").unwrap());
        (HistoryIndexCache::new(blob.clone()), blob, dir)
    }

    fn meta_at(version: u64) -> SyncMeta {
        SyncMeta {
            version,
            ..SyncMeta::default()
        }
    }

    async fn seed_entry(blob: &Arc<SledBlobStore>, ts: i64, version: u64) -> String {
        let key = history_key(ts);
        let mut doc = SyncDocument::default();
        doc.meta = meta_at(version);
        blob.put(&key, doc.to_bytes().unwrap(), PutOptions::default())
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn read_of_missing_index_is_none() {
        let (cache, _blob, _dir) = setup();
        assert!(cache.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rebuild_lists_sorts_and_persists() {
        let (cache, blob, _dir) = setup();

        let base = 1_700_000_000_000i64;
        for i in 0..5 {
            seed_entry(&blob, base + i * 1000, i as u64 + 1).await;
        }

        let index = cache.rebuild().await.unwrap();
        assert_eq!(index.items.len(), 5);
        // Newest first.
        assert_eq!(index.items[0].meta.version, 5);
        assert_eq!(index.items[4].meta.version, 1);

        // The rebuilt copy was persisted.
        let cached = cache.read().await.unwrap().unwrap();
        assert_eq!(cached.items.len(), 5);
    }

    #[tokio::test]
    async fn rebuild_truncates_ring_and_deletes_overflow() {
        let (cache, blob, _dir) = setup();

        let base = 1_700_000_000_000i64;
        let mut keys = Vec::new();
        for i in 0..(HISTORY_RING_SIZE as i64 + 5) {
            keys.push(seed_entry(&blob, base + i * 1000, i as u64 + 1).await);
        }

        let index = cache.rebuild().await.unwrap();
        assert_eq!(index.items.len(), HISTORY_RING_SIZE);

        // The 5 oldest keys are gone from the backend.
        for key in &keys[..5] {
            assert!(blob.get(key).await.unwrap().is_none());
        }
        for key in &keys[5..] {
            assert!(blob.get(key).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn corrupt_index_heals_on_rebuild() {
        let (cache, blob, _dir) = setup();

        blob.put(
            HISTORY_INDEX_KEY,
            b"not json at all".to_vec(),
            PutOptions::default(),
        )
        .await
        .unwrap();
        assert!(cache.read().await.unwrap().is_none());

        seed_entry(&blob, 1_700_000_000_000, 1).await;
        let index = cache.rebuild().await.unwrap();
        assert_eq!(index.items.len(), 1);
        assert!(cache.read().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_prepends_dedups_and_bounds() {
        let (cache, blob, _dir) = setup();

        let base = 1_700_000_000_000i64;
        let mut first_key = String::new();
        for i in 0..(HISTORY_RING_SIZE as i64 + 3) {
            let key = seed_entry(&blob, base + i * 1000, i as u64 + 1).await;
            if i == 0 {
                first_key = key.clone();
            }
            cache.update(&key, meta_at(i as u64 + 1)).await;
        }

        let index = cache.read().await.unwrap().unwrap();
        assert_eq!(index.items.len(), HISTORY_RING_SIZE);
        assert!(index.items.iter().all(|item| item.key != first_key));
        // Overflowed entries were deleted from the backend too.
        assert!(blob.get(&first_key).await.unwrap().is_none());

        // Re-recording an existing key does not duplicate it.
        let newest = index.items[0].clone();
        cache.update(&newest.key, newest.meta.clone()).await;
        let index = cache.read().await.unwrap().unwrap();
        assert_eq!(
            index
                .items
                .iter()
                .filter(|item| item.key == newest.key)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn remove_is_noop_when_absent() {
        let (cache, blob, _dir) = setup();

        let key = seed_entry(&blob, 1_700_000_000_000, 1).await;
        cache.update(&key, meta_at(1)).await;

        cache.remove("history/0000000000000-abcdef").await;
        assert_eq!(cache.read().await.unwrap().unwrap().items.len(), 1);

        cache.remove(&key).await;
        assert!(cache.read().await.unwrap().unwrap().items.is_empty());
    }
}
