//! Backup and history lifecycle: snapshots, the ring-bounded history log,
//! rollback points, and restore.
//!
//! Three snapshot flavors share one storage shape. Manual snapshots are
//! operator-triggered and bounded only by TTL; history entries are written
//! on sync and ring-bounded to [`HISTORY_RING_SIZE`]; rollback points are
//! auto-created right before a restore overwrites the main document.
//!
//! Non-critical side effects here — index maintenance, rollback creation,
//! the history entry recording a restore — degrade gracefully: their
//! failure never fails the primary operation.

pub mod index;

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::document::{SyncDocument, SyncKind};
use crate::record::{RecordError, RecordStore};
use crate::sanitize;
use crate::storage::keys::{
    is_backup_key, is_history_key, is_snapshot_key, history_key, snapshot_key,
};
use crate::storage::{now_ms, PutOptions, StorageBackend, StorageError};

pub use index::{HistoryIndex, HistoryIndexCache, HistoryIndexItem, HISTORY_RING_SIZE};

/// Snapshots, history entries, and rollback points all expire after 30 days.
pub const BACKUP_TTL_SECONDS: u64 = 30 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid backup key: {0}")]
    InvalidKey(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("The history entry for the current version cannot be deleted")]
    ActiveEntry,

    #[error("Serialized backup size {size} exceeds the {limit}-byte backend ceiling")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Backup encoding failure: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Record(#[from] RecordError),
}

pub type BackupResult<T> = Result<T, BackupError>;

/// One row of the history listing.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupListItem {
    pub key: String,
    pub updated_at: i64,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    pub sync_kind: SyncKind,
    pub version: u64,
    pub is_current: bool,
}

pub struct BackupManager {
    blob: Arc<dyn StorageBackend>,
    records: Arc<RecordStore>,
    index: HistoryIndexCache,
}

impl BackupManager {
    pub fn new(blob: Arc<dyn StorageBackend>, records: Arc<RecordStore>) -> Arc<Self> {
        let index = HistoryIndexCache::new(blob.clone());
        Arc::new(Self {
            blob,
            records,
            index,
        })
    }

    fn encode_checked(&self, doc: &SyncDocument) -> BackupResult<Vec<u8>> {
        let bytes = sanitize::admin_view(doc).to_bytes()?;
        if let Some(limit) = self.blob.max_value_size() {
            if bytes.len() > limit {
                return Err(BackupError::PayloadTooLarge {
                    size: bytes.len(),
                    limit,
                });
            }
        }
        Ok(bytes)
    }

    /// Persists a manual snapshot of the given document. Snapshots are
    /// retained until TTL expiry, with no count bound.
    pub async fn create_snapshot(&self, doc: &SyncDocument) -> BackupResult<String> {
        let key = snapshot_key(now_ms());
        let bytes = self.encode_checked(doc)?;
        self.blob
            .put(&key, bytes, PutOptions::with_ttl(BACKUP_TTL_SECONDS))
            .await?;
        info!(key, version = doc.meta.version, "snapshot created");
        Ok(key)
    }

    /// Records a history entry for an accepted sync.
    ///
    /// By default only manual syncs produce an entry; high-frequency
    /// automatic syncs would otherwise churn through the ring. Callers can
    /// override the skip with `force`. Returns `None` when skipped.
    pub async fn create_history_entry(
        &self,
        doc: &SyncDocument,
        kind: SyncKind,
        force: bool,
    ) -> BackupResult<Option<String>> {
        if kind == SyncKind::Auto && !force {
            debug!("auto sync, skipping history entry");
            return Ok(None);
        }

        let key = history_key(now_ms());
        let bytes = self.encode_checked(doc)?;
        self.blob
            .put(&key, bytes, PutOptions::with_ttl(BACKUP_TTL_SECONDS))
            .await?;
        self.index.update(&key, doc.meta.clone()).await;
        debug!(key, version = doc.meta.version, "history entry created");
        Ok(Some(key))
    }

    /// Fetches one backup by key.
    pub async fn get(&self, key: &str) -> BackupResult<SyncDocument> {
        if !is_backup_key(key) {
            return Err(BackupError::InvalidKey(key.to_string()));
        }
        let stored = self
            .blob
            .get(key)
            .await?
            .ok_or_else(|| BackupError::NotFound(key.to_string()))?;
        Ok(SyncDocument::from_bytes(&stored.data)?)
    }

    /// Restores a backup as the new main document.
    ///
    /// The current document is first snapshotted as a rollback point; a
    /// failure there yields `rollback_key = None` but the restore still
    /// proceeds. The restored document is written through the record
    /// manager, so it gets a fresh monotonic version, and the restore
    /// itself is appended to the history best-effort.
    pub async fn restore(
        &self,
        key: &str,
        requester_device_id: &str,
    ) -> BackupResult<(SyncDocument, Option<String>)> {
        let mut doc = self.get(key).await?;

        let rollback_key = match self.records.read_current().await? {
            Some((current, _)) => match self.create_snapshot(&current).await {
                Ok(rollback) => Some(rollback),
                Err(e) => {
                    warn!(error = %e, "rollback snapshot failed, restoring anyway");
                    None
                }
            },
            None => None,
        };

        doc.meta.sync_kind = SyncKind::Manual;
        doc.meta.device_id = requester_device_id.to_string();
        let restored = self.records.write(doc, None).await?;

        if let Err(e) = self
            .create_history_entry(&restored, SyncKind::Manual, true)
            .await
        {
            warn!(error = %e, "failed to record restore in history");
        }

        info!(
            key,
            version = restored.meta.version,
            rollback = rollback_key.as_deref().unwrap_or("-"),
            "backup restored"
        );
        Ok((restored, rollback_key))
    }

    /// Lists history entries, newest first, flagging the one whose version
    /// matches the current main document.
    pub async fn list(&self) -> BackupResult<Vec<BackupListItem>> {
        let index = match self.index.read().await? {
            Some(index) => index,
            None => self.index.rebuild().await?,
        };

        let current_version = self
            .records
            .read_current()
            .await?
            .map(|(doc, _)| doc.meta.version);

        let mut items: Vec<BackupListItem> = index
            .items
            .into_iter()
            .map(|item| BackupListItem {
                key: item.key,
                updated_at: item.meta.updated_at,
                device_id: item.meta.device_id,
                browser: item.meta.browser,
                os: item.meta.os,
                sync_kind: item.meta.sync_kind,
                version: item.meta.version,
                is_current: Some(item.meta.version) == current_version,
            })
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(items)
    }

    /// Deletes one backup.
    ///
    /// Snapshot keys delete unconditionally and idempotently. A history
    /// entry whose recorded version equals the current document's version
    /// is the active entry and is rejected; the cached index supplies that
    /// version where it can, falling back to reading the entry body.
    pub async fn delete(&self, key: &str) -> BackupResult<()> {
        if !is_backup_key(key) {
            return Err(BackupError::InvalidKey(key.to_string()));
        }

        if is_snapshot_key(key) {
            self.blob.delete(key).await?;
            debug!(key, "snapshot deleted");
            return Ok(());
        }

        debug_assert!(is_history_key(key));
        let entry_version = match self.index.read().await? {
            Some(index) => index
                .items
                .iter()
                .find(|item| item.key == key)
                .map(|item| item.meta.version),
            None => None,
        };
        let entry_version = match entry_version {
            Some(version) => Some(version),
            None => match self.blob.get(key).await? {
                Some(stored) => SyncDocument::from_bytes(&stored.data)
                    .ok()
                    .map(|doc| doc.meta.version),
                None => None,
            },
        };

        if let Some(entry_version) = entry_version {
            let current_version = self
                .records
                .read_current()
                .await?
                .map(|(doc, _)| doc.meta.version);
            if Some(entry_version) == current_version {
                return Err(BackupError::ActiveEntry);
            }
        }

        self.blob.delete(key).await?;
        self.index.remove(key).await;
        debug!(key, "history entry deleted");
        Ok(())
    }
}
