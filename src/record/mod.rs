//! Versioned record manager for the main document.
//!
//! Reads and writes the single shared document with optimistic concurrency:
//! the caller may supply the version it last observed, and a write is
//! rejected when that version is stale. On the object store the put is
//! additionally conditioned on the version tag observed during this
//! request's read, so a concurrent writer losing the race can never be
//! silently overwritten. On the blob store the version-number check is the
//! only guard — strictly weaker, and last-write-wins remains possible under
//! true concurrency there.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::document::SyncDocument;
use crate::sanitize;
use crate::storage::keys::MAIN_DOCUMENT_KEY;
use crate::storage::{now_ms, PutCondition, PutOptions, StorageBackend, StorageError};

/// Record-manager errors, already translated into the external taxonomy.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Version conflict; latest stored version is {}", latest.meta.version)]
    Conflict { latest: Box<SyncDocument> },

    #[error("Serialized document size {size} exceeds the {limit}-byte backend ceiling")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Document encoding failure: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type RecordResult<T> = Result<T, RecordError>;

/// The current document plus the backend version tag it was read with.
pub type CurrentRecord = (SyncDocument, Option<String>);

pub struct RecordStore {
    blob: Arc<dyn StorageBackend>,
    object: Option<Arc<dyn StorageBackend>>,
}

impl RecordStore {
    pub fn new(blob: Arc<dyn StorageBackend>, object: Option<Arc<dyn StorageBackend>>) -> Arc<Self> {
        Arc::new(Self { blob, object })
    }

    /// Reads the current document.
    ///
    /// When the object store is configured but empty while the blob store
    /// still holds a legacy copy, the copy is migrated with an absent-only
    /// conditional write, so a concurrent migration can never clobber newer
    /// data written in the meantime. If migration fails the blob value is
    /// served as-is.
    pub async fn read_current(&self) -> RecordResult<Option<CurrentRecord>> {
        let object = match &self.object {
            Some(object) => object,
            None => return self.read_blob().await,
        };

        if let Some(stored) = object.get(MAIN_DOCUMENT_KEY).await? {
            let doc = SyncDocument::from_bytes(&stored.data)?;
            return Ok(Some((doc, stored.version_tag)));
        }

        // Object store empty: check for a legacy blob copy to migrate.
        let legacy = match self.read_blob().await? {
            Some(legacy) => legacy,
            None => return Ok(None),
        };

        let bytes = legacy.0.to_bytes()?;
        match object
            .put(
                MAIN_DOCUMENT_KEY,
                bytes,
                PutOptions::with_condition(PutCondition::IfAbsent),
            )
            .await
        {
            Ok(accepted) => {
                if accepted {
                    info!("migrated legacy document into the object store");
                }
                // Re-read either way: if we lost the race, someone else's
                // migration (or a newer write) is the truth now.
                match object.get(MAIN_DOCUMENT_KEY).await {
                    Ok(Some(stored)) => {
                        let doc = SyncDocument::from_bytes(&stored.data)?;
                        Ok(Some((doc, stored.version_tag)))
                    }
                    Ok(None) => Ok(Some(legacy)),
                    Err(e) => {
                        warn!(error = %e, "object re-read after migration failed, serving blob copy");
                        Ok(Some(legacy))
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "legacy document migration failed, serving blob copy");
                Ok(Some(legacy))
            }
        }
    }

    async fn read_blob(&self) -> RecordResult<Option<CurrentRecord>> {
        match self.blob.get(MAIN_DOCUMENT_KEY).await? {
            Some(stored) => {
                let doc = SyncDocument::from_bytes(&stored.data)?;
                Ok(Some((doc, None)))
            }
            None => Ok(None),
        }
    }

    /// Writes a candidate document, stamping the server-owned metadata.
    ///
    /// The resulting version is always `current + 1` (or 1 against an empty
    /// store). A stale `expected_version` rejects before any write is
    /// attempted; a lost conditional-write race re-reads the winner and
    /// rejects with it attached. The conflicting document is returned
    /// admin-sanitized.
    pub async fn write(
        &self,
        mut candidate: SyncDocument,
        expected_version: Option<u64>,
    ) -> RecordResult<SyncDocument> {
        let current = self.read_current().await?;
        let current_version = current.as_ref().map(|(doc, _)| doc.meta.version).unwrap_or(0);

        if let (Some(expected), Some((current_doc, _))) = (expected_version, current.as_ref()) {
            if current_doc.meta.version != expected {
                debug!(
                    expected,
                    stored = current_doc.meta.version,
                    "stale optimistic-lock version, rejecting write"
                );
                return Err(RecordError::Conflict {
                    latest: Box::new(sanitize::admin_view(current_doc)),
                });
            }
        }

        candidate.normalize();
        candidate.meta.version = current_version + 1;
        candidate.meta.updated_at = now_ms();
        let bytes = candidate.to_bytes()?;

        match &self.object {
            Some(object) => {
                let condition = match current.as_ref().and_then(|(_, tag)| tag.clone()) {
                    Some(tag) => PutCondition::IfMatch(tag),
                    None => PutCondition::IfAbsent,
                };
                let accepted = object
                    .put(
                        MAIN_DOCUMENT_KEY,
                        bytes,
                        PutOptions::with_condition(condition),
                    )
                    .await?;
                if !accepted {
                    // A concurrent writer won the race between our read and
                    // this put. Surface the winner, never overwrite blindly.
                    let latest = match object.get(MAIN_DOCUMENT_KEY).await? {
                        Some(stored) => SyncDocument::from_bytes(&stored.data)?,
                        None => {
                            return Err(RecordError::Storage(StorageError::Corrupt(
                                "document disappeared during conditional write".to_string(),
                            )))
                        }
                    };
                    debug!(
                        stored = latest.meta.version,
                        "conditional write lost the race"
                    );
                    return Err(RecordError::Conflict {
                        latest: Box::new(sanitize::admin_view(&latest)),
                    });
                }
            }
            None => {
                if let Some(limit) = self.blob.max_value_size() {
                    if bytes.len() > limit {
                        return Err(RecordError::PayloadTooLarge {
                            size: bytes.len(),
                            limit,
                        });
                    }
                }
                self.blob
                    .put(MAIN_DOCUMENT_KEY, bytes, PutOptions::default())
                    .await?;
            }
        }

        debug!(
            version = candidate.meta.version,
            device = %candidate.meta.device_id,
            "document written"
        );
        Ok(candidate)
    }
}
