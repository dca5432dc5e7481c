//! # syncd: a cloud synchronization storage engine
//!
//! syncd lets multiple devices share one mutable document with optimistic
//! concurrency, bounded history and backup retention, and brute-force
//! resistant admin authentication. It provides:
//!
//! - **Dual-backend storage**: one contract over a size-limited blob store
//!   (per-key TTLs, no atomic writes) and a stronger object store
//!   (version tags, conditional writes)
//! - **Optimistic concurrency**: monotonic document versions; stale writers
//!   get the winning document back instead of silently losing data
//! - **Ring-bounded history**: the last 20 syncs, backed by a self-healing
//!   denormalized index, plus TTL-bounded manual snapshots and automatic
//!   rollback points on restore
//! - **Tiered rate limiting**: per-client lockout with thresholds scaled to
//!   how trustworthy the client's identity attribution is
//!
//! # Usage
//!
//! ```bash
//! syncd --data-dir ./data --listen 127.0.0.1:8080 --admin-token <secret>
//! ```

// Core modules
pub mod api;
pub mod auth;
pub mod document;
pub mod history;
pub mod record;
pub mod sanitize;
pub mod server;
pub mod storage;

// Re-export main types at crate root for convenience
pub use document::{SyncDocument, SyncKind, SyncMeta};
pub use history::{BackupManager, HISTORY_RING_SIZE};
pub use record::RecordStore;
pub use server::{ServerConfig, SyncServer};
pub use storage::{SledBlobStore, SledObjectStore, StorageBackend};
