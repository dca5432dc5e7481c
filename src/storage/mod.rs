//! Storage layer: one contract, two backend kinds.
//!
//! The blob store is the weaker kind (TTL support, size-limited, no atomic
//! conditional writes); the object store is the stronger kind (version tags
//! plus compare-and-swap preconditions). Everything above this layer
//! depends only on the [`StorageBackend`] trait and the capability flag.

pub mod backend;
pub mod blob;
pub mod keys;
pub mod object;

pub use backend::{
    now_ms, ListPage, PutCondition, PutOptions, StorageBackend, StorageError, StorageResult,
    StoredValue,
};
pub use blob::{SledBlobStore, MAX_VALUE_SIZE};
pub use object::SledObjectStore;
