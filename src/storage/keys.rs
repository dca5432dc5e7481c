//! Key namespaces for the storage backends.
//!
//! Every persisted record lives under one of a small set of prefixes:
//! - `sync/current`: the main document
//! - `backup/{ts}`: manual snapshots and rollback points
//! - `history/{ts}-{suffix}`: ring-bounded history entries
//! - `history-index`: the denormalized history listing cache
//! - `auth-attempt/{hash}`: failed-credential attempt records
//!
//! Timestamps are 13-digit zero-padded milliseconds so that lexicographic
//! key order equals chronological order.

use rand::Rng;

/// Key of the main synchronized document.
pub const MAIN_DOCUMENT_KEY: &str = "sync/current";

/// Prefix for manual snapshots and rollback points.
pub const SNAPSHOT_PREFIX: &str = "backup/";

/// Prefix for history entries written on sync.
pub const HISTORY_PREFIX: &str = "history/";

/// Key of the persisted history index.
pub const HISTORY_INDEX_KEY: &str = "history-index";

/// Prefix for auth attempt records, keyed by hashed client identity.
pub const AUTH_ATTEMPT_PREFIX: &str = "auth-attempt/";

const TIMESTAMP_DIGITS: usize = 13;
const HISTORY_SUFFIX_LEN: usize = 6;

/// Builds a snapshot key from a millisecond timestamp.
pub fn snapshot_key(ts_ms: i64) -> String {
    format!("{}{:013}", SNAPSHOT_PREFIX, ts_ms.max(0))
}

/// Builds a history-entry key from a millisecond timestamp plus a random
/// hex suffix, so two entries written in the same millisecond never collide.
pub fn history_key(ts_ms: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..HISTORY_SUFFIX_LEN)
        .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
        .collect();
    format!("{}{:013}-{}", HISTORY_PREFIX, ts_ms.max(0), suffix)
}

/// Builds an attempt-record key from an already-hashed identity.
pub fn auth_attempt_key(identity_hash: &str) -> String {
    format!("{}{}", AUTH_ATTEMPT_PREFIX, identity_hash)
}

/// Returns true if the key names a snapshot (or rollback point).
pub fn is_snapshot_key(key: &str) -> bool {
    match key.strip_prefix(SNAPSHOT_PREFIX) {
        Some(rest) => rest.len() == TIMESTAMP_DIGITS && rest.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Returns true if the key names a history entry.
pub fn is_history_key(key: &str) -> bool {
    let rest = match key.strip_prefix(HISTORY_PREFIX) {
        Some(rest) => rest,
        None => return false,
    };
    let (ts, suffix) = match rest.split_once('-') {
        Some(parts) => parts,
        None => return false,
    };
    ts.len() == TIMESTAMP_DIGITS
        && ts.bytes().all(|b| b.is_ascii_digit())
        && !suffix.is_empty()
        && suffix.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Returns true if the key is restorable: a snapshot or a history entry.
pub fn is_backup_key(key: &str) -> bool {
    is_snapshot_key(key) || is_history_key(key)
}

/// Extracts the millisecond timestamp embedded in a snapshot or history key.
pub fn key_timestamp(key: &str) -> Option<i64> {
    let rest = key
        .strip_prefix(SNAPSHOT_PREFIX)
        .or_else(|| key.strip_prefix(HISTORY_PREFIX))?;
    let ts = rest.split('-').next()?;
    if ts.len() != TIMESTAMP_DIGITS {
        return None;
    }
    ts.parse::<i64>().ok()
}
