//! Brute-force protection for the admin credential.
//!
//! Client identity is derived from the most trustworthy request attribute
//! available, each tier carrying its own failure threshold: a trusted
//! edge-supplied IP (5), a proxy-forwarded IP combined with a request
//! fingerprint (3), a fingerprint alone (3), or nothing at all (2, the
//! strictest). The identity seed is length-capped and hashed before it is
//! used as a storage key.
//!
//! Per-identity lockout state machine: clean → warned (failures below the
//! threshold) → locked for one hour once the threshold is reached → clean
//! again when the window elapses. The lock is enforced *before* the
//! credential comparison is honored, so an already-locked identity stays
//! rejected even when it presents the correct credential.
//!
//! A successful check clears the durable attempt record, but the delete is
//! throttled through a small process-local advisory memory of recent
//! failures; the two designated entry points (login, auth-status) always
//! force the clear, guaranteeing eventual cleanup even after eviction.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::storage::keys::auth_attempt_key;
use crate::storage::{now_ms, PutOptions, StorageBackend, StorageResult};

/// Lockout window, which doubles as the attempt-record TTL.
pub const LOCKOUT_SECONDS: u64 = 60 * 60;

const SEED_MAX_BYTES: usize = 256;
const ADVISORY_CAPACITY: usize = 256;

/// Durable per-identity attempt state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub failed_count: u32,
    pub locked_until: i64,
    pub updated_at: i64,
}

/// Raw request attributes the identity is derived from.
#[derive(Clone, Debug, Default)]
pub struct ClientHints {
    /// IP supplied by a trusted edge.
    pub client_ip: Option<String>,
    /// First hop of a proxy-supplied forwarded chain.
    pub forwarded_ip: Option<String>,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub accept_encoding: Option<String>,
    pub client_hints_ua: Option<String>,
}

impl ClientHints {
    fn fingerprint(&self) -> String {
        [
            self.user_agent.as_deref(),
            self.accept_language.as_deref(),
            self.accept_encoding.as_deref(),
            self.client_hints_ua.as_deref(),
        ]
        .iter()
        .flatten()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("|")
    }
}

/// A derived identity: the hashed seed plus the tier's failure threshold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIdentity {
    pub hash: String,
    pub threshold: u32,
}

/// Derives the most trusted identity the request attributes allow.
pub fn derive_identity(hints: &ClientHints) -> ClientIdentity {
    let fingerprint = hints.fingerprint();

    let (seed, threshold) = match (
        hints.client_ip.as_deref().filter(|ip| !ip.trim().is_empty()),
        hints
            .forwarded_ip
            .as_deref()
            .filter(|ip| !ip.trim().is_empty()),
    ) {
        (Some(ip), _) => (format!("ip:{}", ip.trim()), 5),
        (None, Some(fwd)) => (format!("fwd:{}|{}", fwd.trim(), fingerprint), 3),
        (None, None) if !fingerprint.is_empty() => (format!("fp:{}", fingerprint), 3),
        (None, None) => ("anon".to_string(), 2),
    };

    ClientIdentity {
        hash: hash_seed(&seed),
        threshold,
    }
}

/// Caps the seed, then hashes it so raw IPs and header values never become
/// storage keys.
fn hash_seed(seed: &str) -> String {
    let mut end = seed.len().min(SEED_MAX_BYTES);
    while end > 0 && !seed.is_char_boundary(end) {
        end -= 1;
    }
    hex::encode(Sha256::digest(seed[..end].as_bytes()))
}

/// Compares a provided credential against the expected one by digest
/// equality, so the comparison does not short-circuit on the raw bytes.
pub fn credentials_match(provided: &str, expected: &str) -> bool {
    let a: [u8; 32] = Sha256::digest(provided.as_bytes()).into();
    let b: [u8; 32] = Sha256::digest(expected.as_bytes()).into();
    a == b
}

/// Outcome of a rate-limited credential check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Allowed,
    WrongCredential { remaining: u32 },
    LockedOut { locked_until: i64, retry_after_secs: u64 },
}

/// Size-bounded, self-expiring advisory memory of identities that recently
/// failed. Never authoritative: its absence must never be read as proof no
/// failure occurred, which is why designated endpoints force the clear.
struct RecentFailures {
    entries: HashMap<String, i64>,
}

impl RecentFailures {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, hash: &str, now: i64) {
        if self.entries.len() >= ADVISORY_CAPACITY && !self.entries.contains_key(hash) {
            let horizon = now - (LOCKOUT_SECONDS as i64) * 1000;
            self.entries.retain(|_, at| *at > horizon);
            if self.entries.len() >= ADVISORY_CAPACITY {
                if let Some(oldest) = self
                    .entries
                    .iter()
                    .min_by_key(|(_, at)| **at)
                    .map(|(k, _)| k.clone())
                {
                    self.entries.remove(&oldest);
                }
            }
        }
        self.entries.insert(hash.to_string(), now);
    }

    fn take(&mut self, hash: &str, now: i64) -> bool {
        match self.entries.remove(hash) {
            Some(at) => at > now - (LOCKOUT_SECONDS as i64) * 1000,
            None => false,
        }
    }
}

pub struct RateLimiter {
    blob: Arc<dyn StorageBackend>,
    recent_failures: Mutex<RecentFailures>,
}

impl RateLimiter {
    pub fn new(blob: Arc<dyn StorageBackend>) -> Arc<Self> {
        Arc::new(Self {
            blob,
            recent_failures: Mutex::new(RecentFailures::new()),
        })
    }

    /// Checks a credential for one derived identity, recording the outcome.
    ///
    /// `force_clear` is set by the designated entry points that must always
    /// issue the durable delete on success.
    pub async fn check_and_record(
        &self,
        identity: &ClientIdentity,
        provided: &str,
        expected: &str,
        force_clear: bool,
    ) -> StorageResult<AuthOutcome> {
        let now = now_ms();
        let key = auth_attempt_key(&identity.hash);

        let record = match self.blob.get(&key).await? {
            Some(stored) => match serde_json::from_slice::<AttemptRecord>(&stored.data) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "unreadable attempt record, treating as clean");
                    None
                }
            },
            None => None,
        };

        // Lock wins: an active lock rejects even a correct credential.
        if let Some(record) = record.as_ref() {
            if record.locked_until > now {
                let retry_after_secs = ((record.locked_until - now) as u64).div_ceil(1000);
                return Ok(AuthOutcome::LockedOut {
                    locked_until: record.locked_until,
                    retry_after_secs,
                });
            }
        }

        if credentials_match(provided, expected) {
            let had_recent_failure = self.recent_failures.lock().take(&identity.hash, now);
            if force_clear || had_recent_failure {
                if let Err(e) = self.blob.delete(&key).await {
                    warn!(error = %e, "failed to clear attempt record");
                }
            }
            return Ok(AuthOutcome::Allowed);
        }

        // An expired lock means the window elapsed: back to clean, so this
        // failure starts a fresh count.
        let failed_count = match record {
            Some(record) if record.locked_until > 0 && record.locked_until <= now => 1,
            Some(record) => record.failed_count + 1,
            None => 1,
        };
        let locked_until = if failed_count >= identity.threshold {
            now + (LOCKOUT_SECONDS as i64) * 1000
        } else {
            0
        };

        let updated = AttemptRecord {
            failed_count,
            locked_until,
            updated_at: now,
        };
        match serde_json::to_vec(&updated) {
            Ok(bytes) => {
                if let Err(e) = self
                    .blob
                    .put(&key, bytes, PutOptions::with_ttl(LOCKOUT_SECONDS))
                    .await
                {
                    warn!(error = %e, "failed to persist attempt record");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode attempt record"),
        }
        self.recent_failures.lock().insert(&identity.hash, now);

        debug!(
            failed_count,
            threshold = identity.threshold,
            locked = locked_until > 0,
            "credential check failed"
        );
        Ok(AuthOutcome::WrongCredential {
            remaining: identity.threshold.saturating_sub(failed_count),
        })
    }

    #[cfg(test)]
    fn forget_recent_failures(&self) {
        self.recent_failures.lock().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledBlobStore;
    use tempfile::TempDir;

    const SECRET: &str = "test-only-not-a-secret";

    fn setup() -> (Arc<RateLimiter>, Arc<SledBlobStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let blob = SledBlobStore::new(db.open_tree("blob").unwrap());
        (RateLimiter::new(blob.clone()), blob, dir)
    }

    fn anonymous() -> ClientIdentity {
        derive_identity(&ClientHints::default())
    }

    #[test]
    fn tiers_pick_the_most_trusted_attribute() {
        let edge = derive_identity(&ClientHints {
            client_ip: Some("203.0.113.9".to_string()),
            forwarded_ip: Some("198.51.100.1".to_string()),
            user_agent: Some("ua".to_string()),
            ..ClientHints::default()
        });
        assert_eq!(edge.threshold, 5);

        let forwarded = derive_identity(&ClientHints {
            forwarded_ip: Some("198.51.100.1".to_string()),
            user_agent: Some("ua".to_string()),
            ..ClientHints::default()
        });
        assert_eq!(forwarded.threshold, 3);
        assert_ne!(edge.hash, forwarded.hash);

        let fingerprint_only = derive_identity(&ClientHints {
            user_agent: Some("ua".to_string()),
            accept_language: Some("en".to_string()),
            ..ClientHints::default()
        });
        assert_eq!(fingerprint_only.threshold, 3);

        assert_eq!(anonymous().threshold, 2);
    }

    #[test]
    fn identity_seed_is_capped_and_hashed() {
        let long_ua = "u".repeat(10_000);
        let id = derive_identity(&ClientHints {
            user_agent: Some(long_ua),
            ..ClientHints::default()
        });
        // Always a sha256 hex digest, regardless of seed length.
        assert_eq!(id.hash.len(), 64);
        assert!(id.hash.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn failures_count_down_then_lock() {
        let (limiter, _blob, _dir) = setup();
        let id = anonymous();

        // Anonymous threshold is 2.
        assert_eq!(
            limiter
                .check_and_record(&id, "wrong", SECRET, false)
                .await
                .unwrap(),
            AuthOutcome::WrongCredential { remaining: 1 }
        );
        assert_eq!(
            limiter
                .check_and_record(&id, "wrong", SECRET, false)
                .await
                .unwrap(),
            AuthOutcome::WrongCredential { remaining: 0 }
        );

        // Third attempt is locked out even with the correct credential.
        match limiter
            .check_and_record(&id, SECRET, SECRET, false)
            .await
            .unwrap()
        {
            AuthOutcome::LockedOut {
                locked_until,
                retry_after_secs,
            } => {
                assert!(locked_until > now_ms());
                assert!(retry_after_secs > 0 && retry_after_secs <= LOCKOUT_SECONDS);
            }
            other => panic!("expected lockout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_clears_after_recent_failure() {
        let (limiter, blob, _dir) = setup();
        let id = anonymous();
        let key = auth_attempt_key(&id.hash);

        limiter
            .check_and_record(&id, "wrong", SECRET, false)
            .await
            .unwrap();
        assert!(blob.get(&key).await.unwrap().is_some());

        limiter
            .check_and_record(&id, SECRET, SECRET, false)
            .await
            .unwrap();
        assert!(blob.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn evicted_advisory_memory_defers_but_force_clear_deletes() {
        let (limiter, blob, _dir) = setup();
        let id = anonymous();
        let key = auth_attempt_key(&id.hash);

        limiter
            .check_and_record(&id, "wrong", SECRET, false)
            .await
            .unwrap();
        limiter.forget_recent_failures();

        // With the advisory memory gone, an ordinary success skips the
        // durable delete.
        assert_eq!(
            limiter
                .check_and_record(&id, SECRET, SECRET, false)
                .await
                .unwrap(),
            AuthOutcome::Allowed
        );
        assert!(blob.get(&key).await.unwrap().is_some());

        // A designated endpoint forces it.
        assert_eq!(
            limiter
                .check_and_record(&id, SECRET, SECRET, true)
                .await
                .unwrap(),
            AuthOutcome::Allowed
        );
        assert!(blob.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lock_returns_to_clean() {
        let (limiter, blob, _dir) = setup();
        let id = anonymous();
        let key = auth_attempt_key(&id.hash);

        // Plant a record whose lock expired a minute ago.
        let stale = AttemptRecord {
            failed_count: 2,
            locked_until: now_ms() - 60_000,
            updated_at: now_ms() - 3_600_000,
        };
        blob.put(
            &key,
            serde_json::to_vec(&stale).unwrap(),
            PutOptions::default(),
        )
        .await
        .unwrap();

        // Correct credential passes again.
        assert_eq!(
            limiter
                .check_and_record(&id, SECRET, SECRET, true)
                .await
                .unwrap(),
            AuthOutcome::Allowed
        );

        // And a wrong one starts a fresh count rather than resuming at 2.
        assert_eq!(
            limiter
                .check_and_record(&id, "wrong", SECRET, false)
                .await
                .unwrap(),
            AuthOutcome::WrongCredential { remaining: 1 }
        );
    }
}
