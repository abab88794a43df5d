//! Skew-window and nonce-reuse checks for signed requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::credential::PublicKey;
use crate::error::{AuthError, AuthResult};
use crate::signer::{verify, Nonce, SignedRequest};

/// Default allowed difference between signer and verifier clocks.
pub const DEFAULT_MAX_SKEW: Duration = Duration::from_secs(30);

/// Number of inserts between sweeps of expired entries.
const CLEANUP_INTERVAL: u64 = 1024;

/// Concurrent record of recently seen `(key id, nonce)` pairs.
///
/// Entries are kept for twice the skew window: a nonce cannot be replayed
/// while any timestamp it could be paired with still passes the skew check.
pub struct ReplayGuard {
    seen: DashMap<(String, Nonce), i64>,
    ttl_ms: i64,
    inserts: AtomicU64,
}

impl ReplayGuard {
    pub fn new(max_skew: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl_ms: 2 * max_skew.as_millis() as i64,
            inserts: AtomicU64::new(0),
        }
    }

    /// Record the nonce; returns `false` if it was already seen.
    ///
    /// The check and the insert happen under the same shard lock.
    pub fn check_and_insert(&self, key_id: &str, nonce: &Nonce, now_ms: i64) -> bool {
        let fresh = match self.seen.entry((key_id.to_string(), *nonce)) {
            Entry::Occupied(mut entry) => {
                if now_ms - *entry.get() > self.ttl_ms {
                    entry.insert(now_ms);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now_ms);
                true
            }
        };

        if fresh && self.inserts.fetch_add(1, Ordering::Relaxed) % CLEANUP_INTERVAL == 0 {
            self.cleanup_expired(now_ms);
        }
        fresh
    }

    pub fn cleanup_expired(&self, now_ms: i64) {
        let before = self.seen.len();
        self.seen.retain(|_, seen_at| now_ms - *seen_at <= self.ttl_ms);
        let removed = before.saturating_sub(self.seen.len());
        if removed > 0 {
            debug!(removed, "Pruned expired nonces");
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Full verification of signed requests from one credential.
pub struct Verifier {
    public_key: PublicKey,
    max_skew_ms: i64,
    replay: ReplayGuard,
}

impl Verifier {
    pub fn new(public_key: PublicKey) -> Self {
        Self::with_max_skew(public_key, DEFAULT_MAX_SKEW)
    }

    pub fn with_max_skew(public_key: PublicKey, max_skew: Duration) -> Self {
        Self {
            public_key,
            max_skew_ms: max_skew.as_millis() as i64,
            replay: ReplayGuard::new(max_skew),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Verify against the current wall clock.
    pub fn verify(&self, request: &SignedRequest) -> AuthResult<()> {
        self.verify_at(request, chrono::Utc::now().timestamp_millis())
    }

    /// Verify the timestamp window, the signature, then record the nonce.
    ///
    /// The nonce is only recorded for requests whose signature is valid, so
    /// forged requests cannot burn nonces of legitimate ones.
    pub fn verify_at(&self, request: &SignedRequest, now_ms: i64) -> AuthResult<()> {
        if request.timestamp < now_ms - self.max_skew_ms {
            return Err(AuthError::TimestampExpired);
        }
        if request.timestamp > now_ms + self.max_skew_ms {
            return Err(AuthError::TimestampInFuture);
        }

        verify(&self.public_key, request)?;

        if !self
            .replay
            .check_and_insert(&request.key_id, &request.nonce, now_ms)
        {
            return Err(AuthError::ReplayDetected);
        }
        Ok(())
    }
}
