//! Token replay detection via `jti` tracking.
//!
//! When a [`ReplayDetector`] is attached to a
//! [`TokenVerifier`](crate::jwt::TokenVerifier), every verified token must
//! carry a `jti` claim, and a `jti` presented a second time before the token
//! expires is rejected with [`AuthError::Replayed`].
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use jwks_authn::replay::InMemoryReplayDetector;
//!
//! // Track at most 10_000 live token ids.
//! let detector = Arc::new(InMemoryReplayDetector::new(10_000));
//! ```
//!
//! Entries expire with the token they belong to, so memory stays bounded by
//! the number of live tokens; the capacity bound is a safety net on top.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::{future::Cache, policy::EvictionPolicy};

use crate::error::AuthError;

/// Records seen token ids and rejects repeats.
#[async_trait]
pub trait ReplayDetector: Send + Sync {
    /// Marks `jti` as seen, failing if it was already seen.
    ///
    /// `expires_in` is the token's remaining lifetime; the entry need not be
    /// kept longer than that.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Replayed`] if `jti` was already recorded.
    async fn check_and_mark(&self, jti: &str, expires_in: Duration) -> Result<(), AuthError>;
}

/// Expires each entry at the instant stored as its value.
struct UntilTokenExpiry;

impl moka::Expiry<String, Instant> for UntilTokenExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Instant,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.saturating_duration_since(created_at))
    }
}

/// In-memory [`ReplayDetector`] backed by a [`moka::future::Cache`].
///
/// Check and insert happen as one atomic cache operation, so two concurrent
/// presentations of the same token cannot both succeed.
pub struct InMemoryReplayDetector {
    /// `jti` → expiry instant.
    seen: Cache<String, Instant>,
}

impl std::fmt::Debug for InMemoryReplayDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryReplayDetector")
            .field("tracked", &self.seen.entry_count())
            .finish()
    }
}

impl InMemoryReplayDetector {
    /// Creates a detector tracking at most `max_capacity` token ids.
    ///
    /// Past capacity, the least recently used entry is evicted.
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        let seen = Cache::builder()
            .max_capacity(max_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(UntilTokenExpiry)
            .build();
        Self { seen }
    }

    /// Number of tracked token ids. Eventually consistent.
    #[must_use]
    pub fn tracked(&self) -> u64 {
        self.seen.entry_count()
    }
}

#[async_trait]
impl ReplayDetector for InMemoryReplayDetector {
    async fn check_and_mark(&self, jti: &str, expires_in: Duration) -> Result<(), AuthError> {
        let expires_at = Instant::now() + expires_in;
        let entry = self.seen.entry(jti.to_owned()).or_insert(expires_at).await;

        if entry.is_fresh() {
            Ok(())
        } else {
            tracing::warn!(jti, "token replay detected");
            Err(AuthError::replayed(jti))
        }
    }
}
