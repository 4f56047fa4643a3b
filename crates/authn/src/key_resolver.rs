//! Cached resolution of signing keys from a JWKS source.
//!
//! [`KeyResolver`] maps a token's `kid` to a verification key, fetching the
//! identity provider's whole key set on demand.
//!
//! # Architecture
//!
//! ```text
//! resolve(kid) → load snapshot (lock-free)
//!              → fresh and contains kid? return it
//!              → otherwise acquire the refresh permit
//!                  → another caller already fetched since we looked? reuse its result
//!                  → else fetch, parse, swap in a new snapshot
//!              → look kid up in the new snapshot
//! ```
//!
//! # Cache Strategy
//!
//! - **TTL**: Default 10 minutes; an expired snapshot is refetched on the next resolve
//! - **Rotation**: An unknown `kid` triggers a refetch, rate-limited by `min_refresh_interval`
//! - **Atomic swap**: A refresh installs a whole new snapshot; readers never see a partial set
//! - **Stale fallback**: While refreshes fail, an expired snapshot younger than `max_stale` keeps
//!   being served; after a failure, retries wait `min_refresh_interval` and stale keys are served
//!   without fetching in between
//!
//! # Examples
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use jwks_authn::{HttpJwksSource, KeyResolver};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = HttpJwksSource::new(
//!     "https://idp.example.com/.well-known/jwks.json",
//!     Duration::from_secs(5),
//! )?;
//! let resolver = Arc::new(KeyResolver::new(Arc::new(source), Duration::from_secs(600)));
//!
//! let key = resolver.resolve("key-2024-001").await?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use fail::fail_point;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{AuthConfig, DEFAULT_CACHE_TTL, DEFAULT_MAX_STALE, DEFAULT_MIN_REFRESH_INTERVAL},
    error::{AuthError, ConfigError, JwksError},
    jwks::{HttpJwksSource, JwksSource, SigningKey, parse_key_set},
};

/// One fetched key set.
///
/// Snapshots are immutable; a refresh replaces the resolver's snapshot as a
/// whole.
#[derive(Debug)]
pub struct KeySet {
    keys: HashMap<String, Arc<SigningKey>>,
    fetched_at: Instant,
    generation: u64,
}

impl KeySet {
    fn new(keys: HashMap<String, Arc<SigningKey>>, generation: u64) -> Self {
        Self { keys, fetched_at: Instant::now(), generation }
    }

    /// Looks up a key by id.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<Arc<SigningKey>> {
        self.keys.get(kid).cloned()
    }

    /// Number of usable keys in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no usable key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key ids in the set, in no particular order.
    pub fn kids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Time since the set was fetched.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// Fetch attempt that produced this set. Increases with every attempt.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Point-in-time view of the resolver's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverMetrics {
    /// Resolves answered from a fresh snapshot.
    pub cache_hits: u64,
    /// Completed fetch attempts, successful or not.
    pub fetches: u64,
    /// Fetch attempts that failed.
    pub fetch_failures: u64,
    /// Resolves answered from an expired snapshot because refreshing failed.
    pub stale_serves: u64,
    /// Completed background refresh cycles.
    pub refresh_cycles: u64,
    /// Keys in the current snapshot.
    pub cached_keys: usize,
    /// Generation of the current snapshot, zero when empty.
    pub generation: u64,
}

/// Resolves key ids to signing keys, caching the identity provider's key set.
///
/// Cheap to share: wrap it in an [`Arc`] and hand it to every verifier.
/// Reads of a fresh snapshot never take a lock; refreshes are serialized so
/// concurrent misses cause a single fetch.
///
/// # Graceful Degradation
///
/// When a refresh of an expired snapshot fails, keys from that snapshot keep
/// being served until it is older than `max_stale` (default
/// [`DEFAULT_MAX_STALE`] = 1 hour). An unknown `kid` is never answered from a
/// stale snapshot's absence: the fetch error is returned instead.
pub struct KeyResolver {
    source: Arc<dyn JwksSource>,
    cache_ttl: Duration,
    min_refresh_interval: Duration,
    max_stale: Duration,

    current: ArcSwapOption<KeySet>,
    /// Serializes fetches. Held across the source call.
    refresh_permit: tokio::sync::Mutex<()>,
    /// Number of completed fetch attempts. A snapshot's generation is the
    /// attempt that produced it.
    completed: AtomicU64,
    last_attempt: Mutex<Option<Instant>>,
    /// Most recent failed attempt and its error, shared with coalesced waiters.
    last_failure: Mutex<Option<(u64, Arc<JwksError>)>>,

    cancel_token: CancellationToken,
    refresh_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,

    cache_hits: AtomicU64,
    fetch_failures: AtomicU64,
    stale_serves: AtomicU64,
    refresh_cycles: AtomicU64,
}

impl std::fmt::Debug for KeyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyResolver")
            .field("source", &self.source.describe())
            .field("cache_ttl", &self.cache_ttl)
            .field("min_refresh_interval", &self.min_refresh_interval)
            .field("max_stale", &self.max_stale)
            .field("generation", &self.current.load().as_ref().map(|set| set.generation))
            .finish_non_exhaustive()
    }
}

impl KeyResolver {
    /// Creates a resolver over `source` whose snapshots expire after `cache_ttl`.
    ///
    /// The rate limit and stale bound start at [`DEFAULT_MIN_REFRESH_INTERVAL`]
    /// and [`DEFAULT_MAX_STALE`].
    pub fn new(source: Arc<dyn JwksSource>, cache_ttl: Duration) -> Self {
        Self {
            source,
            cache_ttl,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            max_stale: DEFAULT_MAX_STALE,
            current: ArcSwapOption::empty(),
            refresh_permit: tokio::sync::Mutex::new(()),
            completed: AtomicU64::new(0),
            last_attempt: Mutex::new(None),
            last_failure: Mutex::new(None),
            cancel_token: CancellationToken::new(),
            refresh_handle: Mutex::new(None),
            cache_hits: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            stale_serves: AtomicU64::new(0),
            refresh_cycles: AtomicU64::new(0),
        }
    }

    /// Creates a resolver with the default TTL of [`DEFAULT_CACHE_TTL`].
    pub fn with_defaults(source: Arc<dyn JwksSource>) -> Self {
        Self::new(source, DEFAULT_CACHE_TTL)
    }

    /// Creates an HTTP-backed resolver from configuration.
    ///
    /// Background refresh is not started here; see
    /// [`with_refresh_interval`](Self::with_refresh_interval).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid or the HTTP
    /// client cannot be built.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let source = HttpJwksSource::new(config.jwks_url(), config.fetch_timeout())?;
        Ok(Self::new(Arc::new(source), config.cache_ttl())
            .with_min_refresh_interval(config.min_refresh_interval())
            .with_max_stale(config.max_stale()))
    }

    /// Sets the minimum interval between refreshes triggered by an unknown `kid`.
    ///
    /// Zero disables the rate limit.
    #[must_use]
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Sets how long an expired snapshot may keep serving keys while refreshes fail.
    ///
    /// Zero disables the stale fallback.
    #[must_use]
    pub fn with_max_stale(mut self, max_stale: Duration) -> Self {
        self.max_stale = max_stale;
        self
    }

    /// Resolves `kid` to a signing key.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The key set does not contain `kid`, even after a fresh fetch ([`AuthError::UnknownKey`])
    /// - The key set could not be fetched and no usable stale copy exists
    ///   ([`AuthError::KeyFetch`])
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, kid: &str) -> Result<Arc<SigningKey>, AuthError> {
        // Read the attempt counter before the snapshot: an attempt completing
        // after this point is reused instead of fetching again.
        let observed = self.completed.load(Ordering::Acquire);
        let snapshot = self.current.load_full();

        if let Some(set) = &snapshot
            && self.is_fresh(set)
        {
            if let Some(key) = set.get(kid) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(generation = set.generation, "cache hit");
                return Ok(key);
            }
            if !self.miss_refresh_allowed() {
                tracing::debug!(
                    generation = set.generation,
                    "unknown kid, refresh rate-limited"
                );
                return Err(AuthError::unknown_key(kid));
            }
            tracing::debug!(generation = set.generation, "unknown kid, refreshing key set");
        } else if let Some(set) = &snapshot
            && let Some(key) = self.stale_during_backoff(set, kid)
        {
            return Ok(key);
        } else {
            tracing::debug!("key set missing or expired, refreshing");
        }

        match self.refresh_coalesced(observed).await {
            Ok(set) => set.get(kid).ok_or_else(|| AuthError::unknown_key(kid)),
            Err(err) => self.stale_or_fail(kid, err),
        }
    }

    /// Fetches the key set now, regardless of the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyFetch`] if the fetch fails. The current snapshot
    /// is left in place.
    pub async fn refresh(&self) -> Result<Arc<KeySet>, AuthError> {
        let _permit = self.refresh_permit.lock().await;
        self.fetch_and_install().await.map_err(AuthError::key_fetch)
    }

    /// Eagerly fetches the key set, typically at startup.
    ///
    /// A failure is logged and otherwise ignored; the first resolve retries.
    pub async fn warm(&self) {
        match self.refresh().await {
            Ok(set) => tracing::info!(
                jwks_url = self.source.describe(),
                keys = set.len(),
                "key set warmed"
            ),
            Err(err) => tracing::warn!(
                jwks_url = self.source.describe(),
                error = %err,
                "key set warm-up failed"
            ),
        }
    }

    /// Drops the current snapshot so the next resolve refetches.
    ///
    /// Also lifts the unknown-`kid` rate limit. An audit event is emitted at
    /// INFO level.
    #[tracing::instrument(skip(self))]
    pub fn invalidate(&self) {
        let previous = self.current.swap(None);
        *self.last_attempt.lock() = None;
        tracing::info!(
            audit.action = "invalidate_key_set",
            audit.resource = self.source.describe(),
            audit.result = "success",
            audit.evicted = previous.as_ref().map_or(0, |set| set.len()),
            "audit_event"
        );
    }

    /// Returns the current snapshot, fresh or not.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<KeySet>> {
        self.current.load_full()
    }

    /// Returns the current counters.
    #[must_use]
    pub fn metrics(&self) -> ResolverMetrics {
        let snapshot = self.current.load();
        ResolverMetrics {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            fetches: self.completed.load(Ordering::Acquire),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            stale_serves: self.stale_serves.load(Ordering::Relaxed),
            refresh_cycles: self.refresh_cycles.load(Ordering::Relaxed),
            cached_keys: snapshot.as_ref().map_or(0, |set| set.len()),
            generation: snapshot.as_ref().map_or(0, |set| set.generation),
        }
    }

    /// Starts a background task that refetches the key set every `interval`.
    ///
    /// Should be shorter than the TTL so requests rarely wait on a fetch.
    /// Failures are logged; the current snapshot is kept. The task stops on
    /// [`shutdown`](Self::shutdown) or when the cancel token fires.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn with_refresh_interval(self: Arc<Self>, interval: Duration) -> Arc<Self> {
        let resolver = Arc::clone(&self);
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; consume it so we start
            // with a full interval wait.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("background refresh task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        resolver.do_refresh_cycle().await;
                    }
                }
            }
        });

        *self.refresh_handle.lock() = Some(handle);
        self
    }

    /// Stops the background refresh task, if any, and drops the snapshot.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.refresh_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "background refresh task panicked");
        }
        self.current.store(None);
    }

    /// Token that stops the background refresh task when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    async fn do_refresh_cycle(&self) {
        let start = Instant::now();
        let result = self.refresh().await;
        self.refresh_cycles.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(set) => tracing::info!(
                keys = set.len(),
                generation = set.generation,
                latency_ms = start.elapsed().as_millis() as u64,
                "background refresh cycle complete"
            ),
            Err(err) => tracing::warn!(
                error = %err,
                latency_ms = start.elapsed().as_millis() as u64,
                "background refresh cycle failed, keeping current key set"
            ),
        }
    }

    fn is_fresh(&self, set: &KeySet) -> bool {
        set.age() < self.cache_ttl
    }

    fn miss_refresh_allowed(&self) -> bool {
        match *self.last_attempt.lock() {
            Some(at) => at.elapsed() >= self.min_refresh_interval,
            None => true,
        }
    }

    /// Serves `kid` from an expired snapshot without fetching while the last
    /// attempt failed less than `min_refresh_interval` ago.
    fn stale_during_backoff(&self, set: &KeySet, kid: &str) -> Option<Arc<SigningKey>> {
        let latest = self.completed.load(Ordering::Acquire);
        let last_failed = self
            .last_failure
            .lock()
            .as_ref()
            .is_some_and(|(generation, _)| *generation == latest);
        if !last_failed || self.miss_refresh_allowed() {
            return None;
        }

        let key = set.get(kid)?;
        let age = set.age();
        if age > self.max_stale {
            return None;
        }
        self.stale_serves.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            generation = set.generation,
            stale_age_secs = age.as_secs(),
            "serving stale key, retry after failed fetch not yet due"
        );
        Some(key)
    }

    /// Refreshes under the permit, reusing an attempt that completed after
    /// `observed` instead of fetching again.
    async fn refresh_coalesced(&self, observed: u64) -> Result<Arc<KeySet>, Arc<JwksError>> {
        let _permit = self.refresh_permit.lock().await;

        let latest = self.completed.load(Ordering::Acquire);
        if latest != observed {
            if let Some(set) = self.current.load_full()
                && set.generation == latest
            {
                tracing::debug!(generation = latest, "reusing key set fetched by another caller");
                return Ok(set);
            }
            if let Some((generation, err)) = self.last_failure.lock().as_ref()
                && *generation == latest
            {
                tracing::debug!(generation = latest, "reusing fetch failure from another caller");
                return Err(Arc::clone(err));
            }
        }

        self.fetch_and_install().await
    }

    /// Fetches and swaps in a new snapshot. Caller holds the refresh permit.
    async fn fetch_and_install(&self) -> Result<Arc<KeySet>, Arc<JwksError>> {
        let generation = self.completed.load(Ordering::Acquire) + 1;
        *self.last_attempt.lock() = Some(Instant::now());

        let outcome = match self.fetch_document().await {
            Ok(document) => {
                let set = Arc::new(KeySet::new(parse_key_set(&document), generation));
                if set.is_empty() {
                    tracing::warn!(
                        jwks_url = self.source.describe(),
                        published = document.keys.len(),
                        "JWKS document contains no usable signing keys"
                    );
                }
                self.current.store(Some(Arc::clone(&set)));
                *self.last_failure.lock() = None;
                tracing::debug!(generation, keys = set.len(), "installed new key set");
                Ok(set)
            },
            Err(err) => {
                self.fetch_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    jwks_url = self.source.describe(),
                    generation,
                    error = %err,
                    "JWKS fetch failed"
                );
                let err = Arc::new(err);
                *self.last_failure.lock() = Some((generation, Arc::clone(&err)));
                Err(err)
            },
        };

        self.completed.store(generation, Ordering::Release);
        outcome
    }

    async fn fetch_document(&self) -> Result<crate::jwks::JwksDocument, JwksError> {
        fail_point!("resolver-before-fetch", |_| {
            Err(JwksError::internal("injected failure before JWKS fetch"))
        });
        self.source.fetch().await
    }

    fn stale_or_fail(&self, kid: &str, err: Arc<JwksError>) -> Result<Arc<SigningKey>, AuthError> {
        if let Some(set) = self.current.load_full()
            && let Some(key) = set.get(kid)
        {
            let age = set.age();
            if age <= self.max_stale {
                self.stale_serves.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    generation = set.generation,
                    stale_age_secs = age.as_secs(),
                    error = %err,
                    "serving stale key, JWKS endpoint unavailable"
                );
                return Ok(key);
            }
            tracing::warn!(
                generation = set.generation,
                stale_age_secs = age.as_secs(),
                "stale key set exceeds max_stale, refusing to serve"
            );
        }

        Err(AuthError::key_fetch(err))
    }
}
