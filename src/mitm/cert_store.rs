//! Certificate storage
//!
//! Signing is on the hot path of every new TLS handshake, so leaves are
//! memoized behind the [`CertStorage`] seam. Every backend guarantees that
//! concurrent fetches of the same key run the generator at most once at a
//! time, and that generator errors are never stored.
//!
//! Backends:
//! - [`ExpiringCertStore`]: RW-locked map with per-key single-flight cells and
//!   a background TTL sweep
//! - [`LruCertStore`]: capacity-bounded LRU with a per-host lock map
//! - [`NoCertCache`]: passthrough, signs on every fetch

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::error::{MitmError, Result};
use super::signer::LeafCertificate;

/// Generator invoked on a cache miss
pub type Generator<'a> = &'a (dyn Fn() -> Result<Arc<LeafCertificate>> + Send + Sync);

/// Pluggable certificate cache
#[async_trait]
pub trait CertStorage: Send + Sync {
    /// Return the certificate stored under `key`, running `generate` on a miss
    async fn fetch(&self, key: &str, generate: Generator<'_>) -> Result<Arc<LeafCertificate>>;
}

/// Cached certificate with its expiry
struct CachedCertificate {
    cert: Arc<LeafCertificate>,
    expires_at: Option<Instant>,
}

impl CachedCertificate {
    fn new(cert: Arc<LeafCertificate>, ttl: Option<Duration>) -> Self {
        Self {
            cert,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(expires_at) if now > expires_at)
    }
}

// ============================================================================
// Passthrough
// ============================================================================

/// Signs on every fetch
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCertCache;

#[async_trait]
impl CertStorage for NoCertCache {
    async fn fetch(&self, _key: &str, generate: Generator<'_>) -> Result<Arc<LeafCertificate>> {
        generate()
    }
}

// ============================================================================
// TTL map with single-flight
// ============================================================================

type Flight = Arc<OnceCell<Arc<LeafCertificate>>>;

/// In-memory map with TTL expiry
///
/// Reads of cached entries only take the shared lock. A miss joins (or
/// starts) the in-flight cell for its key so duplicates wait for a single
/// generation while other keys sign concurrently.
///
/// A zero TTL disables caching: every fetch signs a fresh leaf.
pub struct ExpiringCertStore {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedCertificate>>,
    inflight: Mutex<HashMap<String, Flight>>,
}

impl ExpiringCertStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Create a store and start its background sweep
    ///
    /// Must be called inside a tokio runtime. The sweep stops once the last
    /// strong reference to the store is dropped.
    pub fn with_sweeper(ttl: Duration, sweep_every: Duration) -> Arc<Self> {
        let store = Arc::new(Self::new(ttl));
        start_sweep_task(Arc::downgrade(&store), sweep_every);
        store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_caching(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Number of stored entries (expired ones included until swept)
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Remove every entry whose expiry has passed, returning how many
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    async fn lookup(&self, key: &str) -> Option<Arc<LeafCertificate>> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| Arc::clone(&entry.cert))
    }
}

#[async_trait]
impl CertStorage for ExpiringCertStore {
    async fn fetch(&self, key: &str, generate: Generator<'_>) -> Result<Arc<LeafCertificate>> {
        if !self.is_caching() {
            return generate();
        }

        if let Some(cert) = self.lookup(key).await {
            return Ok(cert);
        }

        let flight = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(inflight.entry(key.to_string()).or_default())
        };

        let result = flight
            .get_or_try_init(|| async move {
                // a previous flight may have landed between lookup and join
                if let Some(cert) = self.lookup(key).await {
                    return Ok(cert);
                }
                let cert = generate()?;
                self.entries.write().await.insert(
                    key.to_string(),
                    CachedCertificate::new(Arc::clone(&cert), Some(self.ttl)),
                );
                Ok::<_, MitmError>(cert)
            })
            .await
            .map(Arc::clone);

        let mut inflight = self.inflight.lock().await;
        if inflight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &flight))
        {
            inflight.remove(key);
        }

        result
    }
}

/// Periodically purge expired entries while the store is alive
fn start_sweep_task(store: Weak<ExpiringCertStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(store) = store.upgrade() else {
                break;
            };
            let evicted = store.purge_expired().await;
            if evicted > 0 {
                debug!(evicted, "Certificate cache sweep complete");
            }
        }
    })
}

// ============================================================================
// LRU with per-host locks
// ============================================================================

/// Capacity-bounded LRU store
///
/// Each host key gets its own async lock while it is being generated, so
/// contention is limited to duplicate requests for the same host set.
pub struct LruCertStore {
    ttl: Option<Duration>,
    cache: Mutex<LruCache<String, CachedCertificate>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LruCertStore {
    /// `ttl` of `None` keeps entries until they are evicted by capacity
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            cache: Mutex::new(LruCache::new(capacity)),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }

    async fn lookup(&self, key: &str) -> Option<Arc<LeafCertificate>> {
        let mut cache = self.cache.lock().await;
        let expired = cache.get(key)?.is_expired(Instant::now());
        if expired {
            cache.pop(key);
            return None;
        }
        cache.get(key).map(|entry| Arc::clone(&entry.cert))
    }
}

#[async_trait]
impl CertStorage for LruCertStore {
    async fn fetch(&self, key: &str, generate: Generator<'_>) -> Result<Arc<LeafCertificate>> {
        if let Some(cert) = self.lookup(key).await {
            return Ok(cert);
        }

        let host_lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key.to_string()).or_default())
        };

        let result = {
            let _guard = host_lock.lock().await;
            match self.lookup(key).await {
                Some(cert) => Ok(cert),
                None => match generate() {
                    Ok(cert) => {
                        self.cache.lock().await.put(
                            key.to_string(),
                            CachedCertificate::new(Arc::clone(&cert), self.ttl),
                        );
                        Ok(cert)
                    }
                    Err(err) => Err(err),
                },
            }
        };

        // drop the lock entry once nobody else is queued on it
        let mut locks = self.locks.lock().await;
        if Arc::strong_count(&host_lock) <= 2 {
            locks.remove(key);
        }

        result
    }
}
