//! TTL result cache for upstream lookups.
//!
//! Data model (one table per value type, all keyed by `(op, address)`):
//!   profile:{address}      → Option<ProtocolProfile>   (TTL: 24h)
//!   events:{address}       → Arc<Vec<ProtocolEvent>>   (TTL: 24h)
//!   resolution:{address}   → ResolvedIdentity          (TTL: 24h)
//!   trust_edges:{viewer}   → TrustEdgeSet              (TTL: 1h)
//!
//! Entries are evicted lazily when read after expiry; there is no background
//! sweep. Time comes from an injected [`Clock`] so tests can move it.

use crate::circles::{CandidateAddress, ProtocolEvent, ProtocolProfile};
use crate::config::CacheConfig;
use crate::resolver::ResolvedIdentity;
use crate::trust::TrustEdgeSet;

use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Source of "now" in unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    Profile,
    Events,
    Resolution,
    TrustEdges,
}

impl CacheOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Events => "events",
            Self::Resolution => "resolution",
            Self::TrustEdges => "trust_edges",
        }
    }
}

impl fmt::Display for CacheOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub op: CacheOp,
    pub address: CandidateAddress,
}

impl CacheKey {
    pub fn new(op: CacheOp, address: &CandidateAddress) -> Self {
        Self {
            op,
            address: address.clone(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.op, self.address)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub computed_at: u64,
    pub ttl_seconds: u64,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.computed_at) > self.ttl_seconds
    }
}

/// Selects entries to drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheTag {
    Address(CandidateAddress),
    Operation(CacheOp),
    All,
}

impl CacheTag {
    fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::Address(address) => &key.address == address,
            Self::Operation(op) => key.op == *op,
            Self::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Drops the per-key compute lock once no caller holds it.
struct InflightCleanup<'a> {
    inflight: &'a DashMap<CacheKey, Arc<Mutex<()>>>,
    key: CacheKey,
}

impl Drop for InflightCleanup<'_> {
    fn drop(&mut self) {
        self.inflight
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Concurrent TTL map with per-key compute coalescing.
pub struct TtlCache<V> {
    entries: DashMap<CacheKey, CacheEntry<V>>,
    inflight: DashMap<CacheKey, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone + Send + Sync> TtlCache<V> {
    pub fn new(clock: Arc<dyn Clock>, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            clock,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A live value for `key`. Expired entries are removed here.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let found = self.lookup(key);
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn lookup(&self, key: &CacheKey) -> Option<V> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
            debug!(key = %key, "evicted expired cache entry");
        }
        None
    }

    pub fn set(&self, key: CacheKey, value: V, ttl_seconds: u64) {
        if ttl_seconds == 0 {
            return;
        }
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                debug!(key = %key, max = self.max_entries, "cache full, not storing");
                return;
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                computed_at: self.clock.now(),
                ttl_seconds,
            },
        );
    }

    /// Return the cached value or run `compute` and cache an `Ok` result.
    /// Concurrent callers for the same key wait for the first compute
    /// instead of issuing their own.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: CacheKey,
        ttl_seconds: u64,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        // Declared before the lock so it runs after the lock is released,
        // including when this future is dropped mid-compute.
        let _cleanup = InflightCleanup {
            inflight: &self.inflight,
            key: key.clone(),
        };
        let lock = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let _held = lock.lock().await;
        // Someone else may have filled it while we waited
        if let Some(value) = self.lookup(&key) {
            return Ok(value);
        }
        let result = compute().await;
        if let Ok(value) = &result {
            self.set(key, value.clone(), ttl_seconds);
        }
        result
    }

    pub fn invalidate(&self, tag: &CacheTag) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !tag.matches(key));
        before.saturating_sub(self.entries.len())
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// All lookup caches behind one handle, with per-operation TTLs.
pub struct ResultCache {
    profiles: TtlCache<Option<ProtocolProfile>>,
    events: TtlCache<Arc<Vec<ProtocolEvent>>>,
    resolutions: TtlCache<ResolvedIdentity>,
    trust_edges: TtlCache<TrustEdgeSet>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl ResultCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let max = config.max_entries;
        Self {
            profiles: TtlCache::new(clock.clone(), max),
            events: TtlCache::new(clock.clone(), max),
            resolutions: TtlCache::new(clock.clone(), max),
            trust_edges: TtlCache::new(clock.clone(), max),
            config,
            clock,
        }
    }

    /// Default TTLs on the system clock.
    pub fn in_memory() -> Self {
        Self::new(CacheConfig::default(), Arc::new(SystemClock))
    }

    pub fn profiles(&self) -> &TtlCache<Option<ProtocolProfile>> {
        &self.profiles
    }

    pub fn events(&self) -> &TtlCache<Arc<Vec<ProtocolEvent>>> {
        &self.events
    }

    pub fn resolutions(&self) -> &TtlCache<ResolvedIdentity> {
        &self.resolutions
    }

    pub fn trust_edges(&self) -> &TtlCache<TrustEdgeSet> {
        &self.trust_edges
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ttl(&self, op: CacheOp) -> u64 {
        match op {
            CacheOp::Profile => self.config.profile_ttl_secs,
            CacheOp::Events => self.config.events_ttl_secs,
            CacheOp::Resolution => self.config.resolution_ttl_secs,
            CacheOp::TrustEdges => self.config.trust_ttl_secs,
        }
    }

    pub fn invalidate(&self, tag: &CacheTag) -> usize {
        let removed = self.profiles.invalidate(tag)
            + self.events.invalidate(tag)
            + self.resolutions.invalidate(tag)
            + self.trust_edges.invalidate(tag);
        debug!(tag = ?tag, removed = removed, "cache invalidated");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        [
            self.profiles.stats(),
            self.events.stats(),
            self.resolutions.stats(),
            self.trust_edges.stats(),
        ]
        .into_iter()
        .fold(CacheStats::default(), |acc, s| CacheStats {
            entries: acc.entries + s.entries,
            hits: acc.hits + s.hits,
            misses: acc.misses + s.misses,
        })
    }
}
