//! Verdict cache with expiry and single-flight evaluation
//!
//! Reads are lock-free through DashMap. Computing a missing verdict holds a
//! per-token async lock, so two tasks never vet the same token at once.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{RiskVerdict, TokenCandidate};
use crate::types::Chain;

type VerdictKey = (String, Chain);

/// Cached verdict with TTL
#[derive(Clone)]
pub struct CachedVerdict {
    pub verdict: RiskVerdict,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedVerdict {
    pub fn new(verdict: RiskVerdict, ttl: Duration) -> Self {
        Self {
            verdict,
            cached_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

pub struct VerdictCache {
    entries: DashMap<VerdictKey, CachedVerdict>,
    in_flight: DashMap<VerdictKey, Arc<tokio::sync::Mutex<()>>>,
    ttl: Duration,
    stats: CacheStats,
}

impl VerdictCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            ttl,
            stats: CacheStats::default(),
        }
    }

    fn key(token: &TokenCandidate) -> VerdictKey {
        (token.address.clone(), token.chain.clone())
    }

    /// Fresh cached verdict, if any
    pub fn get(&self, token: &TokenCandidate) -> Option<RiskVerdict> {
        self.lookup(&Self::key(token))
    }

    fn lookup(&self, key: &VerdictKey) -> Option<RiskVerdict> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.verdict.clone())
    }

    pub fn insert(&self, token: &TokenCandidate, verdict: RiskVerdict) {
        self.entries
            .insert(Self::key(token), CachedVerdict::new(verdict, self.ttl));
    }

    /// Return the cached verdict or compute it, at most once per token at a time
    pub async fn get_or_compute<F, Fut>(&self, token: &TokenCandidate, compute: F) -> RiskVerdict
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RiskVerdict>,
    {
        let key = Self::key(token);
        if let Some(verdict) = self.lookup(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return verdict;
        }

        let gate = self.in_flight.entry(key.clone()).or_default().clone();
        let _guard = gate.lock().await;

        // another task may have finished while we waited
        if let Some(verdict) = self.lookup(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return verdict;
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let verdict = compute().await;
        if verdict.is_cacheable() {
            self.entries
                .insert(key.clone(), CachedVerdict::new(verdict.clone(), self.ttl));
        } else {
            debug!(token = %key.0, "Verdict not cached");
        }
        verdict
    }

    /// Drop expired verdicts and idle per-token locks
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired());
        self.in_flight.retain(|_, gate| Arc::strong_count(gate) > 1);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
