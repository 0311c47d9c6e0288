//! Short-window deduplication of recently processed transaction hashes.
//!
//! Avoids redundant RPC round-trips when a client submits the same
//! `PaymentDetected` event twice in rapid succession. This cache is an
//! optimization only: the database uniqueness constraints on
//! `orders.tx_hash` and `ledger_entries(order_id, event_type, bucket)` are
//! the authoritative deduplication mechanism, so losing it on restart is
//! harmless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Cache statistics
#[derive(Default)]
pub struct DedupeStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DedupeStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Recently-seen transaction hashes, keyed case-insensitively, evicted by
/// time.
pub struct RecentTxCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Instant>>,
    stats: DedupeStats,
}

impl RecentTxCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            stats: DedupeStats::default(),
        }
    }

    /// Whether this hash was recorded within the TTL window. Expired
    /// entries are dropped on the way through.
    pub async fn seen_recently(&self, tx_hash: &str) -> bool {
        let key = tx_hash.to_lowercase();
        {
            let entries = self.entries.read().await;
            if let Some(seen_at) = entries.get(&key) {
                if seen_at.elapsed() < self.ttl {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
            } else {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        // Entry exists but expired; remove it under the write lock.
        let mut entries = self.entries.write().await;
        if let Some(seen_at) = entries.get(&key) {
            if seen_at.elapsed() < self.ttl {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            entries.remove(&key);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Record a processed hash at the current instant.
    pub async fn record(&self, tx_hash: &str) {
        let mut entries = self.entries.write().await;
        entries.insert(tx_hash.to_lowercase(), Instant::now());
    }

    /// Drop all expired entries.
    pub async fn purge_expired(&self) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, seen_at| seen_at.elapsed() < ttl);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub fn stats(&self) -> &DedupeStats {
        &self.stats
    }
}
