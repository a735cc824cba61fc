//! Process-local fallback tier
//!
//! An unbounded Moka cache whose per-entry expiry comes from the TTL given at
//! write time. Expired entries are reclaimed by a periodic sweep; reads also
//! check the deadline themselves, so correctness never depends on when the
//! sweep last ran.

use moka::{Expiry, notification::RemovalCause, sync::Cache};
use serde::Serialize;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{config::MAX_TTL, pattern};

#[derive(Clone, Debug)]
struct FallbackEntry {
    value: Arc<str>,
    /// `None` only when even the clamped deadline is past what `Instant` can hold
    expires_at: Option<Instant>,
}

impl FallbackEntry {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: Arc::from(value),
            expires_at: Instant::now().checked_add(ttl.min(MAX_TTL)),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.expires_at
            .map_or(MAX_TTL, |deadline| deadline.saturating_duration_since(now))
    }
}

struct EntryExpiry;

impl Expiry<String, FallbackEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &FallbackEntry,
        created_at: Instant,
    ) -> Option<Duration> {
        value
            .expires_at
            .map(|deadline| deadline.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &FallbackEntry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value
            .expires_at
            .map(|deadline| deadline.saturating_duration_since(updated_at))
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    swept: AtomicU64,
}

/// Snapshot of fallback tier activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FallbackStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub deletes: u64,
    pub swept: u64,
    pub hit_rate: f64,
}

/// In-memory TTL store used whenever the remote tier is unusable.
///
/// Every operation is synchronous and infallible; a missing or expired key is
/// simply a miss.
#[derive(Clone)]
pub struct FallbackStore {
    entries: Cache<String, FallbackEntry>,
    counters: Arc<Counters>,
}

impl Default for FallbackStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackStore {
    pub fn new() -> Self {
        let counters = Arc::new(Counters::default());
        let reclaimed = counters.clone();
        let entries = Cache::builder()
            .expire_after(EntryExpiry)
            .eviction_listener(move |_key, _entry, cause| {
                if matches!(cause, RemovalCause::Expired) {
                    reclaimed.swept.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();
        Self { entries, counters }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let value = self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.to_string());

        if value.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "fallback hit");
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "fallback miss");
        }
        value
    }

    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        self.entries
            .insert(key.to_owned(), FallbackEntry::new(value, ttl));
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a key, returning how many live entries were removed (0 or 1).
    pub fn delete(&self, key: &str) -> u64 {
        let removed = match self.entries.remove(key) {
            Some(entry) if !entry.is_expired() => 1,
            _ => 0,
        };
        self.counters.deletes.fetch_add(removed, Ordering::Relaxed);
        removed
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    /// Remaining lifetime, or `None` when the key is missing or expired.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.remaining(Instant::now()))
    }

    /// Live keys matching a glob pattern.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired() && pattern::matches(pattern, key))
            .map(|(key, _)| String::clone(&key))
            .collect()
    }

    /// Delete every live key matching a glob pattern.
    pub fn pattern_delete(&self, pattern: &str) -> u64 {
        self.keys(pattern).iter().map(|key| self.delete(key)).sum()
    }

    /// Number of live entries.
    pub fn len(&self) -> u64 {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired())
            .count() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reclaim memory held by expired entries. Returns how many were dropped.
    ///
    /// Expired entries are counted by the eviction listener, which also sees
    /// reclaims Moka performs during its own housekeeping.
    pub fn sweep(&self) -> u64 {
        let before = self.counters.swept.load(Ordering::Relaxed);
        self.entries.run_pending_tasks();
        let swept = self
            .counters
            .swept
            .load(Ordering::Relaxed)
            .saturating_sub(before);
        if swept > 0 {
            debug!(swept, "fallback sweep reclaimed expired entries");
        }
        swept
    }

    /// Run [`sweep`](Self::sweep) every `interval` on the current Tokio runtime.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }

    pub fn stats(&self) -> FallbackStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        FallbackStats {
            entries: self.len(),
            hits,
            misses,
            writes: self.counters.writes.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            swept: self.counters.swept.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}
