//! Cache orchestrator
//!
//! Routes every operation to the remote tier while it is `Connected` and to
//! the fallback tier otherwise, or when a remote call fails. Remote faults are
//! logged here and never surface to callers.
//!
//! The two tiers are not synchronized: a successful remote write does not
//! populate the fallback tier, so a failover starts with an empty fallback.
//!
//! Construct exactly one orchestrator at startup and share the returned
//! `Arc` with every consumer.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    CacheConfig, CacheError, CacheStrategy,
    fallback::{FallbackStats, FallbackStore},
    remote::{ConnectionState, RemoteClient, RemotePipeline},
};

/// The operations the memoization, invalidation and batch layers need.
///
/// [`CacheOrchestrator`] is the production implementation and never returns
/// remote errors; other implementations exist to inject faults in tests.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<u64, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    async fn pattern_delete(&self, pattern: &str) -> Result<u64, CacheError>;

    /// TTL for a named strategy
    fn ttl_for(&self, strategy: CacheStrategy) -> Duration;
}

#[derive(Default)]
struct Counters {
    remote_hits: AtomicU64,
    remote_misses: AtomicU64,
    remote_errors: AtomicU64,
    fallback_operations: AtomicU64,
}

/// Routing counters across both tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub remote_hits: u64,
    pub remote_misses: u64,
    pub remote_errors: u64,
    pub fallback_operations: u64,
    pub fallback_hits: u64,
    pub fallback_misses: u64,
    pub hit_rate: f64,
}

/// Aggregate status for external monitoring
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: ConnectionState,
    pub remote_connected: bool,
    pub fallback_entry_count: u64,
    pub fallback_stats: FallbackStats,
    pub stats: CacheStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_info: Option<String>,
}

/// Unified dual-tier cache
pub struct CacheOrchestrator {
    config: Arc<CacheConfig>,
    remote: Option<RemoteClient>,
    fallback: FallbackStore,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl CacheOrchestrator {
    /// Create the orchestrator with a lazily connected remote tier.
    ///
    /// Must be called inside a Tokio runtime, which hosts the fallback sweeper.
    pub fn new(config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        let remote = RemoteClient::new(config.remote.clone());
        Self::build(config, Some(remote))
    }

    /// Create the orchestrator and connect to the remote tier immediately.
    ///
    /// A failed connection is logged and leaves the orchestrator degraded; it
    /// is not an error.
    pub async fn connect(config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        let orchestrator = Self::new(config)?;
        if let Some(remote) = &orchestrator.remote {
            match remote.connect().await {
                Ok(()) => info!("Remote cache connected"),
                Err(e) => warn!(error = %e, "Remote cache unavailable at startup"),
            }
        }
        Ok(orchestrator)
    }

    /// Create an orchestrator without a remote tier.
    pub fn fallback_only(config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        Self::build(config, None)
    }

    fn build(config: CacheConfig, remote: Option<RemoteClient>) -> Result<Arc<Self>, CacheError> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(CacheError::Config(
                "cache orchestrator must be created inside a Tokio runtime".to_owned(),
            ));
        }

        let fallback = FallbackStore::new();
        let sweeper = fallback.spawn_sweeper(config.fallback_sweep_interval);
        debug!(
            cluster = config.remote.cluster_enabled,
            remote = remote.is_some(),
            "Cache orchestrator created"
        );

        Ok(Arc::new(Self {
            config: Arc::new(config),
            remote,
            fallback,
            sweeper: Mutex::new(Some(sweeper)),
            counters: Counters::default(),
        }))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn ttl_for(&self, strategy: CacheStrategy) -> Duration {
        self.config.ttl_for(strategy)
    }

    /// Current remote connection state. Without a remote tier this is
    /// `Degraded` until the orchestrator is closed.
    pub fn state(&self) -> ConnectionState {
        match &self.remote {
            Some(remote) => remote.state(),
            None if self.sweeper_running() => ConnectionState::Degraded,
            None => ConnectionState::Closed,
        }
    }

    fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// The remote client if it may be used for this call.
    ///
    /// The first call on an uninitialized client triggers the connection.
    async fn usable_remote(&self) -> Option<&RemoteClient> {
        let remote = self.remote.as_ref()?;
        match remote.state() {
            ConnectionState::Connected => Some(remote),
            ConnectionState::Uninitialized => remote.connect().await.ok().map(|()| remote),
            _ => None,
        }
    }

    fn remote_failed(&self, operation: &'static str, key: &str, error: &CacheError) {
        self.counters.remote_errors.fetch_add(1, Ordering::Relaxed);
        warn!(operation, key = %key, error = %error, "Remote cache error, using fallback tier");
    }

    fn used_fallback(&self) {
        self.counters
            .fallback_operations
            .fetch_add(1, Ordering::Relaxed);
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(remote) = self.usable_remote().await {
            match remote.get(key).await {
                Ok(value) => {
                    let counter = if value.is_some() {
                        &self.counters.remote_hits
                    } else {
                        &self.counters.remote_misses
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, hit = value.is_some(), "remote cache lookup");
                    return value;
                }
                Err(e) => self.remote_failed("get", key, &e),
            }
        }
        self.used_fallback();
        self.fallback.get(key)
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Some(remote) = self.usable_remote().await {
            match remote.set(key, value, ttl).await {
                Ok(()) => return,
                Err(e) => self.remote_failed("set", key, &e),
            }
        }
        self.used_fallback();
        self.fallback.set(key, value, ttl);
    }

    pub async fn delete(&self, key: &str) -> u64 {
        if let Some(remote) = self.usable_remote().await {
            match remote.delete(key).await {
                Ok(count) => return count,
                Err(e) => self.remote_failed("delete", key, &e),
            }
        }
        self.used_fallback();
        self.fallback.delete(key)
    }

    pub async fn exists(&self, key: &str) -> bool {
        if let Some(remote) = self.usable_remote().await {
            match remote.exists(key).await {
                Ok(found) => return found,
                Err(e) => self.remote_failed("exists", key, &e),
            }
        }
        self.used_fallback();
        self.fallback.exists(key)
    }

    pub async fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        if let Some(remote) = self.usable_remote().await {
            match remote.ttl_remaining(key).await {
                Ok(ttl) => return ttl,
                Err(e) => self.remote_failed("ttl", key, &e),
            }
        }
        self.used_fallback();
        self.fallback.ttl_remaining(key)
    }

    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        if let Some(remote) = self.usable_remote().await {
            match remote.keys(pattern).await {
                Ok(keys) => return keys,
                Err(e) => self.remote_failed("keys", pattern, &e),
            }
        }
        self.used_fallback();
        self.fallback.keys(pattern)
    }

    pub async fn pattern_delete(&self, pattern: &str) -> u64 {
        if let Some(remote) = self.usable_remote().await {
            match remote.pattern_delete(pattern).await {
                Ok(count) => {
                    debug!(pattern = %pattern, deleted = count, "remote pattern delete");
                    return count;
                }
                Err(e) => self.remote_failed("pattern_delete", pattern, &e),
            }
        }
        self.used_fallback();
        self.fallback.pattern_delete(pattern)
    }

    /// Fetch and decode a JSON value.
    ///
    /// A payload that does not decode into `T` is a caller bug and is returned
    /// as [`CacheError::Serialization`] rather than treated as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key).await {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Encode a value as JSON and store it.
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        self.set(key, &payload, ttl).await;
        Ok(())
    }

    /// Command batch on the remote tier; disabled when not connected.
    pub fn pipeline(&self) -> RemotePipeline {
        match &self.remote {
            Some(remote) => remote.pipeline(),
            None => RemotePipeline::disabled(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let fallback = self.fallback.stats();
        let remote_hits = self.counters.remote_hits.load(Ordering::Relaxed);
        let remote_misses = self.counters.remote_misses.load(Ordering::Relaxed);
        let hits = remote_hits + fallback.hits;
        let lookups = hits + remote_misses + fallback.misses;
        CacheStats {
            remote_hits,
            remote_misses,
            remote_errors: self.counters.remote_errors.load(Ordering::Relaxed),
            fallback_operations: self.counters.fallback_operations.load(Ordering::Relaxed),
            fallback_hits: fallback.hits,
            fallback_misses: fallback.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Read-only health snapshot. Does not trigger a connection attempt.
    pub async fn health(&self) -> HealthReport {
        let state = self.state();
        let remote_connected = state == ConnectionState::Connected;

        let remote_info = match (&self.remote, remote_connected) {
            (Some(remote), true) => match remote.info("memory").await {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!(error = %e, "Remote cache INFO unavailable");
                    None
                }
            },
            _ => None,
        };

        let fallback_stats = self.fallback.stats();
        HealthReport {
            state,
            remote_connected,
            fallback_entry_count: fallback_stats.entries,
            fallback_stats,
            stats: self.stats(),
            remote_info,
        }
    }

    /// Shut down: close the remote client and stop the sweeper. Idempotent.
    pub fn close(&self) {
        if let Some(remote) = &self.remote {
            remote.close();
        }
        let sweeper = match self.sweeper.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = sweeper {
            handle.abort();
            info!("Cache orchestrator closed");
        }
    }
}

impl Drop for CacheOrchestrator {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.sweeper.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl CacheStore for CacheOrchestrator {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(CacheOrchestrator::get(self, key).await)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        CacheOrchestrator::set(self, key, value, ttl).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64, CacheError> {
        Ok(CacheOrchestrator::delete(self, key).await)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(CacheOrchestrator::exists(self, key).await)
    }

    async fn pattern_delete(&self, pattern: &str) -> Result<u64, CacheError> {
        Ok(CacheOrchestrator::pattern_delete(self, pattern).await)
    }

    fn ttl_for(&self, strategy: CacheStrategy) -> Duration {
        self.config.ttl_for(strategy)
    }
}
