//! talentsol-cache - Dual-tier caching for the TalentSol recruiting API
//!
//! - Remote tier: Redis, single node or cluster, shared across instances
//! - Fallback tier: in-process Moka store used while Redis is unusable
//!
//! On top of the [`CacheOrchestrator`] sit:
//! - [`Memoizer`] for fail-open memoization of async data producers
//! - [`InvalidationEngine`] for key, pattern, strategy and tag invalidation
//! - [`BatchQueue`] for ordered mutations with partial-failure accounting
//!
//! Build one orchestrator at startup from [`CacheConfig::from_env`] and hand
//! the `Arc` to everything that needs the cache.

mod batch;
mod config;
mod error;
mod fallback;
mod invalidation;
mod memoize;
mod orchestrator;
pub mod pattern;
mod remote;

pub use batch::{BatchOperation, BatchQueue, BatchResult};
pub use config::{CacheConfig, CacheStrategy, ClusterNode, MAX_TTL, RemoteConfig, TtlPolicy};
pub use error::CacheError;
pub use fallback::{FallbackStats, FallbackStore};
pub use invalidation::{
    ENTITY_KINDS, EntityKeys, ID_PLACEHOLDER, InvalidationEngine, InvalidationTarget, TagRegistry,
};
pub use memoize::{
    CacheOutcome, DefaultKeyPolicy, FnPolicy, KeyPolicy, Memoized, Memoizer, args_digest,
};
pub use orchestrator::{CacheOrchestrator, CacheStats, CacheStore, HealthReport};
pub use remote::{ConnectionState, RemoteClient, RemotePipeline};

// Re-export async_trait for CacheStore implementors
pub use async_trait::async_trait;
