//! Memoization wrapper
//!
//! [`Memoized`] caches the result of an async operation under a key derived
//! from its arguments. Cache faults never reach the caller: a failed lookup
//! runs the operation directly, and a failed write still returns the freshly
//! computed value. Errors from the operation itself are returned unchanged.
//!
//! ```ignore
//! let memo = Memoizer::new(cache.clone());
//! let list_jobs = memo.memoize::<JobFilter>("list_jobs", CacheStrategy::Query);
//! let jobs = list_jobs.call(&filter, || db.list_jobs(&filter)).await?;
//! ```

use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    CacheError, CacheStore, CacheStrategy,
    batch::BatchQueue,
    invalidation::{InvalidationEngine, InvalidationTarget, TagRegistry, operation_prefix},
    pattern,
};

/// Decides the cache key and cache eligibility for one call.
pub trait KeyPolicy<A: ?Sized>: Send + Sync {
    fn derive_key(&self, args: &A) -> Result<String, CacheError>;

    fn should_cache(&self, _args: &A) -> bool {
        true
    }
}

/// First 16 hex chars of SHA-256 over the canonical JSON of `args`.
///
/// Going through `serde_json::Value` sorts object keys, so field order in the
/// argument type does not change the digest.
pub fn args_digest<A: Serialize + ?Sized>(args: &A) -> Result<String, CacheError> {
    let canonical = serde_json::to_value(args)?;
    let hash = Sha256::digest(serde_json::to_vec(&canonical)?);
    Ok(hex::encode(&hash[..8]))
}

/// `{strategy}:{label}:{digest}`
#[derive(Debug, Clone)]
pub struct DefaultKeyPolicy {
    prefix: String,
}

impl DefaultKeyPolicy {
    pub fn new(strategy: CacheStrategy, label: &str) -> Self {
        Self {
            prefix: operation_prefix(strategy, label),
        }
    }
}

impl<A: Serialize + ?Sized> KeyPolicy<A> for DefaultKeyPolicy {
    fn derive_key(&self, args: &A) -> Result<String, CacheError> {
        Ok(format!("{}:{}", self.prefix, args_digest(args)?))
    }
}

type KeyFn<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;
type GuardFn<A> = Arc<dyn Fn(&A) -> bool + Send + Sync>;

/// Closure overrides layered on another policy.
///
/// A key function replaces key derivation entirely; its output is used as
/// the cache key verbatim. A guard is combined with the inner policy's guard.
pub struct FnPolicy<A: ?Sized> {
    inner: Arc<dyn KeyPolicy<A>>,
    key: Option<KeyFn<A>>,
    guard: Option<GuardFn<A>>,
}

impl<A: ?Sized> FnPolicy<A> {
    pub fn over(inner: Arc<dyn KeyPolicy<A>>) -> Self {
        Self {
            inner,
            key: None,
            guard: None,
        }
    }

    pub fn key_fn(mut self, f: impl Fn(&A) -> String + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(f));
        self
    }

    pub fn guard(mut self, f: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Arc::new(f));
        self
    }
}

impl<A: ?Sized> KeyPolicy<A> for FnPolicy<A> {
    fn derive_key(&self, args: &A) -> Result<String, CacheError> {
        match &self.key {
            Some(key) => Ok(key(args)),
            None => self.inner.derive_key(args),
        }
    }

    fn should_cache(&self, args: &A) -> bool {
        self.guard.as_ref().is_none_or(|guard| guard(args)) && self.inner.should_cache(args)
    }
}

/// How a memoized call was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from the cache; the operation did not run
    Hit,
    /// The operation ran and its result was offered to the cache
    Miss,
    /// The operation ran without the cache (guard declined or cache fault)
    Bypass,
}

/// Builds memoized operations and invalidating mutations over one store.
#[derive(Clone)]
pub struct Memoizer {
    store: Arc<dyn CacheStore>,
    engine: Arc<InvalidationEngine>,
}

impl Memoizer {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_registry(store, TagRegistry::default())
    }

    pub fn with_registry(store: Arc<dyn CacheStore>, tags: TagRegistry) -> Self {
        let engine = Arc::new(InvalidationEngine::with_registry(store.clone(), tags));
        Self { store, engine }
    }

    pub fn invalidation(&self) -> &Arc<InvalidationEngine> {
        &self.engine
    }

    /// An empty batch queue sharing this memoizer's store and tag registry.
    pub fn batch(&self) -> BatchQueue {
        BatchQueue::with_engine(self.store.clone(), self.engine.clone())
    }

    /// Memoize an operation identified by `label`, cached for `strategy`'s TTL.
    pub fn memoize<A>(&self, label: &str, strategy: CacheStrategy) -> Memoized<A>
    where
        A: Serialize + ?Sized,
    {
        Memoized {
            store: self.store.clone(),
            label: label.to_owned(),
            strategy,
            ttl: self.store.ttl_for(strategy),
            policy: Arc::new(DefaultKeyPolicy::new(strategy, label)),
        }
    }

    /// Run a mutation, then invalidate `targets` only if it succeeded.
    ///
    /// Invalidation failures are logged; the mutation's result is returned
    /// either way.
    pub async fn invalidate_after<T, E, F, Fut>(
        &self,
        targets: &[InvalidationTarget],
        op: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let value = op().await?;
        for target in targets {
            match self.engine.invalidate(target).await {
                Ok(deleted) => debug!(target = %target, deleted, "Invalidated after mutation"),
                Err(e) => warn!(target = %target, error = %e, "Invalidation after mutation failed"),
            }
        }
        Ok(value)
    }
}

/// A cached async operation taking arguments of type `A`.
pub struct Memoized<A: ?Sized> {
    store: Arc<dyn CacheStore>,
    label: String,
    strategy: CacheStrategy,
    ttl: Duration,
    policy: Arc<dyn KeyPolicy<A>>,
}

impl<A: ?Sized> Clone for Memoized<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            label: self.label.clone(),
            strategy: self.strategy,
            ttl: self.ttl,
            policy: self.policy.clone(),
        }
    }
}

impl<A: ?Sized + 'static> Memoized<A> {
    pub fn with_policy(mut self, policy: impl KeyPolicy<A> + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Use `f(args)` as the cache key instead of the derived one.
    pub fn with_key_fn(self, f: impl Fn(&A) -> String + Send + Sync + 'static) -> Self {
        let policy = FnPolicy::over(self.policy.clone()).key_fn(f);
        self.with_policy(policy)
    }

    /// Only cache calls for which `f(args)` is true.
    pub fn with_guard(self, f: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        let policy = FnPolicy::over(self.policy.clone()).guard(f);
        self.with_policy(policy)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

impl<A: ?Sized> Memoized<A> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn strategy(&self) -> CacheStrategy {
        self.strategy
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn key_for(&self, args: &A) -> Result<String, CacheError> {
        self.policy.derive_key(args)
    }

    pub async fn call<T, E, F, Fut>(&self, args: &A, op: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with_outcome(args, op)
            .await
            .map(|(value, _)| value)
    }

    pub async fn call_with_outcome<T, E, F, Fut>(
        &self,
        args: &A,
        op: F,
    ) -> Result<(T, CacheOutcome), E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.policy.should_cache(args) {
            debug!(label = %self.label, "Guard declined caching");
            return op().await.map(|value| (value, CacheOutcome::Bypass));
        }

        let key = match self.policy.derive_key(args) {
            Ok(key) => key,
            Err(e) => {
                warn!(label = %self.label, error = %e, "Key derivation failed, calling through");
                return op().await.map(|value| (value, CacheOutcome::Bypass));
            }
        };

        match self.store.get(&key).await {
            Ok(Some(payload)) => match serde_json::from_str::<T>(&payload) {
                Ok(value) => {
                    debug!(label = %self.label, key = %key, "Memo hit");
                    return Ok((value, CacheOutcome::Hit));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Cached payload did not decode, recomputing");
                }
            },
            Ok(None) => debug!(label = %self.label, key = %key, "Memo miss"),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed, calling through");
                return op().await.map(|value| (value, CacheOutcome::Bypass));
            }
        }

        let value = op().await?;
        match serde_json::to_string(&value) {
            Ok(payload) => {
                if let Err(e) = self.store.set(&key, &payload, self.ttl).await {
                    warn!(key = %key, error = %e, "Cache write failed");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Result did not serialize, not cached"),
        }
        Ok((value, CacheOutcome::Miss))
    }

    /// Drop the cached entry for one argument set.
    pub async fn forget(&self, args: &A) -> Result<u64, CacheError> {
        let key = self.policy.derive_key(args)?;
        self.store.delete(&key).await
    }

    /// Drop every default-keyed entry of this operation.
    pub async fn clear(&self) -> Result<u64, CacheError> {
        let prefix = operation_prefix(self.strategy, &pattern::escape(&self.label));
        self.store.pattern_delete(&format!("{}:*", prefix)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheConfig, CacheOrchestrator};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::RemoteUnavailable("down".into()))
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::RemoteUnavailable("down".into()))
        }

        async fn delete(&self, _key: &str) -> Result<u64, CacheError> {
            Err(CacheError::RemoteUnavailable("down".into()))
        }

        async fn exists(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::RemoteUnavailable("down".into()))
        }

        async fn pattern_delete(&self, _pattern: &str) -> Result<u64, CacheError> {
            Err(CacheError::RemoteUnavailable("down".into()))
        }

        fn ttl_for(&self, _strategy: CacheStrategy) -> Duration {
            Duration::from_secs(60)
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct JobFilter {
        status: String,
        page: u32,
    }

    fn memoizer() -> (Arc<CacheOrchestrator>, Memoizer) {
        let cache = CacheOrchestrator::fallback_only(CacheConfig::default()).unwrap();
        let memo = Memoizer::new(cache.clone());
        (cache, memo)
    }

    #[test]
    fn test_digest_ignores_field_order() {
        let a = serde_json::json!({"status": "open", "page": 1});
        let b = serde_json::json!({"page": 1, "status": "open"});
        assert_eq!(args_digest(&a).unwrap(), args_digest(&b).unwrap());
        assert_eq!(args_digest(&a).unwrap().len(), 16);
        assert_ne!(
            args_digest(&a).unwrap(),
            args_digest(&serde_json::json!({"status": "open", "page": 2})).unwrap()
        );
    }

    #[test]
    fn test_default_key_layout() {
        let policy = DefaultKeyPolicy::new(CacheStrategy::Query, "list_jobs");
        let key = KeyPolicy::<u32>::derive_key(&policy, &7).unwrap();
        assert!(key.starts_with("query:list_jobs:"));
        assert_eq!(key.len(), "query:list_jobs:".len() + 16);
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (cache, memo) = memoizer();
        let list_jobs = memo.memoize::<JobFilter>("list_jobs", CacheStrategy::Query);
        let filter = JobFilter {
            status: "open".into(),
            page: 1,
        };
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let run = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(vec!["job:1".to_owned(), "job:2".to_owned()])
        };

        let (first, outcome) = list_jobs.call_with_outcome(&filter, run).await.unwrap();
        assert_eq!(outcome, CacheOutcome::Miss);
        let (second, outcome) = list_jobs.call_with_outcome(&filter, run).await.unwrap();
        assert_eq!(outcome, CacheOutcome::Hit);
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let key = list_jobs.key_for(&filter).unwrap();
        let remaining = cache.ttl_remaining(&key).await.unwrap();
        assert!(remaining <= Duration::from_secs(1800));
        assert!(remaining > Duration::from_secs(1790));
    }

    #[tokio::test]
    async fn test_fail_open_on_cache_faults() {
        let memo = Memoizer::new(Arc::new(FailingStore));
        let answer = memo.memoize::<u32>("answer", CacheStrategy::Default);
        let (value, outcome) = answer
            .call_with_outcome(&1, || async { Ok::<_, std::io::Error>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(outcome, CacheOutcome::Bypass);
    }

    #[tokio::test]
    async fn test_operation_error_propagates_and_is_not_cached() {
        let (cache, memo) = memoizer();
        let flaky = memo.memoize::<u32>("flaky", CacheStrategy::Default);
        let result: Result<u32, String> =
            flaky.call(&1, || async { Err("db down".to_owned()) }).await;
        assert_eq!(result, Err("db down".to_owned()));
        assert!(cache.keys("default:flaky:*").await.is_empty());
    }

    #[tokio::test]
    async fn test_guard_bypasses_cache() {
        let (cache, memo) = memoizer();
        let profile = memo
            .memoize::<JobFilter>("profile", CacheStrategy::Session)
            .with_guard(|filter| filter.page == 1);
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let run = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(1u8)
        };
        let filter = JobFilter {
            status: "open".into(),
            page: 2,
        };
        let (_, outcome) = profile.call_with_outcome(&filter, run).await.unwrap();
        assert_eq!(outcome, CacheOutcome::Bypass);
        let (_, outcome) = profile.call_with_outcome(&filter, run).await.unwrap();
        assert_eq!(outcome, CacheOutcome::Bypass);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.keys("*").await.is_empty());
    }

    #[tokio::test]
    async fn test_key_fn_overrides_derivation() {
        let (cache, memo) = memoizer();
        let job = memo
            .memoize::<u32>("job_summary", CacheStrategy::Default)
            .with_key_fn(|id| format!("job:{}:summary", id));
        job.call(&42, || async { Ok::<_, std::io::Error>("Engineer".to_owned()) })
            .await
            .unwrap();
        assert_eq!(cache.get("job:42:summary").await.as_deref(), Some("\"Engineer\""));
        assert_eq!(job.forget(&42).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_recomputed() {
        let (cache, memo) = memoizer();
        let count = memo.memoize::<u32>("count", CacheStrategy::Default);
        let key = count.key_for(&1).unwrap();
        cache.set(&key, "not json", Duration::from_secs(60)).await;
        let (value, outcome) = count
            .call_with_outcome(&1, || async { Ok::<_, std::io::Error>(5u32) })
            .await
            .unwrap();
        assert_eq!((value, outcome), (5, CacheOutcome::Miss));
        assert_eq!(cache.get(&key).await.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_clear_drops_every_argument_set() {
        let (cache, memo) = memoizer();
        let square = memo.memoize::<u32>("square", CacheStrategy::Analysis);
        for n in 1..=3u32 {
            square
                .call(&n, || async move { Ok::<_, std::io::Error>(n * n) })
                .await
                .unwrap();
        }
        cache.set("analysis:other:1", "1", Duration::from_secs(60)).await;
        assert_eq!(square.clear().await.unwrap(), 3);
        assert!(cache.exists("analysis:other:1").await);
    }

    #[tokio::test]
    async fn test_invalidate_after_only_on_success() {
        let (cache, memo) = memoizer();
        cache.set("job:1:summary", "x", Duration::from_secs(60)).await;
        let targets = [InvalidationTarget::tag("job", "1")];

        let failed: Result<(), &str> = memo
            .invalidate_after(&targets, || async { Err("constraint violation") })
            .await;
        assert!(failed.is_err());
        assert!(cache.exists("job:1:summary").await);

        let updated: Result<u32, &str> = memo.invalidate_after(&targets, || async { Ok(1) }).await;
        assert_eq!(updated, Ok(1));
        assert!(!cache.exists("job:1:summary").await);
    }

    #[tokio::test]
    async fn test_invalidate_after_swallows_cache_faults() {
        let memo = Memoizer::new(Arc::new(FailingStore));
        let result: Result<u32, &str> = memo
            .invalidate_after(&[InvalidationTarget::key("k")], || async { Ok(7) })
            .await;
        assert_eq!(result, Ok(7));
    }
}
