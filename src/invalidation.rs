//! Invalidation engine
//!
//! Three ways to drop cached data:
//! - a whole [`CacheStrategy`] (`{strategy}:*`)
//! - an explicit key or glob pattern
//! - a tag: an entity kind plus id, resolved through a [`TagRegistry`] into
//!   one or more patterns deleted in sequence
//!
//! Tags work by key convention rather than an index, so writers should build
//! entity keys with [`EntityKeys`], which is the same formatter the default
//! registry patterns are derived from.

use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, warn};

use crate::{CacheError, CacheStore, CacheStrategy, pattern};

/// Placeholder replaced by the (escaped) entity id in tag patterns.
pub const ID_PLACEHOLDER: &str = "{id}";

/// Entity kinds known to the recruiting pipeline.
pub const ENTITY_KINDS: [&str; 6] = [
    "job",
    "candidate",
    "application",
    "interview",
    "company",
    "user",
];

/// Key formatter shared by writers and tag invalidation.
pub struct EntityKeys;

impl EntityKeys {
    /// `{kind}:{id}:{view}`, e.g. `job:42:summary`
    pub fn key(kind: &str, id: &str, view: &str) -> String {
        format!("{}:{}:{}", kind, id, view)
    }

    /// Pattern matching every view of one entity
    pub fn pattern(kind: &str, id: &str) -> String {
        format!("{}:{}:*", kind, pattern::escape(id))
    }

    /// `{kind}s:{view}`, e.g. `jobs:open` for collection views
    pub fn collection_key(kind: &str, view: &str) -> String {
        format!("{}s:{}", kind, view)
    }
}

/// Maps entity kinds to the key patterns that hold views of one entity.
#[derive(Debug, Clone)]
pub struct TagRegistry {
    patterns: HashMap<String, Vec<String>>,
}

impl Default for TagRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for kind in ENTITY_KINDS {
            registry.register(
                kind,
                [
                    format!("{}:{}:*", kind, ID_PLACEHOLDER),
                    format!("{}s:*", kind),
                ],
            );
        }
        // Scores and recommendations are derived from applications and interviews
        let analysis = format!("{}:*", CacheStrategy::Analysis);
        registry.register("application", [analysis.clone()]);
        registry.register("interview", [analysis]);
        registry
    }
}

impl TagRegistry {
    pub fn empty() -> Self {
        Self {
            patterns: HashMap::new(),
        }
    }

    /// Add pattern templates for `kind`. Templates may contain `{id}`.
    pub fn register<I, S>(&mut self, kind: &str, templates: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.patterns.entry(kind.to_owned()).or_default();
        for template in templates {
            let template = template.into();
            if !entry.contains(&template) {
                entry.push(template);
            }
        }
        self
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.patterns.contains_key(kind)
    }

    /// Concrete patterns for one entity, or `None` for an unknown kind.
    pub fn resolve(&self, kind: &str, id: &str) -> Option<Vec<String>> {
        let escaped = pattern::escape(id);
        self.patterns.get(kind).map(|templates| {
            templates
                .iter()
                .map(|template| template.replace(ID_PLACEHOLDER, &escaped))
                .collect()
        })
    }
}

/// Something to invalidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
    /// One exact key
    Key(String),
    /// Every key matching a glob
    Pattern(String),
    /// Every entry of a TTL class
    Strategy(CacheStrategy),
    /// Every view of one entity
    Tag { kind: String, id: String },
    /// Every cached result of one memoized operation
    Operation {
        strategy: CacheStrategy,
        label: String,
    },
}

impl InvalidationTarget {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::Pattern(pattern.into())
    }

    pub fn tag(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Tag {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn operation(strategy: CacheStrategy, label: impl Into<String>) -> Self {
        Self::Operation {
            strategy,
            label: label.into(),
        }
    }
}

impl fmt::Display for InvalidationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "key {}", key),
            Self::Pattern(pattern) => write!(f, "pattern {}", pattern),
            Self::Strategy(strategy) => write!(f, "strategy {}", strategy),
            Self::Tag { kind, id } => write!(f, "tag {}:{}", kind, id),
            Self::Operation { strategy, label } => write!(f, "operation {}:{}", strategy, label),
        }
    }
}

/// Pattern prefix shared by every memoized result of one operation.
pub(crate) fn operation_prefix(strategy: CacheStrategy, label: &str) -> String {
    format!("{}:{}", strategy, label)
}

pub struct InvalidationEngine {
    store: Arc<dyn CacheStore>,
    tags: TagRegistry,
}

impl InvalidationEngine {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_registry(store, TagRegistry::default())
    }

    pub fn with_registry(store: Arc<dyn CacheStore>, tags: TagRegistry) -> Self {
        Self { store, tags }
    }

    pub fn registry(&self) -> &TagRegistry {
        &self.tags
    }

    pub async fn delete_key(&self, key: &str) -> Result<u64, CacheError> {
        self.store.delete(key).await
    }

    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let deleted = self.store.pattern_delete(pattern).await?;
        debug!(pattern = %pattern, deleted, "Invalidated pattern");
        Ok(deleted)
    }

    /// Drop every entry cached under one strategy.
    pub async fn clear_strategy(&self, strategy: CacheStrategy) -> Result<u64, CacheError> {
        self.delete_pattern(&format!("{}:*", strategy)).await
    }

    /// Drop every cached result of one memoized operation.
    pub async fn clear_operation(
        &self,
        strategy: CacheStrategy,
        label: &str,
    ) -> Result<u64, CacheError> {
        let prefix = operation_prefix(strategy, &pattern::escape(label));
        self.delete_pattern(&format!("{}:*", prefix)).await
    }

    /// Drop every view of one entity.
    ///
    /// Unknown kinds are a no-op so call sites can name entity kinds the
    /// registry has not learned about yet. Every pattern is attempted; if any
    /// failed, the first error is returned after the rest have run.
    pub async fn invalidate_tag(&self, kind: &str, id: &str) -> Result<u64, CacheError> {
        let Some(patterns) = self.tags.resolve(kind, id) else {
            debug!(kind = %kind, id = %id, "No invalidation patterns for entity kind");
            return Ok(0);
        };
        let mut deleted = 0;
        let mut first_error = None;
        for pattern in &patterns {
            match self.delete_pattern(pattern).await {
                Ok(count) => deleted += count,
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Tag pattern delete failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    pub async fn invalidate(&self, target: &InvalidationTarget) -> Result<u64, CacheError> {
        match target {
            InvalidationTarget::Key(key) => self.delete_key(key).await,
            InvalidationTarget::Pattern(pattern) => self.delete_pattern(pattern).await,
            InvalidationTarget::Strategy(strategy) => self.clear_strategy(*strategy).await,
            InvalidationTarget::Tag { kind, id } => self.invalidate_tag(kind, id).await,
            InvalidationTarget::Operation { strategy, label } => {
                self.clear_operation(*strategy, label).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheConfig, CacheOrchestrator};
    use std::time::Duration;

    const MINUTE: Duration = Duration::from_secs(60);

    async fn seeded() -> (Arc<CacheOrchestrator>, InvalidationEngine) {
        let cache = CacheOrchestrator::fallback_only(CacheConfig::default()).unwrap();
        for key in [
            "job:1:views",
            "job:1:summary",
            "job:12:views",
            "jobs:open",
            "candidate:7:profile",
            "candidates:recent",
            "analysis:score:abc",
            "query:list_jobs:0011",
        ] {
            cache.set(key, "v", MINUTE).await;
        }
        let engine = InvalidationEngine::new(cache.clone());
        (cache, engine)
    }

    #[test]
    fn test_entity_keys_match_registry_patterns() {
        let registry = TagRegistry::default();
        let patterns = registry.resolve("job", "42").unwrap();
        let key = EntityKeys::key("job", "42", "summary");
        assert!(patterns.iter().any(|p| pattern::matches(p, &key)));
        let collection = EntityKeys::collection_key("job", "open");
        assert!(patterns.iter().any(|p| pattern::matches(p, &collection)));
        assert!(pattern::matches(&EntityKeys::pattern("job", "42"), &key));
    }

    #[test]
    fn test_registry_escapes_ids_and_dedupes() {
        let mut registry = TagRegistry::empty();
        registry.register("job", ["job:{id}:*", "job:{id}:*"]);
        assert_eq!(registry.resolve("job", "1*").unwrap(), vec![r"job:1\*:*"]);
        assert!(registry.resolve("offer", "1").is_none());
        assert!(!registry.is_registered("offer"));
    }

    #[tokio::test]
    async fn test_tag_invalidation_leaves_other_entities() {
        let (cache, engine) = seeded().await;
        let deleted = engine.invalidate_tag("job", "1").await.unwrap();
        // job:1:views, job:1:summary, jobs:open
        assert_eq!(deleted, 3);
        assert_eq!(cache.get("job:1:views").await, None);
        assert_eq!(cache.get("job:1:summary").await, None);
        assert_eq!(cache.get("jobs:open").await, None);
        assert!(cache.exists("job:12:views").await);
        assert!(cache.exists("candidate:7:profile").await);
        assert!(cache.exists("candidates:recent").await);
    }

    #[tokio::test]
    async fn test_application_tag_clears_analysis() {
        let (cache, engine) = seeded().await;
        engine.invalidate_tag("application", "9").await.unwrap();
        assert_eq!(cache.get("analysis:score:abc").await, None);
        assert!(cache.exists("job:1:views").await);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_noop() {
        let (cache, engine) = seeded().await;
        assert_eq!(engine.invalidate_tag("offer", "1").await.unwrap(), 0);
        assert_eq!(cache.keys("*").await.len(), 8);
    }

    #[tokio::test]
    async fn test_strategy_and_operation_clear() {
        let (cache, engine) = seeded().await;
        assert_eq!(engine.clear_operation(CacheStrategy::Query, "list_jobs").await.unwrap(), 1);
        assert_eq!(engine.clear_operation(CacheStrategy::Query, "list_jobs").await.unwrap(), 0);
        let analysis = InvalidationTarget::Strategy(CacheStrategy::Analysis);
        assert_eq!(engine.invalidate(&analysis).await.unwrap(), 1);
        assert_eq!(cache.keys("*").await.len(), 6);
    }

    #[tokio::test]
    async fn test_invalidate_dispatches_every_target() {
        let (cache, engine) = seeded().await;
        assert_eq!(engine.invalidate(&InvalidationTarget::key("jobs:open")).await.unwrap(), 1);
        assert_eq!(engine.invalidate(&InvalidationTarget::pattern("candidate*")).await.unwrap(), 2);
        assert_eq!(engine.invalidate(&InvalidationTarget::tag("job", "12")).await.unwrap(), 1);
        assert_eq!(
            engine
                .invalidate(&InvalidationTarget::operation(CacheStrategy::Query, "list_jobs"))
                .await
                .unwrap(),
            1
        );
        let mut remaining = cache.keys("*").await;
        remaining.sort();
        assert_eq!(remaining, vec!["analysis:score:abc", "job:1:summary", "job:1:views"]);
    }

    /// Refuses pattern deletes for one pattern, delegates everything else.
    struct RefusingPattern {
        inner: Arc<CacheOrchestrator>,
        refused: &'static str,
    }

    #[async_trait::async_trait]
    impl CacheStore for RefusingPattern {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            CacheStore::get(self.inner.as_ref(), key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
            CacheStore::set(self.inner.as_ref(), key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<u64, CacheError> {
            CacheStore::delete(self.inner.as_ref(), key).await
        }

        async fn exists(&self, key: &str) -> Result<bool, CacheError> {
            CacheStore::exists(self.inner.as_ref(), key).await
        }

        async fn pattern_delete(&self, pattern: &str) -> Result<u64, CacheError> {
            if pattern == self.refused {
                return Err(CacheError::RemoteProtocol("ERR refused".to_owned()));
            }
            CacheStore::pattern_delete(self.inner.as_ref(), pattern).await
        }

        fn ttl_for(&self, strategy: CacheStrategy) -> Duration {
            CacheStore::ttl_for(self.inner.as_ref(), strategy)
        }
    }

    #[tokio::test]
    async fn test_tag_runs_every_pattern_despite_failure() {
        let (cache, _) = seeded().await;
        let engine = InvalidationEngine::new(Arc::new(RefusingPattern {
            inner: cache.clone(),
            refused: "job:1:*",
        }));

        let result = engine.invalidate_tag("job", "1").await;
        assert!(matches!(result, Err(CacheError::RemoteProtocol(_))));
        // The collection pattern after the refused one still ran
        assert!(!cache.exists("jobs:open").await);
        assert!(cache.exists("job:1:views").await);
    }

    #[test]
    fn test_target_display() {
        assert_eq!(InvalidationTarget::tag("job", "1").to_string(), "tag job:1");
        assert_eq!(
            InvalidationTarget::operation(CacheStrategy::Query, "list_jobs").to_string(),
            "operation query:list_jobs"
        );
    }
}
