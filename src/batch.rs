//! Batch operation queue
//!
//! Collects mutations and runs them in submission order. A failing operation
//! is counted and skipped; it never aborts the rest of the batch. The queue
//! is emptied by every `execute`, whatever the outcome.

use serde::Serialize;
use std::{mem, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    CacheError, CacheStore,
    invalidation::{InvalidationEngine, InvalidationTarget},
};

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    Set {
        key: String,
        value: String,
        ttl: Duration,
    },
    Delete {
        key: String,
    },
    Invalidate(InvalidationTarget),
}

impl BatchOperation {
    fn kind(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set",
            Self::Delete { .. } => "delete",
            Self::Invalidate(_) => "invalidate",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub success: usize,
    pub failed: usize,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.success + self.failed
    }
}

pub struct BatchQueue {
    store: Arc<dyn CacheStore>,
    engine: Arc<InvalidationEngine>,
    operations: Vec<BatchOperation>,
}

impl BatchQueue {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        let engine = Arc::new(InvalidationEngine::new(store.clone()));
        Self::with_engine(store, engine)
    }

    pub fn with_engine(store: Arc<dyn CacheStore>, engine: Arc<InvalidationEngine>) -> Self {
        Self {
            store,
            engine,
            operations: Vec::new(),
        }
    }

    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> &mut Self {
        self.push(BatchOperation::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        })
    }

    /// Queue a set of `value` encoded as JSON.
    pub fn set_json<T: Serialize + ?Sized>(
        &mut self,
        key: impl Into<String>,
        value: &T,
        ttl: Duration,
    ) -> Result<&mut Self, CacheError> {
        let payload = serde_json::to_string(value)?;
        Ok(self.set(key, payload, ttl))
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(BatchOperation::Delete { key: key.into() })
    }

    pub fn invalidate(&mut self, target: InvalidationTarget) -> &mut Self {
        self.push(BatchOperation::Invalidate(target))
    }

    pub fn push(&mut self, operation: BatchOperation) -> &mut Self {
        self.operations.push(operation);
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[BatchOperation] {
        &self.operations
    }

    /// Run every queued operation in order and empty the queue.
    pub async fn execute(&mut self) -> BatchResult {
        let operations = mem::take(&mut self.operations);
        let mut result = BatchResult::default();

        for (index, operation) in operations.iter().enumerate() {
            match self.apply(operation).await {
                Ok(()) => result.success += 1,
                Err(e) => {
                    warn!(index, op = operation.kind(), error = %e, "Batch operation failed");
                    result.failed += 1;
                }
            }
        }

        debug!(success = result.success, failed = result.failed, "Batch executed");
        result
    }

    async fn apply(&self, operation: &BatchOperation) -> Result<(), CacheError> {
        match operation {
            BatchOperation::Set { key, value, ttl } => self.store.set(key, value, *ttl).await,
            BatchOperation::Delete { key } => self.store.delete(key).await.map(|_| ()),
            BatchOperation::Invalidate(target) => self.engine.invalidate(target).await.map(|_| ()),
        }
    }
}
