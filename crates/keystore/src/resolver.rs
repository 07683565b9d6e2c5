//! Sibling resolution at the storage boundary
//!
//! Eventually-consistent backends can return several divergent records for
//! one key. Rather than teaching every model how to merge, a resolver is
//! registered per bucket and invoked here, before the model layer sees the
//! record.

use crate::error::{Error, Result};
use crate::types::{IndexMatch, IndexQuery, Record};
use crate::Store;
use std::collections::HashMap;
use std::sync::Arc;

/// Strategy that merges divergent siblings into a single record
pub trait ConflictResolver: Send + Sync {
    /// Merge `siblings` (always two or more) deterministically
    fn resolve(&self, bucket: &str, key: &str, siblings: Vec<Record>) -> Result<Record>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&str, &str, Vec<Record>) -> Result<Record> + Send + Sync,
{
    fn resolve(&self, bucket: &str, key: &str, siblings: Vec<Record>) -> Result<Record> {
        self(bucket, key, siblings)
    }
}

/// A store wrapper that resolves siblings on read
///
/// Reads of a key with several siblings are merged by the bucket's resolver
/// and the merged record is written back. Buckets without a resolver fail
/// with [`Error::SiblingConflict`].
pub struct ResolvingStore<S> {
    inner: S,
    resolvers: HashMap<String, Arc<dyn ConflictResolver>>,
}

impl<S: Store> ResolvingStore<S> {
    /// Wrap a store with no resolvers registered
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            resolvers: HashMap::new(),
        }
    }

    /// Register the resolver for a bucket
    pub fn with_resolver(
        mut self,
        bucket: impl Into<String>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        self.resolvers.insert(bucket.into(), resolver);
        self
    }

    /// Access the wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Store> Store for ResolvingStore<S> {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<Record>> {
        let siblings = self.inner.get(bucket, key)?;
        if siblings.len() <= 1 {
            return Ok(siblings);
        }

        let Some(resolver) = self.resolvers.get(bucket) else {
            return Err(Error::SiblingConflict {
                bucket: bucket.to_string(),
                key: key.to_string(),
                count: siblings.len(),
            });
        };

        log::debug!(
            "Resolving {} siblings for {}/{}",
            siblings.len(),
            bucket,
            key
        );
        let merged = resolver.resolve(bucket, key, siblings)?;
        self.inner.put(bucket, key, &merged)?;
        Ok(vec![merged])
    }

    fn put(&self, bucket: &str, key: &str, record: &Record) -> Result<()> {
        self.inner.put(bucket, key, record)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.inner.delete(bucket, key)
    }

    fn get_index(&self, query: &IndexQuery) -> Result<Vec<IndexMatch>> {
        self.inner.get_index(query)
    }

    fn keys(&self, bucket: &str) -> Result<Vec<String>> {
        self.inner.keys(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use serde_json::json;

    fn diverged() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .put("counters", "hits", &Record::new(json!({ "n": 3 })))
            .unwrap();
        store
            .inject_sibling("counters", "hits", Record::new(json!({ "n": 5 })))
            .unwrap();
        store
    }

    #[test]
    fn test_unresolved_siblings_fail() {
        let store = ResolvingStore::new(diverged());
        let err = store.get("counters", "hits").unwrap_err();
        assert!(matches!(err, Error::SiblingConflict { count: 2, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_resolver_merges_and_writes_back() {
        let max_wins = |_: &str, _: &str, siblings: Vec<Record>| -> Result<Record> {
            let n = siblings
                .iter()
                .filter_map(|r| r.data["n"].as_i64())
                .max()
                .unwrap_or_default();
            Ok(Record::new(json!({ "n": n })))
        };
        let store = ResolvingStore::new(diverged()).with_resolver("counters", Arc::new(max_wins));

        let records = store.get("counters", "hits").unwrap();
        assert_eq!(records, vec![Record::new(json!({ "n": 5 }))]);
        assert_eq!(store.inner().get("counters", "hits").unwrap().len(), 1);
    }
}
