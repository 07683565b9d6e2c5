//! # Keystore
//!
//! Key/value storage with ordered secondary indexes.
//!
//! This crate defines the contract a graph engine needs from its storage
//! substrate and ships two backends:
//!
//! - [`MemoryStore`]: in-process `BTreeMap` store, able to simulate divergent
//!   replicas (siblings) for testing conflict resolution
//! - [`SqliteStore`]: durable store on SQLite with an indexed term table
//!
//! Records are opaque JSON bodies plus a set of `(index name, term)` entries.
//! Index queries are ordered range scans over terms, which is all a caller
//! needs to encode joins as composite, delimiter-separated terms.
//!
//! ## Example
//!
//! ```
//! use keystore::{IndexQuery, MemoryStore, Record, Store};
//! use serde_json::json;
//!
//! let store = MemoryStore::new();
//! let record = Record::new(json!({"name": "node1"})).with_index("tags", "role=db");
//! store.put("resources", "node1", &record)?;
//!
//! let matches = store.get_index(&IndexQuery::prefix("resources", "tags", "role="))?;
//! assert_eq!(matches[0].key, "node1");
//! # Ok::<(), keystore::Error>(())
//! ```
//!
//! ## Siblings
//!
//! [`Store::get`] returns every sibling stored under a key. Backends on
//! eventually-consistent replicas may return more than one; wrap them in a
//! [`ResolvingStore`] with a [`ConflictResolver`] per bucket to merge them.

mod error;
mod memory;
mod resolver;
mod sqlite;
mod types;

pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use resolver::{ConflictResolver, ResolvingStore};
pub use sqlite::SqliteStore;
pub use types::{IndexEntry, IndexMatch, IndexQuery, KEY_INDEX, PREFIX_END, Record};

/// Storage contract consumed by the model layer
///
/// Implementations must be safe to call from several threads; the model
/// layer fans batched reads out over a thread pool.
pub trait Store: Send + Sync {
    /// Fetch every sibling stored under `key`
    ///
    /// Fails with [`Error::NotFound`] when the key does not exist.
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<Record>>;

    /// Store `record` under `key`, replacing all siblings
    fn put(&self, bucket: &str, key: &str, record: &Record) -> Result<()>;

    /// Remove `key`; removing an absent key is not an error
    fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Range-scan a secondary index, ordered by (term, key)
    ///
    /// The reserved index [`KEY_INDEX`] matches record keys directly.
    fn get_index(&self, query: &IndexQuery) -> Result<Vec<IndexMatch>>;

    /// All keys in a bucket, in ascending order
    fn keys(&self, bucket: &str) -> Result<Vec<String>> {
        let query = IndexQuery::from(bucket, KEY_INDEX, "");
        Ok(self
            .get_index(&query)?
            .into_iter()
            .map(|m| m.key)
            .collect())
    }
}

impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<Record>> {
        (**self).get(bucket, key)
    }

    fn put(&self, bucket: &str, key: &str, record: &Record) -> Result<()> {
        (**self).put(bucket, key, record)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        (**self).delete(bucket, key)
    }

    fn get_index(&self, query: &IndexQuery) -> Result<Vec<IndexMatch>> {
        (**self).get_index(query)
    }

    fn keys(&self, bucket: &str) -> Result<Vec<String>> {
        (**self).keys(bucket)
    }
}

/// Sort, deduplicate and truncate raw `(term, key)` matches for a query
pub(crate) fn finish_matches(
    query: &IndexQuery,
    mut matches: Vec<(String, String)>,
) -> Vec<IndexMatch> {
    matches.sort();
    matches.dedup();
    let limit = query.max_results.unwrap_or(usize::MAX);
    matches
        .into_iter()
        .take(limit)
        .map(|(term, key)| IndexMatch {
            term: query.return_terms.then_some(term),
            key,
        })
        .collect()
}
