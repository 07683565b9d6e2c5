//! In-process store backed by ordered maps

use crate::error::{Error, Result};
use crate::types::{IndexMatch, IndexQuery, KEY_INDEX, Record};
use crate::{Store, finish_matches};
use std::collections::BTreeMap;
use std::sync::RwLock;

type Bucket = BTreeMap<String, Vec<Record>>;

/// A thread-safe, non-durable store
///
/// Each key holds a list of siblings. Normal writes keep exactly one;
/// [`MemoryStore::inject_sibling`] appends extra ones to mimic a replica
/// divergence on an eventually-consistent backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: RwLock<BTreeMap<String, Bucket>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a divergent sibling under `key` without replacing the others
    pub fn inject_sibling(&self, bucket: &str, key: &str, record: Record) -> Result<()> {
        let mut buckets = self.buckets.write().map_err(|_| Error::Poisoned)?;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    /// Number of records in a bucket
    pub fn len(&self, bucket: &str) -> Result<usize> {
        let buckets = self.buckets.read().map_err(|_| Error::Poisoned)?;
        Ok(buckets.get(bucket).map_or(0, BTreeMap::len))
    }
}

impl Store for MemoryStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<Record>> {
        let buckets = self.buckets.read().map_err(|_| Error::Poisoned)?;
        buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .filter(|siblings| !siblings.is_empty())
            .cloned()
            .ok_or_else(|| Error::not_found(bucket, key))
    }

    fn put(&self, bucket: &str, key: &str, record: &Record) -> Result<()> {
        let mut buckets = self.buckets.write().map_err(|_| Error::Poisoned)?;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), vec![record.clone()]);
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut buckets = self.buckets.write().map_err(|_| Error::Poisoned)?;
        if let Some(b) = buckets.get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    fn get_index(&self, query: &IndexQuery) -> Result<Vec<IndexMatch>> {
        let buckets = self.buckets.read().map_err(|_| Error::Poisoned)?;
        let Some(bucket) = buckets.get(&query.bucket) else {
            return Ok(Vec::new());
        };

        let mut matches = Vec::new();
        for (key, siblings) in bucket {
            if query.index == KEY_INDEX {
                if query.matches(key) {
                    matches.push((key.clone(), key.clone()));
                }
                continue;
            }
            for record in siblings {
                for term in record.terms(&query.index) {
                    if query.matches(term) {
                        matches.push((term.to_string(), key.clone()));
                    }
                }
            }
        }

        Ok(finish_matches(query, matches))
    }
}
