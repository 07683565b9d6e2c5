//! Store doubles for tests

use keystore::{Error, IndexMatch, IndexQuery, MemoryStore, Record, Result, Store};
use std::collections::BTreeSet;
use std::io;
use std::sync::Mutex;

/// A [`MemoryStore`] that refuses writes to chosen keys
#[derive(Debug, Default)]
pub struct RefusingStore {
    inner: MemoryStore,
    refused: Mutex<BTreeSet<(String, String)>>,
}

impl RefusingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `put` of `bucket/key` fail
    pub fn refuse(&self, bucket: &str, key: &str) {
        self.refused
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()));
    }

    fn is_refused(&self, bucket: &str, key: &str) -> bool {
        self.refused
            .lock()
            .unwrap()
            .contains(&(bucket.to_string(), key.to_string()))
    }
}

impl Store for RefusingStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<Record>> {
        self.inner.get(bucket, key)
    }

    fn put(&self, bucket: &str, key: &str, record: &Record) -> Result<()> {
        if self.is_refused(bucket, key) {
            return Err(Error::Io(io::Error::other(format!("write refused for {bucket}/{key}"))));
        }
        self.inner.put(bucket, key, record)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.inner.delete(bucket, key)
    }

    fn get_index(&self, query: &IndexQuery) -> Result<Vec<IndexMatch>> {
        self.inner.get_index(query)
    }
}
