//! Indexed model layer
//!
//! A [`Session`] maps typed models to store records, keeps their secondary
//! index entries in step with their fields, and caches live records in a
//! bounded [`LfuCache`]. Every session has its own cache; nothing is shared
//! between sessions except the store.
//!
//! ## Dirty indexes
//!
//! Index entries changed through the session are only visible to store-side
//! range scans once the owning record is written. Until then the record is
//! dirty for that index, and a scan over it either flushes first
//! ([`DirtyPolicy::Flush`]) or fails with [`Error::DirtyState`]
//! ([`DirtyPolicy::Fail`]).

use crate::cache::LfuCache;
use crate::computable::{Evaluator, NoEvaluator};
use crate::error::{Error, Result};
use crate::lock::LockOptions;
use crate::types::InputRef;
use keystore::{IndexEntry, IndexMatch, IndexQuery, KEY_INDEX, MemoryStore, Record, Store};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Models
// ============================================================================

/// A typed object persisted in one bucket
pub trait Model: Serialize + DeserializeOwned {
    /// Bucket holding every object of this type
    const BUCKET: &'static str;

    /// Index names derived from fields; rebuilt on every save
    const FIELD_INDEXES: &'static [&'static str] = &[];

    /// Storage key of this object
    fn key(&self) -> String;

    /// Index entries derived from the current field values
    fn field_indexes(&self) -> Vec<IndexEntry> {
        Vec::new()
    }
}

/// Address of a stored object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub bucket: String,
    pub key: String,
}

impl ObjectKey {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn of<M: Model>(key: impl Into<String>) -> Self {
        Self::new(M::BUCKET, key)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

// ============================================================================
// Options
// ============================================================================

/// When saves reach the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveMode {
    /// Write through on every save
    #[default]
    Eager,
    /// Queue saves until [`Session::flush`]
    Lazy,
}

/// What an index scan does when a cached record has unsaved index changes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirtyPolicy {
    /// Write the dirty records, then scan
    #[default]
    Flush,
    /// Fail with [`Error::DirtyState`]
    Fail,
}

/// Tunables for one session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub cache_capacity: usize,
    pub save_mode: SaveMode,
    pub dirty_policy: DirtyPolicy,
    pub lock: LockOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 512,
            save_mode: SaveMode::Eager,
            dirty_policy: DirtyPolicy::Flush,
            lock: LockOptions::default(),
        }
    }
}

// ============================================================================
// Cache entries
// ============================================================================

#[derive(Debug)]
struct Entry {
    record: Record,
    /// Changed since the last write
    modified: bool,
    /// Queued for the next flush
    pending: bool,
    /// Index terms added or removed since the last write, by index name
    dirty: BTreeMap<String, BTreeSet<String>>,
    pin: Arc<()>,
}

impl Entry {
    fn new(record: Record) -> Self {
        Self {
            record,
            modified: false,
            pending: false,
            dirty: BTreeMap::new(),
            pin: Arc::new(()),
        }
    }

    fn deletable(&self) -> bool {
        !self.modified && !self.pending && self.dirty.is_empty() && Arc::strong_count(&self.pin) == 1
    }

    fn touch_index(&mut self, name: &str, term: &str) {
        self.modified = true;
        self.dirty
            .entry(name.to_string())
            .or_default()
            .insert(term.to_string());
    }

    /// Whether unsaved changes could alter the result of `query`
    fn dirty_for(&self, key: &str, query: &IndexQuery) -> bool {
        if query.index == KEY_INDEX {
            return (self.pending || self.modified) && query.matches(key);
        }
        self.dirty
            .get(&query.index)
            .is_some_and(|terms| terms.iter().any(|t| query.matches(t)))
    }
}

/// Live handle keeping a cached record from being evicted
#[derive(Debug, Clone)]
pub struct Pin {
    _handle: Arc<()>,
}

/// Outcome of a batched flush
#[derive(Debug, Default)]
pub struct FlushReport {
    pub saved: usize,
    pub failed: Vec<(ObjectKey, Error)>,
}

impl FlushReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Records captured for compensating rollback
#[derive(Debug, Clone)]
pub struct Checkpoint {
    records: Vec<(ObjectKey, Option<Record>)>,
}

#[derive(Debug, Clone)]
struct Resolved {
    value: Value,
    deps: BTreeSet<InputRef>,
}

// ============================================================================
// Session
// ============================================================================

/// Unit of work over a store
pub struct Session {
    store: Arc<dyn Store>,
    id: String,
    options: SessionOptions,
    cache: LfuCache<ObjectKey, Entry>,
    evaluator: Arc<dyn Evaluator>,
    resolved: HashMap<InputRef, Resolved>,
    last_marker: u64,
}

impl Session {
    pub fn new(store: Arc<dyn Store>, options: SessionOptions) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        log::debug!("Opened session {id}");
        Self {
            store,
            id,
            cache: LfuCache::new(options.cache_capacity),
            options,
            evaluator: Arc::new(NoEvaluator),
            resolved: HashMap::new(),
            last_marker: 0,
        }
    }

    /// Session over a fresh [`MemoryStore`] with default options
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), SessionOptions::default())
    }

    /// Use `evaluator` for computed inputs
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Unique identity of this session
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn evaluator(&self) -> Arc<dyn Evaluator> {
        Arc::clone(&self.evaluator)
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    fn entry(&mut self, key: &ObjectKey) -> Result<&mut Entry> {
        if !self.cache.contains(key) {
            let record = fetch(self.store.as_ref(), &key.bucket, &key.key)?;
            self.cache_record(key.clone(), record);
        }
        self.cache
            .get_mut(key)
            .ok_or_else(|| Error::not_found(&key.bucket, &key.key))
    }

    fn cache_record(&mut self, key: ObjectKey, record: Record) {
        log::trace!("Caching {key}");
        let evicted = self.cache.insert_with(key, Entry::new(record), Entry::deletable);
        for key in evicted {
            log::debug!("Evicted {key} from session cache");
        }
    }

    /// Raw record of an object
    pub fn record(&mut self, bucket: &str, key: &str) -> Result<Record> {
        Ok(self.entry(&ObjectKey::new(bucket, key))?.record.clone())
    }

    /// Load one object; fails with [`Error::NotFound`] when absent
    pub fn get<M: Model>(&mut self, key: &str) -> Result<M> {
        let entry = self.entry(&ObjectKey::of::<M>(key))?;
        Ok(serde_json::from_value(entry.record.data.clone())?)
    }

    /// Load one object, mapping absence to `None`
    pub fn try_get<M: Model>(&mut self, key: &str) -> Result<Option<M>> {
        match self.get(key) {
            Ok(model) => Ok(Some(model)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Load several objects, fetching cache misses in parallel
    pub fn multi_get<M: Model>(&mut self, keys: &[String]) -> Result<Vec<M>> {
        let misses: BTreeSet<&String> = keys
            .iter()
            .filter(|k| !self.cache.contains(&ObjectKey::of::<M>(k.as_str())))
            .collect();

        if misses.len() > 1 {
            log::debug!("Fetching {} {} records in parallel", misses.len(), M::BUCKET);
        }
        let store = self.store.as_ref();
        let fetched: Vec<(String, Result<Record>)> = misses
            .into_par_iter()
            .map(|k| (k.clone(), fetch(store, M::BUCKET, k)))
            .collect();
        for (key, record) in fetched {
            self.cache_record(ObjectKey::of::<M>(key), record?);
        }

        keys.iter().map(|k| self.get(k)).collect()
    }

    pub fn exists(&mut self, bucket: &str, key: &str) -> Result<bool> {
        match self.entry(&ObjectKey::new(bucket, key)) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------------
    // Saving
    // ------------------------------------------------------------------------

    /// Save a new object; fails with [`Error::AlreadyExists`] if the key is taken
    pub fn create<M: Model>(&mut self, model: &M) -> Result<()> {
        let key = model.key();
        if self.exists(M::BUCKET, &key)? {
            return Err(Error::AlreadyExists {
                bucket: M::BUCKET.to_string(),
                key,
            });
        }
        self.save(model)
    }

    /// Save per the session's [`SaveMode`]
    pub fn save<M: Model>(&mut self, model: &M) -> Result<()> {
        self.stage_model(model)?;
        self.write(M::BUCKET, &model.key())
    }

    /// Save at the next [`Session::flush`] regardless of the save mode
    pub fn save_lazy<M: Model>(&mut self, model: &M) -> Result<()> {
        let key = self.stage_model(model)?;
        if let Some(entry) = self.cache.get_mut(&key) {
            entry.pending = true;
        }
        Ok(())
    }

    /// Copy the model body and field indexes into its cache entry
    fn stage_model<M: Model>(&mut self, model: &M) -> Result<ObjectKey> {
        let key = ObjectKey::of::<M>(model.key());
        let data = serde_json::to_value(model)?;

        if !self.cache.contains(&key) {
            let record = match fetch(self.store.as_ref(), &key.bucket, &key.key) {
                Ok(record) => record,
                Err(e) if e.is_not_found() => Record::default(),
                Err(e) => return Err(e),
            };
            self.cache_record(key.clone(), record);
        }
        let entry = self
            .cache
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(&key.bucket, &key.key))?;

        let fresh: BTreeSet<IndexEntry> = model.field_indexes().into_iter().collect();
        let stale: Vec<IndexEntry> = entry
            .record
            .indexes
            .iter()
            .filter(|e| M::FIELD_INDEXES.contains(&e.name.as_str()))
            .cloned()
            .collect();
        for changed in stale
            .iter()
            .filter(|e| !fresh.contains(*e))
            .chain(fresh.iter().filter(|e| !stale.contains(*e)))
        {
            entry.touch_index(&changed.name, &changed.term);
        }
        entry
            .record
            .indexes
            .retain(|e| !M::FIELD_INDEXES.contains(&e.name.as_str()));
        entry.record.indexes.extend(fresh);
        entry.record.data = data;
        entry.modified = true;
        Ok(key)
    }

    /// Write a cached object per the session's [`SaveMode`]
    pub fn write(&mut self, bucket: &str, key: &str) -> Result<()> {
        match self.options.save_mode {
            SaveMode::Eager => self.persist(bucket, key),
            SaveMode::Lazy => {
                self.entry(&ObjectKey::new(bucket, key))?.pending = true;
                Ok(())
            }
        }
    }

    /// Write a cached object to the store now
    pub fn persist(&mut self, bucket: &str, key: &str) -> Result<()> {
        let store = Arc::clone(&self.store);
        let entry = self.entry(&ObjectKey::new(bucket, key))?;
        store.put(bucket, key, &entry.record)?;
        entry.modified = false;
        entry.pending = false;
        entry.dirty.clear();
        log::trace!("Wrote {bucket}/{key}");
        Ok(())
    }

    /// Delete an object from the store and the cache
    ///
    /// Deletes always write through, even in lazy mode.
    pub fn delete(&mut self, bucket: &str, key: &str) -> Result<()> {
        self.store.delete(bucket, key)?;
        self.cache.remove(&ObjectKey::new(bucket, key));
        log::debug!("Deleted {bucket}/{key}");
        Ok(())
    }

    /// Write every queued or modified object
    ///
    /// A failing object is reported and does not stop the others.
    pub fn flush(&mut self) -> FlushReport {
        let mut keys: Vec<ObjectKey> = self
            .cache
            .iter()
            .filter(|(_, e)| e.pending || e.modified)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();

        let mut report = FlushReport::default();
        for key in keys {
            match self.persist(&key.bucket, &key.key) {
                Ok(()) => report.saved += 1,
                Err(e) => {
                    log::warn!("Failed to save {key}: {e}");
                    report.failed.push((key, e));
                }
            }
        }
        if report.saved > 0 {
            log::debug!("Flushed {} objects", report.saved);
        }
        report
    }

    // ------------------------------------------------------------------------
    // Index scans
    // ------------------------------------------------------------------------

    /// Range-scan a store index after enforcing the dirty-state policy
    pub fn scan(&mut self, query: &IndexQuery) -> Result<Vec<IndexMatch>> {
        let mut dirty: Vec<ObjectKey> = self
            .cache
            .iter()
            .filter(|(k, e)| k.bucket == query.bucket && e.dirty_for(&k.key, query))
            .map(|(k, _)| k.clone())
            .collect();
        dirty.sort();

        if let Some(first) = dirty.first() {
            match self.options.dirty_policy {
                DirtyPolicy::Fail => {
                    return Err(Error::DirtyState {
                        bucket: first.bucket.clone(),
                        key: first.key.clone(),
                        index: query.index.clone(),
                    });
                }
                DirtyPolicy::Flush => {
                    for key in &dirty {
                        log::debug!("Flushing {key} before scanning {}", query.index);
                        self.persist(&key.bucket, &key.key)?;
                    }
                }
            }
        }

        log::trace!(
            "Scanning {}/{} from {:?} to {:?}",
            query.bucket,
            query.index,
            query.start,
            query.end
        );
        Ok(self.store.get_index(query)?)
    }

    /// Keys whose `index` terms fall in `[start, end]`
    pub fn filter(&mut self, bucket: &str, index: &str, start: &str, end: &str) -> Result<Vec<String>> {
        let matches = self.scan(&IndexQuery::range(bucket, index, start, end))?;
        Ok(dedup_keys(matches))
    }

    /// Keys with an `index` term starting with `prefix`
    pub fn filter_prefix(&mut self, bucket: &str, index: &str, prefix: &str) -> Result<Vec<String>> {
        let matches = self.scan(&IndexQuery::prefix(bucket, index, prefix))?;
        Ok(dedup_keys(matches))
    }

    /// Every key in a bucket
    pub fn keys(&mut self, bucket: &str) -> Result<Vec<String>> {
        let matches = self.scan(&IndexQuery::from(bucket, KEY_INDEX, ""))?;
        Ok(dedup_keys(matches))
    }

    // ------------------------------------------------------------------------
    // Per-object index entries
    // ------------------------------------------------------------------------

    /// Terms under `name` on one object, starting with `prefix`
    pub fn index_terms(&mut self, bucket: &str, key: &str, name: &str, prefix: &str) -> Result<Vec<String>> {
        let entry = self.entry(&ObjectKey::new(bucket, key))?;
        Ok(entry
            .record
            .terms_with_prefix(name, prefix)
            .map(str::to_string)
            .collect())
    }

    /// Attach an index entry; returns false if it was already present
    pub fn add_index(&mut self, bucket: &str, key: &str, name: &str, term: &str) -> Result<bool> {
        let entry = self.entry(&ObjectKey::new(bucket, key))?;
        let added = entry.record.indexes.insert(IndexEntry::new(name, term));
        if added {
            entry.touch_index(name, term);
        }
        Ok(added)
    }

    /// Detach an index entry; returns false if it was absent
    pub fn remove_index(&mut self, bucket: &str, key: &str, name: &str, term: &str) -> Result<bool> {
        let entry = self.entry(&ObjectKey::new(bucket, key))?;
        let removed = entry.record.indexes.remove(&IndexEntry::new(name, term));
        if removed {
            entry.touch_index(name, term);
        }
        Ok(removed)
    }

    /// Detach every entry under `name` starting with `prefix`; returns the removed terms
    pub fn remove_index_prefix(
        &mut self,
        bucket: &str,
        key: &str,
        name: &str,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let entry = self.entry(&ObjectKey::new(bucket, key))?;
        let removed: Vec<String> = entry
            .record
            .terms_with_prefix(name, prefix)
            .map(str::to_string)
            .collect();
        for term in &removed {
            entry.record.indexes.remove(&IndexEntry::new(name, term.as_str()));
            entry.touch_index(name, term);
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Cache control
    // ------------------------------------------------------------------------

    /// Keep a cached object from being evicted while the pin lives
    pub fn pin(&mut self, bucket: &str, key: &str) -> Result<Pin> {
        let entry = self.entry(&ObjectKey::new(bucket, key))?;
        Ok(Pin {
            _handle: Arc::clone(&entry.pin),
        })
    }

    /// Drop an object from the cache unless it holds unsaved changes
    pub fn evict(&mut self, bucket: &str, key: &str) -> bool {
        let key = ObjectKey::new(bucket, key);
        let unsaved = self
            .cache
            .peek(&key)
            .is_some_and(|e| e.modified || e.pending);
        if unsaved {
            return false;
        }
        self.cache.remove(&key).is_some()
    }

    /// Drop every cached object that holds no unsaved changes
    pub fn clear_cache(&mut self) {
        self.cache.retain(|_, e| e.modified || e.pending);
        self.resolved.clear();
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Capture the current records of `keys` (absent keys included)
    pub fn checkpoint(&mut self, keys: &[ObjectKey]) -> Result<Checkpoint> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let record = match self.entry(key) {
                Ok(entry) => Some(entry.record.clone()),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            records.push((key.clone(), record));
        }
        Ok(Checkpoint { records })
    }

    /// Write captured records back, deleting those that did not exist
    pub fn restore(&mut self, checkpoint: Checkpoint) -> Result<()> {
        for (key, record) in checkpoint.records {
            match record {
                Some(record) => {
                    // Reset in place so live pins keep guarding the entry
                    match self.cache.get_mut(&key) {
                        Some(entry) => {
                            entry.record = record;
                            entry.modified = true;
                            entry.dirty.clear();
                        }
                        None => self.cache_record(key.clone(), record),
                    }
                    self.persist(&key.bucket, &key.key)?;
                }
                None => self.delete(&key.bucket, &key.key)?,
            }
            log::debug!("Restored {key}");
        }
        self.resolved.clear();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Markers and resolved values
    // ------------------------------------------------------------------------

    /// Next `updated` marker: 20 digits, increasing, never behind the clock
    pub fn next_marker(&mut self) -> String {
        let now = u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0);
        self.last_marker = now.max(self.last_marker + 1);
        format_marker(self.last_marker)
    }

    pub(crate) fn remembered(&self, input: &InputRef) -> Option<(Value, BTreeSet<InputRef>)> {
        self.resolved
            .get(input)
            .map(|r| (r.value.clone(), r.deps.clone()))
    }

    pub(crate) fn remember(&mut self, input: InputRef, value: Value, deps: BTreeSet<InputRef>) {
        self.resolved.insert(input, Resolved { value, deps });
    }

    /// Forget every resolved value that read `input`
    pub fn invalidate(&mut self, input: &InputRef) {
        self.resolved
            .retain(|k, r| k != input && !r.deps.contains(input));
    }

    /// Forget every resolved value that read any input of `resource`
    pub fn invalidate_resource(&mut self, resource: &str) {
        self.resolved.retain(|k, r| {
            k.resource != resource && !r.deps.iter().any(|d| d.resource == resource)
        });
    }
}

/// Render a marker the way it is stored and indexed
pub fn format_marker(marker: u64) -> String {
    format!("{marker:020}")
}

fn fetch(store: &dyn Store, bucket: &str, key: &str) -> Result<Record> {
    let mut siblings = store.get(bucket, key)?;
    match siblings.len() {
        0 => Err(Error::not_found(bucket, key)),
        1 => Ok(siblings.remove(0)),
        count => Err(Error::SiblingConflict {
            bucket: bucket.to_string(),
            key: key.to_string(),
            count,
        }),
    }
}

fn dedup_keys(matches: Vec<IndexMatch>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    matches
        .into_iter()
        .filter(|m| seen.insert(m.key.clone()))
        .map(|m| m.key)
        .collect()
}
