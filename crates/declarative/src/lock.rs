//! Identity-based locks over the store
//!
//! Two record layouts are supported. [`LockStrategy::Single`] keeps the owner
//! in one field, which is enough on strongly consistent backends.
//! [`LockStrategy::Ledger`] appends acquire/release entries instead, so that
//! concurrent writes on an eventually-consistent backend can be merged by
//! [`LedgerResolver`] and still reduce to a single owner.

use crate::error::{Error, Result};
use crate::retry::{LogCallback, RetryPolicy, with_retry};
use crate::session::{Model, Session};
use keystore::{ConflictResolver, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Record layout of a lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    /// Single owner field
    #[default]
    Single,
    /// Append-only acquire/release ledger
    Ledger,
}

/// Longest single wait between lock attempts
pub const MAX_LOCK_WAIT: Duration = Duration::from_secs(10);

/// Acquisition tunables
#[derive(Debug, Clone, PartialEq)]
pub struct LockOptions {
    /// Retries after the first attempt
    pub retries: u32,
    /// Wait before the first retry
    pub wait: Duration,
    /// Multiplier applied to the wait after each retry
    pub backoff: f64,
    pub strategy: LockStrategy,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retries: 5,
            wait: Duration::from_millis(200),
            backoff: 1.0,
            strategy: LockStrategy::Single,
        }
    }
}

impl LockOptions {
    /// Fail at once when the lock is taken
    pub fn no_retry(strategy: LockStrategy) -> Self {
        Self {
            retries: 0,
            wait: Duration::ZERO,
            backoff: 1.0,
            strategy,
        }
    }

    /// Retry schedule for acquisition; waits never exceed [`MAX_LOCK_WAIT`]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retries, self.wait).with_backoff(self.backoff, MAX_LOCK_WAIT)
    }
}

/// One ledger entry: `delta` is +1 for acquire and -1 for release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub identity: String,
    pub delta: i8,
    pub stamp: String,
}

impl LedgerEntry {
    fn sort_key(&self) -> (&str, &str, i8) {
        (&self.stamp, &self.identity, self.delta)
    }
}

/// Stored state of one lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: String,
    #[serde(default)]
    pub strategy: LockStrategy,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub ledger: Vec<LedgerEntry>,
}

impl Model for LockRecord {
    const BUCKET: &'static str = "locks";

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl LockRecord {
    fn new(id: &str, strategy: LockStrategy) -> Self {
        Self {
            id: id.to_string(),
            strategy,
            identity: None,
            ledger: Vec::new(),
        }
    }

    /// Current owner
    pub fn owner(&self) -> Option<String> {
        match self.strategy {
            LockStrategy::Single => self.identity.clone(),
            LockStrategy::Ledger => reduce(&self.ledger).first().map(|e| e.identity.clone()),
        }
    }
}

/// Acquires left after cancelling acquire/release pairs, oldest first
pub fn reduce(ledger: &[LedgerEntry]) -> Vec<LedgerEntry> {
    let released: BTreeSet<(&str, &str)> = ledger
        .iter()
        .filter(|e| e.delta < 0)
        .map(|e| (e.identity.as_str(), e.stamp.as_str()))
        .collect();
    let mut held: Vec<LedgerEntry> = ledger
        .iter()
        .filter(|e| e.delta > 0 && !released.contains(&(e.identity.as_str(), e.stamp.as_str())))
        .cloned()
        .collect();
    held.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    held.dedup();
    held
}

/// Entry points for lock acquisition and release
pub struct Lock;

impl Lock {
    /// Acquire `id` for `identity`, retrying per `options`
    ///
    /// Re-acquiring a lock already held by `identity` succeeds. The session
    /// cache entry for the lock is dropped before every attempt.
    pub fn acquire(
        session: &mut Session,
        id: &str,
        identity: &str,
        options: &LockOptions,
    ) -> Result<LockGuard> {
        let policy = options.retry_policy();
        with_retry(&policy, Some(&LogCallback), || {
            session.evict(LockRecord::BUCKET, id);
            try_acquire(session, id, identity, options.strategy)
        })?;
        log::debug!("Lock '{id}' acquired by {identity}");
        Ok(LockGuard {
            id: id.to_string(),
            identity: identity.to_string(),
            released: false,
        })
    }

    /// Release `id`; only the owner may release
    pub fn release(session: &mut Session, id: &str, identity: &str) -> Result<()> {
        session.evict(LockRecord::BUCKET, id);
        let not_owned = || Error::LockNotOwned {
            lock: id.to_string(),
            identity: identity.to_string(),
        };
        let mut record = session
            .try_get::<LockRecord>(id)?
            .ok_or_else(not_owned)?;
        if record.owner().as_deref() != Some(identity) {
            return Err(not_owned());
        }

        match record.strategy {
            LockStrategy::Single => record.identity = None,
            LockStrategy::Ledger => {
                let releases: Vec<LedgerEntry> = reduce(&record.ledger)
                    .into_iter()
                    .filter(|e| e.identity == identity)
                    .map(|e| LedgerEntry { delta: -1, ..e })
                    .collect();
                record.ledger.extend(releases);
                record.identity = None;
            }
        }
        store_now(session, &record)?;
        log::debug!("Lock '{id}' released by {identity}");
        Ok(())
    }

    /// Current owner of `id`, if any
    pub fn owner(session: &mut Session, id: &str) -> Result<Option<String>> {
        session.evict(LockRecord::BUCKET, id);
        Ok(session
            .try_get::<LockRecord>(id)?
            .and_then(|record| record.owner()))
    }
}

fn try_acquire(session: &mut Session, id: &str, identity: &str, strategy: LockStrategy) -> Result<()> {
    let conflict = |owner: Option<String>| Error::LockConflict {
        lock: id.to_string(),
        owner,
    };

    let mut record = session
        .try_get::<LockRecord>(id)?
        .unwrap_or_else(|| LockRecord::new(id, strategy));
    match record.owner() {
        Some(owner) if owner == identity => return Ok(()),
        Some(owner) => return Err(conflict(Some(owner))),
        None => {}
    }

    let stamp = session.next_marker();
    match record.strategy {
        LockStrategy::Single => record.identity = Some(identity.to_string()),
        LockStrategy::Ledger => {
            record.ledger.push(LedgerEntry {
                identity: identity.to_string(),
                delta: 1,
                stamp: stamp.clone(),
            });
            record.identity = Some(identity.to_string());
        }
    }
    store_now(session, &record)?;

    // Read back: a concurrent writer may have won
    session.evict(LockRecord::BUCKET, id);
    let current = session.get::<LockRecord>(id)?;
    match current.owner() {
        Some(owner) if owner == identity => Ok(()),
        owner => {
            if current.strategy == LockStrategy::Ledger {
                let mut current = current;
                current.ledger.push(LedgerEntry {
                    identity: identity.to_string(),
                    delta: -1,
                    stamp,
                });
                store_now(session, &current)?;
            }
            Err(conflict(owner))
        }
    }
}

fn store_now(session: &mut Session, record: &LockRecord) -> Result<()> {
    session.save_lazy(record)?;
    session.persist(LockRecord::BUCKET, &record.id)
}

/// Proof of ownership; release it explicitly with [`LockGuard::release`]
#[derive(Debug)]
pub struct LockGuard {
    id: String,
    identity: String,
    released: bool,
}

impl LockGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn release(mut self, session: &mut Session) -> Result<()> {
        self.released = true;
        Lock::release(session, &self.id, &self.identity)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("Lock '{}' held by {} was never released", self.id, self.identity);
        }
    }
}

/// Run `f` while holding `id`; the lock is released whether or not `f` fails
pub fn with_lock<T, F>(
    session: &mut Session,
    id: &str,
    identity: &str,
    options: &LockOptions,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut Session) -> Result<T>,
{
    let guard = Lock::acquire(session, id, identity, options)?;
    let result = f(session);
    let released = guard.release(session);
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), _) | (Ok(_), Err(e)) => Err(e),
    }
}

/// Merges divergent lock records by taking the union of their ledgers
///
/// Entries are deduplicated and acquire/release pairs of the same identity
/// and stamp cancel out, so the merged record reduces to the same owner
/// whatever the order the siblings arrived in.
pub struct LedgerResolver;

impl ConflictResolver for LedgerResolver {
    fn resolve(&self, bucket: &str, key: &str, siblings: Vec<Record>) -> keystore::Result<Record> {
        let mut ledger: Vec<LedgerEntry> = Vec::new();
        let mut indexes = BTreeSet::new();
        for sibling in siblings {
            let record: LockRecord =
                serde_json::from_value(sibling.data).map_err(|e| keystore::Error::Resolution {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    message: e.to_string(),
                })?;
            ledger.extend(record.ledger);
            indexes.extend(sibling.indexes);
        }

        let mut merged = LockRecord::new(key, LockStrategy::Ledger);
        merged.ledger = reduce(&ledger);
        merged.identity = merged.owner();

        let data = serde_json::to_value(&merged)?;
        Ok(Record { data, indexes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOptions;
    use keystore::{MemoryStore, ResolvingStore, Store};
    use std::sync::Arc;

    fn two_sessions() -> (Session, Session) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        (
            Session::new(Arc::clone(&store), SessionOptions::default()),
            Session::new(store, SessionOptions::default()),
        )
    }

    fn mutual_exclusion(strategy: LockStrategy) {
        let (mut a, mut b) = two_sessions();
        let opts = LockOptions::no_retry(strategy);

        let guard = Lock::acquire(&mut a, "L", "A", &opts).unwrap();
        let err = Lock::acquire(&mut b, "L", "B", &opts).unwrap_err();
        assert!(matches!(err, Error::LockConflict { owner: Some(ref o), .. } if o == "A"));

        guard.release(&mut a).unwrap();
        let guard = Lock::acquire(&mut b, "L", "B", &opts).unwrap();
        assert_eq!(Lock::owner(&mut a, "L").unwrap().as_deref(), Some("B"));
        guard.release(&mut b).unwrap();
        assert_eq!(Lock::owner(&mut a, "L").unwrap(), None);
    }

    #[test]
    fn test_mutual_exclusion_single() {
        mutual_exclusion(LockStrategy::Single);
    }

    #[test]
    fn test_mutual_exclusion_ledger() {
        mutual_exclusion(LockStrategy::Ledger);
    }

    #[test]
    fn test_reacquire_by_owner() {
        let mut session = Session::in_memory();
        let opts = LockOptions::no_retry(LockStrategy::Single);
        let first = Lock::acquire(&mut session, "L", "A", &opts).unwrap();
        let second = Lock::acquire(&mut session, "L", "A", &opts).unwrap();
        second.release(&mut session).unwrap();
        drop(first);
    }

    #[test]
    fn test_release_by_non_owner() {
        let (mut a, mut b) = two_sessions();
        let opts = LockOptions::no_retry(LockStrategy::Ledger);
        let guard = Lock::acquire(&mut a, "L", "A", &opts).unwrap();

        let err = Lock::release(&mut b, "L", "B").unwrap_err();
        assert!(matches!(err, Error::LockNotOwned { .. }));
        assert!(!err.is_retryable());
        assert!(Lock::release(&mut b, "missing", "B").is_err());

        guard.release(&mut a).unwrap();
    }

    #[test]
    fn test_retry_waits_for_release() {
        let (mut a, mut b) = two_sessions();
        let guard = Lock::acquire(&mut a, "L", "A", &LockOptions::default()).unwrap();

        let holder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            guard.release(&mut a).unwrap();
        });

        let opts = LockOptions {
            retries: 20,
            wait: Duration::from_millis(25),
            backoff: 1.0,
            strategy: LockStrategy::Single,
        };
        let guard = Lock::acquire(&mut b, "L", "B", &opts).unwrap();
        holder.join().unwrap();
        guard.release(&mut b).unwrap();
    }

    #[test]
    fn test_retry_policy_backs_off_up_to_cap() {
        let opts = LockOptions {
            retries: 3,
            wait: Duration::from_secs(4),
            backoff: 2.0,
            strategy: LockStrategy::Single,
        };
        let policy = opts.retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(2), MAX_LOCK_WAIT);
    }

    #[test]
    fn test_with_lock_releases_on_error() {
        let mut session = Session::in_memory();
        let opts = LockOptions::no_retry(LockStrategy::Single);
        let result: Result<()> = with_lock(&mut session, "L", "A", &opts, |_| {
            Err(Error::CannotFindId { uid: "x".into() })
        });
        assert!(matches!(result, Err(Error::CannotFindId { .. })));
        assert_eq!(Lock::owner(&mut session, "L").unwrap(), None);
    }

    #[test]
    fn test_reduce_cancels_pairs() {
        let entry = |identity: &str, delta, stamp: &str| LedgerEntry {
            identity: identity.into(),
            delta,
            stamp: stamp.into(),
        };
        let ledger = vec![
            entry("A", 1, "01"),
            entry("B", 1, "02"),
            entry("A", -1, "01"),
            entry("B", 1, "02"),
        ];
        let held = reduce(&ledger);
        assert_eq!(held, vec![entry("B", 1, "02")]);
    }

    #[test]
    fn test_ledger_siblings_resolve_to_oldest_acquire() {
        let memory = Arc::new(MemoryStore::new());
        let lock = |identity: &str, stamp: &str| {
            let mut record = LockRecord::new("L", LockStrategy::Ledger);
            record.ledger.push(LedgerEntry {
                identity: identity.into(),
                delta: 1,
                stamp: stamp.into(),
            });
            Record::new(serde_json::to_value(record).unwrap())
        };
        memory.put("locks", "L", &lock("B", "00000000000000000002")).unwrap();
        memory
            .inject_sibling("locks", "L", lock("A", "00000000000000000001"))
            .unwrap();

        // Without a resolver the divergence surfaces
        let mut bare = Session::new(memory.clone(), SessionOptions::default());
        assert!(matches!(
            Lock::owner(&mut bare, "L"),
            Err(Error::SiblingConflict { count: 2, .. })
        ));

        let resolving = ResolvingStore::new(memory.clone()).with_resolver("locks", Arc::new(LedgerResolver));
        let mut session = Session::new(Arc::new(resolving), SessionOptions::default());
        assert_eq!(Lock::owner(&mut session, "L").unwrap().as_deref(), Some("A"));
        assert_eq!(memory.get("locks", "L").unwrap().len(), 1);

        let err = Lock::acquire(&mut session, "L", "B", &LockOptions::no_retry(LockStrategy::Ledger))
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
