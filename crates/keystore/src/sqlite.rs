//! Durable store on SQLite
//!
//! Objects live in one table keyed by `(bucket, key)`; index entries live in a
//! second table whose primary key `(bucket, name, term, key)` doubles as the
//! ordered structure range scans walk.

use crate::error::{Error, Result};
use crate::types::{IndexEntry, IndexMatch, IndexQuery, KEY_INDEX, Record};
use crate::{Store, finish_matches};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS objects (
        bucket TEXT NOT NULL,
        key TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (bucket, key)
    );

    CREATE TABLE IF NOT EXISTS indexes (
        bucket TEXT NOT NULL,
        name TEXT NOT NULL,
        term TEXT NOT NULL,
        key TEXT NOT NULL,
        PRIMARY KEY (bucket, name, term, key)
    );

    CREATE INDEX IF NOT EXISTS idx_indexes_owner ON indexes(bucket, key);
";

/// A store persisted in a single SQLite database file
///
/// SQLite never produces siblings, so [`Store::get`] always returns exactly
/// one record.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    ///
    /// Creates the parent directory and the tables if they don't exist.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        log::debug!("Opened store at {}", db_path.display());
        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::Poisoned)
    }
}

impl Store for SqliteStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<Record>> {
        let conn = self.conn()?;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM objects WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
                |row| row.get(0),
            )
            .optional()?;
        let Some(data) = data else {
            return Err(Error::not_found(bucket, key));
        };

        let mut stmt =
            conn.prepare("SELECT name, term FROM indexes WHERE bucket = ?1 AND key = ?2")?;
        let indexes = stmt
            .query_map(params![bucket, key], |row| {
                Ok(IndexEntry::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<BTreeSet<_>, _>>()?;

        Ok(vec![Record {
            data: serde_json::from_str(&data)?,
            indexes,
        }])
    }

    fn put(&self, bucket: &str, key: &str, record: &Record) -> Result<()> {
        let data = serde_json::to_string(&record.data)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO objects (bucket, key, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(bucket, key) DO UPDATE SET data = excluded.data",
            params![bucket, key, data],
        )?;
        tx.execute(
            "DELETE FROM indexes WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO indexes (bucket, name, term, key) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entry in &record.indexes {
                insert.execute(params![bucket, entry.name, entry.term, key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM objects WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
        )?;
        tx.execute(
            "DELETE FROM indexes WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_index(&self, query: &IndexQuery) -> Result<Vec<IndexMatch>> {
        let conn = self.conn()?;

        // LIMIT -1 means "no limit" to SQLite
        let limit = query.max_results.map_or(-1, |n| n as i64);
        let row_to_match = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String)> {
            Ok((row.get(0)?, row.get(1)?))
        };

        let matches = if query.index == KEY_INDEX {
            let mut stmt = conn.prepare(
                "SELECT key, key FROM objects
                 WHERE bucket = ?1 AND key >= ?2 AND (?3 IS NULL OR key <= ?3)
                 ORDER BY key LIMIT ?4",
            )?;
            stmt.query_map(
                params![query.bucket, query.start, query.end, limit],
                row_to_match,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT term, key FROM indexes
                 WHERE bucket = ?1 AND name = ?2 AND term >= ?3 AND (?4 IS NULL OR term <= ?4)
                 ORDER BY term, key LIMIT ?5",
            )?;
            stmt.query_map(
                params![query.bucket, query.index, query.start, query.end, limit],
                row_to_match,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?
        };

        Ok(finish_matches(query, matches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip_with_indexes() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("state").join("store.db")).unwrap();

        let record = Record::new(json!({ "ip": "10.0.0.1" }))
            .with_index("tags", "role=db")
            .with_index("updated", "00000000000000000001");
        store.put("resources", "node1", &record).unwrap();

        let fetched = store.get("resources", "node1").unwrap();
        assert_eq!(fetched, vec![record]);
    }

    #[test]
    fn test_put_replaces_index_entries() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put("resources", "node1", &Record::new(json!({})).with_index("tags", "old"))
            .unwrap();
        store
            .put("resources", "node1", &Record::new(json!({})).with_index("tags", "new"))
            .unwrap();

        let old = store
            .get_index(&IndexQuery::range("resources", "tags", "old", "old"))
            .unwrap();
        assert!(old.is_empty());

        let new = store
            .get_index(&IndexQuery::range("resources", "tags", "new", "new"))
            .unwrap();
        assert_eq!(new.len(), 1);
    }

    #[test]
    fn test_prefix_scan_and_limit() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (key, term) in [("b", "a|2"), ("a", "a|1"), ("c", "b|1")] {
            store
                .put("edges", key, &Record::new(json!({})).with_index("emit", term))
                .unwrap();
        }

        let matches = store
            .get_index(&IndexQuery::prefix("edges", "emit", "a|").with_terms())
            .unwrap();
        let terms: Vec<_> = matches.iter().filter_map(|m| m.term.as_deref()).collect();
        assert_eq!(terms, vec!["a|1", "a|2"]);

        let limited = store
            .get_index(&IndexQuery::from("edges", "emit", "").limit(1))
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].key, "a");
    }

    #[test]
    fn test_keys_and_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("locks", "l1", &Record::new(json!({}))).unwrap();
        store.put("locks", "l2", &Record::new(json!({}))).unwrap();
        assert_eq!(store.keys("locks").unwrap(), vec!["l1", "l2"]);

        store.delete("locks", "l1").unwrap();
        assert!(store.get("locks", "l1").unwrap_err().is_not_found());
        assert_eq!(store.keys("locks").unwrap(), vec!["l2"]);
    }
}
