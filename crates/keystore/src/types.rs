//! Data types shared by every store backend

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Upper bound appended to a prefix to turn it into an inclusive range end.
///
/// U+10FFFF has the greatest UTF-8 encoding, so every term that starts with
/// the prefix sorts at or before `prefix + PREFIX_END`.
pub const PREFIX_END: char = '\u{10FFFF}';

/// Reserved index answered by every backend with the record keys themselves
pub const KEY_INDEX: &str = "$key";

/// A single secondary index entry attached to a record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Index name
    pub name: String,
    /// Indexed term
    pub term: String,
}

impl IndexEntry {
    /// Create an index entry
    pub fn new(name: impl Into<String>, term: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            term: term.into(),
        }
    }
}

/// A stored object: an opaque JSON body plus its secondary index entries
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    /// Object body
    pub data: Value,
    /// Secondary index entries, ordered by (name, term)
    #[serde(default)]
    pub indexes: BTreeSet<IndexEntry>,
}

impl Record {
    /// Create a record with no index entries
    pub fn new(data: Value) -> Self {
        Self {
            data,
            indexes: BTreeSet::new(),
        }
    }

    /// Builder-style helper to attach an index entry
    pub fn with_index(mut self, name: impl Into<String>, term: impl Into<String>) -> Self {
        self.indexes.insert(IndexEntry::new(name, term));
        self
    }

    /// All terms stored under `name`, in ascending order
    pub fn terms<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.terms_with_prefix(name, "")
    }

    /// Terms under `name` that start with `prefix`, in ascending order
    pub fn terms_with_prefix<'a>(
        &'a self,
        name: &'a str,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.indexes
            .range(IndexEntry::new(name, prefix)..)
            .take_while(move |e| e.name == name && e.term.starts_with(prefix))
            .map(|e| e.term.as_str())
    }

    /// Names of every index this record carries a term for
    pub fn index_names(&self) -> BTreeSet<&str> {
        self.indexes.iter().map(|e| e.name.as_str()).collect()
    }
}

/// A range query against one secondary index of a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQuery {
    /// Bucket to scan
    pub bucket: String,
    /// Index name
    pub index: String,
    /// Inclusive lower bound
    pub start: String,
    /// Inclusive upper bound; `None` scans to the end of the index
    pub end: Option<String>,
    /// Whether matches should carry the matched term
    pub return_terms: bool,
    /// Maximum number of matches to return
    pub max_results: Option<usize>,
}

impl IndexQuery {
    /// Query the inclusive range `[start, end]`
    pub fn range(
        bucket: impl Into<String>,
        index: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            index: index.into(),
            start: start.into(),
            end: Some(end.into()),
            return_terms: false,
            max_results: None,
        }
    }

    /// Query every term that starts with `prefix`
    pub fn prefix(bucket: impl Into<String>, index: impl Into<String>, prefix: &str) -> Self {
        Self::range(bucket, index, prefix, format!("{prefix}{PREFIX_END}"))
    }

    /// Query every term greater than or equal to `start`
    pub fn from(bucket: impl Into<String>, index: impl Into<String>, start: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            index: index.into(),
            start: start.into(),
            end: None,
            return_terms: false,
            max_results: None,
        }
    }

    /// Ask for the matched terms alongside the keys
    pub fn with_terms(mut self) -> Self {
        self.return_terms = true;
        self
    }

    /// Cap the number of matches
    pub fn limit(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// Whether `term` falls inside the queried range
    pub fn matches(&self, term: &str) -> bool {
        term >= self.start.as_str() && self.end.as_deref().is_none_or(|end| term <= end)
    }
}

/// One result of an index query
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexMatch {
    /// Matched term, present when the query asked for terms
    pub term: Option<String>,
    /// Key of the record carrying the term
    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terms_with_prefix() {
        let record = Record::new(json!({}))
            .with_index("recv", "a|x|b")
            .with_index("recv", "a|y|c")
            .with_index("recv", "b|x|a")
            .with_index("tags", "a|x|zzz");

        let terms: Vec<_> = record.terms_with_prefix("recv", "a|").collect();
        assert_eq!(terms, vec!["a|x|b", "a|y|c"]);
        assert_eq!(record.terms("recv").count(), 3);
        assert_eq!(record.terms("missing").count(), 0);
    }

    #[test]
    fn test_prefix_query_bounds() {
        let query = IndexQuery::prefix("resources", "emit", "node1|");
        assert!(query.matches("node1|ip|node2|ip|scalar>scalar"));
        assert!(!query.matches("node10|ip"));
        assert!(!query.matches("node1"));
    }

    #[test]
    fn test_open_ended_query() {
        let query = IndexQuery::from("resources", "updated", "00000000000000000010");
        assert!(query.matches("00000000000000000011"));
        assert!(query.matches("00000000000000000010"));
        assert!(!query.matches("00000000000000000009"));
    }
}
