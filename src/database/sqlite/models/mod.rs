
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Domain payload of one knowledge item, keyed by field name (`Question`, `Solution`, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, String>);

impl Record {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(field, value);
        self
    }

    #[inline]
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    #[inline]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    #[inline]
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    #[inline]
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Record {
    #[inline]
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A persisted knowledge item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeRow {
    pub id: i64,
    pub version: i64,
    pub vectorized: bool,
    pub record: Record,
}

/// Ordered rows submitted together; every row gets the same version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch {
    pub records: Vec<Record>,
}

impl Batch {
    #[inline]
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl From<Vec<Record>> for Batch {
    #[inline]
    fn from(records: Vec<Record>) -> Self {
        Self::new(records)
    }
}

/// Result of a successful relational write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBatch {
    pub version: i64,
    /// Row ids in the same order as the input batch
    pub ids: Vec<i64>,
}

/// Row count of one version present in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionSummary {
    pub version: i64,
    pub rows: i64,
    pub vectorized_rows: i64,
}

/// Highest version ever handed out for a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionLedgerEntry {
    pub table_name: String,
    pub last_version: i64,
    pub issued_at: DateTime<Utc>,
}
