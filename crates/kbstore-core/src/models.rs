//! Core data models: documents, typed metadata, and query results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{KbError, Result};

/// A scalar metadata value.
///
/// Serialized untagged so HTTP callers can send plain JSON scalars
/// (`"docs"`, `3`, `1.5`, `true`). Nested objects and arrays are rejected
/// at deserialization time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl MetadataValue {
    /// Canonical encoding used by the metadata filter index.
    ///
    /// Two values match under a filter iff their index keys are equal, so
    /// `3` (integer) and `3.0` (float) are distinct.
    pub fn index_key(&self) -> String {
        match self {
            MetadataValue::Boolean(b) => b.to_string(),
            MetadataValue::Integer(i) => i.to_string(),
            MetadataValue::Float(f) => format!("{:?}", f),
            MetadataValue::String(s) => {
                serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::String(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::String(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Integer(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        MetadataValue::Float(f)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Boolean(b)
    }
}

/// Open key/value metadata attached to a document.
///
/// Keys are ordered so the stored JSON form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetadataValue>);

/// Exact-match, AND-combined metadata filter. Same shape as [`Metadata`].
pub type MetadataFilter = Metadata;

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(MetadataValue::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.0.iter()
    }

    /// True when every `(key, value)` in `filter` is present here with an
    /// equal index key. An empty filter matches everything.
    pub fn matches(&self, filter: &MetadataFilter) -> bool {
        filter.iter().all(|(k, v)| {
            self.0
                .get(k)
                .map(|mine| mine.index_key() == v.index_key())
                .unwrap_or(false)
        })
    }

    /// Boundary validation: keys must be non-blank and floats finite.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in &self.0 {
            if key.trim().is_empty() {
                return Err(KbError::validation("metadata keys must not be empty"));
            }
            if let MetadataValue::Float(f) = value {
                if !f.is_finite() {
                    return Err(KbError::validation(format!(
                        "metadata value for '{}' must be a finite number",
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl<K: Into<String>, V: Into<MetadataValue>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Metadata(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A document as handed to [`Store::upsert`](crate::store::Store::upsert).
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub id: String,
    pub embedding: Vec<f32>,
    pub text: String,
    pub metadata: Metadata,
}

/// A document as read back from a store.
#[derive(Debug, Clone, Serialize)]
pub struct StoredDocument {
    pub id: String,
    pub embedding: Vec<f32>,
    pub text: String,
    pub metadata: Metadata,
    /// SHA-256 hex of `text`.
    pub content_hash: String,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds, refreshed on every write.
    pub updated_at: i64,
}

/// One ranked query result. Text and embedding are deliberately absent;
/// callers re-fetch by id when they need the content.
#[derive(Debug, Clone, Serialize)]
pub struct QueryHit {
    pub id: String,
    pub score: f64,
    pub metadata: Metadata,
}

/// Catalog entry for a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionInfo {
    pub name: String,
    pub dims: usize,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub collection_name: String,
    pub document_count: u64,
    pub embedding_dimension: usize,
}

/// Outcome of a successful upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: u64,
    pub updated: u64,
}

/// SHA-256 hex digest of chunk text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
