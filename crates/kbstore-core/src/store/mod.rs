//! Storage abstraction for kbstore.
//!
//! The [`Store`] trait covers everything the ingestion pipeline and the
//! hybrid query engine need from a backend: per-collection schema setup,
//! atomic batch upserts, metadata-filtered deletes, statistics, and
//! candidate retrieval for ranking.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! Every operation takes a [`Deadline`]; backends that perform I/O are
//! expected to abandon (and roll back) work once it passes.

pub mod memory;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{KbError, Result};
use crate::models::{
    CollectionInfo, CollectionStats, DocumentInput, Metadata, MetadataFilter, StoredDocument,
    UpsertSummary,
};
use crate::registry::CollectionName;

/// A point in time after which a store operation must give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
    budget: Option<Duration>,
}

impl Deadline {
    /// No time limit.
    pub fn none() -> Self {
        Self {
            at: None,
            budget: None,
        }
    }

    /// Expires `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Some(Instant::now() + budget),
            budget: Some(budget),
        }
    }

    /// Time left, or `None` when unbounded. Saturates at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().map(|d| d.is_zero()).unwrap_or(false)
    }

    /// The error to report once this deadline has passed.
    pub fn timeout_error(&self) -> KbError {
        KbError::Timeout(self.budget.unwrap_or_default())
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

/// A document considered for ranking.
///
/// Carries everything the scorers and tie-breaks need, so ranking runs
/// without further store round-trips.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
    /// Unix milliseconds.
    pub updated_at: i64,
    /// Raw full-text relevance (larger is better), `None` when the
    /// document did not match any query term.
    pub text_rank: Option<f64>,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_collection`](Store::ensure_collection) | Create a collection's tables if absent |
/// | [`collection_info`](Store::collection_info) | Read a collection's catalog entry |
/// | [`upsert`](Store::upsert) | Atomically insert or replace a batch |
/// | [`get`](Store::get) | Fetch one document with text and embedding |
/// | [`delete_where`](Store::delete_where) | Delete by exact metadata match |
/// | [`delete_all`](Store::delete_all) | Explicitly empty a collection |
/// | [`get_statistics`](Store::get_statistics) | Count and dimension |
/// | [`candidates`](Store::candidates) | Filtered candidates with text ranks |
#[async_trait]
pub trait Store: Send + Sync {
    /// Short backend identifier for statistics (e.g. `"sqlite"`).
    fn backend_name(&self) -> &str;

    /// Create the collection if absent. Idempotent.
    ///
    /// Fails with `Schema` if the collection exists with a different
    /// embedding dimension.
    async fn ensure_collection(
        &self,
        collection: &CollectionName,
        dims: usize,
        deadline: Deadline,
    ) -> Result<CollectionInfo>;

    async fn collection_info(
        &self,
        collection: &CollectionName,
        deadline: Deadline,
    ) -> Result<Option<CollectionInfo>>;

    /// Insert or replace every document in `docs`, all or nothing.
    async fn upsert(
        &self,
        collection: &CollectionName,
        docs: &[DocumentInput],
        deadline: Deadline,
    ) -> Result<UpsertSummary>;

    async fn get(
        &self,
        collection: &CollectionName,
        id: &str,
        deadline: Deadline,
    ) -> Result<Option<StoredDocument>>;

    /// Delete documents matching every pair in `filter`. An empty filter is
    /// rejected; use [`delete_all`](Store::delete_all) instead.
    async fn delete_where(
        &self,
        collection: &CollectionName,
        filter: &MetadataFilter,
        deadline: Deadline,
    ) -> Result<u64>;

    async fn delete_all(&self, collection: &CollectionName, deadline: Deadline) -> Result<u64>;

    async fn get_statistics(
        &self,
        collection: &CollectionName,
        deadline: Deadline,
    ) -> Result<CollectionStats>;

    /// All documents matching `filter`, each with its full-text rank for
    /// `query_text`. A missing collection yields no candidates.
    async fn candidates(
        &self,
        collection: &CollectionName,
        filter: &MetadataFilter,
        query_text: &str,
        deadline: Deadline,
    ) -> Result<Vec<Candidate>>;
}

/// Checks every backend runs before opening a write.
pub fn validate_batch(
    collection: &CollectionName,
    dims: usize,
    docs: &[DocumentInput],
) -> Result<()> {
    let mut seen = HashSet::with_capacity(docs.len());
    for doc in docs {
        if doc.id.trim().is_empty() {
            return Err(KbError::validation("document id must not be empty"));
        }
        if !seen.insert(doc.id.as_str()) {
            return Err(KbError::validation(format!(
                "document id {:?} appears more than once in the batch",
                doc.id
            )));
        }
        if doc.text.trim().is_empty() {
            return Err(KbError::validation(format!(
                "document {:?} has empty text",
                doc.id
            )));
        }
        if doc.embedding.len() != dims {
            return Err(KbError::DimensionMismatch {
                collection: collection.to_string(),
                expected: dims,
                actual: doc.embedding.len(),
            });
        }
        doc.metadata.validate()?;
    }
    Ok(())
}

pub fn ensure_filter_not_empty(filter: &MetadataFilter) -> Result<()> {
    if filter.is_empty() {
        return Err(KbError::validation(
            "refusing to delete with an empty metadata filter; use delete_all",
        ));
    }
    Ok(())
}

pub fn missing_collection(collection: &CollectionName) -> KbError {
    KbError::Schema(format!("collection {} does not exist", collection))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, text: &str, dims: usize) -> DocumentInput {
        DocumentInput {
            id: id.to_string(),
            embedding: vec![0.5; dims],
            text: text.to_string(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_validate_batch() {
        let name = CollectionName::parse("kb_t").unwrap();
        assert!(validate_batch(&name, 3, &[doc("a", "x", 3), doc("b", "y", 3)]).is_ok());
        assert!(matches!(
            validate_batch(&name, 3, &[doc("a", "x", 4)]),
            Err(KbError::DimensionMismatch {
                expected: 3,
                actual: 4,
                ..
            })
        ));
        assert!(matches!(
            validate_batch(&name, 3, &[doc("a", "  ", 3)]),
            Err(KbError::Validation(_))
        ));
        assert!(matches!(
            validate_batch(&name, 3, &[doc("", "x", 3)]),
            Err(KbError::Validation(_))
        ));
        assert!(matches!(
            validate_batch(&name, 3, &[doc("a", "x", 3), doc("a", "y", 3)]),
            Err(KbError::Validation(_))
        ));
    }

    #[test]
    fn test_deadline() {
        assert!(!Deadline::none().is_expired());
        assert_eq!(Deadline::none().remaining(), None);
        assert!(Deadline::after(Duration::ZERO).is_expired());
        assert!(!Deadline::after(Duration::from_secs(60)).is_expired());
        assert!(matches!(
            Deadline::after(Duration::from_millis(5)).timeout_error(),
            KbError::Timeout(d) if d == Duration::from_millis(5)
        ));
    }

    #[test]
    fn test_empty_filter_rejected() {
        assert!(ensure_filter_not_empty(&Metadata::new()).is_err());
        assert!(ensure_filter_not_empty(&Metadata::new().with("source", "a.md")).is_ok());
    }
}
