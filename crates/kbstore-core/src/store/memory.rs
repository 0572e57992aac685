//! In-memory [`Store`] implementation for tests and embedding in other
//! processes without a database.
//!
//! Collections are `HashMap`s behind one `std::sync::RwLock`, so a batch
//! upsert is applied under a single write guard and is trivially atomic.
//! Full-text rank is the number of distinct query terms present in the
//! document's text (no inverted index). Deadlines are checked once on entry
//! because nothing here blocks.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{KbError, Result};
use crate::models::{
    content_hash, now_millis, CollectionInfo, CollectionStats, DocumentInput, MetadataFilter,
    StoredDocument, UpsertSummary,
};
use crate::registry::CollectionName;
use crate::search::query_terms;

use super::{
    ensure_filter_not_empty, missing_collection, validate_batch, Candidate, Deadline, Store,
};

struct MemoryCollection {
    info: CollectionInfo,
    docs: HashMap<String, StoredDocument>,
}

#[derive(Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<CollectionName, MemoryCollection>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<CollectionName, MemoryCollection>>> {
        self.collections
            .read()
            .map_err(|_| KbError::BackendUnavailable("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<CollectionName, MemoryCollection>>> {
        self.collections
            .write()
            .map_err(|_| KbError::BackendUnavailable("in-memory store lock poisoned".into()))
    }
}

fn check(deadline: Deadline) -> Result<()> {
    if deadline.is_expired() {
        Err(deadline.timeout_error())
    } else {
        Ok(())
    }
}

fn term_rank(text: &str, terms: &[String]) -> Option<f64> {
    if terms.is_empty() {
        return None;
    }
    let doc_terms = query_terms(text);
    let matched = terms.iter().filter(|t| doc_terms.contains(t)).count();
    if matched > 0 {
        Some(matched as f64)
    } else {
        None
    }
}

#[async_trait]
impl Store for InMemoryStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn ensure_collection(
        &self,
        collection: &CollectionName,
        dims: usize,
        deadline: Deadline,
    ) -> Result<CollectionInfo> {
        check(deadline)?;
        if dims == 0 {
            return Err(KbError::validation("embedding dimension must be > 0"));
        }
        let mut collections = self.write()?;
        let entry = collections
            .entry(collection.clone())
            .or_insert_with(|| MemoryCollection {
                info: CollectionInfo {
                    name: collection.to_string(),
                    dims,
                    created_at: now_millis(),
                },
                docs: HashMap::new(),
            });
        if entry.info.dims != dims {
            return Err(KbError::Schema(format!(
                "collection {} has embedding dimension {}, requested {}",
                collection, entry.info.dims, dims
            )));
        }
        Ok(entry.info.clone())
    }

    async fn collection_info(
        &self,
        collection: &CollectionName,
        deadline: Deadline,
    ) -> Result<Option<CollectionInfo>> {
        check(deadline)?;
        Ok(self.read()?.get(collection).map(|c| c.info.clone()))
    }

    async fn upsert(
        &self,
        collection: &CollectionName,
        docs: &[DocumentInput],
        deadline: Deadline,
    ) -> Result<UpsertSummary> {
        check(deadline)?;
        let mut collections = self.write()?;
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        validate_batch(collection, coll.info.dims, docs)?;

        let now = now_millis();
        let mut summary = UpsertSummary::default();
        for doc in docs {
            let created_at = match coll.docs.get(&doc.id) {
                Some(existing) => {
                    summary.updated += 1;
                    existing.created_at
                }
                None => {
                    summary.inserted += 1;
                    now
                }
            };
            coll.docs.insert(
                doc.id.clone(),
                StoredDocument {
                    id: doc.id.clone(),
                    embedding: doc.embedding.clone(),
                    text: doc.text.clone(),
                    metadata: doc.metadata.clone(),
                    content_hash: content_hash(&doc.text),
                    created_at,
                    updated_at: now,
                },
            );
        }
        Ok(summary)
    }

    async fn get(
        &self,
        collection: &CollectionName,
        id: &str,
        deadline: Deadline,
    ) -> Result<Option<StoredDocument>> {
        check(deadline)?;
        Ok(self
            .read()?
            .get(collection)
            .and_then(|c| c.docs.get(id).cloned()))
    }

    async fn delete_where(
        &self,
        collection: &CollectionName,
        filter: &MetadataFilter,
        deadline: Deadline,
    ) -> Result<u64> {
        ensure_filter_not_empty(filter)?;
        check(deadline)?;
        let mut collections = self.write()?;
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = coll.docs.len();
        coll.docs.retain(|_, d| !d.metadata.matches(filter));
        Ok((before - coll.docs.len()) as u64)
    }

    async fn delete_all(&self, collection: &CollectionName, deadline: Deadline) -> Result<u64> {
        check(deadline)?;
        let mut collections = self.write()?;
        Ok(collections
            .get_mut(collection)
            .map(|c| {
                let n = c.docs.len() as u64;
                c.docs.clear();
                n
            })
            .unwrap_or(0))
    }

    async fn get_statistics(
        &self,
        collection: &CollectionName,
        deadline: Deadline,
    ) -> Result<CollectionStats> {
        check(deadline)?;
        let collections = self.read()?;
        let coll = collections
            .get(collection)
            .ok_or_else(|| missing_collection(collection))?;
        Ok(CollectionStats {
            collection_name: collection.to_string(),
            document_count: coll.docs.len() as u64,
            embedding_dimension: coll.info.dims,
        })
    }

    async fn candidates(
        &self,
        collection: &CollectionName,
        filter: &MetadataFilter,
        query_text: &str,
        deadline: Deadline,
    ) -> Result<Vec<Candidate>> {
        check(deadline)?;
        let terms = query_terms(query_text);
        let collections = self.read()?;
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(coll
            .docs
            .values()
            .filter(|d| d.metadata.matches(filter))
            .map(|d| Candidate {
                id: d.id.clone(),
                embedding: d.embedding.clone(),
                metadata: d.metadata.clone(),
                updated_at: d.updated_at,
                text_rank: term_rank(&d.text, &terms),
            })
            .collect())
    }
}
