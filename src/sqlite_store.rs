//! SQLite implementation of the core [`Store`] trait.
//!
//! Backed by the tables the [`schema`](crate::schema) module creates. Vector
//! similarity is computed in Rust over the embedding BLOBs of the filtered
//! candidates (brute force, no ANN index); full-text relevance comes from
//! FTS5's `bm25()`.
//!
//! Every operation runs under `tokio::time::timeout` bounded by its
//! [`Deadline`]. When the deadline passes the future is dropped, and with it
//! any open [`sqlx::Transaction`], which rolls back.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use kbstore_core::embedding::{blob_to_vec, vec_to_blob};
use kbstore_core::models::{
    content_hash, now_millis, CollectionInfo, CollectionStats, DocumentInput, Metadata,
    MetadataFilter, StoredDocument, UpsertSummary,
};
use kbstore_core::registry::CollectionName;
use kbstore_core::search::query_terms;
use kbstore_core::store::{
    ensure_filter_not_empty, missing_collection, validate_batch, Candidate, Deadline, Store,
};
use kbstore_core::{KbError, Result};

use crate::db::CATALOG_TABLE;
use crate::schema::{self, Tables};

/// SQLite primary result codes that mean "someone else holds the lock".
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Classify a sqlx error into the core taxonomy.
///
/// Lock contention and pool exhaustion are timeouts (retry later); transport
/// failures mean the backend is unavailable; everything else is a plain
/// backend error.
pub fn db_err(err: sqlx::Error) -> KbError {
    match &err {
        sqlx::Error::PoolTimedOut => KbError::Timeout(Duration::ZERO),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => KbError::BackendUnavailable(err.to_string()),
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xff);
            match primary {
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => KbError::Timeout(Duration::ZERO),
                // Catalog says the collection exists but its tables are gone.
                _ if db.message().starts_with("no such table") => KbError::Schema(err.to_string()),
                _ => KbError::Backend(err.to_string()),
            }
        }
        _ => KbError::Backend(err.to_string()),
    }
}

/// Run `fut`, giving up once `deadline` passes.
async fn within<T, F>(deadline: Deadline, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let result = match deadline.remaining() {
        None => fut.await,
        Some(left) if left.is_zero() => return Err(deadline.timeout_error()),
        Some(left) => match tokio::time::timeout(left, fut).await {
            Ok(result) => result,
            Err(_) => return Err(deadline.timeout_error()),
        },
    };
    // Lock and pool timeouts surface with the caller's budget attached.
    result.map_err(|e| match e {
        KbError::Timeout(d) if d.is_zero() => deadline.timeout_error(),
        other => other,
    })
}

/// `id IN (...)` restricting `column` to documents matching every filter pair.
///
/// Each pair contributes `key = ? AND value = ?` placeholders; bind them with
/// [`bind_filter`] in the same order.
fn filter_clause(column: &str, metadata_table: &str, filter: &MetadataFilter) -> String {
    let parts: Vec<String> = filter
        .iter()
        .map(|_| format!("SELECT doc_id FROM {} WHERE key = ? AND value = ?", metadata_table))
        .collect();
    format!("{} IN ({})", column, parts.join(" INTERSECT "))
}

fn filter_binds(filter: &MetadataFilter) -> Vec<(String, String)> {
    filter
        .iter()
        .map(|(k, v)| (k.clone(), v.index_key()))
        .collect()
}

fn bind_filter<'q>(
    mut q: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [(String, String)],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for (k, v) in binds {
        q = q.bind(k.as_str()).bind(v.as_str());
    }
    q
}

/// FTS5 MATCH expression: every term quoted, any term may match.
fn fts_match_expression(query_text: &str) -> Option<String> {
    let terms = query_terms(query_text);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn stored_from_row(row: &SqliteRow) -> Result<StoredDocument> {
    let blob: Vec<u8> = row.try_get("embedding").map_err(db_err)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(db_err)?;
    Ok(StoredDocument {
        id: row.try_get("id").map_err(db_err)?,
        embedding: blob_to_vec(&blob),
        text: row.try_get("text").map_err(db_err)?,
        metadata: Metadata::from_json(&metadata_json)?,
        content_hash: row.try_get("content_hash").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

/// [`Store`] over a shared [`SqlitePool`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn require_info(&self, collection: &CollectionName) -> Result<CollectionInfo> {
        schema::collection_info(&self.pool, collection)
            .await?
            .ok_or_else(|| missing_collection(collection))
    }

    async fn write_batch(
        &self,
        collection: &CollectionName,
        docs: &[DocumentInput],
    ) -> Result<UpsertSummary> {
        let t = Tables::for_collection(collection);
        let now = now_millis();
        let mut summary = UpsertSummary::default();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Take the write lock first so the transaction never has to upgrade
        // from a read snapshot.
        sqlx::query(&format!(
            "UPDATE {CATALOG_TABLE} SET dims = dims WHERE name = ?"
        ))
        .bind(collection.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for doc in docs {
            let existed: bool = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) > 0 FROM {} WHERE id = ?",
                t.documents
            ))
            .bind(&doc.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

            if existed {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }

            sqlx::query(&format!(
                r#"
                INSERT INTO {}
                    (id, embedding, text, metadata_json, content_hash, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    embedding = excluded.embedding,
                    text = excluded.text,
                    metadata_json = excluded.metadata_json,
                    content_hash = excluded.content_hash,
                    updated_at = excluded.updated_at
                "#,
                t.documents
            ))
            .bind(&doc.id)
            .bind(vec_to_blob(&doc.embedding))
            .bind(&doc.text)
            .bind(doc.metadata.to_json()?)
            .bind(content_hash(&doc.text))
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            replace_index_rows(&mut tx, &t, doc).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(summary)
    }

    async fn delete_matching(
        &self,
        collection: &CollectionName,
        filter: &MetadataFilter,
    ) -> Result<u64> {
        let t = Tables::for_collection(collection);
        let binds = filter_binds(filter);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // The filter subquery reads the metadata table, so it goes last.
        let fts_sql = format!(
            "DELETE FROM {} WHERE {}",
            t.fts,
            filter_clause("doc_id", &t.metadata, filter)
        );
        bind_filter(sqlx::query(&fts_sql), &binds)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let docs_sql = format!(
            "DELETE FROM {} WHERE {}",
            t.documents,
            filter_clause("id", &t.metadata, filter)
        );
        let removed = bind_filter(sqlx::query(&docs_sql), &binds)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        let meta_sql = format!(
            "DELETE FROM {} WHERE {}",
            t.metadata,
            filter_clause("doc_id", &t.metadata, filter)
        );
        bind_filter(sqlx::query(&meta_sql), &binds)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(removed)
    }

    async fn load_candidates(
        &self,
        collection: &CollectionName,
        filter: &MetadataFilter,
        query_text: &str,
    ) -> Result<Vec<Candidate>> {
        if schema::collection_info(&self.pool, collection).await?.is_none() {
            return Ok(Vec::new());
        }
        let t = Tables::for_collection(collection);
        let binds = filter_binds(filter);

        let mut sql = format!(
            "SELECT id, embedding, metadata_json, updated_at FROM {}",
            t.documents
        );
        if !filter.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&filter_clause("id", &t.metadata, filter));
        }
        let rows = bind_filter(sqlx::query(&sql), &binds)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let ranks = match fts_match_expression(query_text) {
            Some(expr) => self.text_ranks(&t, filter, &binds, &expr).await?,
            None => HashMap::new(),
        };

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(db_err)?;
                let blob: Vec<u8> = row.try_get("embedding").map_err(db_err)?;
                let metadata_json: String = row.try_get("metadata_json").map_err(db_err)?;
                Ok(Candidate {
                    text_rank: ranks.get(&id).copied(),
                    id,
                    embedding: blob_to_vec(&blob),
                    metadata: Metadata::from_json(&metadata_json)?,
                    updated_at: row.try_get("updated_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    /// `-bm25` per matching document (larger is better).
    async fn text_ranks(
        &self,
        t: &Tables,
        filter: &MetadataFilter,
        binds: &[(String, String)],
        expr: &str,
    ) -> Result<HashMap<String, f64>> {
        let mut sql = format!(
            "SELECT doc_id, -bm25({fts}) AS rank FROM {fts} WHERE {fts} MATCH ?",
            fts = t.fts
        );
        if !filter.is_empty() {
            sql.push_str(" AND ");
            sql.push_str(&filter_clause("doc_id", &t.metadata, filter));
        }
        let rows = bind_filter(sqlx::query(&sql).bind(expr), binds)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut ranks = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("doc_id").map_err(db_err)?;
            let rank: f64 = row.try_get("rank").map_err(db_err)?;
            ranks.insert(id, rank);
        }
        Ok(ranks)
    }
}

/// Replace a document's FTS row and metadata filter rows.
async fn replace_index_rows(
    conn: &mut SqliteConnection,
    t: &Tables,
    doc: &DocumentInput,
) -> Result<()> {
    sqlx::query(&format!("DELETE FROM {} WHERE doc_id = ?", t.fts))
        .bind(&doc.id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    sqlx::query(&format!("INSERT INTO {} (doc_id, text) VALUES (?, ?)", t.fts))
        .bind(&doc.id)
        .bind(&doc.text)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

    sqlx::query(&format!("DELETE FROM {} WHERE doc_id = ?", t.metadata))
        .bind(&doc.id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    for (key, value) in doc.metadata.iter() {
        sqlx::query(&format!(
            "INSERT INTO {} (doc_id, key, value) VALUES (?, ?, ?)",
            t.metadata
        ))
        .bind(&doc.id)
        .bind(key)
        .bind(value.index_key())
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    fn backend_name(&self) -> &str {
        "sqlite"
    }

    async fn ensure_collection(
        &self,
        collection: &CollectionName,
        dims: usize,
        deadline: Deadline,
    ) -> Result<CollectionInfo> {
        let info = within(deadline, schema::ensure_collection(&self.pool, collection, dims)).await?;
        tracing::debug!(collection = %collection, dims, "collection ensured");
        Ok(info)
    }

    async fn collection_info(
        &self,
        collection: &CollectionName,
        deadline: Deadline,
    ) -> Result<Option<CollectionInfo>> {
        within(deadline, schema::collection_info(&self.pool, collection)).await
    }

    async fn upsert(
        &self,
        collection: &CollectionName,
        docs: &[DocumentInput],
        deadline: Deadline,
    ) -> Result<UpsertSummary> {
        within(deadline, async {
            let info = self.require_info(collection).await?;
            validate_batch(collection, info.dims, docs)?;
            if docs.is_empty() {
                return Ok(UpsertSummary::default());
            }
            let summary = self.write_batch(collection, docs).await?;
            tracing::debug!(
                collection = %collection,
                inserted = summary.inserted,
                updated = summary.updated,
                "batch upserted"
            );
            Ok(summary)
        })
        .await
    }

    async fn get(
        &self,
        collection: &CollectionName,
        id: &str,
        deadline: Deadline,
    ) -> Result<Option<StoredDocument>> {
        within(deadline, async {
            if schema::collection_info(&self.pool, collection).await?.is_none() {
                return Ok(None);
            }
            let t = Tables::for_collection(collection);
            let row = sqlx::query(&format!(
                "SELECT id, embedding, text, metadata_json, content_hash, created_at, updated_at \
                 FROM {} WHERE id = ?",
                t.documents
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
            row.as_ref().map(stored_from_row).transpose()
        })
        .await
    }

    async fn delete_where(
        &self,
        collection: &CollectionName,
        filter: &MetadataFilter,
        deadline: Deadline,
    ) -> Result<u64> {
        ensure_filter_not_empty(filter)?;
        within(deadline, async {
            if schema::collection_info(&self.pool, collection).await?.is_none() {
                return Ok(0);
            }
            self.delete_matching(collection, filter).await
        })
        .await
    }

    async fn delete_all(&self, collection: &CollectionName, deadline: Deadline) -> Result<u64> {
        within(deadline, async {
            if schema::collection_info(&self.pool, collection).await?.is_none() {
                return Ok(0);
            }
            let t = Tables::for_collection(collection);
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let removed = sqlx::query(&format!("DELETE FROM {}", t.documents))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
            for table in [&t.fts, &t.metadata] {
                sqlx::query(&format!("DELETE FROM {}", table))
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
            tx.commit().await.map_err(db_err)?;
            Ok(removed)
        })
        .await
    }

    async fn get_statistics(
        &self,
        collection: &CollectionName,
        deadline: Deadline,
    ) -> Result<CollectionStats> {
        within(deadline, async {
            let info = self.require_info(collection).await?;
            let t = Tables::for_collection(collection);
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", t.documents))
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
            Ok(CollectionStats {
                collection_name: info.name,
                document_count: count as u64,
                embedding_dimension: info.dims,
            })
        })
        .await
    }

    async fn candidates(
        &self,
        collection: &CollectionName,
        filter: &MetadataFilter,
        query_text: &str,
        deadline: Deadline,
    ) -> Result<Vec<Candidate>> {
        within(deadline, self.load_candidates(collection, filter, query_text)).await
    }
}
