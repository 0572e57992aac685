//! Schema Manager: per-collection tables and indexes.
//!
//! Each collection `<name>` owns three tables:
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `<name>_documents` | Rows keyed by `id`: embedding, text, metadata JSON, hash, times |
//! | `<name>_fts` | FTS5 index over `text`, one row per document |
//! | `<name>_metadata` | `(doc_id, key, value)` rows backing exact-match filters |
//!
//! and one row in the [`CATALOG_TABLE`] recording its embedding dimension.
//!
//! Creation runs in a single transaction whose first statement claims the
//! catalog row with `ON CONFLICT DO NOTHING`. Concurrent initializers
//! serialize on SQLite's write lock; the loser sees the winner's row and
//! only re-runs the `IF NOT EXISTS` DDL.

use sqlx::{Row, SqliteConnection, SqlitePool};

use kbstore_core::models::{now_millis, CollectionInfo};
use kbstore_core::registry::CollectionName;
use kbstore_core::{KbError, Result};

use crate::db::CATALOG_TABLE;
use crate::sqlite_store::db_err;

/// Quoted table names for one collection.
#[derive(Debug, Clone)]
pub struct Tables {
    pub documents: String,
    pub fts: String,
    pub metadata: String,
}

impl Tables {
    /// Collection names are restricted to `[A-Za-z0-9_]`, so quoting is
    /// all the escaping needed.
    pub fn for_collection(name: &CollectionName) -> Self {
        Self {
            documents: format!("\"{}_documents\"", name),
            fts: format!("\"{}_fts\"", name),
            metadata: format!("\"{}_metadata\"", name),
        }
    }
}

/// Create the collection's tables if absent and return its catalog entry.
///
/// Fails with `Schema` if the collection already exists with a different
/// dimension; nothing is changed in that case.
pub async fn ensure_collection(
    pool: &SqlitePool,
    name: &CollectionName,
    dims: usize,
) -> Result<CollectionInfo> {
    if dims == 0 {
        return Err(KbError::validation("embedding dimension must be > 0"));
    }

    let mut tx = pool.begin().await.map_err(db_err)?;

    sqlx::query(&format!(
        "INSERT INTO {CATALOG_TABLE} (name, dims, created_at) VALUES (?, ?, ?) \
         ON CONFLICT(name) DO NOTHING"
    ))
    .bind(name.as_str())
    .bind(dims as i64)
    .bind(now_millis())
    .execute(&mut *tx)
    .await
    .map_err(db_err)?;

    let info = read_info(&mut tx, name)
        .await?
        .ok_or_else(|| KbError::Backend(format!("catalog row for {} vanished", name)))?;

    if info.dims != dims {
        // Dropping `tx` rolls back the (no-op) claim.
        return Err(KbError::Schema(format!(
            "collection {} exists with embedding dimension {}, requested {}",
            name, info.dims, dims
        )));
    }

    let tables = Tables::for_collection(name);
    for ddl in create_statements(name, &tables) {
        sqlx::query(&ddl)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
    }

    tx.commit().await.map_err(db_err)?;
    Ok(info)
}

/// Read a collection's catalog entry.
pub async fn collection_info(
    pool: &SqlitePool,
    name: &CollectionName,
) -> Result<Option<CollectionInfo>> {
    let mut conn = pool.acquire().await.map_err(db_err)?;
    read_info(&mut conn, name).await
}

/// Read a catalog entry on an already-acquired connection.
pub async fn read_info(
    conn: &mut SqliteConnection,
    name: &CollectionName,
) -> Result<Option<CollectionInfo>> {
    let row = sqlx::query(&format!(
        "SELECT name, dims, created_at FROM {CATALOG_TABLE} WHERE name = ?"
    ))
    .bind(name.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    match row {
        Some(row) => {
            let dims: i64 = row.try_get("dims").map_err(db_err)?;
            Ok(Some(CollectionInfo {
                name: row.try_get("name").map_err(db_err)?,
                dims: dims as usize,
                created_at: row.try_get("created_at").map_err(db_err)?,
            }))
        }
        None => Ok(None),
    }
}

fn create_statements(name: &CollectionName, t: &Tables) -> Vec<String> {
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                text TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{{}}',
                content_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            t.documents
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{}_documents_updated_at\" ON {}(updated_at DESC)",
            name, t.documents
        ),
        format!(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS {} USING fts5(
                doc_id UNINDEXED,
                text
            )
            "#,
            t.fts
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                doc_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (doc_id, key)
            )
            "#,
            t.metadata
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{}_metadata_key_value\" ON {}(key, value)",
            name, t.metadata
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;

    async fn pool() -> (tempfile::TempDir, SqlitePool) {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = DbConfig {
            url: format!("sqlite://{}", tmp.path().join("kb.sqlite").display()),
            ..DbConfig::default()
        };
        let pool = crate::db::connect(&config).await.unwrap();
        (tmp, pool)
    }

    async fn table_names(pool: &SqlitePool) -> Vec<String> {
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type IN ('table', 'index')")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_creates_tables_and_is_idempotent() {
        let (_tmp, pool) = pool().await;
        let name = CollectionName::parse("kb_acme").unwrap();

        let first = ensure_collection(&pool, &name, 8).await.unwrap();
        let second = ensure_collection(&pool, &name, 8).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.dims, 8);

        let names = table_names(&pool).await;
        for expected in [
            "kb_acme_documents",
            "kb_acme_fts",
            "kb_acme_metadata",
            "kb_acme_documents_updated_at",
            "kb_acme_metadata_key_value",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }

    #[tokio::test]
    async fn test_dimension_conflict_is_schema_error() {
        let (_tmp, pool) = pool().await;
        let name = CollectionName::parse("kb_acme").unwrap();
        ensure_collection(&pool, &name, 8).await.unwrap();

        let err = ensure_collection(&pool, &name, 16).await.unwrap_err();
        assert!(matches!(err, KbError::Schema(_)));

        let info = collection_info(&pool, &name).await.unwrap().unwrap();
        assert_eq!(info.dims, 8);
    }

    #[tokio::test]
    async fn test_concurrent_initializers_agree() {
        let (_tmp, pool) = pool().await;
        let name = CollectionName::parse("kb_race").unwrap();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let name = name.clone();
            handles.push(tokio::spawn(async move {
                ensure_collection(&pool, &name, 4).await
            }));
        }
        let mut created = Vec::new();
        for h in handles {
            created.push(h.await.unwrap().unwrap().created_at);
        }
        created.dedup();
        assert_eq!(created.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_collection_info() {
        let (_tmp, pool) = pool().await;
        let name = CollectionName::parse("kb_ghost").unwrap();
        assert!(collection_info(&pool, &name).await.unwrap().is_none());
        assert!(matches!(
            ensure_collection(&pool, &name, 0).await,
            Err(KbError::Validation(_))
        ));
    }
}
