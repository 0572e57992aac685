//! The `KnowledgeBase` facade: one handle owning the pool, the embedder, the
//! collection registry, and the ranker.
//!
//! Every public method takes a tenant key, resolves it to a collection,
//! makes sure the collection exists (once per process, via the registry
//! cache), and runs the requested core operation under a deadline derived
//! from `db.operation_timeout_ms`. The CLI and the HTTP server are thin
//! layers over this type.

use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;

use kbstore_core::embedding::Embedder;
use kbstore_core::ingest::{self, IngestRequest, SOURCE_KEY};
use kbstore_core::maintenance;
use kbstore_core::models::{CollectionInfo, Metadata, QueryHit, StoredDocument};
use kbstore_core::registry::{CollectionName, CollectionRegistry};
use kbstore_core::search::{self, HybridRanker, QueryRequest};
use kbstore_core::store::{Deadline, Store};
use kbstore_core::{KbError, Result};

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::sqlite_store::SqliteStore;

/// Metadata key the `category` query shortcut filters on.
pub const CATEGORY_KEY: &str = "category";

/// Options for [`KnowledgeBase::query`]. `None` falls back to `[retrieval]`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub top_k: Option<i64>,
    pub alpha: Option<f64>,
    pub category: Option<String>,
}

/// Options for [`KnowledgeBase::add_document`]. `None` falls back to `[chunking]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkOptions {
    pub chunk_size: Option<usize>,
    pub overlap: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub total_chunks: u64,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub backend: String,
    pub collection_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `"ok"` when the database answered a ping, `"degraded"` otherwise.
    pub status: String,
    pub version: String,
    pub backend: String,
    pub pool_size: u32,
    pub idle_connections: usize,
}

pub struct KnowledgeBase {
    config: Arc<Config>,
    store: SqliteStore,
    embedder: Arc<dyn Embedder>,
    registry: CollectionRegistry,
    ranker: HybridRanker,
}

impl KnowledgeBase {
    /// Connect to the configured database and build the configured embedder.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let pool = db::connect(&config.db).await?;
        Self::from_parts(config, pool, embedder)
    }

    /// Assemble from an existing pool and embedder, e.g. a test double.
    pub fn from_parts(
        config: Config,
        pool: SqlitePool,
        embedder: Arc<dyn Embedder>,
    ) -> anyhow::Result<Self> {
        let registry = CollectionRegistry::new(&config.collections.prefix)?;
        Ok(Self {
            config: Arc::new(config),
            store: SqliteStore::new(pool),
            embedder,
            registry,
            ranker: HybridRanker::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.config.db.operation_timeout())
    }

    /// Resolve `tenant` and make sure its collection exists.
    pub async fn collection(&self, tenant: &str) -> Result<CollectionName> {
        let name = self.registry.resolve(tenant)?;
        if !self.registry.is_verified(&name) {
            self.ensure(&name).await?;
        }
        Ok(name)
    }

    async fn ensure(&self, name: &CollectionName) -> Result<CollectionInfo> {
        let info = self
            .store
            .ensure_collection(name, self.embedder.dims(), self.deadline())
            .await?;
        self.registry.mark_verified(name);
        tracing::info!(collection = %name, dims = info.dims, "collection ready");
        Ok(info)
    }

    /// Explicitly create (or verify) a tenant's collection.
    pub async fn init_collection(&self, tenant: &str) -> Result<CollectionInfo> {
        let name = self.registry.resolve(tenant)?;
        self.ensure(&name).await
    }

    /// Chunk, embed, and store one source document. Returns chunks written.
    pub async fn add_document(
        &self,
        tenant: &str,
        content: &str,
        metadata: &Metadata,
        chunking: ChunkOptions,
    ) -> Result<usize> {
        let name = self.collection(tenant).await?;
        let req = IngestRequest {
            content,
            metadata,
            chunk_size: chunking.chunk_size.unwrap_or(self.config.chunking.chunk_size),
            overlap: chunking.overlap.unwrap_or(self.config.chunking.overlap),
        };
        let result = ingest::add_document(
            &self.store,
            self.embedder.as_ref(),
            &name,
            &req,
            self.config.embedding.batch_size,
            self.deadline(),
        )
        .await;
        self.forget_on_schema_error(&name, result)
    }

    /// Hybrid query. Skips the embedding call entirely when `alpha == 0`.
    pub async fn query(
        &self,
        tenant: &str,
        query_text: &str,
        options: &QueryOptions,
    ) -> Result<Vec<QueryHit>> {
        let name = self.collection(tenant).await?;
        let alpha = options.alpha.unwrap_or(self.config.retrieval.alpha);
        let top_k = options.top_k.unwrap_or(self.config.retrieval.top_k);
        if !(0.0..=1.0).contains(&alpha) {
            return Err(KbError::validation(format!(
                "alpha must be within [0, 1], got {}",
                alpha
            )));
        }

        let query_embedding = if alpha > 0.0 && top_k > 0 {
            Some(self.embed_query(query_text).await?)
        } else {
            None
        };

        let mut filter = Metadata::new();
        if let Some(category) = &options.category {
            filter.insert(CATEGORY_KEY, category.as_str());
        }

        let req = QueryRequest {
            query_text,
            query_embedding: query_embedding.as_deref(),
            top_k,
            alpha,
            metadata_filter: &filter,
        };
        let result = search::query(&self.store, &self.ranker, &name, &req, self.deadline()).await;
        self.forget_on_schema_error(&name, result)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self
            .embedder
            .embed(&[text.to_string()])
            .await
            .map_err(|e| match e {
                KbError::Embedding(_) => e,
                other => KbError::Embedding(other.to_string()),
            })?;
        match vectors.pop() {
            Some(v) if vectors.is_empty() => Ok(v),
            _ => Err(KbError::Embedding(format!(
                "embedder {} did not return exactly one query vector",
                self.embedder.model_name()
            ))),
        }
    }

    /// Fetch one stored document, including its text.
    pub async fn get_document(&self, tenant: &str, id: &str) -> Result<Option<StoredDocument>> {
        let name = self.collection(tenant).await?;
        let result = self.store.get(&name, id, self.deadline()).await;
        self.forget_on_schema_error(&name, result)
    }

    /// Delete every chunk ingested from `source`.
    pub async fn delete_by_source(&self, tenant: &str, source: &str) -> Result<bool> {
        if source.trim().is_empty() {
            return Err(KbError::validation(format!(
                "{} must not be empty",
                SOURCE_KEY
            )));
        }
        let name = self.collection(tenant).await?;
        let result =
            maintenance::delete_by_source(&self.store, &name, source, self.deadline()).await;
        self.forget_on_schema_error(&name, result)
    }

    pub async fn statistics(&self, tenant: &str) -> Result<StatsReport> {
        let name = self.collection(tenant).await?;
        let result = maintenance::get_statistics(&self.store, &name, self.deadline()).await;
        let stats = self.forget_on_schema_error(&name, result)?;
        Ok(StatsReport {
            total_chunks: stats.document_count,
            embedding_model: self.embedder.model_name().to_string(),
            embedding_dimension: stats.embedding_dimension,
            backend: self.store.backend_name().to_string(),
            collection_name: stats.collection_name,
        })
    }

    /// Ping the database and report pool occupancy.
    pub async fn health(&self) -> HealthReport {
        let pool = self.store.pool();
        let ok = sqlx::query("SELECT 1").execute(pool).await.is_ok();
        HealthReport {
            status: if ok { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            backend: self.store.backend_name().to_string(),
            pool_size: pool.size(),
            idle_connections: pool.num_idle(),
        }
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn shutdown(&self) {
        self.store.pool().close().await;
        tracing::debug!("database pool closed");
    }

    /// A `Schema` error after verification means the tables went away under
    /// us; drop the cache entry so the next call re-runs `ensure_collection`.
    fn forget_on_schema_error<T>(&self, name: &CollectionName, result: Result<T>) -> Result<T> {
        if let Err(KbError::Schema(_)) = &result {
            self.registry.forget(name);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    async fn kb(extra: &str) -> (tempfile::TempDir, KnowledgeBase) {
        let tmp = tempfile::TempDir::new().unwrap();
        let toml = format!(
            "[db]\nurl = \"sqlite://{}\"\n\n[embedding]\ndims = 64\n{}",
            tmp.path().join("kb.sqlite").display(),
            extra
        );
        let config = parse_config(&toml).unwrap();
        (tmp, KnowledgeBase::open(config).await.unwrap())
    }

    #[tokio::test]
    async fn test_collection_is_ensured_once_and_cached() {
        let (_tmp, kb) = kb("").await;
        let name = kb.collection("acme").await.unwrap();
        assert_eq!(name.as_str(), "kb_acme");
        assert!(kb.registry.is_verified(&name));
        // Cached path does not touch the store.
        assert_eq!(kb.collection("acme").await.unwrap(), name);
    }

    #[tokio::test]
    async fn test_invalid_tenant() {
        let (_tmp, kb) = kb("").await;
        assert!(matches!(
            kb.collection("acme-corp").await,
            Err(KbError::InvalidTenantKey(_))
        ));
        assert!(matches!(
            kb.query("", "x", &QueryOptions::default()).await,
            Err(KbError::InvalidTenantKey(_))
        ));
    }

    #[tokio::test]
    async fn test_statistics_report() {
        let (_tmp, kb) = kb("").await;
        let meta = Metadata::new().with("source", "a.md");
        kb.add_document("t1", "hello world", &meta, ChunkOptions::default())
            .await
            .unwrap();
        let stats = kb.statistics("t1").await.unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.embedding_model, "hashing-v1");
        assert_eq!(stats.embedding_dimension, 64);
        assert_eq!(stats.backend, "sqlite");
        assert_eq!(stats.collection_name, "kb_t1");
    }

    #[tokio::test]
    async fn test_keyword_only_query_works_without_embeddings() {
        let (tmp, kb) = kb("").await;
        let meta = Metadata::new().with("source", "a.md");
        kb.add_document("t1", "kiwi smoothie recipe", &meta, ChunkOptions::default())
            .await
            .unwrap();
        kb.shutdown().await;

        // Reopen the same file with embeddings disabled.
        let toml = format!(
            "[db]\nurl = \"sqlite://{}\"\n\n[embedding]\nprovider = \"disabled\"\ndims = 64\n",
            tmp.path().join("kb.sqlite").display()
        );
        let kb = KnowledgeBase::open(parse_config(&toml).unwrap()).await.unwrap();
        let hits = kb
            .query(
                "t1",
                "kiwi",
                &QueryOptions {
                    alpha: Some(0.0),
                    ..QueryOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let res = kb.query("t1", "kiwi", &QueryOptions::default()).await;
        assert!(matches!(res, Err(KbError::Embedding(_))));
    }

    #[tokio::test]
    async fn test_changed_dimension_is_schema_conflict() {
        let (tmp, kb) = kb("").await;
        kb.init_collection("t1").await.unwrap();
        kb.shutdown().await;

        let toml = format!(
            "[db]\nurl = \"sqlite://{}\"\n\n[embedding]\ndims = 32\n",
            tmp.path().join("kb.sqlite").display()
        );
        let kb = KnowledgeBase::open(parse_config(&toml).unwrap()).await.unwrap();
        assert!(matches!(
            kb.statistics("t1").await,
            Err(KbError::Schema(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_tables_reset_verified_cache() {
        let (_tmp, kb) = kb("").await;
        let meta = Metadata::new().with(SOURCE_KEY, "a.md");
        kb.add_document("t1", "kiwi orchard", &meta, ChunkOptions::default())
            .await
            .unwrap();
        let name = kb.collection("t1").await.unwrap();

        let t = crate::schema::Tables::for_collection(&name);
        sqlx::query(&format!("DROP TABLE {}", t.documents))
            .execute(kb.store.pool())
            .await
            .unwrap();

        assert!(kb.registry.is_verified(&name));
        assert!(matches!(
            kb.query("t1", "kiwi", &QueryOptions::default()).await,
            Err(KbError::Schema(_))
        ));
        assert!(!kb.registry.is_verified(&name));

        kb.registry.mark_verified(&name);
        assert!(matches!(
            kb.get_document("t1", "a.md_0").await,
            Err(KbError::Schema(_))
        ));
        assert!(!kb.registry.is_verified(&name));

        kb.registry.mark_verified(&name);
        assert!(matches!(
            kb.delete_by_source("t1", "a.md").await,
            Err(KbError::Schema(_))
        ));
        assert!(!kb.registry.is_verified(&name));
    }

    #[tokio::test]
    async fn test_health() {
        let (_tmp, kb) = kb("").await;
        let h = kb.health().await;
        assert_eq!(h.status, "ok");
        assert_eq!(h.backend, "sqlite");
        assert!(h.pool_size >= 1);
        assert_eq!(h.version, env!("CARGO_PKG_VERSION"));
    }
}
