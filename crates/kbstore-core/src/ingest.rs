//! Ingestion pipeline: raw text + metadata → chunked, embedded documents.
//!
//! Coordinates chunk → embed → store for one source document. The write is a
//! single [`Store::upsert`] batch, so a failure at any step leaves the
//! collection exactly as it was.
//!
//! Chunk ids are `<source>_<index>`. Re-ingesting a source that produces the
//! same number of chunks overwrites them in place. If the chunk count
//! shrinks, chunks from the previous, longer split stay behind; callers that
//! want a clean re-index delete by source first.

use crate::chunk::chunk_text;
use crate::embedding::Embedder;
use crate::error::{KbError, Result};
use crate::models::{DocumentInput, Metadata, MetadataValue};
use crate::registry::CollectionName;
use crate::store::{Deadline, Store};

/// Metadata key every ingested document must carry.
pub const SOURCE_KEY: &str = "source";
/// Metadata key added to each chunk with its position in the source.
pub const CHUNK_INDEX_KEY: &str = "chunk_index";

/// One source document to ingest.
#[derive(Debug, Clone)]
pub struct IngestRequest<'a> {
    pub content: &'a str,
    /// Must contain a non-empty string `source`.
    pub metadata: &'a Metadata,
    pub chunk_size: usize,
    pub overlap: usize,
}

/// Chunk, embed, and store `req.content`. Returns the number of chunks written.
///
/// Chunks consisting only of whitespace are skipped (their index is not
/// reused), since every stored document must carry text.
///
/// # Errors
///
/// - `Validation` for blank content, a missing `source`, bad metadata, or
///   bad chunking parameters.
/// - `Embedding` if the embedder fails or returns the wrong number of
///   vectors; nothing is written.
/// - `Timeout` if `deadline` passes between embedding batches.
/// - Anything [`Store::upsert`] reports, e.g. `DimensionMismatch`.
pub async fn add_document<S, E>(
    store: &S,
    embedder: &E,
    collection: &CollectionName,
    req: &IngestRequest<'_>,
    batch_size: usize,
    deadline: Deadline,
) -> Result<usize>
where
    S: Store + ?Sized,
    E: Embedder + ?Sized,
{
    if req.content.trim().is_empty() {
        return Err(KbError::validation("content must not be empty"));
    }
    req.metadata.validate()?;
    let source = match req.metadata.get_str(SOURCE_KEY) {
        Some(s) if !s.trim().is_empty() => s,
        _ => {
            return Err(KbError::validation(
                "metadata.source must be a non-empty string",
            ))
        }
    };

    let chunks: Vec<_> = chunk_text(req.content, req.chunk_size, req.overlap)?
        .into_iter()
        .filter(|c| !c.text.trim().is_empty())
        .collect();

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embed_all(embedder, &texts, batch_size, deadline).await?;

    let docs: Vec<DocumentInput> = chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, embedding)| {
            let mut metadata = req.metadata.clone();
            metadata.insert(
                CHUNK_INDEX_KEY,
                MetadataValue::Integer(chunk.index as i64),
            );
            DocumentInput {
                id: format!("{}_{}", source, chunk.index),
                embedding,
                text: chunk.text,
                metadata,
            }
        })
        .collect();

    let summary = store.upsert(collection, &docs, deadline).await?;

    tracing::info!(
        collection = %collection,
        source,
        chunks = docs.len(),
        inserted = summary.inserted,
        updated = summary.updated,
        "document ingested"
    );

    Ok(docs.len())
}

/// Embed `texts` in batches, checking the shape of every response.
async fn embed_all<E: Embedder + ?Sized>(
    embedder: &E,
    texts: &[String],
    batch_size: usize,
    deadline: Deadline,
) -> Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        if deadline.is_expired() {
            return Err(deadline.timeout_error());
        }
        let out = embedder.embed(batch).await.map_err(|e| match e {
            KbError::Embedding(_) => e,
            other => KbError::Embedding(other.to_string()),
        })?;
        if out.len() != batch.len() {
            return Err(KbError::Embedding(format!(
                "embedder {} returned {} vectors for {} texts",
                embedder.model_name(),
                out.len(),
                batch.len()
            )));
        }
        vectors.extend(out);
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds text as `[len, vowels, 1]`.
    struct ShapeEmbedder {
        dims: usize,
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
        drop_one: bool,
    }

    impl ShapeEmbedder {
        fn new(dims: usize) -> Self {
            Self {
                dims,
                calls: AtomicUsize::new(0),
                fail_on_call: None,
                drop_one: false,
            }
        }
    }

    #[async_trait]
    impl Embedder for ShapeEmbedder {
        fn model_name(&self) -> &str {
            "shape"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_call == Some(call) {
                return Err(KbError::Embedding("model offline".into()));
            }
            let mut out: Vec<Vec<f32>> = texts
                .iter()
                .map(|t| {
                    let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count();
                    let mut v = vec![t.len() as f32, vowels as f32, 1.0];
                    v.resize(self.dims, 0.0);
                    v
                })
                .collect();
            if self.drop_one {
                out.pop();
            }
            Ok(out)
        }
    }

    fn meta(source: &str) -> Metadata {
        Metadata::new().with("source", source).with("category", "docs")
    }

    async fn setup(dims: usize) -> (InMemoryStore, CollectionName) {
        let store = InMemoryStore::new();
        let c = CollectionName::parse("kb_t1").unwrap();
        store.ensure_collection(&c, dims, Deadline::none()).await.unwrap();
        (store, c)
    }

    #[tokio::test]
    async fn test_single_chunk_document() {
        let (store, c) = setup(3).await;
        let embedder = ShapeEmbedder::new(3);
        let m = meta("test.md");
        let req = IngestRequest {
            content: "This is a test document about Python programming.",
            metadata: &m,
            chunk_size: 1000,
            overlap: 200,
        };
        let n = add_document(&store, &embedder, &c, &req, 64, Deadline::none())
            .await
            .unwrap();
        assert_eq!(n, 1);

        let doc = store.get(&c, "test.md_0", Deadline::none()).await.unwrap().unwrap();
        assert_eq!(doc.metadata.get_str("category"), Some("docs"));
        assert_eq!(doc.metadata.get("chunk_index"), Some(&MetadataValue::Integer(0)));
    }

    #[tokio::test]
    async fn test_multi_chunk_single_upsert_and_batching() {
        let (store, c) = setup(3).await;
        let embedder = ShapeEmbedder::new(3);
        let content = "lorem ipsum dolor sit amet ".repeat(200);
        let m = meta("big.md");
        let req = IngestRequest {
            content: &content,
            metadata: &m,
            chunk_size: 500,
            overlap: 100,
        };
        let n = add_document(&store, &embedder, &c, &req, 4, Deadline::none())
            .await
            .unwrap();
        assert!(n > 4);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), n.div_ceil(4));
        let stats = store.get_statistics(&c, Deadline::none()).await.unwrap();
        assert_eq!(stats.document_count, n as u64);
    }

    #[tokio::test]
    async fn test_embedding_failure_writes_nothing() {
        let (store, c) = setup(3).await;
        let mut embedder = ShapeEmbedder::new(3);
        embedder.fail_on_call = Some(1);
        let content = "word ".repeat(500);
        let m = meta("fail.md");
        let req = IngestRequest {
            content: &content,
            metadata: &m,
            chunk_size: 200,
            overlap: 20,
        };
        let res = add_document(&store, &embedder, &c, &req, 2, Deadline::none()).await;
        assert!(matches!(res, Err(KbError::Embedding(_))));
        let stats = store.get_statistics(&c, Deadline::none()).await.unwrap();
        assert_eq!(stats.document_count, 0);
    }

    #[tokio::test]
    async fn test_wrong_vector_count_is_embedding_error() {
        let (store, c) = setup(3).await;
        let mut embedder = ShapeEmbedder::new(3);
        embedder.drop_one = true;
        let m = meta("a.md");
        let req = IngestRequest {
            content: "short",
            metadata: &m,
            chunk_size: 100,
            overlap: 10,
        };
        let res = add_document(&store, &embedder, &c, &req, 8, Deadline::none()).await;
        assert!(matches!(res, Err(KbError::Embedding(_))));
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected() {
        let (store, c) = setup(3).await;
        let embedder = ShapeEmbedder::new(5);
        let m = meta("a.md");
        let req = IngestRequest {
            content: "short",
            metadata: &m,
            chunk_size: 100,
            overlap: 10,
        };
        let res = add_document(&store, &embedder, &c, &req, 8, Deadline::none()).await;
        assert!(matches!(res, Err(KbError::DimensionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_validation() {
        let (store, c) = setup(3).await;
        let embedder = ShapeEmbedder::new(3);
        let good = meta("a.md");
        let no_source = Metadata::new().with("category", "docs");
        let numeric_source = Metadata::new().with("source", 7i64);

        for (content, m, size, overlap) in [
            ("   ", &good, 100, 10),
            ("text", &no_source, 100, 10),
            ("text", &numeric_source, 100, 10),
            ("text", &good, 100, 100),
            ("text", &good, 0, 0),
        ] {
            let req = IngestRequest {
                content,
                metadata: m,
                chunk_size: size,
                overlap,
            };
            let res = add_document(&store, &embedder, &c, &req, 8, Deadline::none()).await;
            assert!(matches!(res, Err(KbError::Validation(_))));
        }
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reingest_overwrites_and_shrink_leaves_orphans() {
        let (store, c) = setup(3).await;
        let embedder = ShapeEmbedder::new(3);
        let m = meta("doc.md");
        let long = "alpha beta gamma delta ".repeat(40);

        let first = add_document(
            &store,
            &embedder,
            &c,
            &IngestRequest {
                content: &long,
                metadata: &m,
                chunk_size: 200,
                overlap: 20,
            },
            16,
            Deadline::none(),
        )
        .await
        .unwrap();
        assert!(first > 1);

        let again = add_document(
            &store,
            &embedder,
            &c,
            &IngestRequest {
                content: &long,
                metadata: &m,
                chunk_size: 200,
                overlap: 20,
            },
            16,
            Deadline::none(),
        )
        .await
        .unwrap();
        assert_eq!(again, first);
        let stats = store.get_statistics(&c, Deadline::none()).await.unwrap();
        assert_eq!(stats.document_count, first as u64);

        let shorter = add_document(
            &store,
            &embedder,
            &c,
            &IngestRequest {
                content: "alpha beta",
                metadata: &m,
                chunk_size: 200,
                overlap: 20,
            },
            16,
            Deadline::none(),
        )
        .await
        .unwrap();
        assert_eq!(shorter, 1);
        let stats = store.get_statistics(&c, Deadline::none()).await.unwrap();
        assert_eq!(stats.document_count, first as u64);
        let head = store.get(&c, "doc.md_0", Deadline::none()).await.unwrap().unwrap();
        assert_eq!(head.text, "alpha beta");
    }
}
