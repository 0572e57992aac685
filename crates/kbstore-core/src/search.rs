//! Hybrid query engine: vector similarity blended with full-text relevance.
//!
//! The engine operates entirely through the [`Store`] trait. The caller is
//! responsible for embedding the query text and passing the vector in.
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Fetch every candidate passing the metadata filter, each carrying its
//!    embedding and raw full-text rank for the query terms.
//! 2. Vector score: cosine similarity mapped to `[0, 1]` as `(cos + 1) / 2`.
//! 3. Lexical score: raw rank divided by the best raw rank among the
//!    candidates, so it lies in `(0, 1]` for matches and is `0` otherwise.
//! 4. Merge: `score = α × vector + (1 − α) × lexical`.
//! 5. Sort by score (desc), updated_at (desc), id (asc).
//! 6. Truncate to `top_k`.
//!
//! Both scores come from [`Scorer`] implementations, so a different
//! similarity metric or relevance function can be swapped in without
//! touching the blend or the tie-break order.

use std::cmp::Ordering;

use crate::embedding::cosine_similarity;
use crate::error::{KbError, Result};
use crate::models::{MetadataFilter, QueryHit};
use crate::registry::CollectionName;
use crate::store::{Candidate, Deadline, Store};

/// Inputs for a single hybrid query.
#[derive(Debug, Clone)]
pub struct QueryRequest<'a> {
    pub query_text: &'a str,
    /// Query vector; `None` means every vector score is zero.
    pub query_embedding: Option<&'a [f32]>,
    /// Maximum results. Zero or negative returns nothing.
    pub top_k: i64,
    /// `1.0` = pure vector, `0.0` = pure keyword.
    pub alpha: f64,
    pub metadata_filter: &'a MetadataFilter,
}

/// What a [`Scorer`] sees besides the candidate itself.
#[derive(Debug, Clone)]
pub struct ScoringContext<'a> {
    pub query_text: &'a str,
    pub query_embedding: Option<&'a [f32]>,
    /// Largest `text_rank` among all candidates of this query (0 if none).
    pub best_text_rank: f64,
}

/// A pluggable relevance signal producing scores in `[0, 1]`.
pub trait Scorer: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, ctx: &ScoringContext<'_>, candidate: &Candidate) -> f64;
}

/// Cosine similarity rescaled to `[0, 1]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineScorer;

impl Scorer for CosineScorer {
    fn name(&self) -> &'static str {
        "cosine"
    }

    fn score(&self, ctx: &ScoringContext<'_>, candidate: &Candidate) -> f64 {
        match ctx.query_embedding {
            Some(q) => {
                let cos = cosine_similarity(q, &candidate.embedding) as f64;
                ((cos + 1.0) / 2.0).clamp(0.0, 1.0)
            }
            None => 0.0,
        }
    }
}

/// Full-text rank normalized against the best rank of the query.
#[derive(Debug, Default, Clone, Copy)]
pub struct Bm25Scorer;

impl Scorer for Bm25Scorer {
    fn name(&self) -> &'static str {
        "bm25"
    }

    fn score(&self, ctx: &ScoringContext<'_>, candidate: &Candidate) -> f64 {
        match candidate.text_rank {
            Some(rank) if ctx.best_text_rank > 0.0 => (rank / ctx.best_text_rank).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

/// Blends a vector scorer and a lexical scorer and owns the result order.
pub struct HybridRanker {
    vector: Box<dyn Scorer>,
    lexical: Box<dyn Scorer>,
}

impl Default for HybridRanker {
    fn default() -> Self {
        Self::new(Box::new(CosineScorer), Box::new(Bm25Scorer))
    }
}

struct Scored {
    candidate: Candidate,
    score: f64,
}

impl HybridRanker {
    pub fn new(vector: Box<dyn Scorer>, lexical: Box<dyn Scorer>) -> Self {
        Self { vector, lexical }
    }

    pub fn scorer_names(&self) -> (&'static str, &'static str) {
        (self.vector.name(), self.lexical.name())
    }

    /// Score, order, and truncate `candidates`.
    pub fn rank(
        &self,
        query_text: &str,
        query_embedding: Option<&[f32]>,
        alpha: f64,
        candidates: Vec<Candidate>,
        top_k: usize,
    ) -> Vec<QueryHit> {
        let best_text_rank = candidates
            .iter()
            .filter_map(|c| c.text_rank)
            .fold(0.0f64, f64::max);

        let ctx = ScoringContext {
            query_text,
            query_embedding,
            best_text_rank,
        };

        let mut scored: Vec<Scored> = candidates
            .into_iter()
            .map(|candidate| {
                let v = if alpha > 0.0 {
                    self.vector.score(&ctx, &candidate)
                } else {
                    0.0
                };
                let k = if alpha < 1.0 {
                    self.lexical.score(&ctx, &candidate)
                } else {
                    0.0
                };
                Scored {
                    score: alpha * v + (1.0 - alpha) * k,
                    candidate,
                }
            })
            .collect();

        scored.sort_by(compare_scored);
        scored.truncate(top_k);

        scored
            .into_iter()
            .map(|s| QueryHit {
                id: s.candidate.id,
                score: s.score,
                metadata: s.candidate.metadata,
            })
            .collect()
    }
}

/// Score desc, then most recently updated, then id asc.
fn compare_scored(a: &Scored, b: &Scored) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(b.candidate.updated_at.cmp(&a.candidate.updated_at))
        .then_with(|| a.candidate.id.cmp(&b.candidate.id))
}

/// Run a hybrid query against a [`Store`] backend.
///
/// Degenerate inputs return an empty list rather than an error: `top_k <= 0`,
/// a collection that does not exist yet, or no candidates after filtering.
///
/// # Errors
///
/// - `Validation` when `alpha` is outside `[0, 1]`.
/// - `DimensionMismatch` when the query vector has the wrong length.
/// - Whatever the store reports (timeouts, backend failures).
pub async fn query<S: Store + ?Sized>(
    store: &S,
    ranker: &HybridRanker,
    collection: &CollectionName,
    req: &QueryRequest<'_>,
    deadline: Deadline,
) -> Result<Vec<QueryHit>> {
    if req.top_k <= 0 {
        return Ok(Vec::new());
    }

    if !(0.0..=1.0).contains(&req.alpha) {
        return Err(KbError::validation(format!(
            "alpha must be within [0, 1], got {}",
            req.alpha
        )));
    }

    let info = match store.collection_info(collection, deadline).await? {
        Some(info) => info,
        None => return Ok(Vec::new()),
    };

    if let Some(q) = req.query_embedding {
        if q.len() != info.dims {
            return Err(KbError::DimensionMismatch {
                collection: collection.to_string(),
                expected: info.dims,
                actual: q.len(),
            });
        }
    }

    // Pure vector search has no use for full-text ranks.
    let text_for_store = if req.alpha >= 1.0 { "" } else { req.query_text };

    let candidates = store
        .candidates(collection, req.metadata_filter, text_for_store, deadline)
        .await?;

    let hits = ranker.rank(
        req.query_text,
        req.query_embedding,
        req.alpha,
        candidates,
        req.top_k as usize,
    );

    tracing::debug!(
        collection = %collection,
        alpha = req.alpha,
        hits = hits.len(),
        "hybrid query"
    );

    Ok(hits)
}

/// Lowercased alphanumeric terms of a query, deduplicated in order.
///
/// Stores use this to build their full-text match expression so that
/// punctuation in user input never reaches the FTS parser.
pub fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.is_empty() {
            continue;
        }
        let term = raw.to_lowercase();
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;

    fn cand(id: &str, embedding: Vec<f32>, text_rank: Option<f64>, updated_at: i64) -> Candidate {
        Candidate {
            id: id.to_string(),
            embedding,
            metadata: Metadata::new(),
            updated_at,
            text_rank,
        }
    }

    fn ids(hits: &[QueryHit]) -> Vec<&str> {
        hits.iter().map(|h| h.id.as_str()).collect()
    }

    fn sample() -> Vec<Candidate> {
        vec![
            // close to the query vector, weak keyword match
            cand("a", vec![1.0, 0.0], Some(1.0), 10),
            // far from the query vector, strong keyword match
            cand("b", vec![-1.0, 0.0], Some(8.0), 10),
            // orthogonal, medium keyword match
            cand("c", vec![0.0, 1.0], Some(4.0), 10),
            // no keyword match at all
            cand("d", vec![0.9, 0.1], None, 10),
        ]
    }

    #[test]
    fn test_alpha_one_is_vector_order() {
        let ranker = HybridRanker::default();
        let hits = ranker.rank("q", Some(&[1.0, 0.0]), 1.0, sample(), 10);
        assert_eq!(ids(&hits), vec!["a", "d", "c", "b"]);
    }

    #[test]
    fn test_alpha_zero_is_keyword_order() {
        let ranker = HybridRanker::default();
        let hits = ranker.rank("q", Some(&[1.0, 0.0]), 0.0, sample(), 10);
        assert_eq!(ids(&hits)[..3], ["b", "c", "a"]);
        assert_eq!(hits[3].id, "d");
        assert_eq!(hits[3].score, 0.0);
        assert!((hits[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_scores_non_increasing() {
        let ranker = HybridRanker::default();
        for alpha in [0.0, 0.3, 0.5, 0.7, 1.0] {
            let hits = ranker.rank("q", Some(&[0.6, 0.8]), alpha, sample(), 10);
            for pair in hits.windows(2) {
                assert!(pair[0].score >= pair[1].score, "alpha={}", alpha);
            }
            for h in &hits {
                assert!((0.0..=1.0).contains(&h.score));
            }
        }
    }

    #[test]
    fn test_blend_value() {
        let ranker = HybridRanker::default();
        let hits = ranker.rank("q", Some(&[1.0, 0.0]), 0.7, sample(), 10);
        let a = hits.iter().find(|h| h.id == "a").unwrap();
        // vector 1.0, lexical 1/8
        assert!((a.score - (0.7 + 0.3 * 0.125)).abs() < 1e-9);
    }

    #[test]
    fn test_tie_breaks() {
        let ranker = HybridRanker::default();
        let candidates = vec![
            cand("b", vec![1.0], None, 5),
            cand("a", vec![1.0], None, 5),
            cand("z", vec![1.0], None, 9),
        ];
        let hits = ranker.rank("", Some(&[1.0]), 1.0, candidates, 10);
        assert_eq!(ids(&hits), vec!["z", "a", "b"]);
    }

    #[test]
    fn test_truncates_to_top_k() {
        let ranker = HybridRanker::default();
        let hits = ranker.rank("q", Some(&[1.0, 0.0]), 0.5, sample(), 2);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_no_query_vector_falls_back_to_keyword() {
        let ranker = HybridRanker::default();
        let hits = ranker.rank("q", None, 0.5, sample(), 10);
        assert_eq!(hits[0].id, "b");
    }

    #[test]
    fn test_no_text_matches_is_vector_only() {
        let ranker = HybridRanker::default();
        let candidates: Vec<Candidate> = sample()
            .into_iter()
            .map(|mut c| {
                c.text_rank = None;
                c
            })
            .collect();
        let hits = ranker.rank("", Some(&[1.0, 0.0]), 0.3, candidates, 10);
        assert_eq!(ids(&hits), vec!["a", "d", "c", "b"]);
    }

    struct ConstantScorer(f64);

    impl Scorer for ConstantScorer {
        fn name(&self) -> &'static str {
            "constant"
        }
        fn score(&self, _ctx: &ScoringContext<'_>, _candidate: &Candidate) -> f64 {
            self.0
        }
    }

    #[test]
    fn test_custom_scorer_keeps_tie_breaks() {
        let ranker = HybridRanker::new(Box::new(ConstantScorer(0.5)), Box::new(Bm25Scorer));
        assert_eq!(ranker.scorer_names(), ("constant", "bm25"));
        let candidates = vec![
            cand("b", vec![], None, 1),
            cand("a", vec![], None, 1),
        ];
        let hits = ranker.rank("", None, 1.0, candidates, 10);
        assert_eq!(ids(&hits), vec!["a", "b"]);
        assert!((hits[0].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_query_terms() {
        assert_eq!(
            query_terms("Python programming, python!"),
            vec!["python", "programming"]
        );
        assert_eq!(query_terms("test.md"), vec!["test", "md"]);
        assert!(query_terms("  ... ").is_empty());
        assert_eq!(query_terms("C++ \"quoted\" OR"), vec!["c", "quoted", "or"]);
    }

    mod engine {
        use super::super::*;
        use crate::models::{DocumentInput, Metadata};
        use crate::store::memory::InMemoryStore;

        async fn seeded() -> (InMemoryStore, CollectionName) {
            let store = InMemoryStore::new();
            let c = CollectionName::parse("kb_t1").unwrap();
            store.ensure_collection(&c, 2, Deadline::none()).await.unwrap();
            let docs = vec![
                DocumentInput {
                    id: "py_0".into(),
                    embedding: vec![1.0, 0.0],
                    text: "Python programming guide".into(),
                    metadata: Metadata::new().with("source", "py.md").with("category", "docs"),
                },
                DocumentInput {
                    id: "rs_0".into(),
                    embedding: vec![0.0, 1.0],
                    text: "Rust ownership notes".into(),
                    metadata: Metadata::new().with("source", "rs.md").with("category", "notes"),
                },
            ];
            store.upsert(&c, &docs, Deadline::none()).await.unwrap();
            (store, c)
        }

        async fn run(
            store: &InMemoryStore,
            c: &CollectionName,
            text: &str,
            emb: &[f32],
            top_k: i64,
            alpha: f64,
            filter: &Metadata,
        ) -> Result<Vec<QueryHit>> {
            let req = QueryRequest {
                query_text: text,
                query_embedding: Some(emb),
                top_k,
                alpha,
                metadata_filter: filter,
            };
            query(store, &HybridRanker::default(), c, &req, Deadline::none()).await
        }

        #[tokio::test]
        async fn test_degenerate_inputs() {
            let (store, c) = seeded().await;
            let none = Metadata::new();
            let q = [1.0, 0.0];

            assert!(run(&store, &c, "python", &q, 0, 0.5, &none)
                .await
                .unwrap()
                .is_empty());
            assert!(run(&store, &c, "python", &q, -3, 0.5, &none)
                .await
                .unwrap()
                .is_empty());

            let missing = CollectionName::parse("kb_nobody").unwrap();
            assert!(run(&store, &missing, "python", &q, 5, 0.5, &none)
                .await
                .unwrap()
                .is_empty());

            let hits = run(&store, &c, "", &[0.0, 1.0], 5, 0.2, &none)
                .await
                .unwrap();
            assert_eq!(hits[0].id, "rs_0");
        }

        #[tokio::test]
        async fn test_rejects_bad_alpha_and_dims() {
            let (store, c) = seeded().await;
            let none = Metadata::new();
            for alpha in [-0.1, 1.5, f64::NAN] {
                let res = run(&store, &c, "x", &[1.0, 0.0], 5, alpha, &none).await;
                assert!(matches!(res, Err(KbError::Validation(_))));
            }
            let res = run(&store, &c, "x", &[1.0, 0.0, 0.0], 5, 0.5, &none).await;
            assert!(matches!(
                res,
                Err(KbError::DimensionMismatch {
                    expected: 2,
                    actual: 3,
                    ..
                })
            ));
        }

        #[tokio::test]
        async fn test_filter_restricts_before_ranking() {
            let (store, c) = seeded().await;
            let filter = Metadata::new().with("category", "notes");
            let hits = run(&store, &c, "python", &[1.0, 0.0], 5, 0.7, &filter)
                .await
                .unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].id, "rs_0");
        }

        #[tokio::test]
        async fn test_keyword_and_vector_agree_on_topic() {
            let (store, c) = seeded().await;
            let none = Metadata::new();
            let hits = run(&store, &c, "Python programming", &[1.0, 0.0], 5, 0.7, &none)
                .await
                .unwrap();
            assert_eq!(hits[0].id, "py_0");
            assert_eq!(hits[0].metadata.get_str("category"), Some("docs"));
            assert!(hits[0].score > hits[1].score);
        }
    }
}
