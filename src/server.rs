//! JSON HTTP API over a [`KnowledgeBase`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/collections/{tenant}/documents` | Chunk, embed, and store a document |
//! | `DELETE` | `/collections/{tenant}/documents` | Delete every chunk of a source |
//! | `GET` | `/collections/{tenant}/documents/{id}` | Fetch one stored chunk with its text |
//! | `POST` | `/collections/{tenant}/query` | Hybrid vector + keyword query |
//! | `GET` | `/collections/{tenant}/stats` | Chunk count, model, dimension |
//! | `GET` | `/health` | Database ping, version, pool occupancy |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "content must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `dimension_mismatch` (400), `not_found` (404),
//! `timeout` (408), `schema_conflict` (409), `internal` (500),
//! `embedding_error` (502), `backend_unavailable` (503).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use kbstore_core::models::{Metadata, StoredDocument};
use kbstore_core::KbError;

use crate::config::Config;
use crate::service::{
    ChunkOptions, HealthReport, KnowledgeBase, QueryOptions, StatsReport, CATEGORY_KEY,
};

type AppState = Arc<KnowledgeBase>;

/// Build the router. Exposed separately from [`run_server`] so tests can
/// serve it on an ephemeral port.
pub fn router(kb: Arc<KnowledgeBase>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/collections/{tenant}/documents",
            post(handle_add_document).delete(handle_delete_source),
        )
        .route("/collections/{tenant}/documents/{id}", get(handle_get_document))
        .route("/collections/{tenant}/query", post(handle_query))
        .route("/collections/{tenant}/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(kb)
}

/// Open the knowledge base and serve until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let kb = Arc::new(KnowledgeBase::open(config.clone()).await?);
    let app = router(kb.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    kb.shutdown().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"timeout"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = %self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<KbError> for AppError {
    fn from(err: KbError) -> Self {
        let status = match &err {
            KbError::Validation(_) | KbError::InvalidTenantKey(_) => StatusCode::BAD_REQUEST,
            KbError::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
            KbError::Schema(_) => StatusCode::CONFLICT,
            KbError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            KbError::Embedding(_) => StatusCode::BAD_GATEWAY,
            KbError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            KbError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Constructs a 404 Not Found error.
fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ POST /collections/{tenant}/documents ============

#[derive(Deserialize)]
struct AddDocumentBody {
    content: String,
    #[serde(default)]
    metadata: Metadata,
    chunk_size: Option<usize>,
    overlap: Option<usize>,
}

#[derive(Serialize)]
struct AddDocumentResponse {
    chunks_written: usize,
}

async fn handle_add_document(
    State(kb): State<AppState>,
    Path(tenant): Path<String>,
    body: Result<Json<AddDocumentBody>, JsonRejection>,
) -> Result<Json<AddDocumentResponse>, AppError> {
    let Json(body) = body?;
    let chunks_written = kb
        .add_document(
            &tenant,
            &body.content,
            &body.metadata,
            ChunkOptions {
                chunk_size: body.chunk_size,
                overlap: body.overlap,
            },
        )
        .await?;
    Ok(Json(AddDocumentResponse { chunks_written }))
}

// ============ DELETE /collections/{tenant}/documents ============

#[derive(Deserialize)]
struct DeleteBody {
    source: String,
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn handle_delete_source(
    State(kb): State<AppState>,
    Path(tenant): Path<String>,
    body: Result<Json<DeleteBody>, JsonRejection>,
) -> Result<Json<DeleteResponse>, AppError> {
    let Json(body) = body?;
    let deleted = kb.delete_by_source(&tenant, &body.source).await?;
    Ok(Json(DeleteResponse { deleted }))
}

// ============ GET /collections/{tenant}/documents/{id} ============

async fn handle_get_document(
    State(kb): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Result<Json<StoredDocument>, AppError> {
    kb.get_document(&tenant, &id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("no document with id: {}", id)))
}

// ============ POST /collections/{tenant}/query ============

#[derive(Deserialize)]
struct QueryBody {
    #[serde(default)]
    query_text: String,
    top_k: Option<i64>,
    category: Option<String>,
    alpha: Option<f64>,
}

/// One ranked hit. `category` and `source` are lifted out of `metadata`
/// for convenience; either is `""` when the chunk has no string value for it.
#[derive(Serialize)]
struct QueryResultItem {
    id: String,
    score: f64,
    metadata: Metadata,
    category: String,
    source: String,
}

async fn handle_query(
    State(kb): State<AppState>,
    Path(tenant): Path<String>,
    body: Result<Json<QueryBody>, JsonRejection>,
) -> Result<Json<Vec<QueryResultItem>>, AppError> {
    let Json(body) = body?;
    let options = QueryOptions {
        top_k: body.top_k,
        alpha: body.alpha,
        category: body.category,
    };
    let hits = kb.query(&tenant, &body.query_text, &options).await?;

    let items = hits
        .into_iter()
        .map(|hit| QueryResultItem {
            category: hit
                .metadata
                .get_str(CATEGORY_KEY)
                .unwrap_or_default()
                .to_string(),
            source: hit.metadata.get_str("source").unwrap_or_default().to_string(),
            id: hit.id,
            score: hit.score,
            metadata: hit.metadata,
        })
        .collect();
    Ok(Json(items))
}

// ============ GET /collections/{tenant}/stats ============

async fn handle_stats(
    State(kb): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<StatsReport>, AppError> {
    Ok(Json(kb.statistics(&tenant).await?))
}

// ============ GET /health ============

async fn handle_health(State(kb): State<AppState>) -> Json<HealthReport> {
    Json(kb.health().await)
}
