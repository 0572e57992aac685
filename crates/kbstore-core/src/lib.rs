//! # kbstore core
//!
//! Backend-agnostic logic for kbstore: data models, the error taxonomy,
//! chunking, the embedding trait, the store abstraction, hybrid ranking,
//! ingestion, and the tenant collection registry.
//!
//! This crate contains no sqlx, HTTP client, or filesystem I/O. The `kbstore`
//! app crate supplies a SQLite [`store::Store`] and concrete
//! [`embedding::Embedder`]s.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod maintenance;
pub mod models;
pub mod registry;
pub mod search;
pub mod store;

pub use error::{KbError, Result};
