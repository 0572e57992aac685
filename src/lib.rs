//! # kbstore
//!
//! Knowledge-base storage that unifies vector similarity search and keyword
//! (full-text) search over a single SQLite database, with one isolated
//! collection per tenant.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌─────────────────────┐
//! │ CLI (kb) │──▶│ KnowledgeBase│──▶│ SQLite              │
//! │ HTTP API │   │ chunk+embed  │   │ <c>_documents (vec) │
//! └──────────┘   │ hybrid rank  │   │ <c>_fts (FTS5)      │
//!                └──────────────┘   │ <c>_metadata        │
//!                                   └─────────────────────┘
//! ```
//!
//! Pure logic (chunking, scoring, the `Store` trait, ingestion, the
//! collection registry) lives in `kbstore-core`; this crate supplies the
//! SQLite store, the embedding providers, and the outer surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Connection pool and catalog migration |
//! | [`schema`] | Per-collection tables and indexes |
//! | [`sqlite_store`] | SQLite `Store` implementation |
//! | [`embedding`] | Embedding providers |
//! | [`service`] | `KnowledgeBase` facade |
//! | [`server`] | HTTP server |
//! | [`commands`] | CLI command implementations |

pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod schema;
pub mod server;
pub mod service;
pub mod sqlite_store;
