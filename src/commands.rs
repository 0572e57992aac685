//! CLI command implementations.
//!
//! Each `run_*` function opens a [`KnowledgeBase`], performs one operation,
//! prints a human-readable result to stdout, and closes the pool.

use anyhow::{Context, Result};
use std::path::Path;

use kbstore_core::models::Metadata;

use crate::config::Config;
use crate::service::{ChunkOptions, KnowledgeBase, QueryOptions};

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_default()
}

/// `kb init <tenant>`
pub async fn run_init(config: &Config, tenant: &str) -> Result<()> {
    let kb = KnowledgeBase::open(config.clone()).await?;
    let info = kb.init_collection(tenant).await?;
    println!(
        "Collection {} ready (dimension {}, created {}).",
        info.name,
        info.dims,
        format_millis(info.created_at)
    );
    kb.shutdown().await;
    Ok(())
}

/// Arguments of `kb add`.
#[derive(Debug, Clone, Default)]
pub struct AddArgs {
    pub source: Option<String>,
    pub category: Option<String>,
    pub chunk_size: Option<usize>,
    pub overlap: Option<usize>,
}

/// `kb add <tenant> <file>`; the source defaults to the file path.
pub async fn run_add(config: &Config, tenant: &str, file: &Path, args: AddArgs) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let source = args
        .source
        .unwrap_or_else(|| file.display().to_string());
    let mut metadata = Metadata::new().with("source", source.as_str());
    if let Some(category) = args.category {
        metadata.insert("category", category);
    }

    let kb = KnowledgeBase::open(config.clone()).await?;
    let written = kb
        .add_document(
            tenant,
            &content,
            &metadata,
            ChunkOptions {
                chunk_size: args.chunk_size,
                overlap: args.overlap,
            },
        )
        .await?;
    println!("Added {} ({} chunks).", source, written);
    kb.shutdown().await;
    Ok(())
}

/// `kb query <tenant> <text>`
pub async fn run_query(
    config: &Config,
    tenant: &str,
    text: &str,
    options: QueryOptions,
    json: bool,
) -> Result<()> {
    let kb = KnowledgeBase::open(config.clone()).await?;
    let hits = kb.query(tenant, text, &options).await?;
    kb.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}",
            i + 1,
            hit.score,
            hit.metadata.get_str("source").unwrap_or("(no source)")
        );
        if let Some(category) = hit.metadata.get_str("category") {
            println!("    category: {}", category);
        }
        println!("    id: {}", hit.id);
        println!();
    }
    Ok(())
}

/// `kb delete <tenant> --source <source>`
pub async fn run_delete(config: &Config, tenant: &str, source: &str) -> Result<()> {
    let kb = KnowledgeBase::open(config.clone()).await?;
    let deleted = kb.delete_by_source(tenant, source).await?;
    kb.shutdown().await;
    if deleted {
        println!("Deleted all chunks from {}.", source);
    } else {
        println!("Nothing to delete for {}.", source);
    }
    Ok(())
}

/// `kb stats <tenant>`
pub async fn run_stats(config: &Config, tenant: &str) -> Result<()> {
    let kb = KnowledgeBase::open(config.clone()).await?;
    let stats = kb.statistics(tenant).await?;
    kb.shutdown().await;

    println!("collection:          {}", stats.collection_name);
    println!("total_chunks:        {}", stats.total_chunks);
    println!("embedding_model:     {}", stats.embedding_model);
    println!("embedding_dimension: {}", stats.embedding_dimension);
    println!("backend:             {}", stats.backend);
    Ok(())
}

/// `kb get <tenant> <id>`
pub async fn run_get(config: &Config, tenant: &str, id: &str) -> Result<()> {
    let kb = KnowledgeBase::open(config.clone()).await?;
    let doc = kb.get_document(tenant, id).await?;
    kb.shutdown().await;

    let doc = doc.ok_or_else(|| anyhow::anyhow!("No document with id: {}", id))?;
    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("created_at:   {}", format_millis(doc.created_at));
    println!("updated_at:   {}", format_millis(doc.updated_at));
    println!("content_hash: {}", doc.content_hash);
    println!("metadata:     {}", doc.metadata.to_json()?);
    println!();
    println!("--- Text ---");
    println!("{}", doc.text);
    Ok(())
}
