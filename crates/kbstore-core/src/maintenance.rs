//! Read-only introspection and administrative cleanup.

use crate::error::Result;
use crate::ingest::SOURCE_KEY;
use crate::models::{CollectionStats, Metadata};
use crate::registry::CollectionName;
use crate::store::{Deadline, Store};

/// Collection statistics straight from the store.
pub async fn get_statistics<S: Store + ?Sized>(
    store: &S,
    collection: &CollectionName,
    deadline: Deadline,
) -> Result<CollectionStats> {
    store.get_statistics(collection, deadline).await
}

/// Delete every chunk ingested from `source`. Returns whether anything was removed.
pub async fn delete_by_source<S: Store + ?Sized>(
    store: &S,
    collection: &CollectionName,
    source: &str,
    deadline: Deadline,
) -> Result<bool> {
    let filter = Metadata::new().with(SOURCE_KEY, source);
    let removed = store.delete_where(collection, &filter, deadline).await?;
    tracing::info!(collection = %collection, source, removed, "deleted by source");
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentInput;
    use crate::store::memory::InMemoryStore;

    #[tokio::test]
    async fn test_delete_by_source() {
        let store = InMemoryStore::new();
        let c = CollectionName::parse("kb_t1").unwrap();
        store.ensure_collection(&c, 2, Deadline::none()).await.unwrap();
        store
            .upsert(
                &c,
                &[DocumentInput {
                    id: "test.md_0".into(),
                    embedding: vec![1.0, 0.0],
                    text: "hello".into(),
                    metadata: Metadata::new().with("source", "test.md"),
                }],
                Deadline::none(),
            )
            .await
            .unwrap();

        assert!(!delete_by_source(&store, &c, "other.md", Deadline::none())
            .await
            .unwrap());
        assert!(delete_by_source(&store, &c, "test.md", Deadline::none())
            .await
            .unwrap());
        assert!(!delete_by_source(&store, &c, "test.md", Deadline::none())
            .await
            .unwrap());

        let stats = get_statistics(&store, &c, Deadline::none()).await.unwrap();
        assert_eq!(stats.document_count, 0);
        assert_eq!(stats.collection_name, "kb_t1");
    }
}
