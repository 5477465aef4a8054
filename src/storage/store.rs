//! Trait seams between the engine and the content store.
//!
//! The fetcher, scheduler and pruner only see these traits, so the engine
//! does not care whether items live in SQLite or in a test double.

use async_trait::async_trait;

use super::schema::Database;
use super::types::{DatabaseError, ItemFilter, ItemId, NewItem, Source, SourceId, SourceMeta};

/// Read side of the source registry, plus fetch bookkeeping writes
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Sources with lifecycle status `active`
    async fn list_active(&self) -> Result<Vec<Source>, DatabaseError>;

    /// `Ok(None)` when the source does not exist
    async fn get(&self, id: SourceId) -> Result<Option<Source>, DatabaseError>;

    /// Returns `false` when the source does not exist
    async fn update_meta(&self, id: SourceId, meta: &SourceMeta) -> Result<bool, DatabaseError>;
}

/// Item Store Adapter
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn exists(&self, source_id: SourceId, permalink: &str) -> Result<bool, DatabaseError>;

    async fn insert(&self, item: &NewItem) -> Result<ItemId, DatabaseError>;

    async fn list_by_filter(&self, filter: &ItemFilter) -> Result<Vec<ItemId>, DatabaseError>;

    async fn delete_batch(&self, ids: &[ItemId]) -> Result<u64, DatabaseError>;
}

#[async_trait]
impl SourceStore for Database {
    async fn list_active(&self) -> Result<Vec<Source>, DatabaseError> {
        self.list_active_sources().await
    }

    async fn get(&self, id: SourceId) -> Result<Option<Source>, DatabaseError> {
        self.get_source(id).await
    }

    async fn update_meta(&self, id: SourceId, meta: &SourceMeta) -> Result<bool, DatabaseError> {
        self.update_source_meta(id, meta).await
    }
}

#[async_trait]
impl ItemStore for Database {
    async fn exists(&self, source_id: SourceId, permalink: &str) -> Result<bool, DatabaseError> {
        self.item_exists(source_id, permalink).await
    }

    async fn insert(&self, item: &NewItem) -> Result<ItemId, DatabaseError> {
        self.insert_item(item).await
    }

    async fn list_by_filter(&self, filter: &ItemFilter) -> Result<Vec<ItemId>, DatabaseError> {
        self.list_item_ids(filter).await
    }

    async fn delete_batch(&self, ids: &[ItemId]) -> Result<u64, DatabaseError> {
        self.delete_items(ids).await
    }
}
