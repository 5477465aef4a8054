use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{
    DatabaseError, FavoriteFilter, Item, ItemFilter, ItemId, ItemRow, ItemStatus, NewItem,
    SourceId,
};

/// Upper bound for a single listing (OOM protection)
const MAX_ITEMS: i64 = 2000;

/// Keeps batch deletes under SQLite's 999 parameter limit
const DELETE_CHUNK: usize = 500;

const ITEM_COLUMNS: &str = "id, source_id, permalink, title, content, excerpt, author, \
                            thumbnail_url, published_at, fetched_at, status, is_read, is_favorite";

impl Database {
    // ========================================================================
    // Item Operations
    // ========================================================================

    /// Whether the source already has an item with this dedup key, in any status
    pub async fn item_exists(
        &self,
        source_id: SourceId,
        permalink: &str,
    ) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM items WHERE source_id = ? AND permalink = ? LIMIT 1")
                .bind(source_id)
                .bind(permalink)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Insert an item with its category tags.
    ///
    /// Returns `DatabaseError::Duplicate` when the `(source_id, permalink)`
    /// pair is already stored.
    pub async fn insert_item(&self, item: &NewItem) -> Result<ItemId, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let row: (i64,) = sqlx::query_as(
            "INSERT INTO items (source_id, permalink, title, content, excerpt, author, \
             thumbnail_url, published_at, fetched_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(item.source_id)
        .bind(&item.permalink)
        .bind(&item.title)
        .bind(&item.content)
        .bind(&item.excerpt)
        .bind(&item.author)
        .bind(&item.thumbnail_url)
        .bind(item.published_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_insert)?;

        if !item.category_ids.is_empty() {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT OR IGNORE INTO item_categories (item_id, category_id) ");
            builder.push_values(&item.category_ids, |mut b, category_id| {
                b.push_bind(row.0).push_bind(*category_id);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(row.0)
    }

    pub async fn get_item(&self, id: ItemId) -> Result<Option<Item>, DatabaseError> {
        let row = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {} FROM items WHERE id = ?",
            ITEM_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ItemRow::into_item).transpose()
    }

    /// Items of one source, newest first
    pub async fn list_items_for_source(
        &self,
        source_id: SourceId,
    ) -> Result<Vec<Item>, DatabaseError> {
        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {} FROM items WHERE source_id = ? ORDER BY published_at DESC, id DESC LIMIT ?",
            ITEM_COLUMNS
        ))
        .bind(source_id)
        .bind(MAX_ITEMS)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    /// Category tags copied onto an item at ingestion
    pub async fn item_category_ids(&self, id: ItemId) -> Result<Vec<i64>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT category_id FROM item_categories WHERE item_id = ? ORDER BY category_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// IDs of items matching `filter`, oldest publish time first
    pub async fn list_item_ids(&self, filter: &ItemFilter) -> Result<Vec<ItemId>, DatabaseError> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT id FROM items WHERE 1 = 1");

        if let Some(source_id) = filter.source_id {
            builder.push(" AND source_id = ");
            builder.push_bind(source_id);
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        match filter.favorite {
            FavoriteFilter::Any => {}
            FavoriteFilter::Favorited => {
                builder.push(" AND is_favorite = 1");
            }
            FavoriteFilter::NotFavorited => {
                // Absent flag counts as not favorited
                builder.push(" AND (is_favorite IS NULL OR is_favorite = 0)");
            }
        }
        if let Some(before) = filter.published_before {
            builder.push(" AND published_at < ");
            builder.push_bind(before);
        }

        let limit = filter.limit.unwrap_or(MAX_ITEMS).clamp(0, MAX_ITEMS);
        builder.push(" ORDER BY published_at ASC, id ASC LIMIT ");
        builder.push_bind(limit);

        let rows: Vec<(i64,)> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Permanently delete the given items, returning how many were removed
    pub async fn delete_items(&self, ids: &[ItemId]) -> Result<u64, DatabaseError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("DELETE FROM items WHERE id IN (");
            let mut list = builder.separated(", ");
            for id in chunk {
                list.push_bind(*id);
            }
            list.push_unseparated(")");
            deleted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    pub async fn count_items(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Set the read flag. Returns `false` if the item does not exist.
    pub async fn set_item_read(&self, id: ItemId, read: bool) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE items SET is_read = ? WHERE id = ?")
            .bind(read)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set or clear the favorite flag. `None` returns it to the absent state.
    pub async fn set_item_favorite(
        &self,
        id: ItemId,
        favorite: Option<bool>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE items SET is_favorite = ? WHERE id = ?")
            .bind(favorite)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_item_status(
        &self,
        id: ItemId,
        status: ItemStatus,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE items SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Retire every published item that has been read. Returns the number moved.
    pub async fn retire_read_items(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query("UPDATE items SET status = ? WHERE status = ? AND is_read = 1")
            .bind(ItemStatus::Retired.as_str())
            .bind(ItemStatus::Published.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
