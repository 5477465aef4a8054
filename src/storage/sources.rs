use std::collections::HashMap;

use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{
    DatabaseError, NewSource, Source, SourceId, SourceMeta, SourceRow, SourceStatus, SourceUpdate,
};
use crate::util::strip_control_chars;

const SOURCE_COLUMNS: &str = "id, title, feed_url, site_url, refresh_interval, last_fetched, \
                              last_error, status, fetch_status, created_at";

impl Database {
    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Insert a new source and its category tags, returning the new ID.
    ///
    /// Returns `DatabaseError::Duplicate` if a source with the same non-empty
    /// feed URL already exists.
    pub async fn insert_source(&self, source: &NewSource) -> Result<SourceId, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let title = strip_control_chars(source.title.trim()).into_owned();
        let mut tx = self.pool.begin().await?;

        let row: (i64,) = sqlx::query_as(
            "INSERT INTO sources (title, feed_url, refresh_interval, status, created_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&title)
        .bind(source.feed_url.trim())
        .bind(source.refresh_interval)
        .bind(source.status.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_insert)?;

        for category_id in &source.category_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO source_categories (source_id, category_id) VALUES (?, ?)",
            )
            .bind(row.0)
            .bind(category_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(row.0)
    }

    /// Get a single source, or `None` if it does not exist
    pub async fn get_source(&self, id: SourceId) -> Result<Option<Source>, DatabaseError> {
        let row = sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {} FROM sources WHERE id = ?",
            SOURCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let categories = self.source_category_ids(id).await?;
                Ok(Some(row.into_source(categories)?))
            }
            None => Ok(None),
        }
    }

    /// Find a source by its feed URL (exact match after trimming)
    pub async fn find_source_by_url(&self, feed_url: &str) -> Result<Option<Source>, DatabaseError> {
        let id: Option<(i64,)> = sqlx::query_as("SELECT id FROM sources WHERE feed_url = ?")
            .bind(feed_url.trim())
            .fetch_optional(&self.pool)
            .await?;

        match id {
            Some((id,)) => self.get_source(id).await,
            None => Ok(None),
        }
    }

    /// All sources ordered by title
    pub async fn list_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        self.query_sources(None).await
    }

    /// Sources whose lifecycle status is active
    pub async fn list_active_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        self.query_sources(Some(SourceStatus::Active)).await
    }

    async fn query_sources(
        &self,
        status: Option<SourceStatus>,
    ) -> Result<Vec<Source>, DatabaseError> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM sources", SOURCE_COLUMNS));
        if let Some(status) = status {
            builder.push(" WHERE status = ");
            builder.push_bind(status.as_str());
        }
        builder.push(" ORDER BY title, id");

        let rows: Vec<SourceRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        // One query for all category tags instead of one per source
        let links: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT source_id, category_id FROM source_categories ORDER BY category_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut by_source: HashMap<i64, Vec<i64>> = HashMap::new();
        for (source_id, category_id) in links {
            by_source.entry(source_id).or_default().push(category_id);
        }

        rows.into_iter()
            .map(|row| {
                let categories = by_source.remove(&row.id).unwrap_or_default();
                row.into_source(categories)
            })
            .collect()
    }

    /// IDs of every source regardless of status
    pub async fn list_source_ids(&self) -> Result<Vec<SourceId>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Category tags of a source
    pub async fn source_category_ids(&self, id: SourceId) -> Result<Vec<i64>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT category_id FROM source_categories WHERE source_id = ? ORDER BY category_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Apply user edits to a source. Returns `false` if the source does not exist.
    pub async fn update_source(
        &self,
        id: SourceId,
        update: &SourceUpdate,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(false);
        }

        if update.title.is_some() || update.feed_url.is_some() || update.refresh_interval.is_some()
        {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("UPDATE sources SET ");
            let mut set = builder.separated(", ");
            if let Some(title) = &update.title {
                set.push("title = ");
                set.push_bind_unseparated(strip_control_chars(title.trim()).into_owned());
            }
            if let Some(feed_url) = &update.feed_url {
                set.push("feed_url = ");
                set.push_bind_unseparated(feed_url.trim().to_string());
            }
            if let Some(interval) = update.refresh_interval {
                set.push("refresh_interval = ");
                set.push_bind_unseparated(interval);
            }
            builder.push(" WHERE id = ");
            builder.push_bind(id);
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(DatabaseError::from_insert)?;
        }

        if let Some(category_ids) = &update.category_ids {
            sqlx::query("DELETE FROM source_categories WHERE source_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            for category_id in category_ids {
                sqlx::query(
                    "INSERT OR IGNORE INTO source_categories (source_id, category_id) VALUES (?, ?)",
                )
                .bind(id)
                .bind(category_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Change the lifecycle status. Returns the previous status, or `None`
    /// if the source does not exist.
    pub async fn set_source_status(
        &self,
        id: SourceId,
        status: SourceStatus,
    ) -> Result<Option<SourceStatus>, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let previous: Option<(String,)> = sqlx::query_as("SELECT status FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((previous,)) = previous else {
            return Ok(None);
        };

        sqlx::query("UPDATE sources SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(SourceStatus::parse(&previous)?))
    }

    /// Write fetch bookkeeping. Returns `false` if the source does not exist.
    pub async fn update_source_meta(
        &self,
        id: SourceId,
        meta: &SourceMeta,
    ) -> Result<bool, DatabaseError> {
        if meta.is_empty() {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM sources WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            return Ok(exists.is_some());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("UPDATE sources SET ");
        let mut set = builder.separated(", ");
        if let Some(site_url) = &meta.site_url {
            set.push("site_url = ");
            set.push_bind_unseparated(site_url.clone());
        }
        if let Some(last_fetched) = meta.last_fetched {
            set.push("last_fetched = ");
            set.push_bind_unseparated(last_fetched);
        }
        if let Some(last_error) = &meta.last_error {
            set.push("last_error = ");
            set.push_bind_unseparated(last_error.clone());
        }
        if let Some(fetch_status) = meta.fetch_status {
            set.push("fetch_status = ");
            set.push_bind_unseparated(fetch_status.as_str());
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a source and every item referencing it.
    ///
    /// Returns the number of items deleted alongside the source, or `None`
    /// if the source does not exist.
    pub async fn delete_source(&self, id: SourceId) -> Result<Option<u64>, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        // Explicit delete (rather than relying on ON DELETE CASCADE) so the count is exact
        let items = sqlx::query("DELETE FROM items WHERE source_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let sources = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if sources == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        Ok(Some(items))
    }
}
