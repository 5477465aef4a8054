//! Source registry: the write path for sources.
//!
//! Every mutation is persisted first and then announced to subscribed
//! [`SourceListener`]s, one after another, before the call returns.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::storage::{
    Database, DatabaseError, NewSource, Source, SourceId, SourceStatus, SourceUpdate,
};
use crate::util::{validate_feed_url, UrlValidationError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),
    #[error("Source {0} not found")]
    NotFound(SourceId),
    #[error("Refresh interval must be positive, got {0}s")]
    InvalidInterval(i64),
    #[error(transparent)]
    Database(DatabaseError),
}

impl From<DatabaseError> for RegistryError {
    fn from(err: DatabaseError) -> Self {
        RegistryError::Database(err)
    }
}

/// Lifecycle notification emitted after a source mutation is stored
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Created(Source),
    /// User-editable fields changed (title, URL, interval, categories)
    Updated(Source),
    StatusChanged {
        source: Source,
        previous: SourceStatus,
    },
    Deleted(SourceId),
}

/// Subscriber to source lifecycle events
#[async_trait]
pub trait SourceListener: Send + Sync {
    async fn on_source_event(&self, event: &SourceEvent);
}

pub struct Registry {
    db: Database,
    listeners: RwLock<Vec<Arc<dyn SourceListener>>>,
    allow_private_hosts: bool,
}

impl Registry {
    pub fn new(db: Database, allow_private_hosts: bool) -> Self {
        Self {
            db,
            listeners: RwLock::new(Vec::new()),
            allow_private_hosts,
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn SourceListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    async fn notify(&self, event: SourceEvent) {
        // Snapshot so the lock is not held across listener awaits
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener.on_source_event(&event).await;
        }
    }

    /// Empty URLs are stored as-is (a misconfigured source); anything else must validate
    fn check_url(&self, feed_url: &str) -> Result<(), RegistryError> {
        if feed_url.trim().is_empty() {
            return Ok(());
        }
        validate_feed_url(feed_url, self.allow_private_hosts)?;
        Ok(())
    }

    fn check_interval(secs: i64) -> Result<(), RegistryError> {
        if secs <= 0 {
            return Err(RegistryError::InvalidInterval(secs));
        }
        Ok(())
    }

    fn map_duplicate(err: DatabaseError, feed_url: &str) -> RegistryError {
        match err {
            DatabaseError::Duplicate(_) => RegistryError::AlreadySubscribed(feed_url.trim().to_string()),
            other => RegistryError::Database(other),
        }
    }

    pub async fn create_source(&self, new: NewSource) -> Result<Source, RegistryError> {
        self.check_url(&new.feed_url)?;
        Self::check_interval(new.refresh_interval)?;

        let id = self
            .db
            .insert_source(&new)
            .await
            .map_err(|e| Self::map_duplicate(e, &new.feed_url))?;
        let source = self.get(id).await?;

        tracing::info!(source_id = id, url = %source.feed_url, "Source created");
        self.notify(SourceEvent::Created(source.clone())).await;
        Ok(source)
    }

    pub async fn update_source(
        &self,
        id: SourceId,
        update: SourceUpdate,
    ) -> Result<Source, RegistryError> {
        if let Some(feed_url) = &update.feed_url {
            self.check_url(feed_url)?;
        }
        if let Some(secs) = update.refresh_interval {
            Self::check_interval(secs)?;
        }
        if update.is_empty() {
            return self.get(id).await;
        }

        let found = self.db.update_source(id, &update).await.map_err(|e| {
            Self::map_duplicate(e, update.feed_url.as_deref().unwrap_or_default())
        })?;
        if !found {
            return Err(RegistryError::NotFound(id));
        }

        let source = self.get(id).await?;
        tracing::debug!(source_id = id, "Source updated");
        self.notify(SourceEvent::Updated(source.clone())).await;
        Ok(source)
    }

    /// Activate or deactivate a source. Setting the current status again is a
    /// no-op and emits nothing.
    pub async fn set_status(
        &self,
        id: SourceId,
        status: SourceStatus,
    ) -> Result<Source, RegistryError> {
        let previous = self
            .db
            .set_source_status(id, status)
            .await?
            .ok_or(RegistryError::NotFound(id))?;

        let source = self.get(id).await?;
        if previous != status {
            tracing::info!(source_id = id, status = status.as_str(), "Source status changed");
            self.notify(SourceEvent::StatusChanged {
                source: source.clone(),
                previous,
            })
            .await;
        }
        Ok(source)
    }

    /// Delete a source and all of its items. Returns the number of items deleted.
    pub async fn delete_source(&self, id: SourceId) -> Result<u64, RegistryError> {
        let items = self
            .db
            .delete_source(id)
            .await?
            .ok_or(RegistryError::NotFound(id))?;

        tracing::info!(source_id = id, items_deleted = items, "Source deleted");
        self.notify(SourceEvent::Deleted(id)).await;
        Ok(items)
    }

    pub async fn get(&self, id: SourceId) -> Result<Source, RegistryError> {
        self.db
            .get_source(id)
            .await?
            .ok_or(RegistryError::NotFound(id))
    }

    pub async fn list(&self) -> Result<Vec<Source>, RegistryError> {
        Ok(self.db.list_sources().await?)
    }

    pub async fn list_active(&self) -> Result<Vec<Source>, RegistryError> {
        Ok(self.db.list_active_sources().await?)
    }

    pub async fn find_by_url(&self, feed_url: &str) -> Result<Option<Source>, RegistryError> {
        Ok(self.db.find_source_by_url(feed_url).await?)
    }
}
