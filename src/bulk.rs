//! Operations over every source or every item at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::registry::{Registry, RegistryError};
use crate::scheduler::Scheduler;
use crate::storage::{Database, DatabaseError, ItemFilter, NewSource, DEFAULT_REFRESH_INTERVAL_SECS};

/// Tallies from [`Bulk::refresh_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub succeeded: usize,
    pub failed: usize,
    pub inserted: usize,
    /// Already being fetched; a follow-up run was queued behind that fetch
    pub deferred: usize,
}

/// Tallies from the bulk delete operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub sources: u64,
    pub items: u64,
}

/// One subscription to import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub feed_url: String,
    pub title: String,
    /// Slash-separated category path such as `Tech/Rust`; empty for none
    pub category_path: String,
}

impl ImportEntry {
    pub fn new(feed_url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            feed_url: feed_url.into(),
            title: title.into(),
            category_path: String::new(),
        }
    }

    pub fn in_category(mut self, path: impl Into<String>) -> Self {
        self.category_path = path.into();
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    /// Already subscribed
    pub skipped: usize,
    /// Invalid URL, bad category path or store error
    pub failed: usize,
}

pub struct Bulk {
    db: Database,
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    concurrency: usize,
    default_refresh_interval: i64,
}

impl Bulk {
    pub fn new(
        db: Database,
        registry: Arc<Registry>,
        scheduler: Arc<Scheduler>,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            registry,
            scheduler,
            concurrency: concurrency.max(1),
            default_refresh_interval: DEFAULT_REFRESH_INTERVAL_SECS,
        }
    }

    /// Refresh interval given to imported sources
    pub fn with_default_refresh_interval(mut self, secs: i64) -> Self {
        self.default_refresh_interval = secs;
        self
    }

    /// Fetch every active source, at most `concurrency` at a time.
    ///
    /// Each fetch goes through the scheduler, so it never overlaps a timed
    /// fetch of the same source and the source is rescheduled afterwards.
    /// `progress` receives `(completed, total)` after each fetch. A failed
    /// fetch is counted and never stops the rest of the batch.
    pub async fn refresh_all(
        &self,
        progress: Option<mpsc::Sender<(usize, usize)>>,
    ) -> Result<BulkReport, DatabaseError> {
        let ids: Vec<_> = self
            .db
            .list_active_sources()
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();

        let total = ids.len();
        if total == 0 {
            if let Some(tx) = &progress {
                let _ = tx.send((0, 0)).await;
            }
            return Ok(BulkReport::default());
        }

        let completed = Arc::new(AtomicUsize::new(0));
        let results: Vec<_> = stream::iter(ids)
            .map(|source_id| {
                let scheduler = self.scheduler.clone();
                let progress = progress.clone();
                let completed = completed.clone();

                async move {
                    let result = scheduler.run_now(source_id).await;

                    let done = completed.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                    if let Some(tx) = progress {
                        if let Err(e) = tx.send((done, total)).await {
                            tracing::debug!(error = %e, done, total, "Progress receiver dropped");
                        }
                    }
                    result
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = BulkReport::default();
        for result in results {
            match result {
                Some(Ok(outcome)) => {
                    report.succeeded += 1;
                    report.inserted += outcome.inserted;
                }
                Some(Err(_)) => report.failed += 1,
                None => report.deferred += 1,
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            inserted = report.inserted,
            deferred = report.deferred,
            "Refresh-all finished"
        );
        Ok(report)
    }

    /// Delete every item, one page of IDs at a time
    pub async fn delete_all_items(&self) -> Result<DeleteReport, DatabaseError> {
        let mut report = DeleteReport::default();
        loop {
            let ids = self.db.list_item_ids(&ItemFilter::default()).await?;
            if ids.is_empty() {
                break;
            }
            let deleted = self.db.delete_items(&ids).await?;
            report.items += deleted;
            if deleted == 0 {
                break;
            }
        }
        tracing::info!(items = report.items, "Deleted all items");
        Ok(report)
    }

    /// Delete every source along with its items.
    ///
    /// Goes through the registry so each deletion cancels its schedule.
    pub async fn delete_all_sources(&self) -> Result<DeleteReport, RegistryError> {
        let mut report = DeleteReport::default();
        for id in self.db.list_source_ids().await? {
            match self.registry.delete_source(id).await {
                Ok(items) => {
                    report.sources += 1;
                    report.items += items;
                }
                // Removed concurrently
                Err(RegistryError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!(sources = report.sources, items = report.items, "Deleted all sources");
        Ok(report)
    }

    /// Delete all items, then refresh every active source
    pub async fn reset_and_refresh(
        &self,
        progress: Option<mpsc::Sender<(usize, usize)>>,
    ) -> Result<BulkReport, DatabaseError> {
        self.delete_all_items().await?;
        self.refresh_all(progress).await
    }

    /// Subscribe to each entry that is not already subscribed
    pub async fn import_sources(&self, entries: &[ImportEntry]) -> ImportReport {
        let mut report = ImportReport::default();

        for entry in entries {
            let feed_url = entry.feed_url.trim();
            if feed_url.is_empty() {
                tracing::warn!(title = %entry.title, "Import entry has no feed URL");
                report.failed += 1;
                continue;
            }

            match self.registry.find_by_url(feed_url).await {
                Ok(Some(_)) => {
                    tracing::debug!(url = %feed_url, "Already subscribed, skipping");
                    report.skipped += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(url = %feed_url, error = %e, "Subscription lookup failed");
                    report.failed += 1;
                    continue;
                }
            }

            let category_ids = match self.db.ensure_category_path(&entry.category_path).await {
                Ok(Some(id)) => vec![id],
                Ok(None) => Vec::new(),
                Err(e) => {
                    tracing::warn!(url = %feed_url, path = %entry.category_path, error = %e, "Bad category path");
                    report.failed += 1;
                    continue;
                }
            };

            let title = if entry.title.trim().is_empty() {
                feed_url
            } else {
                entry.title.trim()
            };
            let new = NewSource::new(feed_url, title)
                .with_refresh_interval(self.default_refresh_interval)
                .with_categories(category_ids);

            match self.registry.create_source(new).await {
                Ok(_) => report.imported += 1,
                Err(RegistryError::AlreadySubscribed(_)) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(url = %feed_url, error = %e, "Import failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            imported = report.imported,
            skipped = report.skipped,
            failed = report.failed,
            "Import finished"
        );
        report
    }
}
