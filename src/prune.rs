//! Retention pruning of retired items.
//!
//! Only items that are retired, older than the retention cutoff and not
//! favorited are ever selected. Each run deletes at most one batch.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::storage::{DatabaseError, FavoriteFilter, ItemFilter, ItemStatus, ItemStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub selected: usize,
    pub deleted: u64,
}

pub struct Pruner {
    items: Arc<dyn ItemStore>,
    retention: Duration,
    batch_size: usize,
}

impl Pruner {
    pub fn new(items: Arc<dyn ItemStore>, retention: Duration, batch_size: usize) -> Self {
        Self {
            items,
            retention,
            batch_size: batch_size.max(1),
        }
    }

    /// Filter matching prune-eligible items published before `cutoff`
    pub fn eligible_filter(&self, cutoff: i64) -> ItemFilter {
        ItemFilter {
            status: Some(ItemStatus::Retired),
            favorite: FavoriteFilter::NotFavorited,
            published_before: Some(cutoff),
            limit: Some(i64::try_from(self.batch_size).unwrap_or(i64::MAX)),
            ..Default::default()
        }
    }

    /// Delete one batch of eligible items
    pub async fn prune_once(&self) -> Result<PruneReport, DatabaseError> {
        let retention_secs = i64::try_from(self.retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = chrono::Utc::now().timestamp().saturating_sub(retention_secs);

        let ids = self.items.list_by_filter(&self.eligible_filter(cutoff)).await?;
        if ids.is_empty() {
            tracing::debug!(cutoff, "Nothing to prune");
            return Ok(PruneReport::default());
        }

        let deleted = self.items.delete_batch(&ids).await?;
        tracing::info!(selected = ids.len(), deleted, cutoff, "Pruned retired items");
        Ok(PruneReport {
            selected: ids.len(),
            deleted,
        })
    }

    /// Run [`Pruner::prune_once`] every `period`, starting one period from now
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            // Skip the first immediate tick
            interval.tick().await;

            loop {
                interval.tick().await;
                if let Err(e) = self.prune_once().await {
                    tracing::warn!(error = %e, "Scheduled prune failed");
                }
            }
        })
    }
}
