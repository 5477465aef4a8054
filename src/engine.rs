//! Wires the registry, fetcher, scheduler, pruner and bulk operations
//! around one database and exposes the trigger surface.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bulk::{Bulk, BulkReport, DeleteReport, ImportEntry, ImportReport};
use crate::config::Config;
use crate::feed::{FeedRetriever, Fetcher, HttpRetriever, RetrieveError};
use crate::prune::{PruneReport, Pruner};
use crate::registry::{Registry, RegistryError};
use crate::scheduler::{
    FiredJob, JobFacility, RefreshDispatch, ScheduleError, Scheduler, TokioJobs,
};
use crate::storage::{Database, DatabaseError, ItemStore, NewSource, SourceId, SourceStore};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] RetrieveError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

pub struct Engine {
    config: Config,
    db: Database,
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    pruner: Arc<Pruner>,
    bulk: Bulk,
    tasks: Vec<JoinHandle<()>>,
    // Keeps the in-process timers alive for the engine's lifetime
    _jobs: Arc<dyn JobFacility>,
}

impl Engine {
    /// Assemble the components without spawning anything.
    ///
    /// The scheduler is subscribed to the registry, so source mutations
    /// made through [`Engine::registry`] keep the schedule in sync.
    pub fn build(
        config: Config,
        db: Database,
        retriever: Arc<dyn FeedRetriever>,
        jobs: Arc<dyn JobFacility>,
    ) -> Self {
        let store = Arc::new(db.clone());
        let sources: Arc<dyn SourceStore> = store.clone();
        let items: Arc<dyn ItemStore> = store;

        let fetcher = Arc::new(Fetcher::new(
            sources.clone(),
            items.clone(),
            retriever,
            config.fetch_settings(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            sources,
            fetcher,
            jobs.clone(),
            config.stagger_window(),
        ));

        let registry = Arc::new(Registry::new(db.clone(), config.allow_private_hosts));
        registry.subscribe(scheduler.clone());

        let pruner = Arc::new(Pruner::new(items, config.retention(), config.prune_batch_size));
        let bulk = Bulk::new(db.clone(), registry.clone(), scheduler.clone(), config.refresh_concurrency)
            .with_default_refresh_interval(config.default_refresh_interval_secs);

        Self {
            config,
            db,
            registry,
            scheduler,
            pruner,
            bulk,
            tasks: Vec::new(),
            _jobs: jobs,
        }
    }

    /// Build with the HTTP retriever and in-process timers, start the
    /// dispatcher and the prune loop, and schedule every active source.
    pub async fn start(config: Config, db: Database) -> Result<Self, EngineError> {
        let retriever = Arc::new(HttpRetriever::new(config.retrieve_settings())?);
        let (jobs, fired) = TokioJobs::new();
        let mut engine = Self::build(config, db, retriever, Arc::new(jobs));
        engine.run(fired).await?;
        Ok(engine)
    }

    /// Spawn the background tasks for an engine assembled with [`Engine::build`]
    pub async fn run(
        &mut self,
        fired: mpsc::UnboundedReceiver<FiredJob>,
    ) -> Result<(), EngineError> {
        self.tasks.push(self.scheduler.spawn_dispatcher(fired));

        if let Some(period) = self.config.prune_interval() {
            self.tasks.push(self.pruner.clone().spawn(period));
        }

        let scheduled = self.scheduler.schedule_all().await?;
        tracing::info!(scheduled, "Engine started");
        Ok(())
    }

    /// Stop the dispatcher and the prune loop
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("Engine stopped");
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// A new source carrying the configured default refresh interval
    pub fn new_source(&self, feed_url: impl Into<String>, title: impl Into<String>) -> NewSource {
        NewSource::new(feed_url, title).with_refresh_interval(self.config.default_refresh_interval_secs)
    }

    // ========================================================================
    // Triggers
    // ========================================================================

    pub async fn refresh_source(&self, source_id: SourceId) -> Result<RefreshDispatch, ScheduleError> {
        self.scheduler.refresh_now(source_id).await
    }

    pub async fn refresh_all(
        &self,
        progress: Option<mpsc::Sender<(usize, usize)>>,
    ) -> Result<BulkReport, DatabaseError> {
        self.bulk.refresh_all(progress).await
    }

    pub async fn delete_all_items(&self) -> Result<DeleteReport, DatabaseError> {
        self.bulk.delete_all_items().await
    }

    pub async fn delete_all_sources(&self) -> Result<DeleteReport, RegistryError> {
        self.bulk.delete_all_sources().await
    }

    pub async fn reset_and_refresh(
        &self,
        progress: Option<mpsc::Sender<(usize, usize)>>,
    ) -> Result<BulkReport, DatabaseError> {
        self.bulk.reset_and_refresh(progress).await
    }

    pub async fn import_sources(&self, entries: &[ImportEntry]) -> ImportReport {
        self.bulk.import_sources(entries).await
    }

    /// Retire every read item so it becomes eligible for pruning
    pub async fn retire_read_items(&self) -> Result<u64, DatabaseError> {
        let retired = self.db.retire_read_items().await?;
        tracing::info!(retired, "Retired read items");
        Ok(retired)
    }

    pub async fn prune_now(&self) -> Result<PruneReport, DatabaseError> {
        self.pruner.prune_once().await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{ParsedEntry, ParsedFeed};
    use crate::scheduler::{ManualJobs, ObligationKey, ScheduleState};
    use crate::storage::SourceStatus;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct OneEntry;

    #[async_trait]
    impl FeedRetriever for OneEntry {
        async fn retrieve(&self, url: &str) -> Result<ParsedFeed, RetrieveError> {
            Ok(ParsedFeed {
                site_url: Some("https://example.com/".into()),
                entries: vec![ParsedEntry {
                    title: Some("Hello".into()),
                    permalink: Some(format!("{}#hello", url)),
                    published: Some(chrono::Utc::now().timestamp()),
                    ..Default::default()
                }],
            })
        }
    }

    async fn engine() -> (Engine, Arc<ManualJobs>) {
        let db = Database::open(":memory:").await.unwrap();
        let jobs = Arc::new(ManualJobs::new());
        let engine = Engine::build(Config::default(), db, Arc::new(OneEntry), jobs.clone());
        (engine, jobs)
    }

    #[tokio::test]
    async fn test_registry_changes_drive_the_schedule() {
        let (engine, jobs) = engine().await;
        let source = engine
            .registry()
            .create_source(engine.new_source("https://example.com/rss", "Example"))
            .await
            .unwrap();
        let key = ObligationKey::for_source(source.id);

        assert!(jobs.scheduled_at(&key).is_some());
        assert_eq!(
            engine.scheduler().state(source.id).await.unwrap(),
            ScheduleState::Scheduled
        );

        engine
            .registry()
            .set_status(source.id, SourceStatus::Inactive)
            .await
            .unwrap();
        assert!(jobs.scheduled_at(&key).is_none());
        assert_eq!(jobs.obligation_count(), 0);
    }

    #[tokio::test]
    async fn test_retire_then_prune_respects_retention() {
        let (engine, _) = engine().await;
        let source = engine
            .registry()
            .create_source(engine.new_source("https://example.com/rss", "Example"))
            .await
            .unwrap();
        engine.refresh_all(None).await.unwrap();

        let db = engine.database();
        let item = db.list_items_for_source(source.id).await.unwrap().remove(0);
        db.set_item_read(item.id, true).await.unwrap();

        assert_eq!(engine.retire_read_items().await.unwrap(), 1);
        // Freshly published, so still inside the retention window
        assert_eq!(engine.prune_now().await.unwrap(), PruneReport::default());
        assert_eq!(db.count_items().await.unwrap(), 1);
    }
}
