//! Retention pruning and bulk operations through the engine's trigger surface.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use feedmill::bulk::{DeleteReport, ImportEntry, ImportReport};
use feedmill::config::Config;
use feedmill::engine::Engine;
use feedmill::feed::{FeedRetriever, ParsedEntry, ParsedFeed, RetrieveError};
use feedmill::scheduler::ManualJobs;
use feedmill::storage::{Database, ItemStatus, NewItem, SourceId};
use pretty_assertions::assert_eq;

const DAY: i64 = 24 * 60 * 60;

/// Two current entries per feed
struct TwoEntries;

#[async_trait]
impl FeedRetriever for TwoEntries {
    async fn retrieve(&self, url: &str) -> Result<ParsedFeed, RetrieveError> {
        let now = Utc::now().timestamp();
        Ok(ParsedFeed {
            site_url: None,
            entries: (0..2)
                .map(|n| ParsedEntry {
                    title: Some(format!("Entry {}", n)),
                    permalink: Some(format!("{}/{}", url, n)),
                    published: Some(now - n * 60),
                    ..Default::default()
                })
                .collect(),
        })
    }
}

async fn engine() -> (Engine, Arc<ManualJobs>) {
    let db = Database::open(":memory:").await.unwrap();
    let jobs = Arc::new(ManualJobs::new());
    let config = Config {
        refresh_concurrency: 1,
        ..Default::default()
    };
    let engine = Engine::build(config, db, Arc::new(TwoEntries), jobs.clone());
    (engine, jobs)
}

async fn old_retired_item(db: &Database, source_id: SourceId, slug: &str, favorite: Option<bool>) -> i64 {
    let published = Utc::now().timestamp() - 45 * DAY;
    let id = db
        .insert_item(&NewItem {
            source_id,
            permalink: format!("https://archive.example.com/{}", slug),
            title: slug.to_string(),
            content: String::new(),
            excerpt: String::new(),
            author: None,
            thumbnail_url: None,
            published_at: published,
            category_ids: Vec::new(),
        })
        .await
        .unwrap();
    db.set_item_read(id, true).await.unwrap();
    db.set_item_favorite(id, favorite).await.unwrap();
    id
}

#[tokio::test]
async fn test_prune_keeps_favorites_and_deletes_absent_flag() {
    let (engine, _) = engine().await;
    let source = engine
        .registry()
        .create_source(engine.new_source("https://example.com/rss", "Example"))
        .await
        .unwrap();
    let db = engine.database();

    let favorite = old_retired_item(db, source.id, "favorite", Some(true)).await;
    let absent = old_retired_item(db, source.id, "absent", None).await;
    let cleared = old_retired_item(db, source.id, "cleared", Some(false)).await;

    // Read but not yet retired, so nothing is eligible
    assert_eq!(engine.prune_now().await.unwrap().deleted, 0);

    assert_eq!(engine.retire_read_items().await.unwrap(), 3);
    let report = engine.prune_now().await.unwrap();
    assert_eq!(report.deleted, 2);

    let kept = db.get_item(favorite).await.unwrap().unwrap();
    assert_eq!(kept.status, ItemStatus::Retired);
    assert!(db.get_item(absent).await.unwrap().is_none());
    assert!(db.get_item(cleared).await.unwrap().is_none());
}

#[tokio::test]
async fn test_import_then_refresh_then_delete_sources() {
    let (engine, jobs) = engine().await;

    let report = engine
        .import_sources(&[
            ImportEntry::new("https://a.example.com/rss", "A").in_category("News"),
            ImportEntry::new("https://b.example.com/rss", "").in_category("Tech/Rust"),
            ImportEntry::new("https://a.example.com/rss", "A duplicate"),
            ImportEntry::new("http://10.0.0.1/rss", "Private"),
        ])
        .await;
    assert_eq!(
        report,
        ImportReport {
            imported: 2,
            skipped: 1,
            failed: 1
        }
    );
    // Imported sources are scheduled like any other
    assert_eq!(jobs.obligation_count(), 2);

    let b = engine
        .registry()
        .find_by_url("https://b.example.com/rss")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.title, "https://b.example.com/rss");

    let refreshed = engine.refresh_all(None).await.unwrap();
    assert_eq!(refreshed.succeeded, 2);
    assert_eq!(refreshed.inserted, 4);

    // Items inherit their source's categories
    let item = engine
        .database()
        .list_items_for_source(b.id)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(
        engine.database().item_category_ids(item.id).await.unwrap(),
        b.category_ids
    );

    let deleted = engine.delete_all_sources().await.unwrap();
    assert_eq!(deleted, DeleteReport { sources: 2, items: 4 });
    assert_eq!(engine.database().count_items().await.unwrap(), 0);
    assert_eq!(jobs.obligation_count(), 0);
}

#[tokio::test]
async fn test_reset_and_refresh_restores_items() {
    let (engine, _) = engine().await;
    engine
        .registry()
        .create_source(engine.new_source("https://example.com/rss", "Example"))
        .await
        .unwrap();

    assert_eq!(engine.refresh_all(None).await.unwrap().inserted, 2);
    // Nothing new the second time around
    assert_eq!(engine.refresh_all(None).await.unwrap().inserted, 0);

    let report = engine.reset_and_refresh(None).await.unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(engine.database().count_items().await.unwrap(), 2);
}

#[tokio::test]
async fn test_delete_all_items_on_empty_store() {
    let (engine, _) = engine().await;
    assert_eq!(engine.delete_all_items().await.unwrap(), DeleteReport::default());
}
