use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::parser::ParsedEntry;
use super::retrieve::FeedRetriever;
use super::thumbnail::resolve_thumbnail;
use crate::storage::{
    DatabaseError, FetchStatus, ItemStore, NewItem, Source, SourceId, SourceMeta, SourceStore,
};
use crate::util::{make_excerpt, strip_control_chars};

/// Errors from a single-source fetch.
///
/// Every variant except `NotFound` is also written to the source's
/// `last_error`, so it shows up next to the source.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The source has no feed URL configured
    #[error("Source has no feed URL")]
    NoUrl,
    /// Retrieval or parsing failed
    #[error("Fetch failed: {0}")]
    FetchFailed(String),
    /// One or more items (or the source bookkeeping) could not be written
    #[error("Store write failed: {0}")]
    StoreWriteFailed(String),
    /// Reading from the store failed before the fetch could start
    #[error("Store read failed: {0}")]
    StoreReadFailed(String),
    /// The source does not exist (deleted while an obligation was pending)
    #[error("Source {0} not found")]
    NotFound(SourceId),
}

/// Per-fetch tallies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub source_id: SourceId,
    pub inserted: usize,
    /// Entries whose dedup key was already stored
    pub skipped_existing: usize,
    /// Entries older than the import window
    pub skipped_old: usize,
}

/// Normalization and filtering knobs, filled from [`crate::config::Config`]
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Entries considered per fetch, in document order
    pub max_items: usize,
    /// Entries published longer ago than this are skipped
    pub import_window: Duration,
    pub excerpt_chars: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_items: 50,
            import_window: Duration::from_secs(7 * 24 * 60 * 60),
            excerpt_chars: 300,
        }
    }
}

/// Fetches one source at a time and ingests its new entries
pub struct Fetcher {
    sources: Arc<dyn SourceStore>,
    items: Arc<dyn ItemStore>,
    retriever: Arc<dyn FeedRetriever>,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        items: Arc<dyn ItemStore>,
        retriever: Arc<dyn FeedRetriever>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            sources,
            items,
            retriever,
            settings,
        }
    }

    /// Fetch a source and insert entries not seen before.
    ///
    /// Idempotent: a second fetch of an unchanged feed inserts nothing.
    pub async fn fetch(&self, source_id: SourceId) -> Result<FetchOutcome, FetchError> {
        let source = self
            .sources
            .get(source_id)
            .await
            .map_err(|e| FetchError::StoreReadFailed(e.to_string()))?
            .ok_or(FetchError::NotFound(source_id))?;

        if !source.has_url() {
            // last_fetched and fetch_status stay untouched; only the message is recorded
            let meta = SourceMeta {
                last_error: Some(FetchError::NoUrl.to_string()),
                ..Default::default()
            };
            self.write_meta(source_id, &meta).await?;
            tracing::warn!(source_id, "Source has no feed URL, skipping fetch");
            return Err(FetchError::NoUrl);
        }

        let now = chrono::Utc::now().timestamp();

        let feed = match self.retriever.retrieve(source.feed_url.trim()).await {
            Ok(feed) => feed,
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(source_id, url = %source.feed_url, error = %message, "Feed retrieval failed");
                let meta = SourceMeta {
                    last_error: Some(message.clone()),
                    last_fetched: Some(now),
                    fetch_status: Some(FetchStatus::Error),
                    ..Default::default()
                };
                self.write_meta(source_id, &meta).await?;
                return Err(FetchError::FetchFailed(message));
            }
        };

        if let Some(site_url) = feed.site_url.as_ref().filter(|s| source.site_url.as_ref() != Some(*s)) {
            let meta = SourceMeta {
                site_url: Some(site_url.clone()),
                ..Default::default()
            };
            self.write_meta(source_id, &meta).await?;
        }

        let cutoff = now.saturating_sub(self.settings.import_window.as_secs() as i64);
        let mut outcome = FetchOutcome {
            source_id,
            ..Default::default()
        };
        let mut failures: Vec<String> = Vec::new();

        for entry in feed.entries.iter().take(self.settings.max_items) {
            if entry.published.is_some_and(|published| published < cutoff) {
                outcome.skipped_old += 1;
                continue;
            }

            match self.ingest(&source, entry, now).await {
                Ok(true) => outcome.inserted += 1,
                Ok(false) => outcome.skipped_existing += 1,
                Err(e) => {
                    tracing::warn!(source_id, error = %e, "Failed to store entry");
                    failures.push(e.to_string());
                }
            }
        }

        if !failures.is_empty() {
            let message = format!(
                "{} of {} entries could not be stored: {}",
                failures.len(),
                feed.entries.len().min(self.settings.max_items),
                failures[0]
            );
            let meta = SourceMeta {
                last_error: Some(message.clone()),
                last_fetched: Some(now),
                fetch_status: Some(FetchStatus::Error),
                ..Default::default()
            };
            self.write_meta(source_id, &meta).await?;
            return Err(FetchError::StoreWriteFailed(message));
        }

        let meta = SourceMeta {
            last_error: Some(String::new()),
            last_fetched: Some(now),
            fetch_status: Some(FetchStatus::Ok),
            ..Default::default()
        };
        self.write_meta(source_id, &meta).await?;

        tracing::info!(
            source_id,
            inserted = outcome.inserted,
            skipped_existing = outcome.skipped_existing,
            skipped_old = outcome.skipped_old,
            "Fetch complete"
        );
        Ok(outcome)
    }

    /// Fetch every active source one after another, discarding individual errors.
    ///
    /// Returns the outcomes of the fetches that succeeded.
    pub async fn fetch_all(&self) -> Vec<FetchOutcome> {
        let sources = match self.sources.list_active().await {
            Ok(sources) => sources,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list active sources");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(sources.len());
        for source in sources {
            match self.fetch(source.id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::debug!(source_id = source.id, error = %e, "Fetch failed"),
            }
        }
        outcomes
    }

    /// Normalize and insert one entry. `Ok(false)` means it was already stored.
    async fn ingest(
        &self,
        source: &Source,
        entry: &ParsedEntry,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let dedup_key = entry.dedup_key();

        if self.items.exists(source.id, &dedup_key).await? {
            tracing::debug!(source_id = source.id, key = %dedup_key, "Entry already ingested");
            return Ok(false);
        }

        let item = normalize_entry(source, entry, dedup_key, now, self.settings.excerpt_chars);
        match self.items.insert(&item).await {
            Ok(_) => Ok(true),
            // A concurrent fetch of the same source got there first
            Err(DatabaseError::Duplicate(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn write_meta(&self, source_id: SourceId, meta: &SourceMeta) -> Result<(), FetchError> {
        match self.sources.update_meta(source_id, meta).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(FetchError::NotFound(source_id)),
            Err(e) => Err(FetchError::StoreWriteFailed(e.to_string())),
        }
    }
}

/// Turn a parsed entry into a storable item.
///
/// Title falls back to "Untitled", body to the description, publish time to
/// `now`. The excerpt prefers the description over the body.
pub fn normalize_entry(
    source: &Source,
    entry: &ParsedEntry,
    dedup_key: String,
    now: i64,
    excerpt_chars: usize,
) -> NewItem {
    let title = entry
        .title
        .as_deref()
        .map(|t| strip_control_chars(t.trim()).trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());

    let content = entry
        .content
        .clone()
        .or_else(|| entry.description.clone())
        .unwrap_or_default();

    let excerpt_source = entry.description.as_deref().unwrap_or(&content);
    let excerpt = make_excerpt(excerpt_source, excerpt_chars);

    let author = entry
        .author
        .as_deref()
        .map(|a| strip_control_chars(a.trim()).trim().to_string())
        .filter(|a| !a.is_empty());

    let thumbnail_url = resolve_thumbnail(&entry.media, &content)
        .map(|thumb| absolutize(&thumb, entry.permalink.as_deref()));

    NewItem {
        source_id: source.id,
        permalink: dedup_key,
        title,
        content,
        excerpt,
        author,
        thumbnail_url,
        published_at: entry.published.unwrap_or(now),
        category_ids: source.category_ids.clone(),
    }
}

/// Resolve a relative thumbnail URL against the entry's permalink
fn absolutize(thumb: &str, base: Option<&str>) -> String {
    if url::Url::parse(thumb).is_ok() {
        return thumb.to_string();
    }
    base.and_then(|b| url::Url::parse(b).ok())
        .and_then(|b| b.join(thumb).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| thumb.to_string())
}
