use thiserror::Error;

/// Registry-assigned source identifier (SQLite rowid)
pub type SourceId = i64;

/// Store-assigned item identifier (SQLite rowid)
pub type ItemId = i64;

/// Default refresh interval for new sources (1 hour)
pub const DEFAULT_REFRESH_INTERVAL_SECS: i64 = 3600;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Database is locked by another process")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A row with the same unique key already exists
    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    /// A stored value could not be decoded into its domain type
    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }

    /// Map a failed INSERT, distinguishing UNIQUE violations from other errors
    pub(crate) fn from_insert(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return DatabaseError::Duplicate(db_err.message().to_string());
            }
        }
        Self::from_sqlx(err)
    }
}

// ============================================================================
// Status Enums
// ============================================================================

/// Lifecycle status of a source. Only active sources are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Active,
    Inactive,
}

impl SourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DatabaseError> {
        match s {
            "active" => Ok(SourceStatus::Active),
            "inactive" => Ok(SourceStatus::Inactive),
            other => Err(DatabaseError::InvalidValue(format!(
                "unknown source status '{}'",
                other
            ))),
        }
    }
}

/// Outcome of the most recent fetch, shown next to the source in the UI.
///
/// `Error` does not deactivate the source: failing sources keep their
/// obligation and are retried on the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Never fetched successfully yet
    Pending,
    Ok,
    Error,
}

impl FetchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchStatus::Pending => "pending",
            FetchStatus::Ok => "ok",
            FetchStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DatabaseError> {
        match s {
            "pending" => Ok(FetchStatus::Pending),
            "ok" => Ok(FetchStatus::Ok),
            "error" => Ok(FetchStatus::Error),
            other => Err(DatabaseError::InvalidValue(format!(
                "unknown fetch status '{}'",
                other
            ))),
        }
    }
}

/// Item visibility state. `Retired` items are read-and-archived and are the
/// only ones the pruner may delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Published,
    Retired,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Published => "published",
            ItemStatus::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DatabaseError> {
        match s {
            "published" => Ok(ItemStatus::Published),
            "retired" => Ok(ItemStatus::Retired),
            other => Err(DatabaseError::InvalidValue(format!(
                "unknown item status '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// Sources
// ============================================================================

/// A subscribed feed endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: SourceId,
    pub title: String,
    /// Feed document URL. Empty means misconfigured.
    pub feed_url: String,
    /// Website the feed belongs to, learned from the feed itself
    pub site_url: Option<String>,
    pub refresh_interval: i64,
    /// Epoch seconds, 0 if never fetched
    pub last_fetched: i64,
    /// Empty if the last fetch succeeded
    pub last_error: String,
    pub status: SourceStatus,
    pub fetch_status: FetchStatus,
    pub category_ids: Vec<i64>,
    pub created_at: i64,
}

impl Source {
    pub fn is_active(&self) -> bool {
        self.status == SourceStatus::Active
    }

    pub fn has_url(&self) -> bool {
        !self.feed_url.trim().is_empty()
    }
}

/// Fields for creating a source
#[derive(Debug, Clone)]
pub struct NewSource {
    pub title: String,
    pub feed_url: String,
    pub refresh_interval: i64,
    pub status: SourceStatus,
    pub category_ids: Vec<i64>,
}

impl NewSource {
    pub fn new(feed_url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            feed_url: feed_url.into(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL_SECS,
            status: SourceStatus::Active,
            category_ids: Vec::new(),
        }
    }

    pub fn with_refresh_interval(mut self, secs: i64) -> Self {
        self.refresh_interval = secs;
        self
    }

    pub fn with_categories(mut self, category_ids: Vec<i64>) -> Self {
        self.category_ids = category_ids;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.status = SourceStatus::Inactive;
        self
    }
}

/// User-editable source fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct SourceUpdate {
    pub title: Option<String>,
    pub feed_url: Option<String>,
    pub refresh_interval: Option<i64>,
    pub category_ids: Option<Vec<i64>>,
}

impl SourceUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.feed_url.is_none()
            && self.refresh_interval.is_none()
            && self.category_ids.is_none()
    }
}

/// Fetch bookkeeping written back by the fetcher. `None` leaves a field
/// unchanged; `last_error: Some(String::new())` clears the error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceMeta {
    pub site_url: Option<String>,
    pub last_fetched: Option<i64>,
    pub last_error: Option<String>,
    pub fetch_status: Option<FetchStatus>,
}

impl SourceMeta {
    pub fn is_empty(&self) -> bool {
        self.site_url.is_none()
            && self.last_fetched.is_none()
            && self.last_error.is_none()
            && self.fetch_status.is_none()
    }
}

/// Internal row type for source queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SourceRow {
    pub id: i64,
    pub title: String,
    pub feed_url: String,
    pub site_url: Option<String>,
    pub refresh_interval: i64,
    pub last_fetched: i64,
    pub last_error: String,
    pub status: String,
    pub fetch_status: String,
    pub created_at: i64,
}

impl SourceRow {
    pub(crate) fn into_source(self, category_ids: Vec<i64>) -> Result<Source, DatabaseError> {
        Ok(Source {
            id: self.id,
            title: self.title,
            feed_url: self.feed_url,
            site_url: self.site_url,
            refresh_interval: self.refresh_interval,
            last_fetched: self.last_fetched,
            last_error: self.last_error,
            status: SourceStatus::parse(&self.status)?,
            fetch_status: FetchStatus::parse(&self.fetch_status)?,
            category_ids,
            created_at: self.created_at,
        })
    }
}

// ============================================================================
// Items
// ============================================================================

/// A normalized entry ready to be stored
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub source_id: SourceId,
    pub permalink: String,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub author: Option<String>,
    pub thumbnail_url: Option<String>,
    /// Epoch seconds; ingestion time when the feed gave none
    pub published_at: i64,
    pub category_ids: Vec<i64>,
}

/// A stored item
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: ItemId,
    pub source_id: SourceId,
    pub permalink: String,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub author: Option<String>,
    pub thumbnail_url: Option<String>,
    pub published_at: i64,
    pub fetched_at: i64,
    pub status: ItemStatus,
    pub is_read: bool,
    /// `None` when the flag was never set
    pub is_favorite: Option<bool>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemRow {
    pub id: i64,
    pub source_id: i64,
    pub permalink: String,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub author: Option<String>,
    pub thumbnail_url: Option<String>,
    pub published_at: i64,
    pub fetched_at: i64,
    pub status: String,
    pub is_read: bool,
    pub is_favorite: Option<bool>,
}

impl ItemRow {
    pub(crate) fn into_item(self) -> Result<Item, DatabaseError> {
        Ok(Item {
            id: self.id,
            source_id: self.source_id,
            permalink: self.permalink,
            title: self.title,
            content: self.content,
            excerpt: self.excerpt,
            author: self.author,
            thumbnail_url: self.thumbnail_url,
            published_at: self.published_at,
            fetched_at: self.fetched_at,
            status: ItemStatus::parse(&self.status)?,
            is_read: self.is_read,
            is_favorite: self.is_favorite,
        })
    }
}

/// How the favorite flag participates in an item filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FavoriteFilter {
    #[default]
    Any,
    /// Flag set to true
    Favorited,
    /// Flag absent OR false
    NotFavorited,
}

/// Predicate for `ItemStore::list_by_filter`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub source_id: Option<SourceId>,
    pub status: Option<ItemStatus>,
    pub favorite: FavoriteFilter,
    /// Only items published strictly before this epoch second
    pub published_before: Option<i64>,
    pub limit: Option<i64>,
}

// ============================================================================
// Categories
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
}
