mod categories;
mod items;
mod schema;
mod sources;
mod store;
mod types;

pub use schema::Database;
pub use store::{ItemStore, SourceStore};
pub use types::{
    Category, DatabaseError, FavoriteFilter, FetchStatus, Item, ItemFilter, ItemId, ItemStatus,
    NewItem, NewSource, Source, SourceId, SourceMeta, SourceStatus, SourceUpdate,
    DEFAULT_REFRESH_INTERVAL_SECS,
};
