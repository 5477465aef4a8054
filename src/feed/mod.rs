//! Feed retrieval, parsing and ingestion.
//!
//! - [`retrieve`] - HTTP download with retries, size cap and timeout
//! - [`parser`] - RSS/Atom parsing via `feed-rs`
//! - [`media`] - enclosure and Media RSS extraction via `quick-xml`
//! - [`thumbnail`] - the thumbnail fallback chain
//! - [`fetcher`] - per-source fetch: normalize, dedup, insert, record status

mod fetcher;
mod media;
mod parser;
mod retrieve;
mod thumbnail;

pub use fetcher::{normalize_entry, FetchError, FetchOutcome, FetchSettings, Fetcher};
pub use media::{scan_entry_media, Enclosure, EntryMedia, MediaContent};
pub use parser::{parse_feed, ParsedEntry, ParsedFeed};
pub use retrieve::{FeedRetriever, HttpRetriever, RetrieveError, RetrieveSettings};
pub use thumbnail::resolve_thumbnail;
