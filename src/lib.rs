//! feedmill: a feed aggregation engine.
//!
//! Sources are polled on per-source schedules, entries are normalized and
//! stored once per permalink, and retired items are pruned after a
//! retention period. [`engine::Engine`] wires everything together.

pub mod bulk;
pub mod config;
pub mod engine;
pub mod feed;
pub mod prune;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod util;
