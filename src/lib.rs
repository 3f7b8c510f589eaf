//! Feed synchronization and merged activity streams.
//!
//! Refresh requests arrive as batches on a queue; workers claim a per-feed
//! lock in the store, fetch and parse the feed, and append new entries.
//! The read side merges entries across feeds into time-ordered pages with
//! social metrics attached, behind a short-lived response cache.

pub mod config;
pub mod feed;
pub mod refresh;
pub mod storage;
pub mod stream;
pub mod util;
pub mod web;
