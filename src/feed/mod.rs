//! Feed retrieval and normalization.
//!
//! - [`fetcher`] - HTTP download with a hard timeout and body size limit
//! - [`parser`] - RSS/Atom/JSON Feed → normalized entries via `feed-rs`,
//!   with a lenient `quick-xml` scan for documents `feed-rs` rejects
//! - [`staleness`] - freshness and quarantine checks
//!
//! ```ignore
//! use feedsync::feed::{fetch_feed, parse_document, DEFAULT_MAX_ENTRIES, MAX_FEED_SIZE};
//!
//! let bytes = fetch_feed(&client, &feed.url, timeout, MAX_FEED_SIZE).await?;
//! let outcome = parse_document(&bytes, DEFAULT_MAX_ENTRIES)?;
//! ```

mod fetcher;
mod lenient;
mod parser;
mod staleness;

pub use fetcher::{fetch_feed, FetchError, MAX_FEED_SIZE};
pub use parser::{parse, parse_document, ParseError, ParseOutcome, DEFAULT_MAX_ENTRIES};
pub use staleness::{is_quarantined, is_stale};
