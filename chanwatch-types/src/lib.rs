//! Shared types for the chanwatch channel crawler.
//!
//! This crate defines the data that travels between the persistence layer,
//! the crawl engine and the external collaborators:
//!
//! - [`ChannelSettings`]: the versionless per-channel settings blob
//! - [`PostProcessArgs`]: the versionless per-channel post-processing blob
//! - [`BlockEntry`] / [`BlockContext`]: bot-block ledger entries carried
//!   inside the settings blob
//! - [`Cookie`]: a single cookie as read from a login flow or browser store
//! - [`FetchError`]: the tagged collaborator error taxonomy
//!
//! # Example
//!
//! ```rust
//! use chanwatch_types::{BlockContext, ChannelSettings};
//!
//! // Unknown fields are ignored and missing fields fall back to defaults.
//! let settings: ChannelSettings =
//!     serde_json::from_str(r#"{"concurrency": 4, "future_knob": true}"#).unwrap();
//! assert_eq!(settings.concurrency, 4);
//! assert_eq!(settings.crawl_freq_minutes, 30);
//! assert!(!settings.is_blocked());
//!
//! let ctx: BlockContext = "cookie_based".parse().unwrap();
//! assert_eq!(ctx, BlockContext::CookieBased);
//! ```

pub mod error;
pub mod settings;
pub mod types;

pub use error::{FetchError, ValidationError};
pub use settings::{
    BlockEntry, ChannelSettings, FilterOp, MoveOp, PostProcessArgs, DEFAULT_CRAWL_FREQ_MINUTES,
    MAX_CONCURRENCY,
};
pub use types::{BlockContext, Cookie, DownloadStatus, BOT_ACTIVITY_SENTINEL};
