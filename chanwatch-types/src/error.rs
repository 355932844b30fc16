//! Error types shared between the crawl engine and its collaborators.

use thiserror::Error;

use crate::types::BlockContext;

/// Errors returned by the scraper and fetcher collaborators.
///
/// The variant is decided where the failure is detected (usually while
/// reading a subprocess's stderr), so callers never match on message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The source site flagged the request as automated traffic.
    #[error("Bot activity detected on {hostname} ({context})")]
    BotBlocked {
        hostname: String,
        context: BlockContext,
    },

    /// A failure worth retrying (network hiccup, timeout, 5xx).
    #[error("Transient failure: {0}")]
    Transient(String),

    /// A failure that retrying will not fix (unsupported URL, removed video).
    #[error("Fatal failure: {0}")]
    Fatal(String),
}

impl FetchError {
    /// Whether the failure should be retried under the channel's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Malformed input, rejected before any state is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Channel name must not be empty")]
    EmptyName,

    #[error("Channel must have at least one URL")]
    NoUrls,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Duplicate URL in request: {0}")]
    DuplicateUrl(String),

    #[error("Login URL given without a username for {0}")]
    IncompleteCredentials(String),
}
