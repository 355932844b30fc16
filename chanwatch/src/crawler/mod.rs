//! Crawl engine.
//!
//! This module provides:
//! - [`normalize`]: URL canonicalization used for dedup
//! - [`ledger`]: per-hostname bot-block cooldowns
//! - [`Crawler`]: the per-channel discover/dedup/dispatch pass

pub mod ledger;
pub mod normalize;
pub mod orchestrator;

use thiserror::Error;

use crate::database::DatabaseError;

pub use ledger::{BlockLedger, BlockWait, CooldownTable, LedgerStatus};
pub use normalize::normalize_url;
pub use orchestrator::{CrawlOutcome, Crawler, CrawlerConfig, FailedFetch, IgnoreOutcome};

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel {0} has no URLs")]
    NoUrls(i64),
}

pub type Result<T> = std::result::Result<T, CrawlError>;
