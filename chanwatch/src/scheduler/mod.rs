//! Scheduled task management for chanwatch.
//!
//! This module provides:
//! - [`CrawlScheduler`]: Periodic channel crawling with frequency gating

pub mod crawl_scheduler;

pub use crawl_scheduler::{CrawlScheduler, CrawlSchedulerConfig, RunSummary};
