//! Periodic crawl scheduler.
//!
//! This module decides which channels to crawl and when.
//!
//! # How It Works
//!
//! 1. Every check interval, all channels are loaded from the database
//! 2. Paused channels and channels whose `last_scan + crawl_freq_minutes`
//!    lies in the future are skipped
//! 3. The bot-block ledger is consulted; a channel with any hostname still
//!    cooling down is skipped
//! 4. Remaining channels are crawled one at a time under their channel lock
//!
//! One channel failing does not stop the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::crawler::{Crawler, LedgerStatus, Result};
use crate::database::{ChannelLocks, ChannelRecord, DatabaseError, DatabaseHandle};

/// Crawl scheduler configuration.
#[derive(Debug, Clone)]
pub struct CrawlSchedulerConfig {
    /// Interval between scheduler checks (seconds).
    pub check_interval_secs: u64,
    /// Interval between program lock heartbeats (seconds).
    pub heartbeat_secs: u64,
}

impl Default for CrawlSchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 300,
            heartbeat_secs: 30,
        }
    }
}

/// Counters for one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub crawled: usize,
    pub new_videos: usize,
    pub paused: usize,
    pub not_due: usize,
    pub blocked: usize,
    pub busy: usize,
    pub failed: usize,
}

/// Whether a channel's crawl frequency allows a pass at `now`.
pub fn is_due(channel: &ChannelRecord, now: i64) -> bool {
    match channel.last_scan {
        None => true,
        Some(last) => {
            let freq_secs = channel.settings.crawl_freq_minutes.saturating_mul(60) as i64;
            last.saturating_add(freq_secs) <= now
        }
    }
}

pub struct CrawlScheduler {
    crawler: Arc<Crawler>,
    locks: Arc<ChannelLocks>,
    config: CrawlSchedulerConfig,
}

impl CrawlScheduler {
    pub fn new(crawler: Arc<Crawler>, locks: Arc<ChannelLocks>, config: CrawlSchedulerConfig) -> Self {
        Self {
            crawler,
            locks,
            config,
        }
    }

    /// One pass over every channel.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunSummary> {
        let now = Utc::now().timestamp();
        let channels = {
            let db = self.crawler.database().lock().await;
            db.list_channels()?
        };
        let mut summary = RunSummary::default();

        for channel in channels {
            if cancel.is_cancelled() {
                info!("CrawlScheduler: Cancelled, stopping run");
                break;
            }
            if channel.settings.paused {
                debug!("CrawlScheduler: {} is paused", channel.name);
                summary.paused += 1;
                continue;
            }
            if !is_due(&channel, now) {
                debug!("CrawlScheduler: {} is not due yet", channel.name);
                summary.not_due += 1;
                continue;
            }

            let Some(guard) = self.locks.try_lock(channel.id) else {
                warn!("CrawlScheduler: {} is locked by another task, skipping", channel.name);
                summary.busy += 1;
                continue;
            };

            let status = {
                let db = self.crawler.database().lock().await;
                self.crawler.ledger().check_or_unlock(&db, &guard)
            };
            match status {
                Ok(LedgerStatus::Clear) => {}
                Ok(LedgerStatus::Blocked { remaining }) => {
                    let longest = remaining.iter().filter_map(|w| w.remaining).max();
                    match longest {
                        Some(wait) if remaining.iter().all(|w| w.remaining.is_some()) => info!(
                            "CrawlScheduler: {} is bot-blocked on {} host(s), retry in {}m",
                            channel.name,
                            remaining.len(),
                            wait.as_secs().div_ceil(60)
                        ),
                        _ => info!(
                            "CrawlScheduler: {} is bot-blocked on {} host(s), needs a manual unblock",
                            channel.name,
                            remaining.len()
                        ),
                    }
                    summary.blocked += 1;
                    continue;
                }
                Err(e) => {
                    error!("CrawlScheduler: ledger check for {} failed: {}", channel.name, e);
                    summary.failed += 1;
                    continue;
                }
            }

            match self.crawler.crawl_channel(&guard, cancel).await {
                Ok(outcome) => {
                    summary.crawled += 1;
                    summary.new_videos += outcome.new_videos.len();
                    for failed in &outcome.failed {
                        warn!("CrawlScheduler: {}: {} failed: {}", channel.name, failed.url, failed.error);
                    }
                }
                Err(e) => {
                    error!("CrawlScheduler: crawl of {} failed: {}", channel.name, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "CrawlScheduler: run finished: {} crawled ({} new videos), {} not due, {} paused, {} blocked, {} failed",
            summary.crawled,
            summary.new_videos,
            summary.not_due,
            summary.paused,
            summary.blocked,
            summary.failed
        );
        Ok(summary)
    }

    /// Repeat [`run_once`](Self::run_once) until cancelled.
    pub async fn watch(&self, cancel: &CancellationToken) {
        info!(
            "CrawlScheduler: Starting with check interval {} seconds",
            self.config.check_interval_secs
        );
        let mut check_interval = interval(Duration::from_secs(self.config.check_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("CrawlScheduler: Stopped");
                    break;
                }
                _ = check_interval.tick() => {}
            }

            if let Err(e) = self.run_once(cancel).await {
                error!("CrawlScheduler: Error during run: {}", e);
            }
        }
    }

    /// Keep the program lock fresh until cancelled.
    ///
    /// Losing the lock to another process cancels `cancel`.
    pub fn spawn_heartbeat(
        &self,
        database: DatabaseHandle,
        pid: u32,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let every = Duration::from_secs(self.config.heartbeat_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let result = database.lock().await.program_heartbeat(pid);
                match result {
                    Ok(()) => debug!("CrawlScheduler: heartbeat pid={}", pid),
                    Err(DatabaseError::LockLost(_)) => {
                        error!("CrawlScheduler: program lock taken over by another process, stopping");
                        cancel.cancel();
                        break;
                    }
                    Err(e) => warn!("CrawlScheduler: heartbeat failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::resolver::tests::{MockBrowser, MockLogin};
    use crate::auth::{AuthCache, AuthResolver};
    use crate::collab::{FetchRequest, FetchResult, Fetcher, ScrapeRequest, Scraper};
    use crate::crawler::{BlockLedger, CooldownTable, CrawlerConfig};
    use crate::database::{Database, NewChannel};
    use async_trait::async_trait;
    use chanwatch_types::{BlockContext, ChannelSettings, FetchError};
    use std::convert::Infallible;

    struct OneVideoPerPage;

    #[async_trait]
    impl Scraper for OneVideoPerPage {
        async fn list_video_urls(&self, request: &ScrapeRequest) -> std::result::Result<Vec<String>, FetchError> {
            Ok(vec![format!("{}/video", request.page_url)])
        }
    }

    struct AlwaysOk;

    #[async_trait]
    impl Fetcher for AlwaysOk {
        async fn fetch(&self, _: FetchRequest) -> std::result::Result<FetchResult, FetchError> {
            Ok(FetchResult::default())
        }
    }

    fn scheduler(db: Database, dir: &std::path::Path) -> (CrawlScheduler, Arc<ChannelLocks>) {
        let mut cooldowns = CooldownTable::empty();
        cooldowns.insert("blocked.com", 60);
        let auth = AuthResolver::new(
            Arc::new(AuthCache::new()),
            Arc::new(MockBrowser(Vec::new())),
            Arc::new(MockLogin::new(Vec::new())),
            dir,
        );
        let crawler = Crawler::new(
            db.into_handle(),
            Arc::new(OneVideoPerPage),
            Arc::new(AlwaysOk),
            Arc::new(auth),
            Arc::new(BlockLedger::new(cooldowns)),
            CrawlerConfig::default(),
        );
        let locks = Arc::new(ChannelLocks::new());
        (
            CrawlScheduler::new(Arc::new(crawler), locks.clone(), CrawlSchedulerConfig::default()),
            locks,
        )
    }

    fn record(last_scan: Option<i64>, freq: u64) -> ChannelRecord {
        ChannelRecord {
            id: 1,
            name: "Demo".into(),
            settings: ChannelSettings {
                crawl_freq_minutes: freq,
                ..Default::default()
            },
            postproc_args: Default::default(),
            last_scan,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_is_due() {
        assert!(is_due(&record(None, 30), 1_000));
        assert!(!is_due(&record(Some(1_000), 30), 1_000 + 29 * 60));
        assert!(is_due(&record(Some(1_000), 30), 1_000 + 30 * 60));
    }

    #[tokio::test]
    async fn test_run_once_applies_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_in_memory().unwrap();
        let fresh = db
            .create_channel(&NewChannel::new("fresh").with_url("https://a.com/c"))
            .unwrap();
        let mut paused = NewChannel::new("paused").with_url("https://b.com/c");
        paused.settings.paused = true;
        db.create_channel(&paused).unwrap();
        let recent = db
            .create_channel(&NewChannel::new("recent").with_url("https://c.com/c"))
            .unwrap();
        db.touch_channel_scan(recent, Utc::now().timestamp()).unwrap();
        let blocked = db
            .create_channel(&NewChannel::new("blocked").with_url("https://blocked.com/c"))
            .unwrap();

        let (scheduler, locks) = scheduler(db, dir.path());
        {
            let guard = locks.try_lock(blocked).unwrap();
            let db = scheduler.crawler.database().lock().await;
            db.update_channel_settings(&guard, |s| {
                s.record_block("blocked.com", BlockContext::Unauthenticated, Utc::now());
                Ok::<_, Infallible>(())
            })
            .unwrap();
        }

        let summary = scheduler.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                crawled: 1,
                new_videos: 1,
                paused: 1,
                not_due: 1,
                blocked: 1,
                busy: 0,
                failed: 0,
            }
        );

        let db = scheduler.crawler.database().lock().await;
        assert_eq!(db.list_videos(fresh).unwrap().len(), 1);
        assert!(db.list_videos(blocked).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_busy_channel_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_in_memory().unwrap();
        let id = db
            .create_channel(&NewChannel::new("demo").with_url("https://a.com/c"))
            .unwrap();
        let (scheduler, locks) = scheduler(db, dir.path());

        let _held = locks.try_lock(id).unwrap();
        let summary = scheduler.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.busy, 1);
        assert_eq!(summary.crawled, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_cancels_when_lock_lost() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_in_memory().unwrap();
        db.program_start_at(100, "alpha", 0).unwrap();
        db.program_start_at(200, "beta", 1_000).unwrap();

        let (scheduler, _) = scheduler(db, dir.path());
        let cancel = CancellationToken::new();
        let handle =
            scheduler.spawn_heartbeat(scheduler.crawler.database().clone(), 100, cancel.clone());

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());
    }
}
