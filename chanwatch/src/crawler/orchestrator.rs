//! Per-channel crawl pass.
//!
//! # How It Works
//!
//! 1. Every channel URL gets its cookies resolved and its page listed
//! 2. Listed URLs are normalized and compared with every stored video URL
//! 3. New URLs are fetched through a worker pool bounded by the channel's
//!    concurrency, each with the channel's retry count
//! 4. A bot block stops all remaining work for that hostname in this pass
//!    and is recorded in the ledger; other hostnames carry on
//! 5. Scan timestamps are updated once the pass completes
//!
//! Frequency gating is the caller's job. A call always performs a full pass.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::ledger::BlockLedger;
use super::normalize::{hostname_of, normalize_url};
use super::{CrawlError, Result};
use crate::auth::{AuthError, AuthResolver, ResolvedAuth};
use crate::collab::{FetchOptions, FetchRequest, Fetcher, ScrapeRequest, Scraper};
use crate::database::{
    ChannelGuard, ChannelWithUrls, CompletedVideo, DatabaseError, DatabaseHandle, NewVideo,
    VideoRecord,
};
use chanwatch_types::{BlockContext, ChannelSettings, DownloadStatus, FetchError};

/// Crawl engine tuning.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Base delay between retries; attempt N waits N times this.
    pub retry_backoff: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// A URL that could not be listed or fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFetch {
    pub url: String,
    pub error: String,
}

/// Result of [`Crawler::crawl_channel`].
#[derive(Debug, Clone, Default)]
pub struct CrawlOutcome {
    pub channel_id: i64,
    /// Video rows created by this pass, finished or failed.
    pub new_videos: Vec<VideoRecord>,
    pub failed: Vec<FailedFetch>,
    pub blocked_hosts: Vec<String>,
    pub cancelled: bool,
}

/// Result of [`Crawler::crawl_channel_ignore`].
#[derive(Debug, Clone, Default)]
pub struct IgnoreOutcome {
    pub channel_id: i64,
    pub ignored: usize,
    pub failed: Vec<FailedFetch>,
    pub blocked_hosts: Vec<String>,
    pub cancelled: bool,
}

/// A newly discovered URL waiting for dispatch.
#[derive(Debug, Clone)]
struct Candidate {
    url: String,
    channel_url_id: i64,
    hostname: String,
    context: BlockContext,
    cookie_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Discovery {
    candidates: Vec<Candidate>,
    failed: Vec<FailedFetch>,
    blocked_hosts: Vec<String>,
    cancelled: bool,
}

enum WorkerOutcome {
    Fetched(i64),
    Failed(i64, FailedFetch),
    Blocked(String),
    Skipped,
}

pub struct Crawler {
    database: DatabaseHandle,
    scraper: Arc<dyn Scraper>,
    fetcher: Arc<dyn Fetcher>,
    auth: Arc<AuthResolver>,
    ledger: Arc<BlockLedger>,
    config: CrawlerConfig,
}

impl Crawler {
    pub fn new(
        database: DatabaseHandle,
        scraper: Arc<dyn Scraper>,
        fetcher: Arc<dyn Fetcher>,
        auth: Arc<AuthResolver>,
        ledger: Arc<BlockLedger>,
        config: CrawlerConfig,
    ) -> Self {
        Self {
            database,
            scraper,
            fetcher,
            auth,
            ledger,
            config,
        }
    }

    pub fn database(&self) -> &DatabaseHandle {
        &self.database
    }

    pub fn ledger(&self) -> &BlockLedger {
        &self.ledger
    }

    /// Discover new videos for the guarded channel and fetch them.
    pub async fn crawl_channel(
        &self,
        guard: &ChannelGuard,
        cancel: &CancellationToken,
    ) -> Result<CrawlOutcome> {
        let channel = self.load_channel(guard).await?;
        let settings = channel.channel.settings.clone();
        info!(
            "crawl_channel: starting {} ({} URL(s), concurrency {})",
            channel.channel.name,
            channel.urls.len(),
            settings.effective_concurrency()
        );

        let discovery = self.discover(guard, &channel, cancel).await?;
        let mut outcome = CrawlOutcome {
            channel_id: guard.channel_id(),
            failed: discovery.failed,
            blocked_hosts: discovery.blocked_hosts,
            cancelled: discovery.cancelled,
            ..Default::default()
        };

        let options = FetchOptions::from_settings(&settings);
        let abandoned: Mutex<HashSet<String>> =
            Mutex::new(outcome.blocked_hosts.iter().cloned().collect());

        let results: Vec<std::result::Result<WorkerOutcome, DatabaseError>> =
            stream::iter(discovery.candidates)
                .map(|candidate| {
                    self.fetch_one(guard, candidate, &settings, &options, &abandoned, cancel)
                })
                .buffer_unordered(settings.effective_concurrency())
                .collect()
                .await;

        let mut created = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(WorkerOutcome::Fetched(id)) => created.push(id),
                Ok(WorkerOutcome::Failed(id, failed)) => {
                    created.push(id);
                    outcome.failed.push(failed);
                }
                Ok(WorkerOutcome::Blocked(host)) => {
                    if !outcome.blocked_hosts.contains(&host) {
                        outcome.blocked_hosts.push(host);
                    }
                }
                Ok(WorkerOutcome::Skipped) => {}
                Err(e) => {
                    error!("crawl_channel: persistence error: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e.into());
        }
        outcome.cancelled |= cancel.is_cancelled();

        {
            let db = self.database.lock().await;
            created.sort_unstable();
            for id in created {
                if let Some(video) = db.get_video(id)? {
                    outcome.new_videos.push(video);
                }
            }
            if !outcome.cancelled {
                db.touch_channel_scan(guard.channel_id(), Utc::now().timestamp())?;
            }
        }

        info!(
            "crawl_channel: {} done: {} new, {} failed, {} blocked host(s){}",
            channel.channel.name,
            outcome.new_videos.len(),
            outcome.failed.len(),
            outcome.blocked_hosts.len(),
            if outcome.cancelled { " (cancelled)" } else { "" }
        );
        Ok(outcome)
    }

    /// Mark everything currently listed as handled without fetching it.
    pub async fn crawl_channel_ignore(
        &self,
        guard: &ChannelGuard,
        cancel: &CancellationToken,
    ) -> Result<IgnoreOutcome> {
        let channel = self.load_channel(guard).await?;
        let discovery = self.discover(guard, &channel, cancel).await?;

        let batch: Vec<NewVideo> = discovery
            .candidates
            .iter()
            .map(|c| NewVideo::ignored(guard.channel_id(), Some(c.channel_url_id), &c.url))
            .collect();

        let ignored = {
            let mut db = self.database.lock().await;
            let inserted = db.insert_ignored_videos(&batch)?;
            if !discovery.cancelled {
                db.touch_channel_scan(guard.channel_id(), Utc::now().timestamp())?;
            }
            inserted.len()
        };

        info!(
            "crawl_channel_ignore: {} marked {} video(s) as handled",
            channel.channel.name, ignored
        );
        Ok(IgnoreOutcome {
            channel_id: guard.channel_id(),
            ignored,
            failed: discovery.failed,
            blocked_hosts: discovery.blocked_hosts,
            cancelled: discovery.cancelled,
        })
    }

    async fn load_channel(&self, guard: &ChannelGuard) -> Result<ChannelWithUrls> {
        let db = self.database.lock().await;
        let channel = db
            .get_channel_with_urls(guard.channel_id())?
            .ok_or_else(|| DatabaseError::ChannelNotFound(format!("id={}", guard.channel_id())))?;
        if channel.urls.is_empty() {
            return Err(CrawlError::NoUrls(guard.channel_id()));
        }
        Ok(channel)
    }

    /// List every channel URL and keep the candidates not yet stored.
    async fn discover(
        &self,
        guard: &ChannelGuard,
        channel: &ChannelWithUrls,
        cancel: &CancellationToken,
    ) -> Result<Discovery> {
        let settings = &channel.channel.settings;
        let mut known: HashSet<String> = {
            let db = self.database.lock().await;
            db.get_video_urls_for_channel(guard.channel_id())?
                .iter()
                .map(|u| normalize_url(u))
                .collect()
        };
        let mut discovery = Discovery::default();

        for page in &channel.urls {
            if cancel.is_cancelled() {
                discovery.cancelled = true;
                break;
            }

            let Some(hostname) = hostname_of(&page.url) else {
                discovery.failed.push(FailedFetch {
                    url: page.url.clone(),
                    error: "URL has no hostname".to_string(),
                });
                continue;
            };
            if settings.is_host_blocked(&hostname) || discovery.blocked_hosts.contains(&hostname) {
                info!("crawl_channel: skipping {} ({} is blocked)", page.url, hostname);
                continue;
            }

            let auth = match self.auth.resolve(&channel.channel, page).await {
                Ok(auth) => auth,
                Err(e @ AuthError::CookiesRequired { .. }) => {
                    error!("crawl_channel: {}", e);
                    discovery.failed.push(FailedFetch {
                        url: page.url.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
                Err(e) => {
                    warn!(
                        "crawl_channel: cookie resolution for {} failed, continuing without: {}",
                        page.url, e
                    );
                    ResolvedAuth::anonymous()
                }
            };

            let request = ScrapeRequest {
                page_url: page.url.clone(),
                hostname: hostname.clone(),
                context: auth.context,
                cookies: auth.cookies,
                cookie_file: auth.cookie_file.clone(),
            };

            let listed = match self.scrape_with_retry(&request, settings.retries, cancel).await {
                Ok(urls) => urls,
                Err(FetchError::BotBlocked { hostname, context }) => {
                    let db = self.database.lock().await;
                    self.ledger
                        .record_block(&db, guard, &hostname, context, Utc::now())?;
                    if !discovery.blocked_hosts.contains(&hostname) {
                        discovery.blocked_hosts.push(hostname);
                    }
                    continue;
                }
                Err(e) => {
                    error!("crawl_channel: listing {} failed: {}", page.url, e);
                    discovery.failed.push(FailedFetch {
                        url: page.url.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            {
                let db = self.database.lock().await;
                db.touch_channel_url_scan(page.id, Utc::now().timestamp())?;
            }

            let total = listed.len();
            let mut fresh = 0;
            for url in listed {
                if !known.insert(normalize_url(&url)) {
                    continue;
                }
                fresh += 1;
                discovery.candidates.push(Candidate {
                    hostname: hostname_of(&url).unwrap_or_else(|| hostname.clone()),
                    url,
                    channel_url_id: page.id,
                    context: auth.context,
                    cookie_file: auth.cookie_file.clone(),
                });
            }
            info!("crawl_channel: {} listed {} URL(s), {} new", page.url, total, fresh);
        }

        Ok(discovery)
    }

    async fn scrape_with_retry(
        &self,
        request: &ScrapeRequest,
        retries: u32,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<String>, FetchError> {
        let mut attempt = 0;
        loop {
            match self.scraper.list_video_urls(request).await {
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    warn!(
                        "crawl_channel: listing {} failed (attempt {}/{}): {}",
                        request.page_url,
                        attempt,
                        retries + 1,
                        e
                    );
                    if !self.backoff(attempt, cancel).await {
                        return Err(e);
                    }
                }
                other => return other,
            }
        }
    }

    /// Wait before retry `attempt`. Returns false if cancelled meanwhile.
    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.retry_backoff * attempt) => true,
        }
    }

    async fn fetch_one(
        &self,
        guard: &ChannelGuard,
        candidate: Candidate,
        settings: &ChannelSettings,
        options: &FetchOptions,
        abandoned: &Mutex<HashSet<String>>,
        cancel: &CancellationToken,
    ) -> std::result::Result<WorkerOutcome, DatabaseError> {
        if cancel.is_cancelled() || is_abandoned(abandoned, &candidate.hostname) {
            return Ok(WorkerOutcome::Skipped);
        }

        let id = {
            let db = self.database.lock().await;
            let new = NewVideo::pending(guard.channel_id(), Some(candidate.channel_url_id), &candidate.url);
            let Some(id) = db.insert_video_if_absent(&new)? else {
                debug!("crawl_channel: {} already stored", candidate.url);
                return Ok(WorkerOutcome::Skipped);
            };
            db.update_video_status(id, DownloadStatus::Downloading)?;
            id
        };

        let mut attempt = 0;
        loop {
            if is_abandoned(abandoned, &candidate.hostname) {
                self.database.lock().await.delete_video(id)?;
                return Ok(WorkerOutcome::Skipped);
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let request = FetchRequest {
                video_url: candidate.url.clone(),
                hostname: candidate.hostname.clone(),
                context: candidate.context,
                cookie_file: candidate.cookie_file.clone(),
                options: options.clone(),
                progress: Some(tx),
            };
            let (result, ()) = tokio::join!(self.fetcher.fetch(request), self.drain_progress(id, rx));

            match result {
                Ok(fetched) => {
                    let db = self.database.lock().await;
                    db.complete_video(
                        id,
                        &CompletedVideo {
                            title: fetched.title,
                            description: fetched.description,
                            metadata: fetched.metadata,
                        },
                    )?;
                    debug!("crawl_channel: fetched {}", candidate.url);
                    return Ok(WorkerOutcome::Fetched(id));
                }
                Err(FetchError::BotBlocked { hostname, context }) => {
                    abandon(abandoned, &candidate.hostname);
                    let db = self.database.lock().await;
                    // Forget the row so the URL is rediscovered after the cooldown
                    db.delete_video(id)?;
                    self.ledger
                        .record_block(&db, guard, &hostname, context, Utc::now())?;
                    return Ok(WorkerOutcome::Blocked(hostname));
                }
                Err(e) if e.is_retryable() && attempt < settings.retries => {
                    attempt += 1;
                    warn!(
                        "crawl_channel: fetching {} failed (attempt {}/{}): {}",
                        candidate.url,
                        attempt,
                        settings.retries + 1,
                        e
                    );
                    if !self.backoff(attempt, cancel).await {
                        self.database.lock().await.delete_video(id)?;
                        return Ok(WorkerOutcome::Skipped);
                    }
                }
                Err(e) => {
                    error!("crawl_channel: fetching {} failed: {}", candidate.url, e);
                    self.database
                        .lock()
                        .await
                        .update_video_status(id, DownloadStatus::Failed)?;
                    return Ok(WorkerOutcome::Failed(
                        id,
                        FailedFetch {
                            url: candidate.url,
                            error: e.to_string(),
                        },
                    ));
                }
            }
        }
    }

    /// Persist progress updates until the fetch drops its sender.
    async fn drain_progress(&self, id: i64, mut rx: mpsc::UnboundedReceiver<f64>) {
        while let Some(percentage) = rx.recv().await {
            if let Err(e) = self.database.lock().await.update_video_progress(id, percentage) {
                debug!("crawl_channel: progress update for video {} failed: {}", id, e);
            }
        }
    }
}

fn is_abandoned(abandoned: &Mutex<HashSet<String>>, hostname: &str) -> bool {
    abandoned.lock().contains(hostname)
}

fn abandon(abandoned: &Mutex<HashSet<String>>, hostname: &str) {
    abandoned.lock().insert(hostname.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::resolver::tests::{MockBrowser, MockLogin};
    use crate::auth::AuthCache;
    use crate::collab::FetchResult;
    use crate::crawler::{CooldownTable, LedgerStatus};
    use crate::database::{ChannelLocks, Database, NewChannel};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockScraper {
        pages: HashMap<String, std::result::Result<Vec<String>, FetchError>>,
        /// Fail this many listings transiently before answering.
        flaky: usize,
        listings: AtomicUsize,
    }

    impl MockScraper {
        fn new(pages: Vec<(&str, std::result::Result<Vec<String>, FetchError>)>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|(p, r)| (p.to_string(), r))
                    .collect(),
                flaky: 0,
                listings: AtomicUsize::new(0),
            }
        }

        fn flaky(mut self, failures: usize) -> Self {
            self.flaky = failures;
            self
        }

        fn listings(&self) -> usize {
            self.listings.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Scraper for MockScraper {
        async fn list_video_urls(
            &self,
            request: &ScrapeRequest,
        ) -> std::result::Result<Vec<String>, FetchError> {
            let n = self.listings.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.flaky {
                return Err(FetchError::Transient("listing timed out".into()));
            }
            self.pages
                .get(&request.page_url)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[derive(Clone)]
    enum Behavior {
        Succeed,
        /// Fail transiently this many times, then succeed.
        Flaky(usize),
        BotBlock,
        Fatal,
    }

    #[derive(Default)]
    struct MockFetcher {
        behaviors: HashMap<String, Behavior>,
        calls: Mutex<HashMap<String, usize>>,
        total: AtomicUsize,
        /// Yield once inside every fetch so workers overlap.
        overlap: bool,
        /// Cancelled by the first fetch.
        cancel_on_fetch: Option<CancellationToken>,
    }

    impl MockFetcher {
        fn with(behaviors: &[(&str, Behavior)]) -> Self {
            Self {
                behaviors: behaviors
                    .iter()
                    .map(|(u, b)| (u.to_string(), b.clone()))
                    .collect(),
                ..Default::default()
            }
        }

        fn overlapping(mut self) -> Self {
            self.overlap = true;
            self
        }

        fn cancelling(mut self, token: &CancellationToken) -> Self {
            self.cancel_on_fetch = Some(token.clone());
            self
        }

        fn calls_for(&self, url: &str) -> usize {
            self.calls.lock().get(url).copied().unwrap_or(0)
        }

        fn total(&self) -> usize {
            self.total.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, request: FetchRequest) -> std::result::Result<FetchResult, FetchError> {
            self.total.fetch_add(1, Ordering::SeqCst);
            let n = {
                let mut calls = self.calls.lock();
                let n = calls.entry(request.video_url.clone()).or_insert(0);
                *n += 1;
                *n
            };
            if let Some(token) = &self.cancel_on_fetch {
                token.cancel();
            }
            if self.overlap {
                tokio::task::yield_now().await;
            }
            if let Some(tx) = &request.progress {
                let _ = tx.send(50.0);
            }

            let ok = FetchResult {
                title: Some(format!("title of {}", request.video_url)),
                ..Default::default()
            };
            match self
                .behaviors
                .get(&request.video_url)
                .cloned()
                .unwrap_or(Behavior::Succeed)
            {
                Behavior::Succeed => Ok(ok),
                Behavior::Flaky(failures) if n <= failures => {
                    Err(FetchError::Transient("connection reset".into()))
                }
                Behavior::Flaky(_) => Ok(ok),
                Behavior::BotBlock => Err(FetchError::BotBlocked {
                    hostname: request.hostname.clone(),
                    context: request.context,
                }),
                Behavior::Fatal => Err(FetchError::Fatal("video unavailable".into())),
            }
        }
    }

    struct Harness {
        crawler: Crawler,
        scraper: Arc<MockScraper>,
        fetcher: Arc<MockFetcher>,
        locks: ChannelLocks,
        channel_id: i64,
        _dir: tempfile::TempDir,
    }

    async fn harness(
        urls: &[&str],
        settings: ChannelSettings,
        pages: Vec<(&str, std::result::Result<Vec<String>, FetchError>)>,
        fetcher: MockFetcher,
    ) -> Harness {
        harness_with(urls, settings, MockScraper::new(pages), fetcher).await
    }

    async fn harness_with(
        urls: &[&str],
        settings: ChannelSettings,
        scraper: MockScraper,
        fetcher: MockFetcher,
    ) -> Harness {
        let mut db = Database::open_in_memory().unwrap();
        let mut new = NewChannel::new("Demo");
        for url in urls {
            new = new.with_url(url);
        }
        new.settings = settings;
        let channel_id = db.create_channel(&new).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let auth = AuthResolver::new(
            Arc::new(AuthCache::new()),
            Arc::new(MockBrowser(Vec::new())),
            Arc::new(MockLogin::new(Vec::new())),
            dir.path(),
        );
        let mut cooldowns = CooldownTable::empty();
        cooldowns.insert("site.com", 720);

        let scraper = Arc::new(scraper);
        let fetcher = Arc::new(fetcher);
        let crawler = Crawler::new(
            db.into_handle(),
            scraper.clone(),
            fetcher.clone(),
            Arc::new(auth),
            Arc::new(BlockLedger::new(cooldowns)),
            CrawlerConfig {
                retry_backoff: Duration::from_millis(1),
            },
        );

        Harness {
            crawler,
            scraper,
            fetcher,
            locks: ChannelLocks::new(),
            channel_id,
            _dir: dir,
        }
    }

    fn ok(urls: &[&str]) -> std::result::Result<Vec<String>, FetchError> {
        Ok(urls.iter().map(|u| u.to_string()).collect())
    }

    #[tokio::test]
    async fn test_demo_channel_fetches_only_unknown_video() {
        let h = harness(
            &["https://site.com/channel/demo"],
            ChannelSettings::default(),
            vec![(
                "https://site.com/channel/demo",
                ok(&["https://site.com/a", "https://site.com/b"]),
            )],
            MockFetcher::default(),
        )
        .await;
        {
            let mut db = h.crawler.database().lock().await;
            db.insert_ignored_videos(&[NewVideo::ignored(h.channel_id, None, "https://site.com/a")])
                .unwrap();
        }

        let guard = h.locks.lock(h.channel_id).await;
        let outcome = h
            .crawler
            .crawl_channel(&guard, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.new_videos.len(), 1);
        let video = &outcome.new_videos[0];
        assert_eq!(video.url, "https://site.com/b");
        assert!(video.finished);
        assert_eq!(video.status, DownloadStatus::Finished);
        assert_eq!(video.title.as_deref(), Some("title of https://site.com/b"));
        assert_eq!(h.fetcher.calls_for("https://site.com/a"), 0);

        let db = h.crawler.database().lock().await;
        let channel = db.get_channel_with_urls(h.channel_id).unwrap().unwrap();
        assert!(channel.channel.last_scan.is_some());
        assert!(channel.urls[0].last_scan.is_some());
    }

    #[tokio::test]
    async fn test_recrawl_is_idempotent() {
        let h = harness(
            &["https://site.com/c"],
            ChannelSettings {
                concurrency: 4,
                ..Default::default()
            },
            vec![(
                "https://site.com/c",
                ok(&["https://site.com/1", "https://site.com/2", "https://site.com/3"]),
            )],
            MockFetcher::default(),
        )
        .await;
        let guard = h.locks.lock(h.channel_id).await;
        let cancel = CancellationToken::new();

        let first = h.crawler.crawl_channel(&guard, &cancel).await.unwrap();
        assert_eq!(first.new_videos.len(), 3);

        let second = h.crawler.crawl_channel(&guard, &cancel).await.unwrap();
        assert!(second.new_videos.is_empty());
        assert_eq!(h.fetcher.total(), 3);
    }

    #[tokio::test]
    async fn test_dedup_uses_normalized_urls() {
        let h = harness(
            &["https://site.com/c"],
            ChannelSettings::default(),
            vec![(
                "https://site.com/c",
                ok(&["http://site.com/a/", "https://site.com/A", "https://site.com/A/"]),
            )],
            MockFetcher::default(),
        )
        .await;
        {
            let mut db = h.crawler.database().lock().await;
            db.insert_ignored_videos(&[NewVideo::ignored(h.channel_id, None, "https://site.com/a")])
                .unwrap();
        }

        let guard = h.locks.lock(h.channel_id).await;
        let outcome = h
            .crawler
            .crawl_channel(&guard, &CancellationToken::new())
            .await
            .unwrap();

        // Case differs, so /A is new; its trailing-slash twin is not
        assert_eq!(outcome.new_videos.len(), 1);
        assert_eq!(outcome.new_videos[0].url, "https://site.com/A");
    }

    #[tokio::test]
    async fn test_bot_block_abandons_host_only() {
        let h = harness(
            &["https://site.com/c", "https://other.com/c"],
            ChannelSettings::default(),
            vec![
                (
                    "https://site.com/c",
                    ok(&["https://site.com/1", "https://site.com/2", "https://site.com/3"]),
                ),
                ("https://other.com/c", ok(&["https://other.com/1"])),
            ],
            MockFetcher::with(&[
                ("https://site.com/1", Behavior::BotBlock),
                ("https://site.com/2", Behavior::BotBlock),
                ("https://site.com/3", Behavior::BotBlock),
            ]),
        )
        .await;
        let guard = h.locks.lock(h.channel_id).await;

        let outcome = h
            .crawler
            .crawl_channel(&guard, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.blocked_hosts, vec!["site.com".to_string()]);
        assert_eq!(outcome.new_videos.len(), 1);
        assert_eq!(outcome.new_videos[0].url, "https://other.com/1");
        // Never retried, and the rest of the host was abandoned
        assert_eq!(h.fetcher.calls_for("https://site.com/1"), 1);
        assert_eq!(h.fetcher.calls_for("https://site.com/2"), 0);
        assert_eq!(h.fetcher.calls_for("https://site.com/3"), 0);

        let db = h.crawler.database().lock().await;
        let settings = db.require_channel(h.channel_id).unwrap().settings;
        assert!(settings.bot_blocked);
        assert_eq!(settings.blocked.len(), 1);
        assert_eq!(settings.blocked[0].hostname, "site.com");
        assert_eq!(settings.blocked[0].context, BlockContext::Unauthenticated);
        // Blocked URL is not stored, so it is rediscovered later
        assert_eq!(
            db.get_video_urls_for_channel(h.channel_id).unwrap(),
            vec!["https://other.com/1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let h = harness(
            &["https://site.com/c"],
            ChannelSettings {
                retries: 2,
                ..Default::default()
            },
            vec![("https://site.com/c", ok(&["https://site.com/a"]))],
            MockFetcher::with(&[("https://site.com/a", Behavior::Flaky(2))]),
        )
        .await;
        let guard = h.locks.lock(h.channel_id).await;

        let outcome = h
            .crawler
            .crawl_channel(&guard, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.fetcher.calls_for("https://site.com/a"), 3);
        assert!(outcome.failed.is_empty());
        assert!(outcome.new_videos[0].finished);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_failed() {
        let h = harness(
            &["https://site.com/c"],
            ChannelSettings {
                retries: 1,
                ..Default::default()
            },
            vec![(
                "https://site.com/c",
                ok(&["https://site.com/a", "https://site.com/b", "https://site.com/gone"]),
            )],
            MockFetcher::with(&[
                ("https://site.com/a", Behavior::Flaky(10)),
                ("https://site.com/gone", Behavior::Fatal),
            ]),
        )
        .await;
        let guard = h.locks.lock(h.channel_id).await;
        let cancel = CancellationToken::new();

        let outcome = h.crawler.crawl_channel(&guard, &cancel).await.unwrap();
        assert_eq!(h.fetcher.calls_for("https://site.com/a"), 2);
        assert_eq!(h.fetcher.calls_for("https://site.com/gone"), 1);
        assert_eq!(outcome.failed.len(), 2);
        assert_eq!(outcome.new_videos.len(), 3);

        let failed: Vec<_> = outcome
            .new_videos
            .iter()
            .filter(|v| v.status == DownloadStatus::Failed)
            .map(|v| v.url.as_str())
            .collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.contains(&"https://site.com/a"));

        // Failed rows still dedup until reset
        h.crawler.crawl_channel(&guard, &cancel).await.unwrap();
        assert_eq!(h.fetcher.total(), 4);
    }

    #[tokio::test]
    async fn test_scrape_bot_block_recorded() {
        let h = harness(
            &["https://site.com/c"],
            ChannelSettings::default(),
            vec![(
                "https://site.com/c",
                Err(FetchError::BotBlocked {
                    hostname: "site.com".into(),
                    context: BlockContext::Unauthenticated,
                }),
            )],
            MockFetcher::default(),
        )
        .await;
        let guard = h.locks.lock(h.channel_id).await;

        let outcome = h
            .crawler
            .crawl_channel(&guard, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.blocked_hosts, vec!["site.com".to_string()]);

        let db = h.crawler.database().lock().await;
        let status = h.crawler.ledger().check_or_unlock(&db, &guard).unwrap();
        assert!(matches!(status, LedgerStatus::Blocked { .. }));
    }

    #[tokio::test]
    async fn test_ignore_crawl_marks_without_fetching() {
        let h = harness(
            &["https://site.com/c"],
            ChannelSettings::default(),
            vec![(
                "https://site.com/c",
                ok(&["https://site.com/a", "https://site.com/b"]),
            )],
            MockFetcher::default(),
        )
        .await;
        let guard = h.locks.lock(h.channel_id).await;
        let cancel = CancellationToken::new();

        let ignored = h.crawler.crawl_channel_ignore(&guard, &cancel).await.unwrap();
        assert_eq!(ignored.ignored, 2);
        assert_eq!(h.fetcher.total(), 0);

        let outcome = h.crawler.crawl_channel(&guard, &cancel).await.unwrap();
        assert!(outcome.new_videos.is_empty());
        assert_eq!(h.fetcher.total(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_pass_does_not_touch_scan_time() {
        let h = harness(
            &["https://site.com/c"],
            ChannelSettings::default(),
            vec![("https://site.com/c", ok(&["https://site.com/a"]))],
            MockFetcher::default(),
        )
        .await;
        let guard = h.locks.lock(h.channel_id).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.crawler.crawl_channel(&guard, &cancel).await.unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.new_videos.is_empty());
        assert_eq!(h.fetcher.total(), 0);

        let db = h.crawler.database().lock().await;
        assert!(db.require_channel(h.channel_id).unwrap().last_scan.is_none());
    }

    #[tokio::test]
    async fn test_cancel_mid_pass_stops_remaining_fetches() {
        let cancel = CancellationToken::new();
        let h = harness(
            &["https://site.com/c"],
            ChannelSettings {
                concurrency: 2,
                ..Default::default()
            },
            vec![(
                "https://site.com/c",
                ok(&[
                    "https://site.com/1",
                    "https://site.com/2",
                    "https://site.com/3",
                    "https://site.com/4",
                    "https://site.com/5",
                ]),
            )],
            MockFetcher::default().overlapping().cancelling(&cancel),
        )
        .await;
        let guard = h.locks.lock(h.channel_id).await;

        let outcome = h.crawler.crawl_channel(&guard, &cancel).await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(h.fetcher.total(), 1);
        assert_eq!(outcome.new_videos.len(), 1);
        assert!(outcome.new_videos[0].finished);

        let db = h.crawler.database().lock().await;
        assert_eq!(db.get_video_urls_for_channel(h.channel_id).unwrap().len(), 1);
        assert!(db.require_channel(h.channel_id).unwrap().last_scan.is_none());
    }

    #[tokio::test]
    async fn test_listing_is_retried_after_transient_failure() {
        let h = harness_with(
            &["https://site.com/c"],
            ChannelSettings {
                retries: 2,
                ..Default::default()
            },
            MockScraper::new(vec![("https://site.com/c", ok(&["https://site.com/a"]))]).flaky(2),
            MockFetcher::default(),
        )
        .await;
        let guard = h.locks.lock(h.channel_id).await;

        let outcome = h
            .crawler
            .crawl_channel(&guard, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.scraper.listings(), 3);
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.new_videos.len(), 1);
        assert_eq!(outcome.new_videos[0].url, "https://site.com/a");
    }

    #[tokio::test]
    async fn test_listing_retries_exhausted() {
        let h = harness_with(
            &["https://site.com/c"],
            ChannelSettings {
                retries: 1,
                ..Default::default()
            },
            MockScraper::new(vec![("https://site.com/c", ok(&["https://site.com/a"]))]).flaky(5),
            MockFetcher::default(),
        )
        .await;
        let guard = h.locks.lock(h.channel_id).await;

        let outcome = h
            .crawler
            .crawl_channel(&guard, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.scraper.listings(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].url, "https://site.com/c");
        assert!(outcome.new_videos.is_empty());
        assert!(outcome.blocked_hosts.is_empty());
        assert_eq!(h.fetcher.total(), 0);

        let db = h.crawler.database().lock().await;
        let channel = db.get_channel_with_urls(h.channel_id).unwrap().unwrap();
        assert!(channel.urls[0].last_scan.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_workers_drop_rows_of_blocked_host() {
        let h = harness(
            &["https://site.com/c"],
            ChannelSettings {
                concurrency: 3,
                retries: 3,
                ..Default::default()
            },
            vec![(
                "https://site.com/c",
                ok(&[
                    "https://site.com/1",
                    "https://site.com/2",
                    "https://site.com/3",
                    "https://site.com/4",
                ]),
            )],
            MockFetcher::with(&[
                ("https://site.com/1", Behavior::BotBlock),
                ("https://site.com/2", Behavior::Flaky(1)),
                ("https://site.com/3", Behavior::BotBlock),
            ])
            .overlapping(),
        )
        .await;
        let guard = h.locks.lock(h.channel_id).await;

        let outcome = h
            .crawler
            .crawl_channel(&guard, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.blocked_hosts, vec!["site.com".to_string()]);
        assert!(outcome.new_videos.is_empty());
        // The retrying worker gave up once the host was abandoned
        assert_eq!(h.fetcher.calls_for("https://site.com/2"), 1);
        assert_eq!(h.fetcher.calls_for("https://site.com/4"), 0);

        let db = h.crawler.database().lock().await;
        assert!(db.get_video_urls_for_channel(h.channel_id).unwrap().is_empty());
        let settings = db.require_channel(h.channel_id).unwrap().settings;
        assert_eq!(settings.blocked.len(), 1);
        assert_eq!(settings.blocked[0].hostname, "site.com");
    }

    #[tokio::test]
    async fn test_interrupted_fetch_is_retried_after_restart() {
        let h = harness(
            &["https://site.com/c"],
            ChannelSettings::default(),
            vec![("https://site.com/c", ok(&["https://site.com/v/a"]))],
            MockFetcher::default(),
        )
        .await;
        {
            let mut db = h.crawler.database().lock().await;
            db.program_start_at(100, "alpha", 1_000).unwrap();
            let id = db
                .insert_video_if_absent(&NewVideo::pending(h.channel_id, None, "https://site.com/v/a"))
                .unwrap()
                .unwrap();
            db.update_video_status(id, DownloadStatus::Downloading).unwrap();
            // Process 100 is killed here; the next run takes over its lock
            db.program_start_at(200, "alpha", 1_000 + crate::database::STALE_HEARTBEAT_SECS)
                .unwrap();
        }
        let guard = h.locks.lock(h.channel_id).await;

        let outcome = h
            .crawler
            .crawl_channel(&guard, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.fetcher.calls_for("https://site.com/v/a"), 1);
        assert_eq!(outcome.new_videos.len(), 1);
        assert_eq!(outcome.new_videos[0].status, DownloadStatus::Finished);
        assert!(outcome.new_videos[0].finished);
    }
}
