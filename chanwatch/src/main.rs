//! chanwatch: channel crawl-and-ingest engine.
//!
//! Tracks channels on video sites, discovers videos not yet retrieved,
//! and hands them to an external downloader.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

mod auth;
mod collab;
mod commands;
mod config;
mod crawler;
mod database;
mod logging;
mod scheduler;

use auth::{AuthCache, AuthResolver, FormLogin, SystemBrowserCookies};
use collab::{YtDlpFetcher, YtDlpScraper};
use config::ConfigFile;
use crawler::{BlockLedger, CooldownTable, Crawler, CrawlerConfig};
use database::{ChannelLocks, Database, DatabaseHandle};
use scheduler::{CrawlScheduler, CrawlSchedulerConfig};

/// chanwatch - crawl video channels and fetch new uploads
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the database file
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl every due channel once, or one channel unconditionally
    Crawl {
        /// Channel name, id or URL
        #[arg(long)]
        channel: Option<String>,
    },
    /// Crawl due channels periodically until interrupted
    Watch {
        /// Check interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Mark currently listed videos as handled without fetching them
    IgnoreCrawl {
        #[arg(long)]
        channel: String,
    },
    /// Add a channel with one or more URLs
    AddChannel {
        #[arg(long)]
        name: String,
        #[arg(long = "url", required = true)]
        urls: Vec<String>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Crawl frequency in minutes
        #[arg(long)]
        crawl_freq: Option<u64>,
        #[arg(long)]
        retries: Option<u32>,
        /// Use cookies from locally installed browsers
        #[arg(long)]
        global_cookies: bool,
    },
    /// Delete a channel with its URLs and videos
    RemoveChannel {
        #[arg(long)]
        channel: String,
    },
    /// Add a URL to an existing channel
    AddUrl {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        url: String,
        /// Seeded by hand rather than by a crawl
        #[arg(long)]
        manual: bool,
    },
    /// Remove a URL from a channel
    RemoveUrl {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        url: String,
    },
    /// Set or clear the login override of a channel URL
    SetCredentials {
        #[arg(long)]
        channel: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        login_url: Option<String>,
    },
    /// Change channel settings
    Configure(commands::ConfigureArgs),
    /// List channels and their state
    ListChannels,
    /// List the videos of a channel
    ListVideos {
        #[arg(long)]
        channel: String,
    },
    /// Clear the bot blocks on a channel
    Unblock {
        #[arg(long)]
        channel: String,
        /// Only clear blocks on this hostname
        #[arg(long)]
        host: Option<String>,
    },
    /// Forget failed videos so the next crawl retries them
    RetryFailed {
        #[arg(long)]
        channel: String,
    },
}

impl Command {
    fn is_read_only(&self) -> bool {
        matches!(self, Command::ListChannels | Command::ListVideos { .. })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let file_config = match config::find_config(args.config.as_deref()) {
        Some(path) => match config::load_config(&path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    // Command line takes precedence over the file
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let db_path = args
        .database
        .clone()
        .or_else(|| file_config.database.path.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("chanwatch.db"));

    info!("Opening database: {:?}", db_path);
    let mut db = match Database::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open database: {}", e);
            return Err(e.into());
        }
    };

    if args.command.is_read_only() {
        return commands::run_read_only(&db, &args.command);
    }

    let pid = match db.program_start() {
        Ok(pid) => pid,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };
    let database = db.into_handle();

    let result = run(args.command, &file_config, database.clone(), pid).await;

    if let Err(e) = database.lock().await.program_quit(pid) {
        warn!("Failed to release program lock: {}", e);
    }
    result
}

async fn run(
    command: Command,
    cfg: &ConfigFile,
    database: DatabaseHandle,
    pid: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    let locks = Arc::new(ChannelLocks::new());
    let ledger = Arc::new(BlockLedger::new(CooldownTable::with_overrides(
        &cfg.ledger.cooldowns,
    )));

    let auth_cache = Arc::new(AuthCache::new());
    let cookie_dir = cfg
        .crawler
        .cookie_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("cookies"));
    let browser = match &cfg.crawler.browser_home {
        Some(home) => SystemBrowserCookies::with_home(home),
        None => SystemBrowserCookies::new(),
    };
    let login = FormLogin::default().with_fields(
        cfg.crawler.login_username_field.as_deref().unwrap_or("username"),
        cfg.crawler.login_password_field.as_deref().unwrap_or("password"),
    );
    let auth = Arc::new(AuthResolver::new(
        auth_cache.clone(),
        Arc::new(browser),
        Arc::new(login),
        cookie_dir,
    ));
    info!("Cookie jars are written to {:?}", auth.cookie_dir());

    let downloader = cfg.crawler.downloader.as_deref().unwrap_or("yt-dlp");
    let output_dir = cfg.crawler.output_dir.as_deref().unwrap_or("downloads");
    let mut scraper = YtDlpScraper::new(downloader);
    if let Some(secs) = cfg.crawler.scrape_timeout_secs {
        scraper = scraper.with_timeout(Duration::from_secs(secs));
    }
    let mut fetcher = YtDlpFetcher::new(downloader, output_dir);
    if let Some(secs) = cfg.crawler.fetch_timeout_secs {
        fetcher = fetcher.with_timeout(Duration::from_secs(secs));
    }
    let crawler = Arc::new(Crawler::new(
        database.clone(),
        Arc::new(scraper),
        Arc::new(fetcher),
        auth,
        ledger,
        CrawlerConfig {
            retry_backoff: Duration::from_millis(cfg.crawler.retry_backoff_ms.unwrap_or(5000)),
        },
    ));

    let check_interval_secs = match &command {
        Command::Watch {
            interval: Some(secs),
        } => *secs,
        _ => cfg.crawler.check_interval_secs.unwrap_or(300),
    };
    let scheduler = CrawlScheduler::new(
        crawler.clone(),
        locks.clone(),
        CrawlSchedulerConfig {
            check_interval_secs,
            heartbeat_secs: cfg.crawler.heartbeat_secs.unwrap_or(30),
        },
    );
    let heartbeat = scheduler.spawn_heartbeat(database.clone(), pid, cancel.clone());

    let ctx = commands::Context {
        crawler,
        scheduler,
        locks,
        cancel: cancel.clone(),
    };
    let result = commands::run_command(&ctx, command).await;

    if !auth_cache.is_empty() {
        info!("Logged in to {} host(s) this run", auth_cache.len());
    }

    cancel.cancel();
    let _ = heartbeat.await;
    result
}
