//! Command handlers for the CLI.

use std::sync::Arc;

use chanwatch_types::{ChannelSettings, PostProcessArgs, MAX_CONCURRENCY};
use chrono::{NaiveDate, TimeZone, Utc};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::crawler::{Crawler, LedgerStatus};
use crate::database::{
    ChannelLocks, ChannelRecord, Database, DatabaseError, NewChannel, NewChannelUrl,
};
use crate::scheduler::CrawlScheduler;
use crate::Command;

type CommandResult = Result<(), Box<dyn std::error::Error>>;

/// Everything a mutating command may need.
pub struct Context {
    pub crawler: Arc<Crawler>,
    pub scheduler: CrawlScheduler,
    pub locks: Arc<ChannelLocks>,
    pub cancel: CancellationToken,
}

/// Settings changes for `configure`. Unset flags leave the value alone.
#[derive(clap::Args, Debug, Default)]
pub struct ConfigureArgs {
    /// Channel name, id or URL
    #[arg(long)]
    pub channel: String,
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Crawl frequency in minutes
    #[arg(long)]
    pub crawl_freq: Option<u64>,
    #[arg(long)]
    pub retries: Option<u32>,
    #[arg(long)]
    pub pause: bool,
    #[arg(long, conflicts_with = "pause")]
    pub resume: bool,
    #[arg(long)]
    pub global_cookies: Option<bool>,
    #[arg(long)]
    pub cookies_required: Option<bool>,
    /// Only fetch videos uploaded on or after this date (YYYYMMDD)
    #[arg(long)]
    pub from_date: Option<String>,
    /// Only fetch videos uploaded on or before this date (YYYYMMDD)
    #[arg(long)]
    pub to_date: Option<String>,
    #[arg(long)]
    pub max_filesize: Option<String>,
    #[arg(long)]
    pub video_dir: Option<String>,
    #[arg(long)]
    pub json_dir: Option<String>,
    /// Extra downloader argument, repeatable
    #[arg(long = "downloader-arg", allow_hyphen_values = true)]
    pub downloader_args: Vec<String>,
    /// Container extension for the post-processing stage
    #[arg(long)]
    pub output_ext: Option<String>,
}

/// Find a channel by name, then numeric id, then one of its URLs.
pub fn resolve_channel(db: &Database, key: &str) -> Result<ChannelRecord, DatabaseError> {
    if let Some(channel) = db.get_channel_by_name(key)? {
        return Ok(channel);
    }
    if let Ok(id) = key.parse::<i64>() {
        if let Some(channel) = db.get_channel(id)? {
            return Ok(channel);
        }
    }
    db.get_channel_by_url(key)?
        .ok_or_else(|| DatabaseError::ChannelNotFound(key.to_string()))
}

fn check_date(value: &str) -> Result<(), String> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .map(|_| ())
        .map_err(|_| format!("invalid date '{}', expected YYYYMMDD", value))
}

/// Apply `args` to `settings`. Nothing is changed when a value is rejected.
pub fn apply_settings(args: &ConfigureArgs, settings: &mut ChannelSettings) -> Result<(), String> {
    if let Some(n) = args.concurrency {
        if n == 0 || n > MAX_CONCURRENCY {
            return Err(format!("concurrency must be within 1..={}", MAX_CONCURRENCY));
        }
    }
    if args.crawl_freq == Some(0) {
        return Err("crawl frequency must be at least one minute".to_string());
    }
    for date in [&args.from_date, &args.to_date].into_iter().flatten() {
        check_date(date)?;
    }

    if let Some(n) = args.concurrency {
        settings.concurrency = n;
    }
    if let Some(freq) = args.crawl_freq {
        settings.crawl_freq_minutes = freq;
    }
    if let Some(retries) = args.retries {
        settings.retries = retries;
    }
    if args.pause {
        settings.paused = true;
    }
    if args.resume {
        settings.paused = false;
    }
    if let Some(v) = args.global_cookies {
        settings.use_global_cookies = v;
    }
    if let Some(v) = args.cookies_required {
        settings.cookies_required = v;
    }
    if let Some(d) = &args.from_date {
        settings.from_date = Some(d.clone());
    }
    if let Some(d) = &args.to_date {
        settings.to_date = Some(d.clone());
    }
    if let Some(size) = &args.max_filesize {
        settings.max_filesize = Some(size.clone());
    }
    if let Some(dir) = &args.video_dir {
        settings.video_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.json_dir {
        settings.json_dir = Some(dir.clone());
    }
    if !args.downloader_args.is_empty() {
        settings.extra_downloader_args = args.downloader_args.clone();
    }
    Ok(())
}

fn format_time(ts: Option<i64>) -> String {
    ts.and_then(|t| Utc.timestamp_opt(t, 0).single())
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Commands that only read the database and never take the program lock.
pub(crate) fn run_read_only(db: &Database, command: &Command) -> CommandResult {
    match command {
        Command::ListChannels => {
            if let Some(lock) = db.get_program_lock()? {
                if lock.running {
                    println!(
                        "crawler running: pid {} on {}, heartbeat {}",
                        lock.pid.unwrap_or_default(),
                        lock.host.as_deref().unwrap_or("?"),
                        format_time(lock.heartbeat)
                    );
                }
            }
            for channel in db.list_channels()? {
                let Some(full) = db.get_channel_with_urls(channel.id)? else {
                    continue;
                };
                let s = &full.channel.settings;
                let mut flags = Vec::new();
                if s.paused {
                    flags.push("paused".to_string());
                }
                for block in &s.blocked {
                    flags.push(format!("blocked:{}/{}", block.hostname, block.context));
                }
                println!(
                    "[{}] {} every {}m, last scan {}{}",
                    full.channel.id,
                    full.channel.name,
                    s.crawl_freq_minutes,
                    format_time(full.channel.last_scan),
                    if flags.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", flags.join(", "))
                    }
                );
                for u in &full.urls {
                    println!(
                        "    {}{}{}",
                        u.url,
                        if u.is_manual { " [manual]" } else { "" },
                        if u.has_login() { " [login]" } else { "" }
                    );
                }
            }
        }
        Command::ListVideos { channel } => {
            let channel = resolve_channel(db, channel)?;
            for v in db.list_videos(channel.id)? {
                println!(
                    "[{}] {:<11} {:>5.1}% {} {}",
                    v.id,
                    v.status.as_str(),
                    v.percentage,
                    v.url,
                    v.title.as_deref().unwrap_or("")
                );
            }
        }
        other => return Err(format!("{:?} needs the program lock", other).into()),
    }
    Ok(())
}

/// Commands run while this process holds the program lock.
pub(crate) async fn run_command(ctx: &Context, command: Command) -> CommandResult {
    let database = ctx.crawler.database().clone();

    match command {
        Command::Crawl { channel: None } => {
            let summary = ctx.scheduler.run_once(&ctx.cancel).await?;
            println!(
                "{} crawled, {} new video(s), {} not due, {} paused, {} blocked, {} failed",
                summary.crawled,
                summary.new_videos,
                summary.not_due,
                summary.paused,
                summary.blocked,
                summary.failed
            );
        }
        Command::Crawl { channel: Some(key) } => {
            let channel = resolve_channel(&*database.lock().await, &key)?;
            let guard = ctx.locks.lock(channel.id).await;
            let status = {
                let db = database.lock().await;
                ctx.crawler.ledger().check_or_unlock(&db, &guard)?
            };
            if let LedgerStatus::Blocked { remaining } = status {
                for wait in &remaining {
                    match wait.remaining {
                        Some(left) => println!(
                            "{} is blocked on {} ({}), {}m left",
                            channel.name,
                            wait.hostname,
                            wait.context,
                            left.as_secs().div_ceil(60)
                        ),
                        None => println!(
                            "{} is blocked on {} ({}) until unblocked",
                            channel.name, wait.hostname, wait.context
                        ),
                    }
                }
                return Ok(());
            }

            let outcome = ctx.crawler.crawl_channel(&guard, &ctx.cancel).await?;
            for v in &outcome.new_videos {
                println!("{} {}", v.status.as_str(), v.url);
            }
            for f in &outcome.failed {
                println!("failed {}: {}", f.url, f.error);
            }
            for host in &outcome.blocked_hosts {
                println!("bot-blocked on {}", host);
            }
        }
        Command::Watch { .. } => {
            ctx.scheduler.watch(&ctx.cancel).await;
        }
        Command::IgnoreCrawl { channel } => {
            let channel = resolve_channel(&*database.lock().await, &channel)?;
            let guard = ctx.locks.lock(channel.id).await;
            let outcome = ctx.crawler.crawl_channel_ignore(&guard, &ctx.cancel).await?;
            println!("{} video(s) marked as handled", outcome.ignored);
            for f in &outcome.failed {
                println!("failed {}: {}", f.url, f.error);
            }
        }
        Command::AddChannel {
            name,
            urls,
            concurrency,
            crawl_freq,
            retries,
            global_cookies,
        } => {
            let mut new_channel = NewChannel::new(&name);
            for url in &urls {
                new_channel = new_channel.with_url(url);
            }
            let overrides = ConfigureArgs {
                concurrency,
                crawl_freq,
                retries,
                global_cookies: Some(global_cookies),
                ..Default::default()
            };
            apply_settings(&overrides, &mut new_channel.settings)?;

            let id = database.lock().await.create_channel(&new_channel)?;
            println!("added channel {} (id {})", name, id);
        }
        Command::RemoveChannel { channel } => {
            let channel = resolve_channel(&*database.lock().await, &channel)?;
            let _guard = ctx.locks.lock(channel.id).await;
            database.lock().await.delete_channel(channel.id)?;
            info!("Removed channel {} (id={})", channel.name, channel.id);
        }
        Command::AddUrl {
            channel,
            url,
            manual,
        } => {
            let db = database.lock().await;
            let channel = resolve_channel(&db, &channel)?;
            let mut new_url = NewChannelUrl::new(&url);
            new_url.is_manual = manual;
            db.add_channel_url(channel.id, &new_url)?;
            info!("Added {} to {}", url, channel.name);
        }
        Command::RemoveUrl { channel, url } => {
            let db = database.lock().await;
            let channel = resolve_channel(&db, &channel)?;
            if !db.remove_channel_url(channel.id, &url)? {
                warn!("{} has no URL {}", channel.name, url);
            }
        }
        Command::SetCredentials {
            channel,
            url,
            username,
            password,
            login_url,
        } => {
            let db = database.lock().await;
            let channel = resolve_channel(&db, &channel)?;
            let target = db
                .get_channel_urls(channel.id)?
                .into_iter()
                .find(|u| u.url == url)
                .ok_or_else(|| format!("{} has no URL {}", channel.name, url))?;

            let mut check = NewChannelUrl::new(&url);
            check.username = username.clone();
            check.password = password.clone();
            check.login_url = login_url.clone();
            check.validate()?;

            db.set_channel_url_credentials(
                target.id,
                username.as_deref(),
                password.as_deref(),
                login_url.as_deref(),
            )?;
        }
        Command::Configure(args) => {
            let channel = resolve_channel(&*database.lock().await, &args.channel)?;
            let guard = ctx.locks.lock(channel.id).await;
            let db = database.lock().await;
            let settings = db.update_channel_settings(&guard, |s| apply_settings(&args, s))?;
            if let Some(ext) = &args.output_ext {
                db.update_post_process_args(&guard, |p: &mut PostProcessArgs| {
                    p.output_ext = Some(ext.clone());
                    Ok::<_, String>(())
                })?;
            }
            println!(
                "{}: concurrency {}, every {}m, {} retries{}",
                channel.name,
                settings.effective_concurrency(),
                settings.crawl_freq_minutes,
                settings.retries,
                if settings.paused { ", paused" } else { "" }
            );
        }
        Command::Unblock { channel, host } => {
            let channel = resolve_channel(&*database.lock().await, &channel)?;
            let guard = ctx.locks.lock(channel.id).await;
            let db = database.lock().await;
            let cleared = match host {
                Some(host) => ctx.crawler.ledger().clear_host(&db, &guard, &host)?,
                None => ctx.crawler.ledger().clear(&db, &guard)?,
            };
            println!("cleared {} block(s) on {}", cleared, channel.name);
        }
        Command::RetryFailed { channel } => {
            let db = database.lock().await;
            let channel = resolve_channel(&db, &channel)?;
            let n = db.reset_failed_videos(channel.id)?;
            println!("{} failed video(s) will be retried on the next crawl", n);
        }
        Command::ListChannels | Command::ListVideos { .. } => {
            return Err("read-only command dispatched with the program lock".into());
        }
    }
    Ok(())
}
