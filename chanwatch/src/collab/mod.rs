//! External collaborators of the crawl engine.
//!
//! - [`Scraper`]: lists candidate video URLs on a channel page
//! - [`Fetcher`]: retrieves one video given a cookie jar file
//!
//! Implementations classify their own failures into [`FetchError`]
//! variants; the engine never inspects error text.

pub mod ytdlp;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use chanwatch_types::{BlockContext, ChannelSettings, Cookie, FetchError};

pub use ytdlp::{YtDlpFetcher, YtDlpScraper};

/// Download progress in percent, sent while a fetch runs.
pub type ProgressSink = mpsc::UnboundedSender<f64>;

/// One page listing request.
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub page_url: String,
    pub hostname: String,
    /// Credentials in play, reported back in `FetchError::BotBlocked`.
    pub context: BlockContext,
    pub cookies: Vec<Cookie>,
    pub cookie_file: Option<PathBuf>,
}

/// Per-channel download policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub max_filesize: Option<String>,
    pub extra_args: Vec<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub json_dir: Option<PathBuf>,
}

impl FetchOptions {
    pub fn from_settings(settings: &ChannelSettings) -> Self {
        Self {
            max_filesize: settings.max_filesize.clone(),
            extra_args: settings.extra_downloader_args.clone(),
            from_date: settings.from_date.clone(),
            to_date: settings.to_date.clone(),
            output_dir: settings.video_dir.as_ref().map(PathBuf::from),
            json_dir: settings.json_dir.as_ref().map(PathBuf::from),
        }
    }
}

/// One video fetch request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub video_url: String,
    pub hostname: String,
    pub context: BlockContext,
    pub cookie_file: Option<PathBuf>,
    pub options: FetchOptions,
    pub progress: Option<ProgressSink>,
}

/// Metadata produced by a successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    pub title: Option<String>,
    pub description: Option<String>,
    /// Raw info JSON as written by the downloader.
    pub metadata: Option<String>,
}

#[async_trait]
pub trait Scraper: Send + Sync {
    async fn list_video_urls(&self, request: &ScrapeRequest) -> Result<Vec<String>, FetchError>;
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResult, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_settings() {
        let settings = ChannelSettings {
            max_filesize: Some("2G".into()),
            from_date: Some("20240101".into()),
            video_dir: Some("/media/demo".into()),
            extra_downloader_args: vec!["--no-mtime".into()],
            ..Default::default()
        };
        let opts = FetchOptions::from_settings(&settings);
        assert_eq!(opts.max_filesize.as_deref(), Some("2G"));
        assert_eq!(opts.from_date.as_deref(), Some("20240101"));
        assert_eq!(opts.to_date, None);
        assert_eq!(opts.output_dir, Some(PathBuf::from("/media/demo")));
        assert_eq!(opts.extra_args, vec!["--no-mtime".to_string()]);
    }
}
