//! Versionless settings blobs stored per channel.
//!
//! Both structures are persisted as JSON. Every field is optional on read:
//! missing fields take the [`Default`] value and unknown fields are ignored,
//! so new knobs must be additive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::BlockContext;

/// Upper bound for per-channel fetch concurrency.
pub const MAX_CONCURRENCY: usize = 25;

/// Crawl frequency used when a channel does not set one.
pub const DEFAULT_CRAWL_FREQ_MINUTES: u64 = 30;

/// Per-channel crawl policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Maximum concurrent fetches for this channel.
    pub concurrency: usize,
    /// Minimum minutes between two crawls of this channel.
    pub crawl_freq_minutes: u64,
    /// Retry attempts for transient fetch failures.
    pub retries: u32,
    /// Metadata filters applied by the post-processing stage.
    pub filters: Vec<FilterOp>,
    /// Output relocation rules applied by the post-processing stage.
    pub move_ops: Vec<MoveOp>,
    /// Raw metadata edit operations handed to the post-processing stage.
    pub meta_ops: Vec<String>,
    /// Only fetch videos uploaded on/after this date (YYYYMMDD).
    pub from_date: Option<String>,
    /// Only fetch videos uploaded on/before this date (YYYYMMDD).
    pub to_date: Option<String>,
    /// Maximum file size passed to the downloader (e.g. "2G").
    pub max_filesize: Option<String>,
    /// Extra arguments appended to the downloader invocation.
    pub extra_downloader_args: Vec<String>,
    pub video_dir: Option<String>,
    pub json_dir: Option<String>,
    /// Read cookies from locally installed browsers.
    pub use_global_cookies: bool,
    /// Abort a URL's crawl when cookies cannot be resolved.
    pub cookies_required: bool,
    /// Skip this channel in scheduled runs.
    pub paused: bool,
    /// Mirror of `!blocked.is_empty()`, kept for display layers.
    pub bot_blocked: bool,
    /// Bot-block ledger entries for this channel.
    pub blocked: Vec<BlockEntry>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            crawl_freq_minutes: DEFAULT_CRAWL_FREQ_MINUTES,
            retries: 0,
            filters: Vec::new(),
            move_ops: Vec::new(),
            meta_ops: Vec::new(),
            from_date: None,
            to_date: None,
            max_filesize: None,
            extra_downloader_args: Vec::new(),
            video_dir: None,
            json_dir: None,
            use_global_cookies: false,
            cookies_required: false,
            paused: false,
            bot_blocked: false,
            blocked: Vec::new(),
        }
    }
}

impl ChannelSettings {
    /// Concurrency clamped to `1..=MAX_CONCURRENCY`.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    /// Whether any hostname is currently blocked.
    pub fn is_blocked(&self) -> bool {
        !self.blocked.is_empty()
    }

    /// Whether `hostname` has a block in any context.
    pub fn is_host_blocked(&self, hostname: &str) -> bool {
        self.blocked.iter().any(|e| e.hostname == hostname)
    }

    /// Record a block. A repeated block for the same key restarts its cooldown.
    pub fn record_block(&mut self, hostname: &str, context: BlockContext, at: DateTime<Utc>) {
        match self
            .blocked
            .iter_mut()
            .find(|e| e.hostname == hostname && e.context == context)
        {
            Some(entry) => entry.blocked_at = at,
            None => self.blocked.push(BlockEntry {
                hostname: hostname.to_string(),
                context,
                blocked_at: at,
            }),
        }
        self.bot_blocked = true;
    }

    /// Remove a single block entry. Returns true if one was removed.
    pub fn remove_block(&mut self, hostname: &str, context: BlockContext) -> bool {
        let before = self.blocked.len();
        self.blocked
            .retain(|e| !(e.hostname == hostname && e.context == context));
        self.bot_blocked = !self.blocked.is_empty();
        before != self.blocked.len()
    }

    /// Drop every block entry.
    pub fn clear_blocks(&mut self) -> usize {
        let n = self.blocked.len();
        self.blocked.clear();
        self.bot_blocked = false;
        n
    }
}

/// One bot-block ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub hostname: String,
    pub context: BlockContext,
    pub blocked_at: DateTime<Utc>,
}

/// Keep or drop a video depending on a metadata field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOp {
    pub field: String,
    pub value: String,
    /// true = the field must contain `value`, false = it must not.
    pub must_contain: bool,
}

/// Route a finished video to another directory when a field matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveOp {
    pub field: String,
    pub value: String,
    pub output_dir: String,
}

/// Arguments for the post-processing stage that runs after a fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessArgs {
    pub output_ext: Option<String>,
    pub rename_style: Option<String>,
    pub filename_ops: Vec<String>,
    pub date_tag_format: Option<String>,
    pub transcode_codec: Option<String>,
    pub transcode_quality: Option<String>,
    pub transcode_gpu: Option<String>,
    pub extra_args: Vec<String>,
}
