//! Default collaborators backed by the `yt-dlp` executable.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{FetchRequest, FetchResult, Fetcher, ProgressSink, ScrapeRequest, Scraper};
use chanwatch_types::{BlockContext, FetchError, BOT_ACTIVITY_SENTINEL};

/// Stderr fragments that mean the site is refusing automated traffic.
const BOT_MARKERS: &[&str] = &[
    BOT_ACTIVITY_SENTINEL,
    "sign in to confirm you're not a bot",
    "sign in to confirm you’re not a bot",
    "http error 429",
    "too many requests",
];

/// Stderr fragments that retrying will not fix.
const FATAL_MARKERS: &[&str] = &[
    "unsupported url",
    "video unavailable",
    "private video",
    "has been removed",
    "http error 404",
    "members-only content",
    "requested format is not available",
    "file is larger than max-filesize",
];

/// Map downloader stderr to a tagged error.
pub fn classify_failure(stderr: &str, hostname: &str, context: BlockContext) -> FetchError {
    let lower = stderr.to_lowercase();

    if BOT_MARKERS.iter().any(|m| lower.contains(m)) {
        return FetchError::BotBlocked {
            hostname: hostname.to_string(),
            context,
        };
    }

    let summary = last_error_line(stderr);
    if FATAL_MARKERS.iter().any(|m| lower.contains(m)) {
        FetchError::Fatal(summary)
    } else {
        FetchError::Transient(summary)
    }
}

fn last_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|l| l.starts_with("ERROR"))
        .or_else(|| stderr.lines().rev().find(|l| !l.trim().is_empty()))
        .unwrap_or("downloader exited with an error")
        .trim()
        .to_string()
}

/// Percentage from a `[download]  42.3% of ...` line.
pub fn parse_progress(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("[download]")?;
    let token = rest.split_whitespace().next()?;
    token.strip_suffix('%')?.parse::<f64>().ok()
}

struct RunOutput {
    status: ExitStatus,
    stdout: Vec<String>,
    stderr: String,
}

/// Spawn the downloader, stream its output, and collect it.
async fn run_ytdlp(
    binary: &Path,
    args: &[String],
    progress: Option<&ProgressSink>,
    timeout: Duration,
) -> Result<RunOutput, FetchError> {
    debug!("yt-dlp: {} {}", binary.display(), args.join(" "));

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| FetchError::Fatal(format!("Failed to spawn {}: {}", binary.display(), e)))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let read_stdout = async {
        let mut lines_out = Vec::new();
        if let Some(stream) = stdout {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let (Some(tx), Some(p)) = (progress, parse_progress(&line)) {
                    let _ = tx.send(p);
                }
                lines_out.push(line);
            }
        }
        lines_out
    };

    let read_stderr = async {
        let mut text = String::new();
        if let Some(stream) = stderr {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let (Some(tx), Some(p)) = (progress, parse_progress(&line)) {
                    let _ = tx.send(p);
                } else {
                    debug!("yt-dlp stderr: {}", line);
                    text.push_str(&line);
                    text.push('\n');
                }
            }
        }
        text
    };

    let collected = tokio::time::timeout(timeout, async {
        let (stdout, stderr) = tokio::join!(read_stdout, read_stderr);
        let status = child.wait().await;
        (stdout, stderr, status)
    })
    .await;

    match collected {
        Ok((stdout, stderr, Ok(status))) => Ok(RunOutput {
            status,
            stdout,
            stderr,
        }),
        Ok((_, _, Err(e))) => Err(FetchError::Transient(format!("Downloader wait failed: {}", e))),
        Err(_) => {
            warn!("yt-dlp: timed out after {}s", timeout.as_secs());
            Err(FetchError::Transient(format!(
                "Downloader timed out after {}s",
                timeout.as_secs()
            )))
        }
    }
}

/// Lists a channel page with the downloader's flat-playlist mode.
#[derive(Debug, Clone)]
pub struct YtDlpScraper {
    binary: PathBuf,
    timeout: Duration,
}

impl YtDlpScraper {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_args(request: &ScrapeRequest) -> Vec<String> {
        let mut args = vec![
            "--flat-playlist".to_string(),
            "--print".to_string(),
            "url".to_string(),
            "--no-warnings".to_string(),
        ];
        if let Some(path) = &request.cookie_file {
            args.push("--cookies".to_string());
            args.push(path.to_string_lossy().to_string());
        }
        args.push(request.page_url.clone());
        args
    }
}

#[async_trait]
impl Scraper for YtDlpScraper {
    async fn list_video_urls(&self, request: &ScrapeRequest) -> Result<Vec<String>, FetchError> {
        let args = Self::build_args(request);
        let out = run_ytdlp(&self.binary, &args, None, self.timeout).await?;

        if !out.status.success() {
            return Err(classify_failure(&out.stderr, &request.hostname, request.context));
        }

        Ok(out
            .stdout
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| l.starts_with("http://") || l.starts_with("https://"))
            .collect())
    }
}

/// Downloads a single video and captures its info JSON.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    binary: PathBuf,
    default_output_dir: PathBuf,
    timeout: Duration,
}

impl YtDlpFetcher {
    pub fn new(binary: impl Into<PathBuf>, default_output_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            default_output_dir: default_output_dir.into(),
            timeout: Duration::from_secs(4 * 3600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_args(&self, request: &FetchRequest) -> Vec<String> {
        let opts = &request.options;
        let output_dir = opts
            .output_dir
            .clone()
            .unwrap_or_else(|| self.default_output_dir.clone());

        let mut args = vec![
            "--newline".to_string(),
            "--progress".to_string(),
            "--dump-json".to_string(),
            "--no-simulate".to_string(),
            "-o".to_string(),
            output_dir
                .join("%(title)s [%(id)s].%(ext)s")
                .to_string_lossy()
                .to_string(),
        ];

        if let Some(json_dir) = &opts.json_dir {
            args.push("--write-info-json".to_string());
            args.push("-o".to_string());
            args.push(format!(
                "infojson:{}",
                json_dir.join("%(id)s").to_string_lossy()
            ));
        }
        if let Some(path) = &request.cookie_file {
            args.push("--cookies".to_string());
            args.push(path.to_string_lossy().to_string());
        }
        if let Some(size) = &opts.max_filesize {
            args.push("--max-filesize".to_string());
            args.push(size.clone());
        }
        if let Some(date) = &opts.from_date {
            args.push("--dateafter".to_string());
            args.push(date.clone());
        }
        if let Some(date) = &opts.to_date {
            args.push("--datebefore".to_string());
            args.push(date.clone());
        }
        args.extend(opts.extra_args.iter().cloned());
        args.push(request.video_url.clone());
        args
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResult, FetchError> {
        let args = self.build_args(&request);
        let out = run_ytdlp(&self.binary, &args, request.progress.as_ref(), self.timeout).await?;

        if !out.status.success() {
            return Err(classify_failure(&out.stderr, &request.hostname, request.context));
        }

        let info = out.stdout.iter().rev().find(|l| l.trim_start().starts_with('{'));
        let mut result = FetchResult::default();
        if let Some(raw) = info {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
                result.title = value.get("title").and_then(|v| v.as_str()).map(String::from);
                result.description = value
                    .get("description")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
            result.metadata = Some(raw.clone());
        }
        Ok(result)
    }
}
