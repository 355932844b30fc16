//! Database model definitions.

use chanwatch_types::{ChannelSettings, DownloadStatus, PostProcessArgs, ValidationError};
use serde::Serialize;
use std::collections::HashSet;

/// Channel record from database.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelRecord {
    pub id: i64,
    pub name: String,
    pub settings: ChannelSettings,
    pub postproc_args: PostProcessArgs,
    pub last_scan: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Channel URL record from database.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelUrlRecord {
    pub id: i64,
    pub channel_id: i64,
    pub url: String,
    // Per-URL login override
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub login_url: Option<String>,
    pub is_manual: bool,
    pub last_scan: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ChannelUrlRecord {
    /// Whether a login flow is configured for this URL.
    pub fn has_login(&self) -> bool {
        self.username.as_deref().map_or(false, |u| !u.is_empty())
            && self.login_url.as_deref().map_or(false, |u| !u.is_empty())
    }
}

/// Channel together with its URLs.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelWithUrls {
    pub channel: ChannelRecord,
    pub urls: Vec<ChannelUrlRecord>,
}

/// Video record from database.
#[derive(Debug, Clone, Serialize)]
pub struct VideoRecord {
    pub id: i64,
    pub channel_id: i64,
    pub channel_url_id: Option<i64>,
    pub url: String,
    pub finished: bool,
    pub title: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<String>,
    pub status: DownloadStatus,
    pub percentage: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Program lock row.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramLockRecord {
    pub running: bool,
    pub pid: Option<u32>,
    pub host: Option<String>,
    pub started_at: Option<i64>,
    pub heartbeat: Option<i64>,
}

/// New channel for insertion.
#[derive(Debug, Clone, Default)]
pub struct NewChannel {
    pub name: String,
    pub settings: ChannelSettings,
    pub postproc_args: PostProcessArgs,
    pub urls: Vec<NewChannelUrl>,
}

impl NewChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.urls.push(NewChannelUrl::new(url));
        self
    }

    /// Check the request before anything is written.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.urls.is_empty() {
            return Err(ValidationError::NoUrls);
        }

        let mut seen = HashSet::new();
        for u in &self.urls {
            u.validate()?;
            if !seen.insert(u.url.as_str()) {
                return Err(ValidationError::DuplicateUrl(u.url.clone()));
            }
        }
        Ok(())
    }
}

/// New channel URL for insertion.
#[derive(Debug, Clone, Default)]
pub struct NewChannelUrl {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub login_url: Option<String>,
    pub is_manual: bool,
}

impl NewChannelUrl {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim().to_string(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if url::Url::parse(&self.url).is_err() {
            return Err(ValidationError::InvalidUrl(self.url.clone()));
        }
        if let Some(login) = self.login_url.as_deref() {
            if url::Url::parse(login).is_err() {
                return Err(ValidationError::InvalidUrl(login.to_string()));
            }
            if self.username.as_deref().map_or(true, str::is_empty) {
                return Err(ValidationError::IncompleteCredentials(self.url.clone()));
            }
        }
        Ok(())
    }
}

/// New video for insertion.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub channel_id: i64,
    pub channel_url_id: Option<i64>,
    pub url: String,
    pub finished: bool,
    pub status: DownloadStatus,
}

impl NewVideo {
    /// A freshly discovered video awaiting fetch.
    pub fn pending(channel_id: i64, channel_url_id: Option<i64>, url: &str) -> Self {
        Self {
            channel_id,
            channel_url_id,
            url: url.to_string(),
            finished: false,
            status: DownloadStatus::Pending,
        }
    }

    /// A video marked as handled without fetching.
    pub fn ignored(channel_id: i64, channel_url_id: Option<i64>, url: &str) -> Self {
        Self {
            channel_id,
            channel_url_id,
            url: url.to_string(),
            finished: true,
            status: DownloadStatus::Finished,
        }
    }
}

/// Metadata written when a fetch completes.
#[derive(Debug, Clone, Default)]
pub struct CompletedVideo {
    pub title: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<String>,
}
