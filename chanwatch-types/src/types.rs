//! Core value types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Substring that download tools print when a site blocks automated access.
pub const BOT_ACTIVITY_SENTINEL: &str = "detected bot activity";

/// Which credentials were in play when a block was observed.
///
/// A site may block anonymous traffic while still serving a logged-in
/// session, so the ledger tracks each context separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockContext {
    /// No cookies were sent.
    Unauthenticated,
    /// Browser-extracted cookies only.
    CookieBased,
    /// Cookies obtained from a login flow.
    Authenticated,
}

impl BlockContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockContext::Unauthenticated => "unauthenticated",
            BlockContext::CookieBased => "cookie_based",
            BlockContext::Authenticated => "authenticated",
        }
    }
}

impl fmt::Display for BlockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unauthenticated" => Ok(BlockContext::Unauthenticated),
            "cookie_based" => Ok(BlockContext::CookieBased),
            "authenticated" => Ok(BlockContext::Authenticated),
            other => Err(format!("unknown block context: {}", other)),
        }
    }
}

/// Download state of a video row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Finished,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Finished => "finished",
            DownloadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DownloadStatus::Pending),
            "downloading" => Ok(DownloadStatus::Downloading),
            "finished" => Ok(DownloadStatus::Finished),
            "failed" => Ok(DownloadStatus::Failed),
            other => Err(format!("unknown download status: {}", other)),
        }
    }
}

/// A single HTTP cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Cookie domain; a leading dot means subdomains match too.
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    /// Expiry as a Unix timestamp (None = session cookie).
    pub expires: Option<i64>,
}

impl Cookie {
    /// Create a session cookie scoped to `domain` and path `/`.
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: "/".to_string(),
            secure: false,
            http_only: false,
            expires: None,
        }
    }

    /// Format as one line of a Netscape cookie-jar file.
    pub fn to_netscape_line(&self) -> String {
        let include_subdomains = self.domain.starts_with('.');
        let domain = if self.http_only {
            format!("#HttpOnly_{}", self.domain)
        } else {
            self.domain.clone()
        };
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            domain,
            bool_flag(include_subdomains),
            self.path,
            bool_flag(self.secure),
            self.expires.unwrap_or(0),
            self.name,
            self.value
        )
    }
}

fn bool_flag(b: bool) -> &'static str {
    if b {
        "TRUE"
    } else {
        "FALSE"
    }
}
