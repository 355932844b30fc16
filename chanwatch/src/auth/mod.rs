//! Cookie and authentication resolution for channel URLs.
//!
//! Two optional cookie sources are merged per URL:
//! - [`login::FormLogin`]: a single form-POST login, at most once per
//!   hostname per run
//! - [`browser::SystemBrowserCookies`]: cookies already present in locally
//!   installed browsers, matched by registrable domain
//!
//! The merged set is written to a per-channel-per-URL cookie jar file for
//! the fetch collaborator.

pub mod browser;
pub mod cookie_file;
pub mod login;
pub mod resolver;

use std::path::PathBuf;

use thiserror::Error;

pub use browser::{BrowserCookieSource, CookieStore, SystemBrowserCookies};
pub use login::{FormLogin, LoginFlow};
pub use resolver::{AuthCache, AuthResolver, ResolvedAuth};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Login to {url} rejected with status {status}")]
    LoginRejected { url: String, status: u16 },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to read cookie store {path:?}: {source}")]
    CookieStore {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cookies are required for {url} but none were found")]
    CookiesRequired { url: String },

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, AuthError>;
