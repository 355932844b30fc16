//! Cookies from locally installed browsers.
//!
//! Firefox keeps cookies in `cookies.sqlite` per profile and Chromium-based
//! browsers in a `Cookies` database per profile. Both are opened read-only
//! and immutable so a running browser's lock does not get in the way.
//! Encrypted Chromium values are skipped.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use rusqlite::{Connection, OpenFlags};

use super::{AuthError, Result};
use chanwatch_types::Cookie;

/// Seconds between 1601-01-01 and 1970-01-01.
const WINDOWS_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

/// One browser profile's cookie database.
pub trait CookieStore: Send + Sync {
    fn name(&self) -> String;

    /// Cookies whose host is `domain` or a subdomain of it.
    fn read_cookies(&self, domain: &str) -> Result<Vec<Cookie>>;
}

/// Discovers cookie stores on this machine.
pub trait BrowserCookieSource: Send + Sync {
    fn find_all_cookie_stores(&self) -> Vec<Box<dyn CookieStore>>;
}

fn open_immutable(path: &Path) -> Result<Connection> {
    let uri = format!("file:{}?immutable=1", path.display());
    Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| AuthError::CookieStore {
        path: path.to_path_buf(),
        source: e,
    })
}

fn host_matches(host: &str, domain: &str) -> bool {
    let host = host.trim_start_matches('.');
    host == domain || host.ends_with(&format!(".{}", domain))
}

/// Firefox `cookies.sqlite`.
#[derive(Debug, Clone)]
pub struct FirefoxStore {
    path: PathBuf,
}

impl FirefoxStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CookieStore for FirefoxStore {
    fn name(&self) -> String {
        format!("firefox:{}", self.path.display())
    }

    fn read_cookies(&self, domain: &str) -> Result<Vec<Cookie>> {
        let conn = open_immutable(&self.path)?;
        let store_err = |e: rusqlite::Error| AuthError::CookieStore {
            path: self.path.clone(),
            source: e,
        };

        let mut stmt = conn
            .prepare(
                "SELECT name, value, host, path, expiry, isSecure, isHttpOnly
                 FROM moz_cookies
                 WHERE host = ?1 OR host = '.' || ?1 OR host LIKE '%.' || ?1",
            )
            .map_err(store_err)?;

        let rows = stmt
            .query_map([domain], |row| {
                let expiry: Option<i64> = row.get(4)?;
                Ok(Cookie {
                    name: row.get(0)?,
                    value: row.get(1)?,
                    domain: row.get(2)?,
                    path: row.get(3)?,
                    // Newer profiles store milliseconds
                    expires: expiry.map(|e| if e > 100_000_000_000 { e / 1000 } else { e }),
                    secure: row.get::<_, i64>(5)? != 0,
                    http_only: row.get::<_, i64>(6)? != 0,
                })
            })
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .filter(|c| host_matches(&c.domain, domain))
            .collect())
    }
}

/// Chromium-family `Cookies` database.
#[derive(Debug, Clone)]
pub struct ChromiumStore {
    path: PathBuf,
}

impl ChromiumStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CookieStore for ChromiumStore {
    fn name(&self) -> String {
        format!("chromium:{}", self.path.display())
    }

    fn read_cookies(&self, domain: &str) -> Result<Vec<Cookie>> {
        let conn = open_immutable(&self.path)?;
        let store_err = |e: rusqlite::Error| AuthError::CookieStore {
            path: self.path.clone(),
            source: e,
        };

        let mut stmt = conn
            .prepare(
                "SELECT name, value, host_key, path, expires_utc, is_secure, is_httponly
                 FROM cookies
                 WHERE host_key = ?1 OR host_key = '.' || ?1 OR host_key LIKE '%.' || ?1",
            )
            .map_err(store_err)?;

        let rows = stmt
            .query_map([domain], |row| {
                let expires_utc: i64 = row.get(4)?;
                Ok(Cookie {
                    name: row.get(0)?,
                    value: row.get(1)?,
                    domain: row.get(2)?,
                    path: row.get(3)?,
                    expires: (expires_utc > 0)
                        .then(|| expires_utc / 1_000_000 - WINDOWS_EPOCH_OFFSET_SECS),
                    secure: row.get::<_, i64>(5)? != 0,
                    http_only: row.get::<_, i64>(6)? != 0,
                })
            })
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;

        let total = rows.len();
        let plain: Vec<Cookie> = rows
            .into_iter()
            .filter(|c| !c.value.is_empty() && host_matches(&c.domain, domain))
            .collect();
        if plain.len() < total {
            debug!(
                "ChromiumStore: skipped {} encrypted cookie(s) in {}",
                total - plain.len(),
                self.path.display()
            );
        }
        Ok(plain)
    }
}

/// Scans the well-known profile directories under a home directory.
#[derive(Debug, Clone)]
pub struct SystemBrowserCookies {
    home: Option<PathBuf>,
}

impl SystemBrowserCookies {
    /// Use `$HOME`.
    pub fn new() -> Self {
        Self {
            home: std::env::var_os("HOME").map(PathBuf::from),
        }
    }

    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: Some(home.into()),
        }
    }

    fn firefox_roots(home: &Path) -> Vec<PathBuf> {
        vec![
            home.join(".mozilla/firefox"),
            home.join("snap/firefox/common/.mozilla/firefox"),
            home.join("Library/Application Support/Firefox/Profiles"),
        ]
    }

    fn chromium_roots(home: &Path) -> Vec<PathBuf> {
        [
            ".config/google-chrome",
            ".config/chromium",
            ".config/BraveSoftware/Brave-Browser",
            ".config/microsoft-edge",
            "Library/Application Support/Google/Chrome",
            "Library/Application Support/Chromium",
        ]
        .iter()
        .map(|p| home.join(p))
        .collect()
    }
}

impl Default for SystemBrowserCookies {
    fn default() -> Self {
        Self::new()
    }
}

/// Immediate subdirectories of `root`; empty when it does not exist.
fn subdirs(root: &Path) -> Vec<PathBuf> {
    match fs::read_dir(root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    }
}

impl BrowserCookieSource for SystemBrowserCookies {
    fn find_all_cookie_stores(&self) -> Vec<Box<dyn CookieStore>> {
        let Some(home) = &self.home else {
            return Vec::new();
        };
        let mut stores: Vec<Box<dyn CookieStore>> = Vec::new();

        for root in Self::firefox_roots(home) {
            for profile in subdirs(&root) {
                let db = profile.join("cookies.sqlite");
                if db.is_file() {
                    stores.push(Box::new(FirefoxStore::new(db)));
                }
            }
        }

        for root in Self::chromium_roots(home) {
            for profile in subdirs(&root) {
                for candidate in [profile.join("Network/Cookies"), profile.join("Cookies")] {
                    if candidate.is_file() {
                        stores.push(Box::new(ChromiumStore::new(candidate)));
                        break;
                    }
                }
            }
        }

        debug!("SystemBrowserCookies: found {} cookie store(s)", stores.len());
        stores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firefox_fixture(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE moz_cookies (
                id INTEGER PRIMARY KEY, name TEXT, value TEXT, host TEXT, path TEXT,
                expiry INTEGER, isSecure INTEGER, isHttpOnly INTEGER
             );
             INSERT INTO moz_cookies (name, value, host, path, expiry, isSecure, isHttpOnly) VALUES
                ('sid', 'one', '.site.com', '/', 1900000000, 1, 1),
                ('pref', 'two', 'www.site.com', '/', 1900000000000, 0, 0),
                ('other', 'three', 'notsite.com', '/', 0, 0, 0);",
        )
        .unwrap();
    }

    fn chromium_fixture(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE cookies (
                host_key TEXT, name TEXT, value TEXT, encrypted_value BLOB, path TEXT,
                expires_utc INTEGER, is_secure INTEGER, is_httponly INTEGER
             );
             INSERT INTO cookies VALUES
                ('.site.com', 'plain', 'v', X'', '/', 13350000000000000, 1, 0),
                ('.site.com', 'sealed', '', X'763130', '/', 0, 1, 1);",
        )
        .unwrap();
    }

    #[test]
    fn test_firefox_store_filters_domain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.sqlite");
        firefox_fixture(&path);

        let cookies = FirefoxStore::new(&path).read_cookies("site.com").unwrap();
        assert_eq!(cookies.len(), 2);
        let pref = cookies.iter().find(|c| c.name == "pref").unwrap();
        assert_eq!(pref.expires, Some(1_900_000_000));
        let sid = cookies.iter().find(|c| c.name == "sid").unwrap();
        assert!(sid.secure && sid.http_only);
    }

    #[test]
    fn test_chromium_store_skips_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Cookies");
        chromium_fixture(&path);

        let cookies = ChromiumStore::new(&path).read_cookies("site.com").unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "plain");
        assert_eq!(
            cookies[0].expires,
            Some(13_350_000_000 - WINDOWS_EPOCH_OFFSET_SECS)
        );
    }

    #[test]
    fn test_discovery_under_home() {
        let home = tempfile::tempdir().unwrap();
        let ff = home.path().join(".mozilla/firefox/abcd.default");
        fs::create_dir_all(&ff).unwrap();
        firefox_fixture(&ff.join("cookies.sqlite"));

        let chrome = home.path().join(".config/chromium/Default/Network");
        fs::create_dir_all(&chrome).unwrap();
        chromium_fixture(&chrome.join("Cookies"));

        let stores = SystemBrowserCookies::with_home(home.path()).find_all_cookie_stores();
        assert_eq!(stores.len(), 2);
    }

    #[test]
    fn test_no_browsers_is_not_an_error() {
        let home = tempfile::tempdir().unwrap();
        assert!(SystemBrowserCookies::with_home(home.path())
            .find_all_cookie_stores()
            .is_empty());
    }

    #[test]
    fn test_host_matches() {
        assert!(host_matches(".site.com", "site.com"));
        assert!(host_matches("www.site.com", "site.com"));
        assert!(!host_matches("notsite.com", "site.com"));
    }
}
