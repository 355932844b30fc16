//! Merges login-flow and browser cookies for one channel URL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use super::cookie_file::{cookie_file_path, write_cookie_file};
use super::{AuthError, BrowserCookieSource, LoginFlow, Result};
use crate::crawler::normalize::{base_domain, hostname_of};
use crate::database::{ChannelRecord, ChannelUrlRecord};
use chanwatch_types::{BlockContext, Cookie};

/// Login cookies per hostname, shared by every worker of one run.
///
/// Each hostname logs in at most once; a failed login is cached as an
/// empty cookie set so it is not retried within the run.
#[derive(Debug, Default)]
pub struct AuthCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<Vec<Cookie>>>>>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, hostname: &str) -> Arc<OnceCell<Vec<Cookie>>> {
        let mut entries = self.entries.lock();
        Arc::clone(entries.entry(hostname.to_string()).or_default())
    }

    /// Number of hostnames with a completed login attempt.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock();
        entries.values().filter(|c| c.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cookies to use for one channel URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAuth {
    pub cookies: Vec<Cookie>,
    /// Jar file path, present only when `cookies` is non-empty.
    pub cookie_file: Option<PathBuf>,
    pub context: BlockContext,
}

impl ResolvedAuth {
    pub fn anonymous() -> Self {
        Self {
            cookies: Vec::new(),
            cookie_file: None,
            context: BlockContext::Unauthenticated,
        }
    }
}

/// Login-flow cookies win on name collision.
pub fn merge_cookies(login: Vec<Cookie>, browser: Vec<Cookie>) -> Vec<Cookie> {
    let mut merged: Vec<Cookie> = Vec::with_capacity(login.len() + browser.len());
    for cookie in browser {
        match merged.iter_mut().find(|c| c.name == cookie.name) {
            Some(existing) => *existing = cookie,
            None => merged.push(cookie),
        }
    }
    for cookie in login {
        match merged.iter_mut().find(|c| c.name == cookie.name) {
            Some(existing) => *existing = cookie,
            None => merged.push(cookie),
        }
    }
    merged
}

pub struct AuthResolver {
    cache: Arc<AuthCache>,
    browser: Arc<dyn BrowserCookieSource>,
    login: Arc<dyn LoginFlow>,
    cookie_dir: PathBuf,
}

impl AuthResolver {
    pub fn new(
        cache: Arc<AuthCache>,
        browser: Arc<dyn BrowserCookieSource>,
        login: Arc<dyn LoginFlow>,
        cookie_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            browser,
            login,
            cookie_dir: cookie_dir.into(),
        }
    }

    pub fn cookie_dir(&self) -> &Path {
        &self.cookie_dir
    }

    /// Resolve cookies for `url` and write them to its jar file.
    ///
    /// Login and browser failures degrade to fewer cookies. The only error
    /// besides I/O is [`AuthError::CookiesRequired`], returned when the
    /// channel demands browser cookies and none were found.
    pub async fn resolve(
        &self,
        channel: &ChannelRecord,
        url: &ChannelUrlRecord,
    ) -> Result<ResolvedAuth> {
        let hostname =
            hostname_of(&url.url).ok_or_else(|| AuthError::InvalidUrl(url.url.clone()))?;

        let login_cookies = if url.has_login() {
            self.login_cookies(url).await
        } else {
            Vec::new()
        };

        let browser_cookies = if channel.settings.use_global_cookies {
            self.browser_cookies(&base_domain(&hostname)).await?
        } else {
            Vec::new()
        };

        if channel.settings.use_global_cookies
            && channel.settings.cookies_required
            && browser_cookies.is_empty()
            && login_cookies.is_empty()
        {
            return Err(AuthError::CookiesRequired {
                url: url.url.clone(),
            });
        }

        let context = if !login_cookies.is_empty() {
            BlockContext::Authenticated
        } else if !browser_cookies.is_empty() {
            BlockContext::CookieBased
        } else {
            return Ok(ResolvedAuth::anonymous());
        };

        let cookies = merge_cookies(login_cookies, browser_cookies);
        let path = cookie_file_path(&self.cookie_dir, channel.id, &url.url);
        write_cookie_file(&path, &cookies).await?;
        debug!(
            "AuthResolver: {} cookie(s) for {} ({}) -> {}",
            cookies.len(),
            url.url,
            context,
            path.display()
        );

        Ok(ResolvedAuth {
            cookies,
            cookie_file: Some(path),
            context,
        })
    }

    async fn login_cookies(&self, url: &ChannelUrlRecord) -> Vec<Cookie> {
        let (Some(login_url), Some(username)) = (url.login_url.as_deref(), url.username.as_deref())
        else {
            return Vec::new();
        };
        let password = url.password.as_deref().unwrap_or("");
        let Some(host) = hostname_of(login_url) else {
            warn!("AuthResolver: invalid login URL {}", login_url);
            return Vec::new();
        };

        let cell = self.cache.cell(&host);
        cell.get_or_init(|| async {
            match self.login.login(login_url, username, password).await {
                Ok(cookies) => cookies,
                Err(e) => {
                    warn!("AuthResolver: login to {} failed: {}", host, e);
                    Vec::new()
                }
            }
        })
        .await
        .clone()
    }

    async fn browser_cookies(&self, domain: &str) -> Result<Vec<Cookie>> {
        let source = Arc::clone(&self.browser);
        let domain = domain.to_string();

        tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            for store in source.find_all_cookie_stores() {
                match store.read_cookies(&domain) {
                    Ok(cookies) => found.extend(cookies),
                    Err(e) => warn!("AuthResolver: skipping {}: {}", store.name(), e),
                }
            }
            found
        })
        .await
        .map_err(|e| AuthError::Task(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::CookieStore;
    use crate::database::{Database, NewChannel, NewChannelUrl};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed cookie set and counts calls.
    pub(crate) struct MockLogin {
        pub cookies: Vec<Cookie>,
        pub fail: bool,
        pub calls: AtomicUsize,
    }

    impl MockLogin {
        pub(crate) fn new(cookies: Vec<Cookie>) -> Self {
            Self {
                cookies,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LoginFlow for MockLogin {
        async fn login(&self, login_url: &str, _: &str, _: &str) -> Result<Vec<Cookie>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AuthError::LoginRejected {
                    url: login_url.to_string(),
                    status: 401,
                });
            }
            Ok(self.cookies.clone())
        }
    }

    struct FixedStore(Vec<Cookie>);

    impl CookieStore for FixedStore {
        fn name(&self) -> String {
            "fixed".into()
        }

        fn read_cookies(&self, domain: &str) -> Result<Vec<Cookie>> {
            Ok(self
                .0
                .iter()
                .filter(|c| c.domain.trim_start_matches('.').ends_with(domain))
                .cloned()
                .collect())
        }
    }

    pub(crate) struct MockBrowser(pub Vec<Cookie>);

    impl BrowserCookieSource for MockBrowser {
        fn find_all_cookie_stores(&self) -> Vec<Box<dyn CookieStore>> {
            if self.0.is_empty() {
                Vec::new()
            } else {
                vec![Box::new(FixedStore(self.0.clone()))]
            }
        }
    }

    fn channel(db: &mut Database, global_cookies: bool, required: bool) -> (ChannelRecord, ChannelUrlRecord) {
        let mut url = NewChannelUrl::new("https://www.site.com/c/demo");
        url.username = Some("me".into());
        url.password = Some("pw".into());
        url.login_url = Some("https://www.site.com/login".into());

        let mut new = NewChannel::new("Demo");
        new.urls.push(url);
        new.settings.use_global_cookies = global_cookies;
        new.settings.cookies_required = required;
        let id = db.create_channel(&new).unwrap();

        let with_urls = db.get_channel_with_urls(id).unwrap().unwrap();
        (with_urls.channel, with_urls.urls[0].clone())
    }

    #[test]
    fn test_merge_login_wins() {
        let login = vec![Cookie::new("sid", "login", ".site.com")];
        let browser = vec![
            Cookie::new("sid", "browser", ".site.com"),
            Cookie::new("pref", "dark", ".site.com"),
        ];
        let merged = merge_cookies(login, browser);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.iter().find(|c| c.name == "sid").unwrap().value, "login");
    }

    #[tokio::test]
    async fn test_resolve_merges_and_writes_jar() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_in_memory().unwrap();
        let (ch, url) = channel(&mut db, true, false);

        let login = Arc::new(MockLogin::new(vec![Cookie::new("sid", "login", "www.site.com")]));
        let resolver = AuthResolver::new(
            Arc::new(AuthCache::new()),
            Arc::new(MockBrowser(vec![
                Cookie::new("sid", "browser", ".site.com"),
                Cookie::new("pref", "dark", ".site.com"),
                Cookie::new("x", "y", ".elsewhere.org"),
            ])),
            login.clone(),
            dir.path(),
        );

        let auth = resolver.resolve(&ch, &url).await.unwrap();
        assert_eq!(auth.context, BlockContext::Authenticated);
        assert_eq!(auth.cookies.len(), 2);
        let jar = std::fs::read_to_string(auth.cookie_file.unwrap()).unwrap();
        assert!(jar.contains("\tsid\tlogin"));
        assert!(!jar.contains("elsewhere"));
    }

    #[tokio::test]
    async fn test_login_once_per_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_in_memory().unwrap();
        let (ch, url) = channel(&mut db, false, false);

        let login = Arc::new(MockLogin::new(vec![Cookie::new("sid", "1", "www.site.com")]));
        let resolver = AuthResolver::new(
            Arc::new(AuthCache::new()),
            Arc::new(MockBrowser(Vec::new())),
            login.clone(),
            dir.path(),
        );

        let (a, b) = tokio::join!(resolver.resolve(&ch, &url), resolver.resolve(&ch, &url));
        assert_eq!(a.unwrap().context, BlockContext::Authenticated);
        assert_eq!(b.unwrap().context, BlockContext::Authenticated);
        assert_eq!(login.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_login_failure_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_in_memory().unwrap();
        let (ch, url) = channel(&mut db, false, false);

        let mut failing = MockLogin::new(Vec::new());
        failing.fail = true;
        let login = Arc::new(failing);
        let resolver = AuthResolver::new(
            Arc::new(AuthCache::new()),
            Arc::new(MockBrowser(Vec::new())),
            login.clone(),
            dir.path(),
        );

        let auth = resolver.resolve(&ch, &url).await.unwrap();
        assert_eq!(auth, ResolvedAuth::anonymous());

        // Cached: no second attempt this run
        resolver.resolve(&ch, &url).await.unwrap();
        assert_eq!(login.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cookies_required() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_in_memory().unwrap();
        let (ch, mut url) = channel(&mut db, true, true);
        url.login_url = None;

        let resolver = AuthResolver::new(
            Arc::new(AuthCache::new()),
            Arc::new(MockBrowser(Vec::new())),
            Arc::new(MockLogin::new(Vec::new())),
            dir.path(),
        );

        assert!(matches!(
            resolver.resolve(&ch, &url).await,
            Err(AuthError::CookiesRequired { .. })
        ));
    }

    #[tokio::test]
    async fn test_browser_only_is_cookie_based() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_in_memory().unwrap();
        let (ch, mut url) = channel(&mut db, true, false);
        url.login_url = None;

        let resolver = AuthResolver::new(
            Arc::new(AuthCache::new()),
            Arc::new(MockBrowser(vec![Cookie::new("pref", "1", ".site.com")])),
            Arc::new(MockLogin::new(Vec::new())),
            dir.path(),
        );

        let auth = resolver.resolve(&ch, &url).await.unwrap();
        assert_eq!(auth.context, BlockContext::CookieBased);
        assert!(auth.cookie_file.is_some());
    }
}
