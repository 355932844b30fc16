//! Single form-POST login flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::cookie::{CookieStore as _, Jar};
use scraper::{Html, Selector};
use url::Url;

use super::{AuthError, Result};
use chanwatch_types::Cookie;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// A login that yields session cookies.
#[async_trait]
pub trait LoginFlow: Send + Sync {
    async fn login(
        &self,
        login_url: &str,
        username: &str,
        password: &str,
    ) -> Result<Vec<Cookie>>;
}

/// Fetch the login page, carry over its hidden fields, POST credentials.
#[derive(Debug, Clone)]
pub struct FormLogin {
    timeout: Duration,
    username_field: String,
    password_field: String,
}

impl Default for FormLogin {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            username_field: "username".to_string(),
            password_field: "password".to_string(),
        }
    }
}

impl FormLogin {
    /// Post credentials under these form field names instead.
    pub fn with_fields(mut self, username_field: &str, password_field: &str) -> Self {
        self.username_field = username_field.to_string();
        self.password_field = password_field.to_string();
        self
    }

    /// Form body for a login page: its hidden fields plus the credentials.
    fn login_form(&self, page: &str, username: &str, password: &str) -> HashMap<String, String> {
        let mut form = hidden_fields(page);
        form.insert(self.username_field.clone(), username.to_string());
        form.insert(self.password_field.clone(), password.to_string());
        form
    }
}

#[async_trait]
impl LoginFlow for FormLogin {
    async fn login(
        &self,
        login_url: &str,
        username: &str,
        password: &str,
    ) -> Result<Vec<Cookie>> {
        let url = Url::parse(login_url).map_err(|_| AuthError::InvalidUrl(login_url.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| AuthError::InvalidUrl(login_url.to_string()))?
            .to_string();

        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .user_agent(USER_AGENT)
            .timeout(self.timeout)
            .build()?;

        let page = client.get(url.clone()).send().await?.text().await?;
        let form = self.login_form(&page, username, password);
        debug!("FormLogin: posting {} field(s) to {}", form.len(), login_url);

        let response = client.post(url.clone()).form(&form).send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(AuthError::LoginRejected {
                url: login_url.to_string(),
                status: status.as_u16(),
            });
        }

        let cookies = jar
            .cookies(&url)
            .and_then(|h| h.to_str().ok().map(|s| parse_cookie_header(s, &host)))
            .unwrap_or_default();

        info!("FormLogin: logged in to {} ({} cookie(s))", host, cookies.len());
        Ok(cookies)
    }
}

/// Name/value of every hidden input on the page.
pub fn hidden_fields(html: &str) -> HashMap<String, String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(r#"input[type="hidden"]"#).expect("hidden input selector");

    document
        .select(&selector)
        .filter_map(|el| {
            let name = el.value().attr("name")?;
            let value = el.value().attr("value").unwrap_or("");
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Split a `Cookie:` header value into cookies scoped to `domain`.
pub fn parse_cookie_header(header: &str, domain: &str) -> Vec<Cookie> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name.is_empty() {
                return None;
            }
            Some(Cookie::new(name, value, domain))
        })
        .collect()
}
