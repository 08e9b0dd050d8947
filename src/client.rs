use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://www.deviantart.com";

static CSRF_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""csrf":"(.+?)""#).unwrap());

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] reqwest::Error),

    #[error("{url}: HTTP {status}")]
    Response { url: String, status: u16 },

    #[error("malformed JSON response: {0}")]
    BadJson(#[from] serde_json::Error),

    #[error("{url}: CSRF token not found")]
    TokenNotFound { url: String },
}

/// An authenticated session with the site.
///
/// Holds the underlying HTTP client plus the anti-forgery token every
/// API query must carry. The token is scraped once at connect time and
/// read-only afterwards, so clones can be shared freely across tasks.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl Client {
    /// Open a session against `base_url` and fetch its CSRF token.
    pub async fn connect(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("critscan/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;

        let base_url = base_url.trim_end_matches('/').to_string();

        // Any page carries the token; a 404 page keeps the payload small.
        // The status is deliberately not checked here.
        let url = format!("{base_url}/_");
        let body = http.get(&url).send().await?.text().await?;
        let token =
            extract_token(&body).ok_or_else(|| ClientError::TokenNotFound { url })?;

        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    /// Query an API endpoint under the session's base URL, returning
    /// the decoded JSON payload.
    pub async fn query_api(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .query(params)
            .query(&[("csrf_token", self.token.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Response {
                url,
                status: status.as_u16(),
            });
        }

        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Extract a CSRF token from HTML markup.
pub fn extract_token(html: &str) -> Option<String> {
    CSRF_TOKEN_RE
        .captures(html)
        .map(|caps| caps[1].to_string())
}
