//! MISP REST API client
//!
//! Covers only what the installer touches: version check, server
//! settings, and feed management. Every call sends the automation key in
//! the `Authorization` header and expects JSON back.

use crate::error::PlatformError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const BODY_EXCERPT_LEN: usize = 240;

/// Where the automation key comes from.
///
/// The key file is written by the installer's own key-generation phase,
/// so it is read on every request rather than once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeySource {
    Static(String),
    File(PathBuf),
}

impl ApiKeySource {
    pub fn resolve(&self) -> Result<String> {
        match self {
            ApiKeySource::Static(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            ApiKeySource::Static(_) => Err(PlatformError::MissingApiKey(
                "configured api_key is empty".to_string(),
            )),
            ApiKeySource::File(path) => match std::fs::read_to_string(path) {
                Ok(content) if !content.trim().is_empty() => Ok(content.trim().to_string()),
                Ok(_) => Err(PlatformError::MissingApiKey(format!(
                    "key file {} is empty",
                    path.display()
                ))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(PlatformError::MissingApiKey(format!(
                        "key file {} does not exist",
                        path.display()
                    )))
                }
                Err(e) => Err(PlatformError::Io(e)),
            },
        }
    }

    /// Whether a key can currently be resolved.
    pub fn is_available(&self) -> bool {
        self.resolve().is_ok()
    }
}

/// Connection settings for a MISP instance.
#[derive(Debug, Clone)]
pub struct MispConfig {
    /// Base URL, e.g. `https://localhost`
    pub base_url: String,
    pub api_key: ApiKeySource,
    /// Verify TLS certificates (the stock docker deployment is self-signed)
    pub verify_tls: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

impl MispConfig {
    pub fn new(base_url: &str, api_key: ApiKeySource) -> Self {
        MispConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            verify_tls: false,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A feed as listed by `/feeds/index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSummary {
    pub id: String,
    pub name: String,
    pub url: String,
    pub provider: String,
    pub enabled: bool,
}

impl FeedSummary {
    /// Parse one element of the feed index, which MISP wraps as `{"Feed": {...}}`.
    pub fn from_value(value: &Value) -> Option<FeedSummary> {
        let feed = value.get("Feed").unwrap_or(value);
        let id = match feed.get("id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let text = |key: &str| {
            feed.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Some(FeedSummary {
            id,
            name: text("name"),
            url: text("url"),
            provider: text("provider"),
            enabled: parse_flag(feed.get("enabled")),
        })
    }
}

/// MISP encodes booleans as `true`, `1`, or `"1"` depending on version.
fn parse_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// A feed to register with `/feeds/add`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFeed {
    pub name: String,
    pub provider: String,
    pub url: String,
    /// `misp`, `freetext`, or `csv`
    #[serde(default = "default_source_format")]
    pub source_format: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_source_format() -> String {
    "misp".to_string()
}

fn default_true() -> bool {
    true
}

impl NewFeed {
    fn to_payload(&self) -> Value {
        json!({
            "Feed": {
                "name": self.name,
                "provider": self.provider,
                "url": self.url,
                "source_format": self.source_format,
                "input_source": "network",
                "enabled": self.enabled,
                "caching_enabled": true,
                "distribution": 0,
            }
        })
    }
}

/// Narrow interface to the MISP REST API.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Running MISP version.
    async fn version(&self) -> Result<String>;

    /// Change a server setting (`Security.password_policy_length`, ...).
    async fn set_setting(&self, name: &str, value: &Value) -> Result<()>;

    /// Import MISP's bundled default feed list.
    async fn load_default_feeds(&self) -> Result<()>;

    async fn list_feeds(&self) -> Result<Vec<FeedSummary>>;

    async fn enable_feed(&self, id: &str) -> Result<()>;

    /// Register a feed and return its id.
    async fn add_feed(&self, feed: &NewFeed) -> Result<String>;

    /// Queue a fetch of every enabled feed.
    async fn fetch_all_feeds(&self) -> Result<()>;
}

/// [`PlatformApi`] over HTTPS.
pub struct MispClient {
    config: MispConfig,
    http_client: reqwest::Client,
}

impl MispClient {
    pub fn new(config: MispConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("misp-install/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(config.timeout)
            .build()?;

        Ok(MispClient {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &MispConfig {
        &self.config
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let key = self.config.api_key.resolve()?;
        let url = format!("{}{}", self.config.base_url, path);
        debug!(method = %method, url = %url, "MISP API request");

        let mut request = self
            .http_client
            .request(method.clone(), &url)
            .header("Authorization", key)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(PlatformError::Api {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body: excerpt(&text),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(BODY_EXCERPT_LEN) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[async_trait]
impl PlatformApi for MispClient {
    async fn version(&self) -> Result<String> {
        let body = self.request(Method::GET, "/servers/getVersion", None).await?;
        body.get("version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PlatformError::UnexpectedResponse(format!("no version in {body}")))
    }

    async fn set_setting(&self, name: &str, value: &Value) -> Result<()> {
        info!(setting = name, "Updating MISP setting");
        self.request(
            Method::POST,
            &format!("/servers/serverSettingsEdit/{name}"),
            Some(json!({ "value": value })),
        )
        .await
        .map(|_| ())
    }

    async fn load_default_feeds(&self) -> Result<()> {
        info!("Loading default MISP feeds");
        self.request(Method::POST, "/feeds/loadDefaultFeeds", Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn list_feeds(&self) -> Result<Vec<FeedSummary>> {
        let body = self.request(Method::GET, "/feeds/index", None).await?;
        let items = body
            .as_array()
            .ok_or_else(|| PlatformError::UnexpectedResponse("feed index is not a list".into()))?;
        Ok(items.iter().filter_map(FeedSummary::from_value).collect())
    }

    async fn enable_feed(&self, id: &str) -> Result<()> {
        debug!(feed_id = id, "Enabling feed");
        self.request(Method::POST, &format!("/feeds/enable/{id}"), Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn add_feed(&self, feed: &NewFeed) -> Result<String> {
        info!(feed = %feed.name, "Adding feed");
        let body = self
            .request(Method::POST, "/feeds/add", Some(feed.to_payload()))
            .await?;
        FeedSummary::from_value(&body)
            .map(|f| f.id)
            .ok_or_else(|| PlatformError::UnexpectedResponse(format!("no feed id in {body}")))
    }

    async fn fetch_all_feeds(&self) -> Result<()> {
        info!("Fetching all enabled feeds");
        self.request(Method::GET, "/feeds/fetchFromAllFeeds", None)
            .await
            .map(|_| ())
    }
}
