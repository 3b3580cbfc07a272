//! Artifact download client
//!
//! Performs a single HTTP GET per artifact. The controller is the only party
//! that talks to the artifact origin; agents receive copies from the cache.

use crate::error::FetchError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Download client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Overall request timeout in seconds
    pub timeout_secs: u64,
    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            timeout_secs: std::env::var("AUTOINJECT_FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            user_agent: std::env::var("AUTOINJECT_USER_AGENT")
                .unwrap_or_else(|_| format!("autoinject/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

impl FetchConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Override the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }
}

/// Username/password pair resolved by the host before the download starts.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// HTTP client for artifact downloads
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http_client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a new download client
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(HttpFetcher { http_client })
    }

    /// Create client from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(&FetchConfig::from_env())
    }

    /// Download `url` and return the full response body.
    ///
    /// Any non-2xx status and any empty body is a failure.
    pub async fn download(&self, url: &str, credentials: Option<&Credentials>) -> Result<Vec<u8>> {
        let parsed =
            url::Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }

        debug!(url = %url, authenticated = credentials.is_some(), "downloading artifact");

        let mut request = self.http_client.get(parsed);
        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "artifact download rejected");
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(FetchError::EmptyBody {
                url: url.to_string(),
            });
        }

        debug!(url = %url, bytes = body.len(), "artifact downloaded");
        Ok(body.to_vec())
    }
}
