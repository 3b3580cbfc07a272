//! Error types for artifact-fetch

use thiserror::Error;

/// Errors that can occur while downloading an artifact
#[derive(Error, Debug)]
pub enum FetchError {
    /// The download URL could not be parsed or is not http/https
    #[error("Invalid download URL: {0}")]
    InvalidUrl(String),

    /// Transport-level failure (connect, TLS, timeout, body read)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Server answered with a non-2xx status
    #[error("Could not download artifact from {url}: HTTP {status}")]
    Status { url: String, status: u16 },

    /// Server answered 2xx with no content
    #[error("Could not download artifact from {url}: empty response body")]
    EmptyBody { url: String },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(err.to_string())
    }
}
