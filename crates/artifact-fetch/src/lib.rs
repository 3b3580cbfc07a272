//! artifact-fetch: download client for instrumentation artifacts
//!
//! Fetches Gradle plugin jars, Maven extension jars and npm agent tarballs
//! from a Maven repository or npm registry over HTTP(S), optionally with
//! Basic credentials that the host has already resolved.

pub mod client;
pub mod error;

pub use client::{Credentials, FetchConfig, HttpFetcher};
pub use error::FetchError;

/// Result type for artifact-fetch operations
pub type Result<T> = std::result::Result<T, FetchError>;
