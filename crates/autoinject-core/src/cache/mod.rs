//! Controller-side artifact cache.
//!
//! Each artifact is stored once per cache root next to a one-line metadata
//! record `<version>,<digest>`. A record whose version matches the requested
//! one means the bytes on disk are current.

pub mod fs;

use std::fmt;
use std::str::FromStr;

use artifact_fetch::{Credentials, FetchError, HttpFetcher};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

pub use fs::ArtifactCache;

/// SHA-256 of an artifact's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactDigest([u8; 32]);

impl ArtifactDigest {
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compare against a digest rendered as text, e.g. a marker file.
    pub fn matches(&self, text: &str) -> bool {
        text.trim().parse::<ArtifactDigest>().ok().as_ref() == Some(self)
    }
}

impl fmt::Display for ArtifactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ArtifactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ArtifactDigest({})",
            self.to_hex().chars().take(12).collect::<String>()
        )
    }
}

impl FromStr for ArtifactDigest {
    type Err = CacheError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CacheError::InvalidDigest(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(CacheError::InvalidDigest(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Version and digest of the artifact bytes last downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMetadata {
    pub version: String,
    pub digest: ArtifactDigest,
}

impl ArtifactMetadata {
    pub fn new(version: impl Into<String>, digest: ArtifactDigest) -> Self {
        Self {
            version: version.into(),
            digest,
        }
    }

    /// Parse `<version>,<digest>`. Any other shape is `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let parts: Vec<&str> = text.trim().split(',').collect();
        match parts.as_slice() {
            [version, digest] if !version.trim().is_empty() => {
                let digest = digest.trim().parse().ok()?;
                Some(Self::new(version.trim(), digest))
            }
            _ => None,
        }
    }

    pub fn is_for_version(&self, version: &str) -> bool {
        self.version == version
    }

    pub fn render(&self) -> String {
        format!("{},{}", self.version, self.digest)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cached {artifact} does not match its digest (expected {expected}, found {actual})")]
    DigestMismatch {
        artifact: String,
        expected: ArtifactDigest,
        actual: ArtifactDigest,
    },

    #[error("{0} is not cached")]
    NotCached(String),

    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Origin of artifact bytes.
///
/// Only the controller-side cache calls this; agents are fed from the cache.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> std::result::Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        self.download(url, credentials).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_display_fromstr_roundtrip() {
        let d = ArtifactDigest::compute(b"jar bytes");
        let hex = d.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<ArtifactDigest>().unwrap(), d);
        assert!(d.matches(&format!("{hex}\n")));
        assert!(!d.matches("abcd"));
    }

    #[test]
    fn digest_rejects_bad_hex() {
        assert!("zz".parse::<ArtifactDigest>().is_err());
        assert!("abcd".parse::<ArtifactDigest>().is_err());
    }

    #[test]
    fn metadata_parse() {
        let d = ArtifactDigest::compute(b"x");
        let text = format!("1.21.4,{d}");
        let meta = ArtifactMetadata::parse(&text).unwrap();
        assert_eq!(meta.version, "1.21.4");
        assert_eq!(meta.digest, d);
        assert_eq!(meta.render(), text);
        assert!(meta.is_for_version("1.21.4"));
        assert!(!meta.is_for_version("1.21"));
    }

    #[test]
    fn malformed_metadata_is_absent() {
        let d = ArtifactDigest::compute(b"x");
        assert!(ArtifactMetadata::parse("").is_none());
        assert!(ArtifactMetadata::parse("1.0").is_none());
        assert!(ArtifactMetadata::parse(&format!("1.0,{d},extra")).is_none());
        assert!(ArtifactMetadata::parse("1.0,not-a-digest").is_none());
        assert!(ArtifactMetadata::parse(&format!(",{d}")).is_none());
    }
}
