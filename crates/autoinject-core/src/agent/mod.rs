//! Narrow view of a build agent.
//!
//! The engine only needs labels, a few filesystem operations and the agent's
//! environment variables. Hosts implement [`AgentDescriptor`] over whatever
//! transport reaches the machine; [`LocalAgent`] covers agents whose
//! filesystem is mounted on the controller.

pub mod local;

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::ArtifactDigest;

pub use local::{AgentInventory, InventoryEntry, LocalAgent};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("environment store error: {0}")]
    Env(String),

    #[error("agent {0} is unreachable")]
    Unreachable(String),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

#[async_trait]
pub trait AgentDescriptor: Send + Sync {
    /// Node identity used in logs and diagnostics.
    fn name(&self) -> &str;

    fn assigned_labels(&self) -> &BTreeSet<String>;

    /// Unix-like agents separate classpath entries with `:`, others with `;`.
    fn is_unix(&self) -> bool;

    fn path_separator(&self) -> char {
        if self.is_unix() {
            ':'
        } else {
            ';'
        }
    }

    /// Agent working root, where per-ecosystem artifact directories live.
    fn root(&self) -> &Path;

    /// Home directory of the build user.
    fn home(&self) -> &Path;

    async fn read_env(&self, key: &str) -> AgentResult<Option<String>>;

    /// Set `key`, or remove it when `value` is `None`.
    async fn write_env(&self, key: &str, value: Option<&str>) -> AgentResult<()>;

    /// Returns `None` when the file does not exist.
    async fn read_file(&self, path: &Path) -> AgentResult<Option<Vec<u8>>>;

    /// Write `bytes`, creating parent directories.
    async fn write_file(&self, path: &Path, bytes: &[u8]) -> AgentResult<()>;

    /// Remove a file or a directory tree. Missing paths are not an error.
    async fn delete(&self, path: &Path) -> AgentResult<()>;

    /// Move a file or directory tree to `to`, which must not exist.
    async fn rename(&self, from: &Path, to: &Path) -> AgentResult<()>;

    /// Digest of a file on the agent. Transports that can hash remotely
    /// should override this to avoid shipping the bytes back.
    async fn file_digest(&self, path: &Path) -> AgentResult<Option<ArtifactDigest>> {
        Ok(self
            .read_file(path)
            .await?
            .map(|bytes| ArtifactDigest::compute(&bytes)))
    }
}
