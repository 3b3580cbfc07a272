//! Error taxonomy for reconciliation.

use thiserror::Error;

use crate::agent::AgentError;
use crate::cache::CacheError;

/// Errors surfaced by a single (agent, ecosystem) reconciliation.
#[derive(Debug, Error)]
pub enum InjectionError {
    /// Policy failed validation. Callers resolve this to "ecosystem disabled".
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// Obtaining an artifact from the origin or the cache failed.
    #[error("artifact fetch failed: {0}")]
    FetchFailed(#[from] CacheError),

    /// The agent's filesystem or environment could not be reached.
    #[error("agent unreachable: {0}")]
    AgentUnreachable(#[from] AgentError),

    /// A persisted record or token could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, InjectionError>;
