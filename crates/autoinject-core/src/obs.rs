//! Structured lifecycle events for reconciliation and the artifact cache.
//!
//! - `reconcile_span` tags everything logged while reconciling one agent
//! - `emit_*` functions record one event each, with an `event` field that
//!   log pipelines can filter on

use std::fmt::Display;

use tracing::{info, warn};

use crate::policy::Ecosystem;

/// Agent-scoped span for one reconciliation.
///
/// Attach it to the reconciliation future so that it follows the task
/// across await points:
///
/// ```ignore
/// reconcile(agent).instrument(reconcile_span("linux-1")).await;
/// // events inside carry agent = "linux-1"
/// ```
pub fn reconcile_span(agent: &str) -> tracing::Span {
    tracing::info_span!("autoinject.reconcile", agent = %agent)
}

pub fn emit_injected(agent: &str, ecosystem: Ecosystem, version: &str) {
    info!(
        event = "reconcile.injected",
        agent = %agent,
        ecosystem = %ecosystem,
        version = %version,
    );
}

pub fn emit_cleaned(agent: &str, ecosystem: Ecosystem) {
    info!(event = "reconcile.cleaned", agent = %agent, ecosystem = %ecosystem);
}

/// Reconciliation of one (agent, ecosystem) pair failed (warning level).
pub fn emit_failed(agent: &str, ecosystem: Ecosystem, error: &dyn Display) {
    warn!(
        event = "reconcile.failed",
        agent = %agent,
        ecosystem = %ecosystem,
        error = %error,
    );
}

pub fn emit_artifact_fetched(artifact: &str, version: &str, digest: &dyn Display, bytes: usize) {
    info!(
        event = "artifact.fetched",
        artifact = %artifact,
        version = %version,
        digest = %digest,
        bytes = bytes,
    );
}

pub fn emit_cache_hit(artifact: &str, version: &str) {
    tracing::debug!(event = "artifact.cache_hit", artifact = %artifact, version = %version);
}

/// A checkout produced a build-scoped override.
pub fn emit_checkout_override(build_id: &str, reason: &str, entries: usize) {
    info!(
        event = "checkout.override",
        build_id = %build_id,
        reason = %reason,
        entries = entries,
    );
}
