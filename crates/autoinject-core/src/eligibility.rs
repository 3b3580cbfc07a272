//! Per-agent eligibility decisions.

use std::collections::BTreeSet;

use crate::agent::AgentDescriptor;
use crate::policy::{Ecosystem, Policy};

/// Whether `ecosystem` should be injected on `agent` under `policy`.
///
/// Pure: reads the policy snapshot and the agent's labels only.
pub fn is_enabled_for_agent(
    policy: &Policy,
    ecosystem: Ecosystem,
    agent: &dyn AgentDescriptor,
) -> bool {
    is_enabled_for_labels(policy, ecosystem, agent.assigned_labels())
}

pub fn is_enabled_for_labels(
    policy: &Policy,
    ecosystem: Ecosystem,
    labels: &BTreeSet<String>,
) -> bool {
    if !policy.is_globally_enabled(ecosystem) {
        return false;
    }
    let settings = policy.ecosystem(ecosystem);
    is_not_disabled(&settings.disabled_node_labels, labels)
        && is_enabled(&settings.enabled_node_labels, labels)
}

fn is_not_disabled(disabled: &BTreeSet<String>, labels: &BTreeSet<String>) -> bool {
    disabled.is_empty() || disabled.is_disjoint(labels)
}

fn is_enabled(enabled: &BTreeSet<String>, labels: &BTreeSet<String>) -> bool {
    enabled.is_empty() || !enabled.is_disjoint(labels)
}

/// Eligibility of every ecosystem for one agent.
pub fn resolve_all(policy: &Policy, agent: &dyn AgentDescriptor) -> Vec<(Ecosystem, bool)> {
    Ecosystem::ALL
        .iter()
        .map(|&ecosystem| (ecosystem, is_enabled_for_agent(policy, ecosystem, agent)))
        .collect()
}
