//! Brings agents into agreement with the current policy.
//!
//! Two inbound events drive everything: an agent coming online and a policy
//! change. Each (agent, ecosystem) pair is reconciled independently; a
//! failure is logged, recorded for diagnostics and never blocks other pairs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn, Instrument};

use crate::agent::AgentDescriptor;
use crate::cache::{ArtifactCache, ArtifactDigest};
use crate::eligibility;
use crate::error::{InjectionError, Result};
use crate::injector::npm::{unpack_package, VERSION_META};
use crate::injector::{self, EcosystemInjector, Install, PlannedArtifact};
use crate::obs;
use crate::policy::{Ecosystem, Policy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Injected,
    Cleaned,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Injected => write!(f, "injected"),
            Transition::Cleaned => write!(f, "cleaned"),
        }
    }
}

/// Latest failed reconciliation of one (agent, ecosystem) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileFailure {
    pub ecosystem: Ecosystem,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Outcome of reconciling every ecosystem on one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent: String,
    pub transitions: BTreeMap<Ecosystem, Transition>,
    pub failures: BTreeMap<Ecosystem, String>,
}

impl AgentReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of agents reconciled at once during a fan-out.
    pub max_concurrent: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_concurrent: 8 }
    }
}

pub struct InjectionOrchestrator {
    cache: Arc<ArtifactCache>,
    injectors: Vec<Box<dyn EcosystemInjector>>,
    config: OrchestratorConfig,
    failures: Mutex<HashMap<String, BTreeMap<Ecosystem, ReconcileFailure>>>,
}

impl InjectionOrchestrator {
    pub fn new(cache: Arc<ArtifactCache>) -> Self {
        Self::with_config(cache, OrchestratorConfig::default())
    }

    pub fn with_config(cache: Arc<ArtifactCache>, config: OrchestratorConfig) -> Self {
        Self {
            cache,
            injectors: injector::all(),
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn injector(&self, ecosystem: Ecosystem) -> Result<&dyn EcosystemInjector> {
        self.injectors
            .iter()
            .find(|i| i.ecosystem() == ecosystem)
            .map(|i| i.as_ref())
            .ok_or_else(|| {
                InjectionError::ConfigurationInvalid(format!("no injector for {ecosystem}"))
            })
    }

    /// Reconcile one (agent, ecosystem) pair against `policy`.
    #[instrument(skip_all, fields(agent = %agent.name(), ecosystem = %ecosystem))]
    pub async fn reconcile(
        &self,
        policy: &Policy,
        agent: &dyn AgentDescriptor,
        ecosystem: Ecosystem,
    ) -> Result<Transition> {
        let injector = self.injector(ecosystem)?;
        if eligibility::is_enabled_for_agent(policy, ecosystem, agent) {
            self.inject(policy, agent, injector).await?;
            Ok(Transition::Injected)
        } else {
            self.clean(agent, injector).await?;
            Ok(Transition::Cleaned)
        }
    }

    async fn inject(
        &self,
        policy: &Policy,
        agent: &dyn AgentDescriptor,
        injector: &dyn EcosystemInjector,
    ) -> Result<()> {
        let plan = injector.plan(policy, agent);

        // Artifacts land before anything references them.
        for planned in &plan.artifacts {
            let digest = self.cache.get_or_fetch(&planned.request).await?;
            self.install(agent, planned, &digest).await?;
        }

        let variable = injector.options_variable();
        let current = agent.read_env(variable).await?;
        let merged = injector.editor().merge(current.as_deref(), &plan.options);
        if current.as_deref() != Some(merged.as_str()) {
            agent.write_env(variable, Some(&merged)).await?;
        }
        for (key, value) in &plan.env {
            agent.write_env(key, value.as_deref()).await?;
        }

        // Only unreferenced leftovers go, once the options no longer name them.
        for path in &plan.stale {
            agent.delete(path).await?;
        }

        let version = policy
            .ecosystem(injector.ecosystem())
            .agent_version
            .as_deref()
            .unwrap_or_default();
        obs::emit_injected(agent.name(), injector.ecosystem(), version);
        Ok(())
    }

    async fn install(
        &self,
        agent: &dyn AgentDescriptor,
        planned: &PlannedArtifact,
        digest: &ArtifactDigest,
    ) -> Result<()> {
        let descriptor = planned.request.descriptor;
        match planned.install {
            Install::Copy => {
                if agent.file_digest(&planned.destination).await?.as_ref() == Some(digest) {
                    debug!(artifact = %descriptor, "agent copy is current");
                    return Ok(());
                }
                let bytes = self.cache.read_artifact(descriptor, digest)?;
                agent.write_file(&planned.destination, &bytes).await?;
            }
            Install::UnpackNpmPackage => {
                let marker = planned.destination.join(VERSION_META);
                if let Some(current) = agent.read_file(&marker).await? {
                    if digest.matches(&String::from_utf8_lossy(&current)) {
                        debug!(artifact = %descriptor, "agent package is current");
                        return Ok(());
                    }
                }
                let bytes = self.cache.read_artifact(descriptor, digest)?;
                let files = unpack_package(&bytes)?;

                // The previous package stays usable until the new one is complete.
                let staging = staging_dir(&planned.destination);
                agent.delete(&staging).await?;
                for (relative, content) in files {
                    agent.write_file(&staging.join(relative), &content).await?;
                }
                agent
                    .write_file(&staging.join(VERSION_META), digest.to_hex().as_bytes())
                    .await?;
                agent.delete(&planned.destination).await?;
                agent.rename(&staging, &planned.destination).await?;
            }
        }
        Ok(())
    }

    async fn clean(
        &self,
        agent: &dyn AgentDescriptor,
        injector: &dyn EcosystemInjector,
    ) -> Result<()> {
        let variable = injector.options_variable();
        if let Some(current) = agent.read_env(variable).await? {
            // A string we never wrote is left alone.
            if injector.editor().is_managed(&current) {
                let stripped = injector.editor().strip(Some(&current), &[]);
                agent.write_env(variable, stripped.as_deref()).await?;
            }
        }
        for key in injector.owned_variables() {
            agent.write_env(key, None).await?;
        }

        // Files go after the variables stop pointing at them.
        for path in injector.installed_paths(agent) {
            agent.delete(&path).await?;
        }

        obs::emit_cleaned(agent.name(), injector.ecosystem());
        Ok(())
    }

    /// Reconcile every ecosystem on `agent`, isolating failures per ecosystem.
    pub async fn reconcile_agent(
        &self,
        policy: &Policy,
        agent: &dyn AgentDescriptor,
    ) -> AgentReport {
        let mut report = AgentReport {
            agent: agent.name().to_string(),
            ..Default::default()
        };

        for ecosystem in Ecosystem::ALL {
            match self.reconcile(policy, agent, ecosystem).await {
                Ok(transition) => {
                    self.clear_failure(agent.name(), ecosystem);
                    report.transitions.insert(ecosystem, transition);
                }
                Err(e) => {
                    obs::emit_failed(agent.name(), ecosystem, &e);
                    self.record_failure(agent.name(), ecosystem, &e);
                    report.failures.insert(ecosystem, e.to_string());
                }
            }
        }
        report
    }

    /// Inbound event: an agent came online.
    pub async fn on_agent_online(
        &self,
        policy: &Policy,
        agent: &dyn AgentDescriptor,
    ) -> AgentReport {
        self.reconcile_agent(policy, agent)
            .instrument(obs::reconcile_span(agent.name()))
            .await
    }

    /// Inbound event: the policy changed.
    ///
    /// Artifacts for every globally enabled ecosystem are fetched once, then
    /// every agent is reconciled against the same snapshot, at most
    /// `max_concurrent` at a time.
    #[instrument(skip_all, fields(agents = agents.len()))]
    pub async fn on_policy_changed(
        self: &Arc<Self>,
        policy: Arc<Policy>,
        agents: Vec<Arc<dyn AgentDescriptor>>,
    ) -> Vec<AgentReport> {
        self.prefetch(&policy).await;

        let sem = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = Vec::with_capacity(agents.len());

        for agent in agents {
            let this = Arc::clone(self);
            let policy = Arc::clone(&policy);
            let sem = Arc::clone(&sem);
            let name = agent.name().to_string();

            let task = tokio::spawn(
                async move {
                    let _permit = sem.acquire_owned().await.ok();
                    this.reconcile_agent(&policy, agent.as_ref()).await
                }
                .instrument(obs::reconcile_span(&name)),
            );
            tasks.push((name, task));
        }

        let mut reports = Vec::with_capacity(tasks.len());
        for (name, task) in tasks {
            match task.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(agent = %name, error = %e, "reconciliation task aborted");
                    reports.push(AgentReport {
                        agent: name,
                        failures: Ecosystem::ALL
                            .iter()
                            .map(|&eco| (eco, e.to_string()))
                            .collect(),
                        ..Default::default()
                    });
                }
            }
        }
        reports
    }

    /// Fetch what the policy needs before fanning out. Failures are logged;
    /// each agent retries the fetch through the cache.
    pub async fn prefetch(&self, policy: &Policy) {
        for injector in &self.injectors {
            if !policy.is_globally_enabled(injector.ecosystem()) {
                continue;
            }
            for request in injector.required_artifacts(policy) {
                if let Err(e) = self.cache.get_or_fetch(&request).await {
                    warn!(
                        ecosystem = %injector.ecosystem(),
                        artifact = %request.descriptor,
                        error = %e,
                        "prefetch failed"
                    );
                }
            }
        }
    }

    /// Most recent failure per agent and ecosystem.
    pub fn latest_failures(&self) -> BTreeMap<String, Vec<ReconcileFailure>> {
        let failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures
            .iter()
            .filter(|(_, by_ecosystem)| !by_ecosystem.is_empty())
            .map(|(agent, by_ecosystem)| (agent.clone(), by_ecosystem.values().cloned().collect()))
            .collect()
    }

    fn record_failure(&self, agent: &str, ecosystem: Ecosystem, error: &InjectionError) {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.entry(agent.to_string()).or_default().insert(
            ecosystem,
            ReconcileFailure {
                ecosystem,
                error: error.to_string(),
                at: Utc::now(),
            },
        );
    }

    fn clear_failure(&self, agent: &str, ecosystem: Ecosystem) {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(by_ecosystem) = failures.get_mut(agent) {
            by_ecosystem.remove(&ecosystem);
        }
    }
}

/// Sibling directory a package is unpacked into before it replaces `destination`.
fn staging_dir(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".staging");
    destination.with_file_name(name)
}

impl fmt::Debug for InjectionOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectionOrchestrator")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
