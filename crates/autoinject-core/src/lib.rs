//! Autoinject Core Library
//!
//! Build-scan agent auto-injection for Gradle, Maven and npm build agents:
//! policy, eligibility, the artifact cache, per-ecosystem injectors and the
//! orchestrator that reconciles agents against a policy.

pub mod agent;
pub mod artifact;
pub mod cache;
pub mod checkout;
pub mod eligibility;
pub mod error;
pub mod fakes;
pub mod injector;
pub mod obs;
pub mod options;
pub mod orchestrator;
pub mod policy;
pub mod repo_filter;
pub mod telemetry;

/// Crate version, used as the version of embedded artifacts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use agent::{AgentDescriptor, AgentError, AgentInventory, InventoryEntry, LocalAgent};

pub use artifact::{ArtifactDescriptor, ArtifactRequest, CATALOG};

pub use cache::fs::ArtifactCache;
pub use cache::{ArtifactDigest, ArtifactFetcher, ArtifactMetadata, CacheError};

pub use checkout::{on_checkout, BuildOverride, CheckoutContext};

pub use eligibility::{is_enabled_for_agent, is_enabled_for_labels};

pub use error::{InjectionError, Result};

pub use injector::{EcosystemInjector, GradleInjector, MavenInjector, NpmInjector};

pub use options::{OptionsEditor, PropertyKey, SystemProperty};

pub use orchestrator::{
    AgentReport, InjectionOrchestrator, OrchestratorConfig, ReconcileFailure, Transition,
};

pub use policy::{ArtifactRepository, Ecosystem, EcosystemPolicy, Policy, PolicyStore};

pub use repo_filter::{Classification, RepositoryFilter, VcsFilterRule};

pub use telemetry::init_tracing;
