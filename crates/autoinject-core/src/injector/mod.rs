//! Per-ecosystem injection recipes.
//!
//! An [`EcosystemInjector`] says which artifacts an ecosystem needs, where
//! they go on the agent, and which options tokens and plain variables it
//! owns. The orchestrator drives every injector through the same cache,
//! editor and eligibility machinery.

pub mod gradle;
pub mod maven;
pub mod npm;

use std::path::{Path, PathBuf};

use crate::agent::AgentDescriptor;
use crate::artifact::ArtifactRequest;
use crate::options::OptionsEditor;
use crate::policy::{Ecosystem, Policy};

pub use gradle::GradleInjector;
pub use maven::MavenInjector;
pub use npm::NpmInjector;

/// Directory under the agent root that holds copied jars.
pub const INJECTION_DIR: &str = "develocity-injection";

/// Value recorded as the CI auto-injection custom value.
pub const CUSTOM_VALUE: &str = "autoinject";

/// How a cached artifact lands on the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Install {
    /// Byte-for-byte copy to `destination`.
    Copy,
    /// Gzipped npm tarball unpacked into the `destination` directory.
    UnpackNpmPackage,
}

#[derive(Debug, Clone)]
pub struct PlannedArtifact {
    pub request: ArtifactRequest,
    pub destination: PathBuf,
    pub install: Install,
}

/// Everything needed to move one agent into the injected state.
#[derive(Debug, Clone, Default)]
pub struct InjectionPlan {
    pub artifacts: Vec<PlannedArtifact>,
    /// Tokens merged into the options variable, in order.
    pub options: Vec<String>,
    /// Plain variables to set, or to remove when `None`.
    pub env: Vec<(&'static str, Option<String>)>,
    /// Agent paths left over from other configurations.
    pub stale: Vec<PathBuf>,
}

pub trait EcosystemInjector: Send + Sync {
    fn ecosystem(&self) -> Ecosystem;

    /// Environment variable holding the shared options string.
    fn options_variable(&self) -> &'static str;

    fn editor(&self) -> &OptionsEditor;

    /// Plain variables this injector sets and removes wholesale.
    fn owned_variables(&self) -> &'static [&'static str] {
        &[]
    }

    /// Artifacts needed under `policy`, independent of any agent.
    fn required_artifacts(&self, policy: &Policy) -> Vec<ArtifactRequest>;

    fn plan(&self, policy: &Policy, agent: &dyn AgentDescriptor) -> InjectionPlan;

    /// Paths removed when the agent is cleaned.
    fn installed_paths(&self, agent: &dyn AgentDescriptor) -> Vec<PathBuf>;

    /// Build-scoped variables that switch this ecosystem off for one build,
    /// given the agent's current options string.
    fn disabled_build_env(&self, current_options: Option<&str>) -> Vec<(String, Option<String>)> {
        stripped_options(self.editor(), self.options_variable(), current_options)
    }
}

/// `variable` with the editor's tokens removed, if the string is managed.
pub(crate) fn stripped_options(
    editor: &OptionsEditor,
    variable: &str,
    current: Option<&str>,
) -> Vec<(String, Option<String>)> {
    match current {
        Some(current) if editor.is_managed(current) => {
            vec![(variable.to_string(), editor.strip(Some(current), &[]))]
        }
        _ => Vec::new(),
    }
}

/// The three built-in injectors.
pub fn all() -> Vec<Box<dyn EcosystemInjector>> {
    vec![
        Box::new(GradleInjector::new()),
        Box::new(MavenInjector::new()),
        Box::new(NpmInjector::new()),
    ]
}

/// Render agent-side paths joined with the agent's path separator.
pub(crate) fn join_paths(paths: &[&Path], separator: char) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(&separator.to_string())
}

pub(crate) fn flag(value: bool) -> String {
    value.to_string()
}
