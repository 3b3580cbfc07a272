//! npm: agent package unpacked under `~/.node_modules`, preloaded through
//! `NODE_OPTIONS`, configured with plain `DEVELOCITY_*` variables.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;

use super::{EcosystemInjector, InjectionPlan, Install, PlannedArtifact, CUSTOM_VALUE};
use crate::agent::AgentDescriptor;
use crate::artifact::{ArtifactRequest, NPM_AGENT};
use crate::error::{InjectionError, Result};
use crate::options::{OptionsEditor, PropertyKey};
use crate::policy::{Ecosystem, Policy};

pub const NODE_OPTIONS: &str = "NODE_OPTIONS";
pub const DEVELOCITY_URL: &str = "DEVELOCITY_URL";
pub const DEVELOCITY_ALLOW_UNTRUSTED_SERVER: &str = "DEVELOCITY_ALLOW_UNTRUSTED_SERVER";
pub const DEVELOCITY_INTERNAL_ENABLE_JEST_REPORTER_INJECTION: &str =
    "DEVELOCITY_INTERNAL_ENABLE_JEST_REPORTER_INJECTION";
pub const DEVELOCITY_VALUE_CI_AUTO_INJECTION: &str = "DEVELOCITY_VALUE_CIAutoInjection";
pub const DEVELOCITY_INTERNAL_DISABLE_AGENT: &str = "DEVELOCITY_INTERNAL_DISABLE_AGENT";

/// Marker holding the digest of the unpacked tarball.
pub const VERSION_META: &str = "version.meta";

const PRELOAD_MODULE: PropertyKey = PropertyKey::required("@gradle-tech/develocity-agent/preload");
const PACKAGE_PREFIX: &str = "package/";

const OWNED_VARIABLES: &[&str] = &[
    DEVELOCITY_URL,
    DEVELOCITY_ALLOW_UNTRUSTED_SERVER,
    DEVELOCITY_INTERNAL_ENABLE_JEST_REPORTER_INJECTION,
    DEVELOCITY_VALUE_CI_AUTO_INJECTION,
];

#[derive(Debug, Clone)]
pub struct NpmInjector {
    editor: OptionsEditor,
}

impl NpmInjector {
    pub fn new() -> Self {
        Self {
            editor: OptionsEditor::new(&[PRELOAD_MODULE]),
        }
    }

    fn scope_dir(agent: &dyn AgentDescriptor) -> PathBuf {
        agent.home().join(".node_modules").join("@gradle-tech")
    }

    pub fn package_dir(agent: &dyn AgentDescriptor) -> PathBuf {
        Self::scope_dir(agent).join("develocity-agent")
    }

    fn preload_token() -> String {
        format!("--require={}", PRELOAD_MODULE.name)
    }
}

impl Default for NpmInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl EcosystemInjector for NpmInjector {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Npm
    }

    fn options_variable(&self) -> &'static str {
        NODE_OPTIONS
    }

    fn editor(&self) -> &OptionsEditor {
        &self.editor
    }

    fn owned_variables(&self) -> &'static [&'static str] {
        OWNED_VARIABLES
    }

    fn required_artifacts(&self, policy: &Policy) -> Vec<ArtifactRequest> {
        policy
            .npm
            .agent_version
            .as_deref()
            .map(|version| {
                vec![ArtifactRequest::new(&NPM_AGENT, version)
                    .with_repository(policy.npm.repository.clone())]
            })
            .unwrap_or_default()
    }

    fn plan(&self, policy: &Policy, agent: &dyn AgentDescriptor) -> InjectionPlan {
        let artifacts = self
            .required_artifacts(policy)
            .into_iter()
            .map(|request| PlannedArtifact {
                request,
                destination: Self::package_dir(agent),
                install: Install::UnpackNpmPackage,
            })
            .collect();

        let env = vec![
            (DEVELOCITY_URL, policy.server.clone()),
            (
                DEVELOCITY_ALLOW_UNTRUSTED_SERVER,
                policy.allow_untrusted.then(|| "true".to_string()),
            ),
            (
                DEVELOCITY_INTERNAL_ENABLE_JEST_REPORTER_INJECTION,
                Some("true".to_string()),
            ),
            (
                DEVELOCITY_VALUE_CI_AUTO_INJECTION,
                Some(CUSTOM_VALUE.to_string()),
            ),
        ];

        InjectionPlan {
            artifacts,
            options: vec![Self::preload_token()],
            env,
            stale: Vec::new(),
        }
    }

    fn installed_paths(&self, agent: &dyn AgentDescriptor) -> Vec<PathBuf> {
        vec![Self::scope_dir(agent)]
    }

    fn disabled_build_env(&self, _current_options: Option<&str>) -> Vec<(String, Option<String>)> {
        vec![(
            DEVELOCITY_INTERNAL_DISABLE_AGENT.to_string(),
            Some("true".to_string()),
        )]
    }
}

/// Unpack a gzipped npm tarball into `(relative path, bytes)` pairs.
///
/// The leading `package/` directory is dropped. Only regular files are
/// returned, and entries that would escape the target directory are
/// rejected.
pub fn unpack_package(tarball: &[u8]) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    let decode = |e: std::io::Error| InjectionError::Decode(format!("npm agent tarball: {e}"));

    let mut archive = tar::Archive::new(GzDecoder::new(tarball));
    let mut files = Vec::new();
    for entry in archive.entries().map_err(decode)? {
        let mut entry = entry.map_err(decode)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw = entry.path().map_err(decode)?.to_string_lossy().to_string();
        let relative = PathBuf::from(raw.strip_prefix(PACKAGE_PREFIX).unwrap_or(&raw));
        if !is_contained(&relative) {
            return Err(InjectionError::Decode(format!(
                "npm agent tarball entry escapes package: {raw}"
            )));
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(decode)?;
        files.push((relative, bytes));
    }
    Ok(files)
}

fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}
