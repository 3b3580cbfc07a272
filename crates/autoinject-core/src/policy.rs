//! Injection policy: immutable snapshots plus the store that swaps them.
//!
//! A [`Policy`] is loaded from JSON, never mutated in place, and handed to
//! every decision as an `Arc<Policy>`. [`PolicyStore`] is the single point
//! where the current snapshot is read and replaced.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, OnceLock, RwLock};

use artifact_fetch::Credentials;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{InjectionError, Result};
use crate::repo_filter::RepositoryFilter;

const VERSION_PATTERN: &str = r"^\d+\.\d+(\.\d+)?(-[-\w]+)?$";

/// Build tool integration that can be injected independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Gradle,
    Maven,
    Npm,
}

impl Ecosystem {
    pub const ALL: [Ecosystem; 3] = [Ecosystem::Gradle, Ecosystem::Maven, Ecosystem::Npm];
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ecosystem::Gradle => f.pad("gradle"),
            Ecosystem::Maven => f.pad("maven"),
            Ecosystem::Npm => f.pad("npm"),
        }
    }
}

impl FromStr for Ecosystem {
    type Err = InjectionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gradle" => Ok(Ecosystem::Gradle),
            "maven" => Ok(Ecosystem::Maven),
            "npm" => Ok(Ecosystem::Npm),
            other => Err(InjectionError::ConfigurationInvalid(format!(
                "unknown ecosystem: {other}"
            ))),
        }
    }
}

/// Where artifacts for one ecosystem are downloaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRepository {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

/// Per-ecosystem settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcosystemPolicy {
    /// Instrumentation version; absent means the ecosystem is off.
    pub agent_version: Option<String>,
    /// Optional Common Custom User Data add-on version.
    pub ccud_version: Option<String>,
    pub enabled_node_labels: BTreeSet<String>,
    pub disabled_node_labels: BTreeSet<String>,
    pub repository: Option<ArtifactRepository>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub enabled: bool,
    /// Build-scan server every injected build reports to.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub allow_untrusted: bool,
    #[serde(default)]
    pub enforce_url: bool,
    #[serde(default = "default_true")]
    pub capture_file_fingerprints: bool,
    #[serde(default)]
    pub gradle: EcosystemPolicy,
    #[serde(default)]
    pub maven: EcosystemPolicy,
    #[serde(default)]
    pub npm: EcosystemPolicy,
    #[serde(default)]
    pub repository_filter: RepositoryFilter,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            enabled: false,
            server: None,
            allow_untrusted: false,
            enforce_url: false,
            capture_file_fingerprints: true,
            gradle: EcosystemPolicy::default(),
            maven: EcosystemPolicy::default(),
            npm: EcosystemPolicy::default(),
            repository_filter: RepositoryFilter::default(),
        }
    }
}

impl Policy {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| InjectionError::ConfigurationInvalid(format!("policy JSON: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            InjectionError::ConfigurationInvalid(format!("{}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn ecosystem(&self, ecosystem: Ecosystem) -> &EcosystemPolicy {
        match ecosystem {
            Ecosystem::Gradle => &self.gradle,
            Ecosystem::Maven => &self.maven,
            Ecosystem::Npm => &self.npm,
        }
    }

    /// The configured server URL, only if it is a valid http/https URL.
    pub fn server_url(&self) -> Option<&str> {
        self.server.as_deref().filter(|s| is_valid_http_url(s))
    }

    /// Check the global settings needed to inject `ecosystem`.
    pub fn validate(&self, ecosystem: Ecosystem) -> Result<()> {
        if !self.enabled {
            return Err(InjectionError::ConfigurationInvalid(
                "injection disabled".to_string(),
            ));
        }
        match self.server.as_deref() {
            Some(server) if is_valid_http_url(server) => {}
            Some(server) => {
                return Err(InjectionError::ConfigurationInvalid(format!(
                    "invalid server URL: {server}"
                )))
            }
            None => {
                return Err(InjectionError::ConfigurationInvalid(
                    "server URL not configured".to_string(),
                ))
            }
        }

        let settings = self.ecosystem(ecosystem);
        match settings.agent_version.as_deref() {
            Some(version) if is_valid_version(version) => {}
            Some(version) => {
                return Err(InjectionError::ConfigurationInvalid(format!(
                    "invalid {ecosystem} version: {version}"
                )))
            }
            None => {
                return Err(InjectionError::ConfigurationInvalid(format!(
                    "{ecosystem} version not configured"
                )))
            }
        }
        if let Some(ccud) = settings.ccud_version.as_deref() {
            if !is_valid_version(ccud) {
                return Err(InjectionError::ConfigurationInvalid(format!(
                    "invalid {ecosystem} CCUD version: {ccud}"
                )));
            }
        }
        Ok(())
    }

    /// Enabled irrespective of any particular agent.
    pub fn is_globally_enabled(&self, ecosystem: Ecosystem) -> bool {
        self.validate(ecosystem).is_ok()
    }
}

fn version_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(VERSION_PATTERN).ok()).as_ref()
}

/// `1.2`, `1.2.3`, `1.2.3-rc-1`.
pub fn is_valid_version(version: &str) -> bool {
    version_regex().is_some_and(|re| re.is_match(version))
}

pub fn is_valid_http_url(candidate: &str) -> bool {
    url::Url::parse(candidate)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

/// Holds the current policy snapshot.
///
/// Readers get an `Arc` that stays valid even if the store is replaced
/// while they work.
#[derive(Debug, Default)]
pub struct PolicyStore {
    current: RwLock<Arc<Policy>>,
}

impl PolicyStore {
    pub fn new(policy: Policy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
        }
    }

    pub fn snapshot(&self) -> Arc<Policy> {
        let guard = match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(&guard)
    }

    /// Install a new snapshot and return it.
    pub fn replace(&self, policy: Policy) -> Arc<Policy> {
        let next = Arc::new(policy);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::clone(&next);
        next
    }
}
