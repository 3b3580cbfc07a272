//! Compiled-in catalog of the artifacts injection can place on an agent.

use std::cmp::Ordering;
use std::fmt;

use artifact_fetch::Credentials;

use crate::policy::{is_valid_http_url, ArtifactRepository, Ecosystem};

pub const DEFAULT_MAVEN_REPOSITORY: &str = "https://repo1.maven.org/maven2";
pub const DEFAULT_NPM_REGISTRY: &str = "https://registry.npmjs.org";

/// Last Maven extension version published under the Gradle Enterprise name.
const LAST_GRADLE_ENTERPRISE_EXTENSION: [u64; 3] = [1, 20, 1];

const GRADLE_INIT_SCRIPT: &[u8] = include_bytes!("../resources/init-build-scan.gradle");

/// How an artifact is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// `{base}/{groupPath}/{artifactId}/{version}/{artifactId}-{version}.jar`
    Maven {
        group: &'static str,
        artifact: &'static str,
    },
    /// `{base}/{scope}/{name}/-/{name}-{version}.tgz`
    Npm {
        scope: &'static str,
        name: &'static str,
    },
    /// Shipped inside this binary, never downloaded.
    Embedded(&'static [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub id: &'static str,
    pub ecosystem: Ecosystem,
    pub source: Source,
    /// File name in the controller cache and on the agent.
    pub cache_file_name: &'static str,
}

impl fmt::Display for ArtifactDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id)
    }
}

pub const DEVELOCITY_GRADLE_PLUGIN: ArtifactDescriptor = ArtifactDescriptor {
    id: "develocity-gradle-plugin",
    ecosystem: Ecosystem::Gradle,
    source: Source::Maven {
        group: "com.gradle",
        artifact: "develocity-gradle-plugin",
    },
    cache_file_name: "develocity-gradle-plugin.jar",
};

pub const CCUD_GRADLE_PLUGIN: ArtifactDescriptor = ArtifactDescriptor {
    id: "common-custom-user-data-gradle-plugin",
    ecosystem: Ecosystem::Gradle,
    source: Source::Maven {
        group: "com.gradle",
        artifact: "common-custom-user-data-gradle-plugin",
    },
    cache_file_name: "common-custom-user-data-gradle-plugin.jar",
};

pub const GRADLE_INIT_SCRIPT_ARTIFACT: ArtifactDescriptor = ArtifactDescriptor {
    id: "gradle-init-script",
    ecosystem: Ecosystem::Gradle,
    source: Source::Embedded(GRADLE_INIT_SCRIPT),
    cache_file_name: "init-build-scan.gradle",
};

pub const DEVELOCITY_MAVEN_EXTENSION: ArtifactDescriptor = ArtifactDescriptor {
    id: "develocity-maven-extension",
    ecosystem: Ecosystem::Maven,
    source: Source::Maven {
        group: "com.gradle",
        artifact: "develocity-maven-extension",
    },
    cache_file_name: "develocity-maven-extension.jar",
};

pub const GRADLE_ENTERPRISE_MAVEN_EXTENSION: ArtifactDescriptor = ArtifactDescriptor {
    id: "gradle-enterprise-maven-extension",
    ecosystem: Ecosystem::Maven,
    source: Source::Maven {
        group: "com.gradle",
        artifact: "gradle-enterprise-maven-extension",
    },
    cache_file_name: "gradle-enterprise-maven-extension.jar",
};

pub const CCUD_MAVEN_EXTENSION: ArtifactDescriptor = ArtifactDescriptor {
    id: "common-custom-user-data-maven-extension",
    ecosystem: Ecosystem::Maven,
    source: Source::Maven {
        group: "com.gradle",
        artifact: "common-custom-user-data-maven-extension",
    },
    cache_file_name: "common-custom-user-data-maven-extension.jar",
};

pub const NPM_AGENT: ArtifactDescriptor = ArtifactDescriptor {
    id: "develocity-npm-agent",
    ecosystem: Ecosystem::Npm,
    source: Source::Npm {
        scope: "@gradle-tech",
        name: "develocity-agent",
    },
    cache_file_name: "develocity-npm-agent.tgz",
};

/// Every artifact known to the engine.
pub const CATALOG: &[ArtifactDescriptor] = &[
    DEVELOCITY_GRADLE_PLUGIN,
    CCUD_GRADLE_PLUGIN,
    GRADLE_INIT_SCRIPT_ARTIFACT,
    DEVELOCITY_MAVEN_EXTENSION,
    GRADLE_ENTERPRISE_MAVEN_EXTENSION,
    CCUD_MAVEN_EXTENSION,
    NPM_AGENT,
];

impl ArtifactDescriptor {
    pub fn lookup(id: &str) -> Option<&'static ArtifactDescriptor> {
        CATALOG.iter().find(|d| d.id == id)
    }

    pub fn embedded(&self) -> Option<&'static [u8]> {
        match self.source {
            Source::Embedded(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Name of the cache metadata record.
    pub fn metadata_file_name(&self) -> String {
        format!("{}.meta", self.id)
    }

    /// Maven `group:artifact` coordinates, for jar artifacts.
    pub fn coordinates(&self) -> Option<String> {
        match self.source {
            Source::Maven { group, artifact } => Some(format!("{group}:{artifact}")),
            Source::Npm { scope, name } => Some(format!("{scope}/{name}")),
            Source::Embedded(_) => None,
        }
    }

    /// Download URL for `version`. A missing or invalid base falls back to
    /// the public default. Embedded artifacts have no URL.
    pub fn download_url(&self, version: &str, base: Option<&str>) -> Option<String> {
        let base = base.filter(|b| is_valid_http_url(b));
        match self.source {
            Source::Maven { group, artifact } => {
                let base = base.unwrap_or(DEFAULT_MAVEN_REPOSITORY).trim_end_matches('/');
                let group_path = group.replace('.', "/");
                Some(format!(
                    "{base}/{group_path}/{artifact}/{version}/{artifact}-{version}.jar"
                ))
            }
            Source::Npm { scope, name } => {
                let base = base.unwrap_or(DEFAULT_NPM_REGISTRY).trim_end_matches('/');
                Some(format!("{base}/{scope}/{name}/-/{name}-{version}.tgz"))
            }
            Source::Embedded(_) => None,
        }
    }
}

/// An artifact pinned to a version and an origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRequest {
    pub descriptor: &'static ArtifactDescriptor,
    pub version: String,
    pub repository: Option<ArtifactRepository>,
}

impl ArtifactRequest {
    pub fn new(descriptor: &'static ArtifactDescriptor, version: impl Into<String>) -> Self {
        Self {
            descriptor,
            version: version.into(),
            repository: None,
        }
    }

    pub fn with_repository(mut self, repository: Option<ArtifactRepository>) -> Self {
        self.repository = repository;
        self
    }

    pub fn url(&self) -> Option<String> {
        self.descriptor
            .download_url(&self.version, self.repository.as_ref().map(|r| r.url.as_str()))
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.repository.as_ref().and_then(|r| r.credentials.as_ref())
    }
}

/// The Develocity Maven extension, or its Gradle Enterprise predecessor for
/// versions up to 1.20.1.
pub fn maven_extension_for(version: &str) -> &'static ArtifactDescriptor {
    if compare_versions(version, &LAST_GRADLE_ENTERPRISE_EXTENSION) == Ordering::Greater {
        &DEVELOCITY_MAVEN_EXTENSION
    } else {
        &GRADLE_ENTERPRISE_MAVEN_EXTENSION
    }
}

/// Numeric comparison of the dotted release part, ignoring any `-suffix`.
/// Missing components count as zero.
fn compare_versions(version: &str, other: &[u64]) -> Ordering {
    let release = version.split('-').next().unwrap_or_default();
    let parts: Vec<u64> = release
        .split('.')
        .map(|p| p.parse().unwrap_or(0))
        .collect();
    let len = parts.len().max(other.len());
    for i in 0..len {
        let a = parts.get(i).copied().unwrap_or(0);
        let b = other.get(i).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Equal => continue,
            unequal => return unequal,
        }
    }
    Ordering::Equal
}
