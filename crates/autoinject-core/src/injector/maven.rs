//! Maven: extension jars on `maven.ext.class.path`, configured through
//! system properties in `MAVEN_OPTS`.

use std::path::{Path, PathBuf};

use super::{
    flag, join_paths, EcosystemInjector, InjectionPlan, Install, PlannedArtifact, INJECTION_DIR,
};
use crate::agent::AgentDescriptor;
use crate::artifact::{
    maven_extension_for, ArtifactRequest, CCUD_MAVEN_EXTENSION, DEVELOCITY_MAVEN_EXTENSION,
    GRADLE_ENTERPRISE_MAVEN_EXTENSION,
};
use crate::options::{OptionsEditor, PropertyKey};
use crate::policy::{Ecosystem, Policy};

pub const MAVEN_OPTS: &str = "MAVEN_OPTS";

pub const EXT_CLASS_PATH: PropertyKey = PropertyKey::required("maven.ext.class.path");
pub const DEVELOCITY_URL: PropertyKey = PropertyKey::required("develocity.url");
pub const GRADLE_ENTERPRISE_URL: PropertyKey = PropertyKey::required("gradle.enterprise.url");
pub const DEVELOCITY_UPLOAD_IN_BACKGROUND: PropertyKey =
    PropertyKey::required("develocity.scan.uploadInBackground");
pub const BUILD_SCAN_UPLOAD_IN_BACKGROUND: PropertyKey =
    PropertyKey::required("gradle.scan.uploadInBackground");
pub const DEVELOCITY_ALLOW_UNTRUSTED: PropertyKey =
    PropertyKey::optional("develocity.allowUntrustedServer");
pub const GRADLE_ENTERPRISE_ALLOW_UNTRUSTED: PropertyKey =
    PropertyKey::optional("gradle.enterprise.allowUntrustedServer");
pub const DEVELOCITY_CAPTURE_FILE_FINGERPRINTS: PropertyKey =
    PropertyKey::optional("develocity.scan.captureFileFingerprints");
pub const GRADLE_ENTERPRISE_CAPTURE_GOAL_INPUT_FILES: PropertyKey =
    PropertyKey::optional("gradle.scan.captureGoalInputFiles");

pub const KEYS: &[PropertyKey] = &[
    EXT_CLASS_PATH,
    DEVELOCITY_URL,
    GRADLE_ENTERPRISE_URL,
    DEVELOCITY_UPLOAD_IN_BACKGROUND,
    BUILD_SCAN_UPLOAD_IN_BACKGROUND,
    DEVELOCITY_ALLOW_UNTRUSTED,
    GRADLE_ENTERPRISE_ALLOW_UNTRUSTED,
    DEVELOCITY_CAPTURE_FILE_FINGERPRINTS,
    GRADLE_ENTERPRISE_CAPTURE_GOAL_INPUT_FILES,
];

#[derive(Debug, Clone)]
pub struct MavenInjector {
    editor: OptionsEditor,
}

impl MavenInjector {
    pub fn new() -> Self {
        Self {
            editor: OptionsEditor::new(KEYS),
        }
    }

    pub fn extension_dir(agent: &dyn AgentDescriptor) -> PathBuf {
        agent.root().join(INJECTION_DIR).join("maven")
    }
}

impl Default for MavenInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl EcosystemInjector for MavenInjector {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Maven
    }

    fn options_variable(&self) -> &'static str {
        MAVEN_OPTS
    }

    fn editor(&self) -> &OptionsEditor {
        &self.editor
    }

    fn required_artifacts(&self, policy: &Policy) -> Vec<ArtifactRequest> {
        let settings = &policy.maven;
        let Some(version) = settings.agent_version.as_deref() else {
            return Vec::new();
        };
        let repository = settings.repository.clone();

        let mut requests = vec![
            ArtifactRequest::new(maven_extension_for(version), version)
                .with_repository(repository.clone()),
        ];
        if let Some(ccud) = settings.ccud_version.as_deref() {
            requests.push(
                ArtifactRequest::new(&CCUD_MAVEN_EXTENSION, ccud).with_repository(repository),
            );
        }
        requests
    }

    fn plan(&self, policy: &Policy, agent: &dyn AgentDescriptor) -> InjectionPlan {
        let dir = Self::extension_dir(agent);
        let artifacts: Vec<PlannedArtifact> = self
            .required_artifacts(policy)
            .into_iter()
            .map(|request| PlannedArtifact {
                destination: dir.join(request.descriptor.cache_file_name),
                request,
                install: Install::Copy,
            })
            .collect();

        let jars: Vec<&Path> = artifacts.iter().map(|a| a.destination.as_path()).collect();
        let server = policy.server.clone().unwrap_or_default();
        let capture = flag(policy.capture_file_fingerprints);

        let mut options = vec![
            EXT_CLASS_PATH.with(join_paths(&jars, agent.path_separator())),
            DEVELOCITY_UPLOAD_IN_BACKGROUND.with("false"),
            BUILD_SCAN_UPLOAD_IN_BACKGROUND.with("false"),
            DEVELOCITY_URL.with(server.clone()),
            GRADLE_ENTERPRISE_URL.with(server),
        ];
        if policy.allow_untrusted {
            options.push(DEVELOCITY_ALLOW_UNTRUSTED.with("true"));
            options.push(GRADLE_ENTERPRISE_ALLOW_UNTRUSTED.with("true"));
        }
        options.push(DEVELOCITY_CAPTURE_FILE_FINGERPRINTS.with(capture.clone()));
        options.push(GRADLE_ENTERPRISE_CAPTURE_GOAL_INPUT_FILES.with(capture));

        let in_use: Vec<&str> = artifacts.iter().map(|a| a.request.descriptor.id).collect();
        let stale = [
            &DEVELOCITY_MAVEN_EXTENSION,
            &GRADLE_ENTERPRISE_MAVEN_EXTENSION,
            &CCUD_MAVEN_EXTENSION,
        ]
        .into_iter()
        .filter(|d| !in_use.contains(&d.id))
        .map(|d| dir.join(d.cache_file_name))
        .collect();

        InjectionPlan {
            artifacts,
            options: options.iter().map(ToString::to_string).collect(),
            env: Vec::new(),
            stale,
        }
    }

    fn installed_paths(&self, agent: &dyn AgentDescriptor) -> Vec<PathBuf> {
        vec![Self::extension_dir(agent)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryAgent;
    use crate::policy::EcosystemPolicy;

    fn policy(version: &str) -> Policy {
        Policy {
            enabled: true,
            server: Some("https://scans.example.com".to_string()),
            maven: EcosystemPolicy {
                agent_version: Some(version.to_string()),
                ccud_version: Some("2.0.1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn plan_tokens() {
        let agent = MemoryAgent::new("m");
        let plan = MavenInjector::new().plan(&policy("1.21.4"), &agent);
        assert_eq!(
            plan.options,
            vec![
                "-Dmaven.ext.class.path=/agents/m/develocity-injection/maven/develocity-maven-extension.jar:/agents/m/develocity-injection/maven/common-custom-user-data-maven-extension.jar",
                "-Ddevelocity.scan.uploadInBackground=false",
                "-Dgradle.scan.uploadInBackground=false",
                "-Ddevelocity.url=https://scans.example.com",
                "-Dgradle.enterprise.url=https://scans.example.com",
                "-Ddevelocity.scan.captureFileFingerprints=true",
                "-Dgradle.scan.captureGoalInputFiles=true",
            ]
        );
        assert_eq!(
            plan.stale,
            vec![PathBuf::from(
                "/agents/m/develocity-injection/maven/gradle-enterprise-maven-extension.jar"
            )]
        );
    }

    #[test]
    fn legacy_version_uses_gradle_enterprise_extension() {
        let injector = MavenInjector::new();
        let requests = injector.required_artifacts(&policy("1.18"));
        assert_eq!(requests[0].descriptor.id, GRADLE_ENTERPRISE_MAVEN_EXTENSION.id);
    }

    #[test]
    fn allow_untrusted_adds_both_keys() {
        let mut p = policy("1.21");
        p.allow_untrusted = true;
        p.capture_file_fingerprints = false;
        let plan = MavenInjector::new().plan(&p, &MemoryAgent::new("m"));
        for expected in [
            "-Ddevelocity.allowUntrustedServer=true",
            "-Dgradle.enterprise.allowUntrustedServer=true",
            "-Ddevelocity.scan.captureFileFingerprints=false",
        ] {
            assert!(plan.options.iter().any(|o| o == expected), "{expected}");
        }
    }

    #[test]
    fn disabled_build_env_strips_only_managed_strings() {
        let injector = MavenInjector::new();
        let plan = injector.plan(&policy("1.21"), &MemoryAgent::new("m"));
        let merged = injector.editor().merge(Some("-Xmx1g"), &plan.options);

        assert_eq!(
            injector.disabled_build_env(Some(&merged)),
            vec![(MAVEN_OPTS.to_string(), Some("-Xmx1g".to_string()))]
        );
        assert!(injector.disabled_build_env(Some("-Xmx1g")).is_empty());
        assert!(injector.disabled_build_env(None).is_empty());
    }
}
