//! Gradle: init script in `~/.gradle/init.d` plus plugin jars, configured
//! through `develocity-injection.*` system properties in `GRADLE_OPTS`.

use std::path::PathBuf;

use super::{
    flag, join_paths, stripped_options, EcosystemInjector, InjectionPlan, Install, PlannedArtifact,
    CUSTOM_VALUE, INJECTION_DIR,
};
use crate::agent::AgentDescriptor;
use crate::artifact::{
    ArtifactRequest, CCUD_GRADLE_PLUGIN, DEVELOCITY_GRADLE_PLUGIN, GRADLE_INIT_SCRIPT_ARTIFACT,
};
use crate::options::{OptionsEditor, PropertyKey};
use crate::policy::{is_valid_http_url, Ecosystem, Policy};

pub const GRADLE_OPTS: &str = "GRADLE_OPTS";
pub const INIT_SCRIPT_NAME: &str = "init-build-scan.gradle";

/// Environment fallback the init script reads for `develocity-injection.enabled`.
pub const DISABLED_ENV: &str = "DEVELOCITY_INJECTION_ENABLED";

pub const ENABLED: PropertyKey = PropertyKey::required("develocity-injection.enabled");
pub const URL: PropertyKey = PropertyKey::required("develocity-injection.url");
pub const PLUGIN_VERSION: PropertyKey =
    PropertyKey::required("develocity-injection.develocity-plugin.version");
pub const INIT_SCRIPT: PropertyKey = PropertyKey::required("develocity-injection.init-script-name");
pub const PLUGIN_CLASSPATH: PropertyKey =
    PropertyKey::required("develocity-injection.plugin-classpath");
pub const CCUD_PLUGIN_VERSION: PropertyKey =
    PropertyKey::optional("develocity-injection.ccud-plugin.version");
pub const ALLOW_UNTRUSTED: PropertyKey =
    PropertyKey::optional("develocity-injection.allow-untrusted-server");
pub const ENFORCE_URL: PropertyKey = PropertyKey::optional("develocity-injection.enforce-url");
pub const CAPTURE_FILE_FINGERPRINTS: PropertyKey =
    PropertyKey::optional("develocity-injection.capture-file-fingerprints");
pub const CUSTOM_VALUE_KEY: PropertyKey =
    PropertyKey::optional("develocity-injection.custom-value");
pub const PLUGIN_REPOSITORY_URL: PropertyKey =
    PropertyKey::optional("develocity-injection.plugin-repository.url");

const KEYS: &[PropertyKey] = &[
    ENABLED,
    URL,
    PLUGIN_VERSION,
    INIT_SCRIPT,
    PLUGIN_CLASSPATH,
    CCUD_PLUGIN_VERSION,
    ALLOW_UNTRUSTED,
    ENFORCE_URL,
    CAPTURE_FILE_FINGERPRINTS,
    CUSTOM_VALUE_KEY,
    PLUGIN_REPOSITORY_URL,
];

#[derive(Debug, Clone)]
pub struct GradleInjector {
    editor: OptionsEditor,
}

impl GradleInjector {
    pub fn new() -> Self {
        Self {
            editor: OptionsEditor::new(KEYS),
        }
    }

    fn jar_dir(agent: &dyn AgentDescriptor) -> PathBuf {
        agent.root().join(INJECTION_DIR).join("gradle")
    }

    pub fn init_script_path(agent: &dyn AgentDescriptor) -> PathBuf {
        agent.home().join(".gradle").join("init.d").join(INIT_SCRIPT_NAME)
    }
}

impl Default for GradleInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl EcosystemInjector for GradleInjector {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Gradle
    }

    fn options_variable(&self) -> &'static str {
        GRADLE_OPTS
    }

    fn editor(&self) -> &OptionsEditor {
        &self.editor
    }

    fn required_artifacts(&self, policy: &Policy) -> Vec<ArtifactRequest> {
        let settings = &policy.gradle;
        let Some(version) = settings.agent_version.as_deref() else {
            return Vec::new();
        };
        let repository = settings.repository.clone();

        let mut requests = vec![
            ArtifactRequest::new(&GRADLE_INIT_SCRIPT_ARTIFACT, crate::VERSION),
            ArtifactRequest::new(&DEVELOCITY_GRADLE_PLUGIN, version)
                .with_repository(repository.clone()),
        ];
        if let Some(ccud) = settings.ccud_version.as_deref() {
            requests.push(
                ArtifactRequest::new(&CCUD_GRADLE_PLUGIN, ccud).with_repository(repository),
            );
        }
        requests
    }

    fn plan(&self, policy: &Policy, agent: &dyn AgentDescriptor) -> InjectionPlan {
        let settings = &policy.gradle;
        let jar_dir = Self::jar_dir(agent);

        let mut artifacts = Vec::new();
        for request in self.required_artifacts(policy) {
            let destination = if request.descriptor.embedded().is_some() {
                Self::init_script_path(agent)
            } else {
                jar_dir.join(request.descriptor.cache_file_name)
            };
            artifacts.push(PlannedArtifact {
                request,
                destination,
                install: Install::Copy,
            });
        }

        let jars: Vec<&std::path::Path> = artifacts
            .iter()
            .filter(|a| a.request.descriptor.embedded().is_none())
            .map(|a| a.destination.as_path())
            .collect();
        let classpath = join_paths(&jars, agent.path_separator());

        let mut options = vec![
            ENABLED.with("true"),
            URL.with(policy.server.clone().unwrap_or_default()),
            PLUGIN_VERSION.with(settings.agent_version.clone().unwrap_or_default()),
            INIT_SCRIPT.with(INIT_SCRIPT_NAME),
            PLUGIN_CLASSPATH.with(classpath),
        ];
        if let Some(ccud) = &settings.ccud_version {
            options.push(CCUD_PLUGIN_VERSION.with(ccud.clone()));
        }
        if policy.allow_untrusted {
            options.push(ALLOW_UNTRUSTED.with("true"));
        }
        if policy.enforce_url {
            options.push(ENFORCE_URL.with("true"));
        }
        options.push(CAPTURE_FILE_FINGERPRINTS.with(flag(policy.capture_file_fingerprints)));
        options.push(CUSTOM_VALUE_KEY.with(CUSTOM_VALUE));
        if let Some(repo) = settings
            .repository
            .as_ref()
            .filter(|r| is_valid_http_url(&r.url))
        {
            options.push(PLUGIN_REPOSITORY_URL.with(repo.url.clone()));
        }

        let mut stale = Vec::new();
        if settings.ccud_version.is_none() {
            stale.push(jar_dir.join(CCUD_GRADLE_PLUGIN.cache_file_name));
        }

        InjectionPlan {
            artifacts,
            options: options.iter().map(ToString::to_string).collect(),
            env: Vec::new(),
            stale,
        }
    }

    fn installed_paths(&self, agent: &dyn AgentDescriptor) -> Vec<PathBuf> {
        vec![Self::jar_dir(agent), Self::init_script_path(agent)]
    }

    fn disabled_build_env(&self, current_options: Option<&str>) -> Vec<(String, Option<String>)> {
        let mut env = stripped_options(&self.editor, GRADLE_OPTS, current_options);
        env.push((DISABLED_ENV.to_string(), Some("false".to_string())));
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryAgent;
    use crate::policy::EcosystemPolicy;

    fn policy() -> Policy {
        Policy {
            enabled: true,
            server: Some("https://scans.example.com".to_string()),
            gradle: EcosystemPolicy {
                agent_version: Some("3.11.1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn plan_minimal() {
        let agent = MemoryAgent::new("linux-1");
        let plan = GradleInjector::new().plan(&policy(), &agent);

        assert_eq!(
            plan.options,
            vec![
                "-Ddevelocity-injection.enabled=true",
                "-Ddevelocity-injection.url=https://scans.example.com",
                "-Ddevelocity-injection.develocity-plugin.version=3.11.1",
                "-Ddevelocity-injection.init-script-name=init-build-scan.gradle",
                "-Ddevelocity-injection.plugin-classpath=/agents/linux-1/develocity-injection/gradle/develocity-gradle-plugin.jar",
                "-Ddevelocity-injection.capture-file-fingerprints=true",
                "-Ddevelocity-injection.custom-value=autoinject",
            ]
        );
        assert_eq!(plan.artifacts.len(), 2);
        assert_eq!(
            plan.artifacts[0].destination,
            PathBuf::from("/home/linux-1/.gradle/init.d/init-build-scan.gradle")
        );
        assert_eq!(
            plan.stale,
            vec![PathBuf::from(
                "/agents/linux-1/develocity-injection/gradle/common-custom-user-data-gradle-plugin.jar"
            )]
        );
    }

    #[test]
    fn plan_with_ccud_and_flags_on_windows() {
        let mut p = policy();
        p.gradle.ccud_version = Some("2.0.2".to_string());
        p.allow_untrusted = true;
        p.enforce_url = true;
        let agent = MemoryAgent::new("win").with_unix(false);

        let plan = GradleInjector::new().plan(&p, &agent);
        assert!(plan.stale.is_empty());
        assert_eq!(plan.artifacts.len(), 3);
        let classpath = plan
            .options
            .iter()
            .find(|t| t.contains(PLUGIN_CLASSPATH.name))
            .unwrap();
        assert!(classpath.contains("develocity-gradle-plugin.jar;"));
        for expected in [
            "-Ddevelocity-injection.ccud-plugin.version=2.0.2",
            "-Ddevelocity-injection.allow-untrusted-server=true",
            "-Ddevelocity-injection.enforce-url=true",
        ] {
            assert!(plan.options.iter().any(|o| o == expected), "{expected}");
        }
    }

    #[test]
    fn editor_recognises_own_output() {
        let agent = MemoryAgent::new("a");
        let injector = GradleInjector::new();
        let plan = injector.plan(&policy(), &agent);
        let merged = injector.editor().merge(Some("-Xmx1g"), &plan.options);
        assert!(injector.editor().is_managed(&merged));
        assert_eq!(injector.editor().strip(Some(&merged), &[]).as_deref(), Some("-Xmx1g"));
    }

    #[test]
    fn disabled_build_env_switches_init_script_off() {
        let injector = GradleInjector::new();
        let plan = injector.plan(&policy(), &MemoryAgent::new("a"));
        let merged = injector.editor().merge(Some("-Xmx1g"), &plan.options);

        assert_eq!(
            injector.disabled_build_env(Some(&merged)),
            vec![
                (GRADLE_OPTS.to_string(), Some("-Xmx1g".to_string())),
                (DISABLED_ENV.to_string(), Some("false".to_string())),
            ]
        );
        assert_eq!(injector.disabled_build_env(Some("-Xmx1g")).len(), 1);
    }

    #[test]
    fn no_version_no_artifacts() {
        let injector = GradleInjector::new();
        assert!(injector.required_artifacts(&Policy::default()).is_empty());
    }
}
