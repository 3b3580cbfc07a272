//! Build-scoped overrides computed when a build checks out its sources.
//!
//! The agent's persistent state is never touched here. The result is a set
//! of environment entries that the host layers over the build's environment.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::agent::AgentDescriptor;
use crate::artifact::{
    ArtifactDescriptor, CCUD_MAVEN_EXTENSION, DEVELOCITY_MAVEN_EXTENSION,
    GRADLE_ENTERPRISE_MAVEN_EXTENSION,
};
use crate::error::Result;
use crate::injector::{self, maven};
use crate::obs;
use crate::options::{OptionsEditor, PropertyKey, SystemProperty};
use crate::policy::{Ecosystem, Policy};

pub const MAVEN_EXTENSIONS_FILE: &str = ".mvn/extensions.xml";

/// What the host knows about a build at checkout time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutContext {
    pub build_id: String,
    /// Remote URLs in declaration order. `None` is a remote without a URL.
    pub remote_urls: Vec<Option<String>>,
    /// Workspace path on the agent.
    pub workspace: PathBuf,
}

/// Environment entries for one build. `None` removes the variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOverride {
    pub build_id: String,
    pub entries: BTreeMap<String, Option<String>>,
}

impl BuildOverride {
    fn new(build_id: &str) -> Self {
        Self {
            build_id: build_id.to_string(),
            entries: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Layer this override over a build environment.
    pub fn apply(&self, env: &mut BTreeMap<String, String>) {
        for (key, value) in &self.entries {
            match value {
                Some(v) => {
                    env.insert(key.clone(), v.clone());
                }
                None => {
                    env.remove(key);
                }
            }
        }
    }
}

/// Decide the override for a checked-out build on `agent`.
#[instrument(skip_all, fields(build_id = %context.build_id, agent = %agent.name()))]
pub async fn on_checkout(
    policy: &Policy,
    context: &CheckoutContext,
    agent: &dyn AgentDescriptor,
) -> Result<BuildOverride> {
    let mut result = BuildOverride::new(&context.build_id);
    if !policy.enabled || policy.server_url().is_none() {
        return Ok(result);
    }

    let remotes: Vec<Option<&str>> = context.remote_urls.iter().map(|u| u.as_deref()).collect();
    if !policy.repository_filter.is_enabled_for_remotes(&remotes) {
        for injector in injector::all() {
            if !policy.is_globally_enabled(injector.ecosystem()) {
                continue;
            }
            let current = agent.read_env(injector.options_variable()).await?;
            result
                .entries
                .extend(injector.disabled_build_env(current.as_deref()));
        }
        obs::emit_checkout_override(&context.build_id, "repository excluded", result.entries.len());
        return Ok(result);
    }

    if !policy.is_globally_enabled(Ecosystem::Maven) {
        return Ok(result);
    }
    let Some(current) = agent.read_env(maven::MAVEN_OPTS).await? else {
        return Ok(result);
    };

    let extensions_file = context.workspace.join(MAVEN_EXTENSIONS_FILE);
    let known = match agent.read_file(&extensions_file).await? {
        Some(bytes) => detect_known_extensions(&String::from_utf8_lossy(&bytes)),
        None => {
            debug!(path = %extensions_file.display(), "no maven extensions file");
            return Ok(result);
        }
    };
    if known.is_empty() {
        return Ok(result);
    }

    let filtered = filter_maven_opts(&current, &known, agent.path_separator(), policy.enforce_url);
    result
        .entries
        .insert(maven::MAVEN_OPTS.to_string(), filtered);
    obs::emit_checkout_override(
        &context.build_id,
        "maven extension already applied",
        result.entries.len(),
    );
    Ok(result)
}

fn extension_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<extension>(.*?)</extension>").ok())
        .as_ref()
}

fn group_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<groupId>\s*([^<\s]+)\s*</groupId>").ok())
        .as_ref()
}

fn artifact_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<artifactId>\s*([^<\s]+)\s*</artifactId>").ok())
        .as_ref()
}

/// `group:artifact` of every extension declared in an `extensions.xml`.
pub fn declared_extensions(xml: &str) -> BTreeSet<String> {
    let (Some(block), Some(group), Some(artifact)) =
        (extension_block_regex(), group_regex(), artifact_regex())
    else {
        return BTreeSet::new();
    };

    block
        .captures_iter(xml)
        .filter_map(|c| {
            let body = c.get(1)?.as_str();
            let g = group.captures(body)?.get(1)?.as_str();
            let a = artifact.captures(body)?.get(1)?.as_str();
            Some(format!("{g}:{a}"))
        })
        .collect()
}

/// Which injected extensions a project already applies on its own.
pub fn detect_known_extensions(xml: &str) -> Vec<&'static ArtifactDescriptor> {
    let declared = declared_extensions(xml);
    let declares = |d: &ArtifactDescriptor| {
        d.coordinates()
            .map(|c| declared.contains(&c))
            .unwrap_or(false)
    };

    let mut known = Vec::new();
    if declares(&DEVELOCITY_MAVEN_EXTENSION) || declares(&GRADLE_ENTERPRISE_MAVEN_EXTENSION) {
        known.push(&DEVELOCITY_MAVEN_EXTENSION);
        known.push(&GRADLE_ENTERPRISE_MAVEN_EXTENSION);
    }
    if declares(&CCUD_MAVEN_EXTENSION) {
        known.push(&CCUD_MAVEN_EXTENSION);
    }
    known
}

/// Drop already-applied extensions from `maven.ext.class.path`, and when
/// the Develocity extension is among them also drop the server and upload
/// settings (keeping the server URL if it must be enforced).
pub fn filter_maven_opts(
    current: &str,
    known: &[&ArtifactDescriptor],
    separator: char,
    enforce_url: bool,
) -> Option<String> {
    let without_jars = current
        .split(' ')
        .filter_map(|token| match token.parse::<SystemProperty>() {
            Ok(prop) if prop.key == maven::EXT_CLASS_PATH.name => {
                let kept: Vec<&str> = prop
                    .value
                    .split(separator)
                    .filter(|lib| !known.iter().any(|d| lib.contains(d.cache_file_name)))
                    .collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(maven::EXT_CLASS_PATH.with(kept.join(&separator.to_string())).to_string())
                }
            }
            _ => Some(token.to_string()),
        })
        .collect::<Vec<_>>()
        .join(" ");

    if !known.iter().any(|d| d.id == DEVELOCITY_MAVEN_EXTENSION.id) {
        return Some(without_jars).filter(|s| !s.trim().is_empty());
    }

    let editor = OptionsEditor::new(&[
        maven::DEVELOCITY_URL,
        maven::GRADLE_ENTERPRISE_URL,
        maven::DEVELOCITY_UPLOAD_IN_BACKGROUND,
        maven::BUILD_SCAN_UPLOAD_IN_BACKGROUND,
        maven::DEVELOCITY_ALLOW_UNTRUSTED,
        maven::GRADLE_ENTERPRISE_ALLOW_UNTRUSTED,
    ]
    .map(|k| PropertyKey::optional(k.name)));

    let keep: &[&str] = if enforce_url {
        &[maven::DEVELOCITY_URL.name, maven::GRADLE_ENTERPRISE_URL.name]
    } else {
        &[]
    };
    editor.strip(Some(&without_jars), keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryAgent;
    use crate::injector::gradle::GRADLE_OPTS;
    use crate::injector::npm::DEVELOCITY_INTERNAL_DISABLE_AGENT;
    use crate::policy::EcosystemPolicy;
    use crate::repo_filter::RepositoryFilter;
    use std::path::Path;

    const EXTENSIONS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<extensions>
  <extension>
    <groupId>com.gradle</groupId>
    <artifactId>develocity-maven-extension</artifactId>
    <version>1.21.4</version>
  </extension>
  <extension>
    <groupId>org.example</groupId>
    <artifactId>other</artifactId>
  </extension>
</extensions>"#;

    fn version(v: &str) -> EcosystemPolicy {
        EcosystemPolicy {
            agent_version: Some(v.to_string()),
            ..Default::default()
        }
    }

    fn policy(filter: &str) -> Policy {
        Policy {
            enabled: true,
            server: Some("https://scans.example.com".to_string()),
            gradle: version("3.11.1"),
            maven: version("1.21.4"),
            npm: version("1.0.1"),
            repository_filter: RepositoryFilter::parse(filter),
            ..Default::default()
        }
    }

    fn context(urls: &[&str]) -> CheckoutContext {
        CheckoutContext {
            build_id: "job#1".to_string(),
            remote_urls: urls.iter().map(|u| Some(u.to_string())).collect(),
            workspace: PathBuf::from("/ws/job"),
        }
    }

    const MAVEN_OPTS_INJECTED: &str = "-Xmx1g -Dmaven.ext.class.path=/a/develocity-maven-extension.jar:/a/common-custom-user-data-maven-extension.jar -Ddevelocity.scan.uploadInBackground=false -Dgradle.scan.uploadInBackground=false -Ddevelocity.url=https://scans.example.com -Dgradle.enterprise.url=https://scans.example.com";

    #[test]
    fn parses_declared_extensions() {
        let declared = declared_extensions(EXTENSIONS_XML);
        assert!(declared.contains("com.gradle:develocity-maven-extension"));
        assert!(declared.contains("org.example:other"));
        assert_eq!(declared.len(), 2);
        assert!(declared_extensions("<extensions/>").is_empty());
    }

    #[test]
    fn detects_develocity_family() {
        let known = detect_known_extensions(EXTENSIONS_XML);
        let ids: Vec<&str> = known.iter().map(|d| d.id).collect();
        assert_eq!(
            ids,
            vec!["develocity-maven-extension", "gradle-enterprise-maven-extension"]
        );
    }

    #[test]
    fn filter_removes_jar_and_server_settings() {
        let known = detect_known_extensions(EXTENSIONS_XML);
        let filtered = filter_maven_opts(MAVEN_OPTS_INJECTED, &known, ':', false);
        assert_eq!(
            filtered.as_deref(),
            Some("-Xmx1g -Dmaven.ext.class.path=/a/common-custom-user-data-maven-extension.jar")
        );
    }

    #[test]
    fn filter_keeps_url_when_enforced() {
        let known = detect_known_extensions(EXTENSIONS_XML);
        let filtered = filter_maven_opts(MAVEN_OPTS_INJECTED, &known, ':', true).unwrap();
        assert!(filtered.contains("-Ddevelocity.url=https://scans.example.com"));
        assert!(filtered.contains("-Dgradle.enterprise.url=https://scans.example.com"));
        assert!(!filtered.contains("uploadInBackground"));
    }

    #[test]
    fn filter_ccud_only_touches_classpath() {
        let filtered =
            filter_maven_opts(MAVEN_OPTS_INJECTED, &[&CCUD_MAVEN_EXTENSION], ':', false).unwrap();
        assert!(filtered.contains("-Dmaven.ext.class.path=/a/develocity-maven-extension.jar "));
        assert!(filtered.contains("-Ddevelocity.url="));
    }

    #[tokio::test]
    async fn excluded_repository_disables_everything() {
        let agent = MemoryAgent::new("a")
            .with_env(maven::MAVEN_OPTS, MAVEN_OPTS_INJECTED)
            .with_env(GRADLE_OPTS, "-Xmx2g");
        let context = context(&["https://github.com/x.git"]);
        let result = on_checkout(&policy("-:github.com/"), &context, &agent)
            .await
            .unwrap();

        assert_eq!(result.entries[maven::MAVEN_OPTS].as_deref(), Some("-Xmx1g"));
        assert_eq!(
            result.entries[DEVELOCITY_INTERNAL_DISABLE_AGENT].as_deref(),
            Some("true")
        );
        assert_eq!(
            result.entries[crate::injector::gradle::DISABLED_ENV].as_deref(),
            Some("false")
        );
        // GRADLE_OPTS was never ours.
        assert!(!result.entries.contains_key(GRADLE_OPTS));

        let mut env = agent.env_snapshot();
        result.apply(&mut env);
        assert_eq!(env[maven::MAVEN_OPTS], "-Xmx1g");
        // Agent state itself is untouched.
        assert_eq!(agent.env_snapshot()[maven::MAVEN_OPTS], MAVEN_OPTS_INJECTED);
    }

    #[tokio::test]
    async fn included_repository_without_extensions_is_untouched() {
        let agent = MemoryAgent::new("a").with_env(maven::MAVEN_OPTS, MAVEN_OPTS_INJECTED);
        let context = context(&["https://github.com/org/x.git"]);
        let result = on_checkout(&policy("+:github.com/org/"), &context, &agent)
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn undecided_repository_is_excluded() {
        let agent = MemoryAgent::new("a");
        let context = context(&["https://gitlab.com/x.git"]);
        let result = on_checkout(&policy("+:github.com/org/"), &context, &agent)
            .await
            .unwrap();
        assert!(result.entries.contains_key(DEVELOCITY_INTERNAL_DISABLE_AGENT));
    }

    #[tokio::test]
    async fn project_extension_filters_maven_opts() {
        let agent = MemoryAgent::new("a").with_env(maven::MAVEN_OPTS, MAVEN_OPTS_INJECTED);
        agent
            .write_file(Path::new("/ws/job/.mvn/extensions.xml"), EXTENSIONS_XML.as_bytes())
            .await
            .unwrap();

        let result = on_checkout(&policy(""), &context(&["https://github.com/x.git"]), &agent)
            .await
            .unwrap();
        assert_eq!(
            result.entries[maven::MAVEN_OPTS].as_deref(),
            Some("-Xmx1g -Dmaven.ext.class.path=/a/common-custom-user-data-maven-extension.jar")
        );
    }

    #[tokio::test]
    async fn globally_disabled_policy_yields_nothing() {
        let agent = MemoryAgent::new("a");
        let result = on_checkout(&Policy::default(), &context(&[]), &agent)
            .await
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(result.build_id, "job#1");
    }
}
