//! autoinject - build-scan instrumentation auto-injection CLI
//!
//! Reconciles a fleet of build agents against an injection policy.
//!
//! ## Commands
//!
//! - `reconcile`: Reconcile every agent in the inventory
//! - `online`: Reconcile one agent, as when it connects
//! - `watch`: Re-run reconciliation whenever the policy file changes
//! - `eligibility`: Show which ecosystems each agent would receive
//! - `validate`: Check the policy per ecosystem
//! - `classify`: Classify repository URLs against the repository filter
//! - `checkout`: Compute the build-scoped override for a checkout
//! - `cache`: Show what the controller-side artifact cache holds

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

use artifact_fetch::HttpFetcher;
use autoinject_core::checkout::{on_checkout, CheckoutContext};
use autoinject_core::eligibility::resolve_all;
use autoinject_core::{
    AgentDescriptor, AgentInventory, AgentReport, ArtifactCache, ArtifactDescriptor,
    ArtifactDigest, InjectionOrchestrator, OrchestratorConfig, Policy, PolicyStore, CATALOG,
};

#[derive(Parser)]
#[command(name = "autoinject")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build-scan instrumentation auto-injection for CI agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "AUTOINJECT_LOG_JSON")]
    json: bool,

    /// Injection policy (JSON)
    #[arg(long, global = true, env = "AUTOINJECT_POLICY", default_value = "autoinject-policy.json")]
    policy: PathBuf,

    /// Agent inventory (JSON array of agents)
    #[arg(long, global = true, env = "AUTOINJECT_AGENTS", default_value = "agents.json")]
    agents: PathBuf,

    /// Controller-side artifact cache directory
    #[arg(long, global = true, env = "AUTOINJECT_CACHE_DIR", default_value = ".autoinject/cache")]
    cache_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every agent against the policy
    Reconcile {
        /// Maximum number of agents reconciled at once
        #[arg(long, default_value = "8")]
        max_concurrent: usize,
    },

    /// Reconcile a single agent
    Online {
        /// Agent name from the inventory
        agent: String,
    },

    /// Watch the policy file and reconcile the fleet on every change
    Watch {
        /// Poll interval in seconds
        #[arg(long, default_value = "30")]
        interval_secs: u64,

        /// Maximum number of agents reconciled at once
        #[arg(long, default_value = "8")]
        max_concurrent: usize,
    },

    /// Show per-agent, per-ecosystem eligibility
    Eligibility,

    /// Validate the policy for every ecosystem
    Validate,

    /// Classify repository URLs against the repository filter
    Classify {
        /// Repository URLs
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Print the environment override for a build checkout
    Checkout {
        /// Agent name from the inventory
        agent: String,

        /// Build identifier
        #[arg(long, default_value = "local")]
        build_id: String,

        /// Workspace path on the agent
        #[arg(long)]
        workspace: PathBuf,

        /// Remote URLs of the checked-out repository
        #[arg(long = "remote")]
        remotes: Vec<String>,
    },

    /// List cached artifacts with their version and digest
    Cache {
        /// Only show this artifact id
        artifact: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    autoinject_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Reconcile { max_concurrent } => {
            cmd_reconcile(&cli.policy, &cli.agents, &cli.cache_dir, max_concurrent).await
        }
        Commands::Online { agent } => {
            cmd_online(&cli.policy, &cli.agents, &cli.cache_dir, &agent).await
        }
        Commands::Watch {
            interval_secs,
            max_concurrent,
        } => {
            cmd_watch(
                &cli.policy,
                &cli.agents,
                &cli.cache_dir,
                Duration::from_secs(interval_secs.max(1)),
                max_concurrent,
            )
            .await
        }
        Commands::Eligibility => cmd_eligibility(&cli.policy, &cli.agents),
        Commands::Validate => cmd_validate(&cli.policy),
        Commands::Classify { urls } => cmd_classify(&cli.policy, &urls),
        Commands::Checkout {
            agent,
            build_id,
            workspace,
            remotes,
        } => cmd_checkout(&cli.policy, &cli.agents, &agent, build_id, workspace, remotes).await,
        Commands::Cache { artifact } => cmd_cache(&cli.cache_dir, artifact.as_deref()),
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn load_policy(path: &Path) -> Result<Policy> {
    Policy::load(path).with_context(|| format!("Failed to load policy {}", path.display()))
}

fn load_agents(path: &Path) -> Result<Vec<Arc<dyn AgentDescriptor>>> {
    let inventory = AgentInventory::load(path)
        .with_context(|| format!("Failed to load agent inventory {}", path.display()))?;
    Ok(inventory.into_agents())
}

fn find_agent(agents: &[Arc<dyn AgentDescriptor>], name: &str) -> Result<Arc<dyn AgentDescriptor>> {
    match agents.iter().find(|a| a.name() == name) {
        Some(agent) => Ok(Arc::clone(agent)),
        None => bail!("No agent named '{}' in the inventory", name),
    }
}

fn build_orchestrator(
    cache_dir: &Path,
    max_concurrent: usize,
) -> Result<Arc<InjectionOrchestrator>> {
    let fetcher = HttpFetcher::from_env().context("Failed to build HTTP client")?;
    let cache = ArtifactCache::new(cache_dir, Arc::new(fetcher))
        .with_context(|| format!("Failed to open artifact cache {}", cache_dir.display()))?;
    Ok(Arc::new(InjectionOrchestrator::with_config(
        Arc::new(cache),
        OrchestratorConfig { max_concurrent },
    )))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_reconcile(
    policy_path: &Path,
    agents_path: &Path,
    cache_dir: &Path,
    max_concurrent: usize,
) -> Result<()> {
    let policy = Arc::new(load_policy(policy_path)?);
    let agents = load_agents(agents_path)?;
    let orchestrator = build_orchestrator(cache_dir, max_concurrent)?;

    let reports = orchestrator.on_policy_changed(policy, agents).await;
    let failed = print_reports(&reports);
    if failed > 0 {
        bail!("{} of {} agent(s) failed to reconcile", failed, reports.len());
    }
    Ok(())
}

async fn cmd_online(
    policy_path: &Path,
    agents_path: &Path,
    cache_dir: &Path,
    name: &str,
) -> Result<()> {
    let policy = load_policy(policy_path)?;
    let agents = load_agents(agents_path)?;
    let agent = find_agent(&agents, name)?;
    let orchestrator = build_orchestrator(cache_dir, 1)?;

    let report = orchestrator.on_agent_online(&policy, agent.as_ref()).await;
    if print_reports(std::slice::from_ref(&report)) > 0 {
        bail!("Agent '{}' failed to reconcile", name);
    }
    Ok(())
}

async fn cmd_watch(
    policy_path: &Path,
    agents_path: &Path,
    cache_dir: &Path,
    interval: Duration,
    max_concurrent: usize,
) -> Result<()> {
    let store = PolicyStore::new(load_policy(policy_path)?);
    let orchestrator = build_orchestrator(cache_dir, max_concurrent)?;
    let mut last_digest = policy_digest(policy_path)?;

    let reports = orchestrator
        .on_policy_changed(store.snapshot(), load_agents(agents_path)?)
        .await;
    print_reports(&reports);

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping policy watch");
                return Ok(());
            }
        }

        let digest = match policy_digest(policy_path) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "Policy file unreadable, keeping current policy");
                continue;
            }
        };
        if digest == last_digest {
            continue;
        }
        last_digest = digest;

        let policy = match Policy::load(policy_path) {
            Ok(p) => store.replace(p),
            Err(e) => {
                warn!(error = %e, "Policy file invalid, keeping current policy");
                continue;
            }
        };
        let agents = match load_agents(agents_path) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "Agent inventory unreadable, skipping round");
                continue;
            }
        };
        info!(digest = %digest, agents = agents.len(), "Policy changed, reconciling");
        let reports = orchestrator.on_policy_changed(policy, agents).await;
        print_reports(&reports);
    }
}

fn policy_digest(path: &Path) -> Result<ArtifactDigest> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read policy {}", path.display()))?;
    Ok(ArtifactDigest::compute(&bytes))
}

fn cmd_eligibility(policy_path: &Path, agents_path: &Path) -> Result<()> {
    let policy = load_policy(policy_path)?;
    for agent in load_agents(agents_path)? {
        let decisions = resolve_all(&policy, agent.as_ref())
            .into_iter()
            .map(|(ecosystem, enabled)| {
                format!("{}={}", ecosystem, if enabled { "on" } else { "off" })
            })
            .collect::<Vec<_>>()
            .join(" ");
        println!("{:<24} {}", agent.name(), decisions);
    }
    Ok(())
}

fn cmd_validate(policy_path: &Path) -> Result<()> {
    let policy = load_policy(policy_path)?;
    for line in validation_lines(&policy) {
        println!("{}", line);
    }
    Ok(())
}

fn validation_lines(policy: &Policy) -> Vec<String> {
    autoinject_core::Ecosystem::ALL
        .iter()
        .map(|&ecosystem| match policy.validate(ecosystem) {
            Ok(()) => format!("{:<8} enabled", ecosystem),
            Err(e) => format!("{:<8} disabled ({})", ecosystem, e),
        })
        .collect()
}

fn cmd_classify(policy_path: &Path, urls: &[String]) -> Result<()> {
    let policy = load_policy(policy_path)?;
    let filter = &policy.repository_filter;
    for url in urls {
        println!("{:<10} {}", filter.classify(url), url);
    }
    let remotes: Vec<Option<&str>> = urls.iter().map(|u| Some(u.as_str())).collect();
    println!(
        "Injection for this checkout: {}",
        if filter.is_enabled_for_remotes(&remotes) {
            "enabled"
        } else {
            "disabled"
        }
    );
    Ok(())
}

async fn cmd_checkout(
    policy_path: &Path,
    agents_path: &Path,
    name: &str,
    build_id: String,
    workspace: PathBuf,
    remotes: Vec<String>,
) -> Result<()> {
    let policy = load_policy(policy_path)?;
    let agents = load_agents(agents_path)?;
    let agent = find_agent(&agents, name)?;

    let context = CheckoutContext {
        build_id,
        remote_urls: remotes.into_iter().map(Some).collect(),
        workspace,
    };
    let result = on_checkout(&policy, &context, agent.as_ref())
        .await
        .context("Failed to compute checkout override")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn cmd_cache(cache_dir: &Path, artifact: Option<&str>) -> Result<()> {
    let fetcher = HttpFetcher::from_env().context("Failed to build HTTP client")?;
    let cache = ArtifactCache::new(cache_dir, Arc::new(fetcher))
        .with_context(|| format!("Failed to open artifact cache {}", cache_dir.display()))?;
    for line in cache_lines(&cache, artifact)? {
        println!("{}", line);
    }
    Ok(())
}

fn cache_lines(cache: &ArtifactCache, artifact: Option<&str>) -> Result<Vec<String>> {
    let descriptors: Vec<&ArtifactDescriptor> = match artifact {
        Some(id) => {
            let descriptor = ArtifactDescriptor::lookup(id)
                .with_context(|| format!("Unknown artifact '{}'", id))?;
            vec![descriptor]
        }
        None => CATALOG.iter().collect(),
    };

    let mut lines = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        let line = match cache.read_cached_digest(descriptor)? {
            Some(digest) => {
                let version = match descriptor.embedded() {
                    Some(_) => autoinject_core::VERSION.to_string(),
                    None => cache
                        .metadata(descriptor)?
                        .map(|m| m.version)
                        .unwrap_or_default(),
                };
                format!("{:<42} {:<10} {}", descriptor.id, version, digest.to_hex())
            }
            None => format!("{:<42} not cached", descriptor.id),
        };
        lines.push(line);
    }
    Ok(lines)
}

/// Print one line per agent, returning the number of agents with failures.
fn print_reports(reports: &[AgentReport]) -> usize {
    let mut failed = 0;
    for report in reports {
        let transitions = report
            .transitions
            .iter()
            .map(|(ecosystem, transition)| format!("{}={}", ecosystem, transition))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{:<24} {}", report.agent, transitions);
        for (ecosystem, error) in &report.failures {
            println!("  ! {}: {}", ecosystem, error);
        }
        if !report.is_success() {
            failed += 1;
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoinject_core::injector::gradle::GRADLE_OPTS;
    use autoinject_core::LocalAgent;

    fn write_fixtures(dir: &Path, policy: &str) -> (PathBuf, PathBuf) {
        let policy_path = dir.join("policy.json");
        std::fs::write(&policy_path, policy).unwrap();

        let agents_path = dir.join("agents.json");
        let inventory = serde_json::json!([
            { "name": "linux-1", "root": dir.join("linux-1"), "labels": ["linux"] },
            { "name": "linux-2", "root": dir.join("linux-2") }
        ]);
        std::fs::write(&agents_path, inventory.to_string()).unwrap();
        (policy_path, agents_path)
    }

    #[test]
    fn cli_parses_checkout_with_remotes() {
        let cli = Cli::try_parse_from([
            "autoinject",
            "--policy",
            "p.json",
            "checkout",
            "linux-1",
            "--workspace",
            "/ws",
            "--remote",
            "https://a",
            "--remote",
            "https://b",
        ])
        .unwrap();
        assert_eq!(cli.policy, PathBuf::from("p.json"));
        match cli.command {
            Commands::Checkout { remotes, build_id, .. } => {
                assert_eq!(remotes, vec!["https://a", "https://b"]);
                assert_eq!(build_id, "local");
            }
            _ => panic!("expected checkout"),
        }
    }

    #[test]
    fn validation_reports_each_ecosystem() {
        let policy = Policy::from_json_str(
            r#"{ "enabled": true, "server": "https://scans.example.com",
                 "gradle": { "agent_version": "3.11" } }"#,
        )
        .unwrap();
        let lines = validation_lines(&policy);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("gradle") && lines[0].ends_with("enabled"));
        assert!(lines[1].contains("disabled"));
    }

    #[test]
    fn find_agent_reports_unknown_names() {
        let dir = tempfile::tempdir().unwrap();
        let (_, agents_path) = write_fixtures(dir.path(), "{}");
        let agents = load_agents(&agents_path).unwrap();
        assert!(find_agent(&agents, "linux-2").is_ok());
        assert!(find_agent(&agents, "missing").is_err());
    }

    #[tokio::test]
    async fn reconcile_with_disabled_policy_cleans_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let (policy_path, agents_path) = write_fixtures(dir.path(), r#"{ "enabled": false }"#);

        let seeded = LocalAgent::new("linux-1", dir.path().join("linux-1"));
        seeded
            .write_env(GRADLE_OPTS, Some("-Xmx1g"))
            .await
            .unwrap();

        cmd_reconcile(&policy_path, &agents_path, &dir.path().join("cache"), 2)
            .await
            .unwrap();

        let env = seeded.environment().await.unwrap();
        assert_eq!(env[GRADLE_OPTS], "-Xmx1g");
    }

    #[tokio::test]
    async fn cache_listing_reports_fetched_and_missing_artifacts() {
        use autoinject_core::artifact::NPM_AGENT;
        use autoinject_core::fakes::StaticFetcher;
        use autoinject_core::ArtifactRequest;

        let dir = tempfile::tempdir().unwrap();
        let cache =
            ArtifactCache::new(dir.path(), Arc::new(StaticFetcher::new(b"pkg".to_vec()))).unwrap();

        let lines = cache_lines(&cache, Some("develocity-npm-agent")).unwrap();
        assert_eq!(lines, vec![format!("{:<42} not cached", "develocity-npm-agent")]);

        let digest = cache
            .get_or_fetch(&ArtifactRequest::new(&NPM_AGENT, "1.0.1"))
            .await
            .unwrap();
        let lines = cache_lines(&cache, Some("develocity-npm-agent")).unwrap();
        assert!(lines[0].contains("1.0.1"));
        assert!(lines[0].ends_with(&digest.to_hex()));

        assert_eq!(cache_lines(&cache, None).unwrap().len(), CATALOG.len());
        assert!(cache_lines(&cache, Some("nope")).is_err());
    }

    #[test]
    fn policy_digest_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let (policy_path, _) = write_fixtures(dir.path(), "{}");
        let first = policy_digest(&policy_path).unwrap();
        std::fs::write(&policy_path, r#"{ "enabled": true }"#).unwrap();
        assert_ne!(first, policy_digest(&policy_path).unwrap());
    }
}
