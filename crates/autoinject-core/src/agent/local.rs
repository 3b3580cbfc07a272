use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{AgentDescriptor, AgentError, AgentResult};

/// File under the agent root that holds the node-level environment.
pub const ENV_FILE: &str = ".autoinject-env.json";

/// Agent whose filesystem is reachable from the controller.
///
/// Node-level environment variables are persisted as a JSON object in
/// `<root>/.autoinject-env.json`.
#[derive(Debug)]
pub struct LocalAgent {
    name: String,
    root: PathBuf,
    home: PathBuf,
    labels: BTreeSet<String>,
    unix: bool,
    env_lock: Mutex<()>,
}

impl LocalAgent {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            name: name.into(),
            home: root.clone(),
            root,
            labels: BTreeSet::new(),
            unix: cfg!(unix),
            env_lock: Mutex::new(()),
        }
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_unix(mut self, unix: bool) -> Self {
        self.unix = unix;
        self
    }

    fn env_path(&self) -> PathBuf {
        self.root.join(ENV_FILE)
    }

    async fn load_env(&self) -> AgentResult<BTreeMap<String, String>> {
        match tokio::fs::read(self.env_path()).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| AgentError::Env(format!("{}: {e}", self.env_path().display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Full environment snapshot.
    pub async fn environment(&self) -> AgentResult<BTreeMap<String, String>> {
        self.load_env().await
    }
}

#[async_trait]
impl AgentDescriptor for LocalAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn assigned_labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    fn is_unix(&self) -> bool {
        self.unix
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn home(&self) -> &Path {
        &self.home
    }

    async fn read_env(&self, key: &str) -> AgentResult<Option<String>> {
        Ok(self.load_env().await?.get(key).cloned())
    }

    async fn write_env(&self, key: &str, value: Option<&str>) -> AgentResult<()> {
        let _guard = self.env_lock.lock().await;
        let mut env = self.load_env().await?;
        let changed = match value {
            Some(v) => env.insert(key.to_string(), v.to_string()).as_deref() != Some(v),
            None => env.remove(key).is_some(),
        };
        if !changed {
            return Ok(());
        }

        let json = serde_json::to_vec_pretty(&env).map_err(|e| AgentError::Env(e.to_string()))?;
        tokio::fs::create_dir_all(&self.root).await?;
        let tmp = self.root.join(format!("{ENV_FILE}.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, self.env_path()).await?;
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> AgentResult<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> AgentResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> AgentResult<()> {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> AgentResult<()> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from, to).await?;
        Ok(())
    }
}

/// One agent in a fleet inventory file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub name: String,
    pub root: PathBuf,
    #[serde(default)]
    pub home: Option<PathBuf>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_unix")]
    pub unix: bool,
}

fn default_unix() -> bool {
    true
}

impl InventoryEntry {
    pub fn into_agent(self) -> LocalAgent {
        let home = self.home.unwrap_or_else(|| self.root.clone());
        LocalAgent::new(self.name, self.root)
            .with_home(home)
            .with_labels(self.labels)
            .with_unix(self.unix)
    }
}

/// Fleet inventory: a JSON array of [`InventoryEntry`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentInventory {
    pub agents: Vec<InventoryEntry>,
}

impl AgentInventory {
    pub fn from_json_str(json: &str) -> AgentResult<Self> {
        serde_json::from_str(json).map_err(|e| AgentError::Env(format!("inventory: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> AgentResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn into_agents(self) -> Vec<Arc<dyn AgentDescriptor>> {
        self.agents
            .into_iter()
            .map(|entry| Arc::new(entry.into_agent()) as Arc<dyn AgentDescriptor>)
            .collect()
    }
}
