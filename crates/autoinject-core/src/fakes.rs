//! In-memory fakes for the agent and fetcher seams (testing only)
//!
//! `MemoryAgent` stands in for a remote build agent and `StaticFetcher` for
//! the artifact origin. Both can be switched into a failing mode.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use artifact_fetch::{Credentials, FetchError};
use async_trait::async_trait;

use crate::agent::{AgentDescriptor, AgentError, AgentResult};
use crate::cache::ArtifactFetcher;

// ---------------------------------------------------------------------------
// MemoryAgent
// ---------------------------------------------------------------------------

/// Agent whose environment and filesystem live in maps.
#[derive(Debug)]
pub struct MemoryAgent {
    name: String,
    labels: BTreeSet<String>,
    unix: bool,
    root: PathBuf,
    home: PathBuf,
    env: Mutex<BTreeMap<String, String>>,
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    offline: AtomicBool,
    env_writes_failing: AtomicBool,
    file_writes_failing: AtomicBool,
    file_writes: AtomicUsize,
}

impl MemoryAgent {
    /// Unix agent rooted at `/agents/<name>` with home `/home/<name>`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            root: PathBuf::from(format!("/agents/{name}")),
            home: PathBuf::from(format!("/home/{name}")),
            name,
            labels: BTreeSet::new(),
            unix: true,
            env: Mutex::new(BTreeMap::new()),
            files: Mutex::new(BTreeMap::new()),
            offline: AtomicBool::new(false),
            env_writes_failing: AtomicBool::new(false),
            file_writes_failing: AtomicBool::new(false),
            file_writes: AtomicUsize::new(0),
        }
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

    pub fn with_env(self, key: &str, value: &str) -> Self {
        self.env
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self
    }

    /// While set, `write_env` fails and leaves the environment unchanged.
    pub fn set_env_writes_failing(&self, failing: bool) {
        self.env_writes_failing.store(failing, Ordering::SeqCst);
    }

    /// While set, `write_file` fails and leaves the files unchanged.
    pub fn set_file_writes_failing(&self, failing: bool) {
        self.file_writes_failing.store(failing, Ordering::SeqCst);
    }

    /// While offline every I/O call fails with `AgentError::Unreachable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn env_snapshot(&self) -> BTreeMap<String, String> {
        self.env.lock().unwrap().clone()
    }

    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path.as_ref()).cloned()
    }

    /// Number of `write_file` calls so far.
    pub fn file_writes(&self) -> usize {
        self.file_writes.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> AgentResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(AgentError::Unreachable(self.name.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AgentDescriptor for MemoryAgent {
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
        self.check_online()?;
        Ok(self.env.lock().unwrap().get(key).cloned())
    }

    async fn write_env(&self, key: &str, value: Option<&str>) -> AgentResult<()> {
        self.check_online()?;
        if self.env_writes_failing.load(Ordering::SeqCst) {
            return Err(AgentError::Env(format!("{}: environment store is read-only", self.name)));
        }
        let mut env = self.env.lock().unwrap();
        match value {
            Some(v) => {
                env.insert(key.to_string(), v.to_string());
            }
            None => {
                env.remove(key);
            }
        }
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> AgentResult<Option<Vec<u8>>> {
        self.check_online()?;
        Ok(self.files.lock().unwrap().get(path).cloned())
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> AgentResult<()> {
        self.check_online()?;
        if self.file_writes_failing.load(Ordering::SeqCst) {
            return Err(AgentError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{}: disk full", path.display()),
            )));
        }
        self.file_writes.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &Path) -> AgentResult<()> {
        self.check_online()?;
        self.files
            .lock()
            .unwrap()
            .retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> AgentResult<()> {
        self.check_online()?;
        let mut files = self.files.lock().unwrap();
        let moved: Vec<PathBuf> = files.keys().filter(|p| p.starts_with(from)).cloned().collect();
        for path in moved {
            if let (Some(bytes), Ok(rest)) = (files.remove(&path), path.strip_prefix(from)) {
                let target = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
                files.insert(target, bytes);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StaticFetcher
// ---------------------------------------------------------------------------

/// Fetcher that serves the same canned body for every URL.
#[derive(Debug)]
pub struct StaticFetcher {
    body: Mutex<Vec<u8>>,
    failing: AtomicBool,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Mutex::new(body),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_body(&self, body: Vec<u8>) {
        *self.body.lock().unwrap() = body;
    }

    /// While failing every fetch returns HTTP 503.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactFetcher for StaticFetcher {
    async fn fetch(
        &self,
        url: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: 503,
            });
        }
        Ok(self.body.lock().unwrap().clone())
    }
}
