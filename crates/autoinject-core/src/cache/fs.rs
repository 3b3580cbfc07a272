use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;
use tracing::instrument;

use super::{ArtifactDigest, ArtifactFetcher, ArtifactMetadata, CacheError, Result};
use crate::artifact::{ArtifactDescriptor, ArtifactRequest};
use crate::obs;

/// Filesystem-backed artifact cache shared by every agent of a controller.
///
/// Layout: `<root>/<cache_file_name>` plus `<root>/<id>.meta`.
pub struct ArtifactCache {
    root: PathBuf,
    fetcher: Arc<dyn ArtifactFetcher>,
    locks: Mutex<HashMap<&'static str, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArtifactCache {
    /// Create a cache rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>, fetcher: Arc<dyn ArtifactFetcher>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            fetcher,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, descriptor: &ArtifactDescriptor) -> PathBuf {
        self.root.join(descriptor.cache_file_name)
    }

    fn metadata_path(&self, descriptor: &ArtifactDescriptor) -> PathBuf {
        self.root.join(descriptor.metadata_file_name())
    }

    fn key_lock(&self, descriptor: &ArtifactDescriptor) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(descriptor.id).or_default())
    }

    /// Metadata record for `descriptor`, if present and well-formed.
    pub fn metadata(&self, descriptor: &ArtifactDescriptor) -> Result<Option<ArtifactMetadata>> {
        match fs::read_to_string(self.metadata_path(descriptor)) {
            Ok(text) => Ok(ArtifactMetadata::parse(&text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Digest of the cached artifact for `request.version`, downloading it
    /// first when the metadata is missing or records another version.
    #[instrument(skip_all, fields(artifact = %request.descriptor, version = %request.version))]
    pub async fn get_or_fetch(&self, request: &ArtifactRequest) -> Result<ArtifactDigest> {
        let descriptor = request.descriptor;
        if let Some(bytes) = descriptor.embedded() {
            return Ok(ArtifactDigest::compute(bytes));
        }

        if let Some(digest) = self.current_digest(descriptor, &request.version)? {
            return Ok(digest);
        }

        let lock = self.key_lock(descriptor);
        let _guard = lock.lock().await;

        // Another task may have finished the download while we waited.
        if let Some(digest) = self.current_digest(descriptor, &request.version)? {
            return Ok(digest);
        }

        let url = request
            .url()
            .ok_or_else(|| CacheError::NotCached(descriptor.id.to_string()))?;
        let bytes = self.fetcher.fetch(&url, request.credentials()).await?;
        let digest = ArtifactDigest::compute(&bytes);

        self.store(descriptor, &bytes, &ArtifactMetadata::new(&request.version, digest))?;
        obs::emit_artifact_fetched(descriptor.id, &request.version, &digest, bytes.len());
        Ok(digest)
    }

    fn current_digest(
        &self,
        descriptor: &ArtifactDescriptor,
        version: &str,
    ) -> Result<Option<ArtifactDigest>> {
        match self.metadata(descriptor)? {
            Some(meta) if meta.is_for_version(version) => {
                obs::emit_cache_hit(descriptor.id, version);
                Ok(Some(meta.digest))
            }
            _ => Ok(None),
        }
    }

    /// Write artifact and metadata so that a reader never sees metadata that
    /// describes bytes other than the ones on disk.
    fn store(
        &self,
        descriptor: &ArtifactDescriptor,
        bytes: &[u8],
        metadata: &ArtifactMetadata,
    ) -> Result<()> {
        let mut artifact_tmp = NamedTempFile::new_in(&self.root)?;
        artifact_tmp.write_all(bytes)?;
        artifact_tmp.as_file().sync_all()?;

        let mut metadata_tmp = NamedTempFile::new_in(&self.root)?;
        metadata_tmp.write_all(metadata.render().as_bytes())?;

        match fs::remove_file(self.metadata_path(descriptor)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        artifact_tmp
            .persist(self.artifact_path(descriptor))
            .map_err(|e| e.error)?;
        metadata_tmp
            .persist(self.metadata_path(descriptor))
            .map_err(|e| e.error)?;
        Ok(())
    }

    /// Metadata-only lookup of whatever version is cached. Never downloads.
    pub fn read_cached_digest(
        &self,
        descriptor: &ArtifactDescriptor,
    ) -> Result<Option<ArtifactDigest>> {
        if let Some(bytes) = descriptor.embedded() {
            return Ok(Some(ArtifactDigest::compute(bytes)));
        }
        Ok(self.metadata(descriptor)?.map(|m| m.digest))
    }

    /// Cached bytes, verified against `expected`.
    pub fn read_artifact(
        &self,
        descriptor: &ArtifactDescriptor,
        expected: &ArtifactDigest,
    ) -> Result<Vec<u8>> {
        let bytes = match descriptor.embedded() {
            Some(bytes) => bytes.to_vec(),
            None => fs::read(self.artifact_path(descriptor)).map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    CacheError::NotCached(descriptor.id.to_string())
                } else {
                    CacheError::Io(e)
                }
            })?,
        };

        let actual = ArtifactDigest::compute(&bytes);
        if &actual != expected {
            return Err(CacheError::DigestMismatch {
                artifact: descriptor.id.to_string(),
                expected: *expected,
                actual,
            });
        }
        Ok(bytes)
    }
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{
        ArtifactRequest, DEVELOCITY_MAVEN_EXTENSION, GRADLE_INIT_SCRIPT_ARTIFACT, NPM_AGENT,
    };
    use crate::fakes::StaticFetcher;

    fn make_cache(fetcher: Arc<StaticFetcher>) -> (tempfile::TempDir, ArtifactCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path(), fetcher).unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn second_call_with_same_version_does_not_fetch() {
        let fetcher = Arc::new(StaticFetcher::new(b"ext-1.2".to_vec()));
        let (_dir, cache) = make_cache(fetcher.clone());
        let request = ArtifactRequest::new(&DEVELOCITY_MAVEN_EXTENSION, "1.2");

        let first = cache.get_or_fetch(&request).await.unwrap();
        let second = cache.get_or_fetch(&request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn version_change_refetches_once() {
        let fetcher = Arc::new(StaticFetcher::new(b"ext-1.2".to_vec()));
        let (_dir, cache) = make_cache(fetcher.clone());

        let old = cache
            .get_or_fetch(&ArtifactRequest::new(&DEVELOCITY_MAVEN_EXTENSION, "1.2"))
            .await
            .unwrap();

        fetcher.set_body(b"ext-1.3".to_vec());
        let request = ArtifactRequest::new(&DEVELOCITY_MAVEN_EXTENSION, "1.3");
        let new = cache.get_or_fetch(&request).await.unwrap();
        cache.get_or_fetch(&request).await.unwrap();

        assert_ne!(old, new);
        assert_eq!(fetcher.calls(), 2);
        let meta = cache.metadata(&DEVELOCITY_MAVEN_EXTENSION).unwrap().unwrap();
        assert_eq!(meta, ArtifactMetadata::new("1.3", new));
        assert_eq!(
            cache.read_artifact(&DEVELOCITY_MAVEN_EXTENSION, &new).unwrap(),
            b"ext-1.3"
        );
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cache_untouched() {
        let fetcher = Arc::new(StaticFetcher::new(b"agent".to_vec()));
        let (dir, cache) = make_cache(fetcher.clone());
        let cached = cache
            .get_or_fetch(&ArtifactRequest::new(&NPM_AGENT, "1.0.0"))
            .await
            .unwrap();

        fetcher.set_failing(true);
        let err = cache
            .get_or_fetch(&ArtifactRequest::new(&NPM_AGENT, "1.1.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Fetch(_)));

        let meta = cache.metadata(&NPM_AGENT).unwrap().unwrap();
        assert_eq!(meta.version, "1.0.0");
        assert_eq!(cache.read_cached_digest(&NPM_AGENT).unwrap(), Some(cached));

        // Only the artifact and its metadata, no stray temp files.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn malformed_metadata_forces_refetch() {
        let fetcher = Arc::new(StaticFetcher::new(b"bytes".to_vec()));
        let (dir, cache) = make_cache(fetcher.clone());
        fs::write(
            dir.path().join(DEVELOCITY_MAVEN_EXTENSION.metadata_file_name()),
            "garbage",
        )
        .unwrap();

        cache
            .get_or_fetch(&ArtifactRequest::new(&DEVELOCITY_MAVEN_EXTENSION, "1.2"))
            .await
            .unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_fetch_once() {
        let fetcher = Arc::new(StaticFetcher::new(b"shared".to_vec()));
        let (_dir, cache) = make_cache(fetcher.clone());
        let cache = Arc::new(cache);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&ArtifactRequest::new(&DEVELOCITY_MAVEN_EXTENSION, "1.2"))
                    .await
                    .unwrap()
            }));
        }
        let digests: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(digests.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn read_cached_digest_without_metadata_is_none() {
        let (_dir, cache) = make_cache(Arc::new(StaticFetcher::new(vec![1])));
        assert_eq!(cache.read_cached_digest(&NPM_AGENT).unwrap(), None);
    }

    #[tokio::test]
    async fn embedded_artifacts_are_never_fetched() {
        let fetcher = Arc::new(StaticFetcher::new(vec![1]));
        let (_dir, cache) = make_cache(fetcher.clone());
        let request = ArtifactRequest::new(&GRADLE_INIT_SCRIPT_ARTIFACT, "any");

        let digest = cache.get_or_fetch(&request).await.unwrap();
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(
            cache.read_cached_digest(&GRADLE_INIT_SCRIPT_ARTIFACT).unwrap(),
            Some(digest)
        );
        assert!(cache
            .read_artifact(&GRADLE_INIT_SCRIPT_ARTIFACT, &digest)
            .is_ok());
    }

    #[tokio::test]
    async fn tampered_artifact_is_detected() {
        let fetcher = Arc::new(StaticFetcher::new(b"original".to_vec()));
        let (dir, cache) = make_cache(fetcher);
        let digest = cache
            .get_or_fetch(&ArtifactRequest::new(&DEVELOCITY_MAVEN_EXTENSION, "1.2"))
            .await
            .unwrap();

        fs::write(
            dir.path().join(DEVELOCITY_MAVEN_EXTENSION.cache_file_name),
            b"tampered",
        )
        .unwrap();
        assert!(matches!(
            cache.read_artifact(&DEVELOCITY_MAVEN_EXTENSION, &digest),
            Err(CacheError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn missing_artifact_is_not_cached() {
        let (_dir, cache) = make_cache(Arc::new(StaticFetcher::new(vec![1])));
        let digest = ArtifactDigest::compute(b"x");
        assert!(matches!(
            cache.read_artifact(&NPM_AGENT, &digest),
            Err(CacheError::NotCached(_))
        ));
    }
}
