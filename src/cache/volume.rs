//! Directory-backed cache
//!
//! Layout under the cache root:
//!
//! ```text
//! committed/          layers and metadata of the last commit
//! staging/            state being assembled for the next commit
//! committed-backup/   previous `committed/` while a commit is in flight
//! ```
//!
//! Committing renames `committed` to `committed-backup` and `staging` to
//! `committed`. If the second rename fails the backup is renamed back, so a
//! reader never sees a half-written `committed/`.

use super::Cache;
use crate::dist::labels;
use crate::dist::CacheMetadata;
use crate::error::{PackError, PackResult};
use async_trait::async_trait;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const COMMITTED: &str = "committed";
const STAGING: &str = "staging";
const BACKUP: &str = "committed-backup";

#[derive(Debug)]
pub struct VolumeCache {
    name: String,
    committed: PathBuf,
    staging: PathBuf,
    backup: PathBuf,
    done: bool,
}

fn io_err(context: &str, path: &Path) -> impl FnOnce(std::io::Error) -> PackError {
    let context = format!("{} {}", context, path.display());
    move |e| PackError::io(context, e)
}

async fn remove_dir_if_exists(path: &Path) -> PackResult<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PackError::io(format!("removing {}", path.display()), e)),
    }
}

impl VolumeCache {
    /// Open the cache rooted at `dir`, discarding any leftover staging state
    pub async fn new(dir: &Path) -> PackResult<Self> {
        let cache = Self {
            name: dir.display().to_string(),
            committed: dir.join(COMMITTED),
            staging: dir.join(STAGING),
            backup: dir.join(BACKUP),
            done: false,
        };

        remove_dir_if_exists(&cache.staging).await?;
        fs::create_dir_all(&cache.staging)
            .await
            .map_err(io_err("creating", &cache.staging))?;
        fs::create_dir_all(&cache.committed)
            .await
            .map_err(io_err("creating", &cache.committed))?;
        Ok(cache)
    }

    fn layer_file(dir: &Path, diff_id: &str) -> PathBuf {
        dir.join(format!("{}.tar", diff_id))
    }

    fn metadata_file(dir: &Path) -> PathBuf {
        dir.join(labels::CACHE_METADATA)
    }

    fn ensure_open(&self) -> PackResult<()> {
        if self.done {
            return Err(PackError::Internal(format!(
                "cache {} cannot be modified after commit",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for VolumeCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_metadata(&self) -> PackResult<CacheMetadata> {
        let path = Self::metadata_file(&self.committed);
        match fs::read_to_string(&path).await {
            Ok(raw) => Ok(CacheMetadata::from_label_lenient(&raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CacheMetadata::default()),
            Err(e) => Err(PackError::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn set_metadata(&mut self, metadata: &CacheMetadata) -> PackResult<()> {
        self.ensure_open()?;
        let path = Self::metadata_file(&self.staging);
        let raw = serde_json::to_vec(metadata)?;
        fs::write(&path, raw).await.map_err(io_err("writing", &path))
    }

    async fn add_layer(
        &mut self,
        identifier: &str,
        diff_id: &str,
        tar_path: &Path,
    ) -> PackResult<()> {
        self.ensure_open()?;
        let dest = Self::layer_file(&self.staging, diff_id);
        debug!("Caching layer {} ({})", identifier, diff_id);
        fs::copy(tar_path, &dest)
            .await
            .map_err(io_err("caching layer into", &dest))?;
        Ok(())
    }

    async fn reuse_layer(&mut self, identifier: &str, diff_id: &str) -> PackResult<()> {
        self.ensure_open()?;
        let src = Self::layer_file(&self.committed, diff_id);
        let dest = Self::layer_file(&self.staging, diff_id);
        debug!("Reusing cached layer {} ({})", identifier, diff_id);
        match fs::hard_link(&src, &dest).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(PackError::NotFound(format!(
                "cached layer {} ({})",
                identifier, diff_id
            ))),
            Err(e) => Err(PackError::io(format!("linking {}", src.display()), e)),
        }
    }

    async fn retrieve_layer(&mut self, diff_id: &str) -> PackResult<Box<dyn Read + Send>> {
        let path = Self::layer_file(&self.committed, diff_id);
        match std::fs::File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PackError::NotFound(format!("cached layer {}", diff_id)))
            }
            Err(e) => Err(PackError::io(format!("opening {}", path.display()), e)),
        }
    }

    async fn commit(&mut self) -> PackResult<()> {
        self.ensure_open()?;
        self.done = true;

        remove_dir_if_exists(&self.backup).await?;
        fs::rename(&self.committed, &self.backup)
            .await
            .map_err(io_err("backing up", &self.committed))?;

        if let Err(e) = fs::rename(&self.staging, &self.committed).await {
            if let Err(rollback) = fs::rename(&self.backup, &self.committed).await {
                warn!("Failed to restore {}: {}", self.committed.display(), rollback);
            }
            return Err(PackError::io(
                format!("committing {}", self.staging.display()),
                e,
            ));
        }

        remove_dir_if_exists(&self.backup).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{single_file_tar, DEFAULT_FILE_MODE};
    use crate::dist::{BuildpackLayersMetadata, LayerMetadata};
    use crate::layer::{diff_id_of_bytes, diff_id_of_file};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn metadata(sha: &str) -> CacheMetadata {
        let mut bp = BuildpackLayersMetadata {
            id: "bp.one".to_string(),
            version: "1.0".to_string(),
            ..Default::default()
        };
        bp.layers.insert(
            "deps".to_string(),
            LayerMetadata {
                sha: sha.to_string(),
                cache: true,
                ..Default::default()
            },
        );
        CacheMetadata {
            buildpacks: vec![bp],
        }
    }

    fn layer_tar(dir: &Path, content: &[u8]) -> (PathBuf, String) {
        let bytes = single_file_tar(Vec::new(), "layers/file", content, DEFAULT_FILE_MODE).unwrap();
        let path = dir.join(format!("{}.tar", diff_id_of_bytes(content).replace(':', "_")));
        std::fs::write(&path, &bytes).unwrap();
        let diff_id = diff_id_of_file(&path).unwrap();
        (path, diff_id)
    }

    fn read_all(mut reader: Box<dyn Read + Send>) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        buf
    }

    #[tokio::test]
    async fn empty_cache_has_empty_metadata() {
        let dir = TempDir::new().unwrap();
        let cache = VolumeCache::new(dir.path()).await.unwrap();
        assert_eq!(cache.get_metadata().await.unwrap(), CacheMetadata::default());
        assert!(dir.path().join("committed").is_dir());
        assert!(dir.path().join("staging").is_dir());
    }

    #[tokio::test]
    async fn corrupt_metadata_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("committed")).unwrap();
        std::fs::write(
            dir.path().join("committed").join(labels::CACHE_METADATA),
            "{not json",
        )
        .unwrap();
        let cache = VolumeCache::new(dir.path()).await.unwrap();
        assert_eq!(cache.get_metadata().await.unwrap(), CacheMetadata::default());
    }

    #[tokio::test]
    async fn commit_publishes_staged_state() {
        let dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let (tar, diff_id) = layer_tar(work.path(), b"deps");

        let mut cache = VolumeCache::new(dir.path()).await.unwrap();
        cache.add_layer("bp.one:deps", &diff_id, &tar).await.unwrap();
        cache.set_metadata(&metadata(&diff_id)).await.unwrap();
        cache.commit().await.unwrap();

        assert_eq!(cache.get_metadata().await.unwrap(), metadata(&diff_id));
        let bytes = read_all(cache.retrieve_layer(&diff_id).await.unwrap());
        assert_eq!(diff_id_of_bytes(&bytes), diff_id);
        assert!(!dir.path().join("committed-backup").exists());
    }

    #[tokio::test]
    async fn reuse_links_committed_layer() {
        let dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let (tar, diff_id) = layer_tar(work.path(), b"deps");

        let mut first = VolumeCache::new(dir.path()).await.unwrap();
        first.add_layer("bp.one:deps", &diff_id, &tar).await.unwrap();
        first.set_metadata(&metadata(&diff_id)).await.unwrap();
        first.commit().await.unwrap();

        let mut second = VolumeCache::new(dir.path()).await.unwrap();
        second.reuse_layer("bp.one:deps", &diff_id).await.unwrap();
        second.set_metadata(&metadata(&diff_id)).await.unwrap();
        second.commit().await.unwrap();

        let bytes = read_all(second.retrieve_layer(&diff_id).await.unwrap());
        assert_eq!(diff_id_of_bytes(&bytes), diff_id);
    }

    #[tokio::test]
    async fn layers_not_carried_forward_are_dropped() {
        let dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let (tar, diff_id) = layer_tar(work.path(), b"old");

        let mut first = VolumeCache::new(dir.path()).await.unwrap();
        first.add_layer("bp.one:deps", &diff_id, &tar).await.unwrap();
        first.commit().await.unwrap();

        let mut second = VolumeCache::new(dir.path()).await.unwrap();
        second.commit().await.unwrap();
        assert!(matches!(
            second.retrieve_layer(&diff_id).await,
            Err(PackError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reuse_of_unknown_layer_fails() {
        let dir = TempDir::new().unwrap();
        let mut cache = VolumeCache::new(dir.path()).await.unwrap();
        assert!(matches!(
            cache.reuse_layer("bp.one:deps", "sha256:missing").await,
            Err(PackError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn no_changes_after_commit() {
        let dir = TempDir::new().unwrap();
        let mut cache = VolumeCache::new(dir.path()).await.unwrap();
        cache.commit().await.unwrap();
        assert!(cache.set_metadata(&CacheMetadata::default()).await.is_err());
        assert!(cache.commit().await.is_err());
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn uncommitted_changes_leave_committed_untouched(
            first in proptest::collection::vec(any::<u8>(), 0..512),
            second in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            runtime().block_on(async {
                let dir = TempDir::new().unwrap();
                let work = TempDir::new().unwrap();
                let (tar_a, id_a) = layer_tar(work.path(), &first);

                let mut cache = VolumeCache::new(dir.path()).await.unwrap();
                cache.add_layer("a", &id_a, &tar_a).await.unwrap();
                cache.set_metadata(&metadata(&id_a)).await.unwrap();
                cache.commit().await.unwrap();

                // Staged but never committed, as if the process died
                let (tar_b, id_b) = layer_tar(work.path(), &second);
                let mut crashed = VolumeCache::new(dir.path()).await.unwrap();
                crashed.add_layer("b", &id_b, &tar_b).await.unwrap();
                crashed.set_metadata(&metadata(&id_b)).await.unwrap();
                drop(crashed);

                let mut reopened = VolumeCache::new(dir.path()).await.unwrap();
                assert_eq!(reopened.get_metadata().await.unwrap(), metadata(&id_a));
                let bytes = read_all(reopened.retrieve_layer(&id_a).await.unwrap());
                assert_eq!(diff_id_of_bytes(&bytes), id_a);
            });
        }

        #[test]
        fn retrieved_layers_hash_to_their_diff_id(
            content in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            runtime().block_on(async {
                let dir = TempDir::new().unwrap();
                let work = TempDir::new().unwrap();
                let (tar, diff_id) = layer_tar(work.path(), &content);

                let mut cache = VolumeCache::new(dir.path()).await.unwrap();
                cache.add_layer("layer", &diff_id, &tar).await.unwrap();
                cache.commit().await.unwrap();

                let bytes = read_all(cache.retrieve_layer(&diff_id).await.unwrap());
                assert_eq!(diff_id_of_bytes(&bytes), diff_id);
            });
        }
    }
}
