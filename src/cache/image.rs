//! Image-backed cache
//!
//! The cache image's layers are the cached layers and its label holds the
//! metadata. Changes are staged on a fresh image of the same name; commit
//! saves it and deletes the image it replaced.

use super::Cache;
use crate::dist::labels;
use crate::dist::CacheMetadata;
use crate::error::{PackError, PackResult};
use crate::image::{Image, ImageFetcher};
use async_trait::async_trait;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

pub struct ImageCache {
    orig: Box<dyn Image>,
    staged: Box<dyn Image>,
    done: bool,
}

impl ImageCache {
    pub async fn new(fetcher: &dyn ImageFetcher, name: &str, daemon: bool) -> PackResult<Self> {
        let orig = fetcher.open(name, daemon).await?;
        let staged = fetcher.new_image(name, None, daemon).await?;
        Ok(Self {
            orig,
            staged,
            done: false,
        })
    }

    fn ensure_open(&self) -> PackResult<()> {
        if self.done {
            return Err(PackError::Internal(format!(
                "cache {} cannot be modified after commit",
                self.orig.name()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for ImageCache {
    fn name(&self) -> &str {
        self.orig.name()
    }

    async fn get_metadata(&self) -> PackResult<CacheMetadata> {
        if !self.orig.found() {
            return Ok(CacheMetadata::default());
        }
        Ok(self
            .orig
            .label(labels::CACHE_METADATA)
            .map(|raw| CacheMetadata::from_label_lenient(&raw))
            .unwrap_or_default())
    }

    async fn set_metadata(&mut self, metadata: &CacheMetadata) -> PackResult<()> {
        self.ensure_open()?;
        let raw = serde_json::to_string(metadata)?;
        self.staged.set_label(labels::CACHE_METADATA, &raw);
        Ok(())
    }

    async fn add_layer(
        &mut self,
        identifier: &str,
        diff_id: &str,
        tar_path: &Path,
    ) -> PackResult<()> {
        self.ensure_open()?;
        debug!("Caching layer {} ({})", identifier, diff_id);
        self.staged.add_layer_with_diff_id(tar_path, diff_id)
    }

    async fn reuse_layer(&mut self, identifier: &str, diff_id: &str) -> PackResult<()> {
        self.ensure_open()?;
        debug!("Reusing cached layer {} ({})", identifier, diff_id);
        self.staged.reuse_layer(diff_id).await
    }

    async fn retrieve_layer(&mut self, diff_id: &str) -> PackResult<Box<dyn Read + Send>> {
        let path = self.orig.get_layer(diff_id).await?;
        let file = std::fs::File::open(&path)
            .map_err(|e| PackError::io(format!("opening {}", path.display()), e))?;
        Ok(Box::new(file))
    }

    async fn commit(&mut self) -> PackResult<()> {
        self.ensure_open()?;
        self.done = true;

        let new_id = self.staged.save(&[]).await?;
        if self.orig.found() {
            let old_id = self.orig.identifier()?;
            if old_id != new_id {
                // The name now points at the new image; remove the old one by id
                self.orig.rename(&old_id);
                if let Err(e) = self.orig.delete().await {
                    warn!("Failed to delete previous cache image {}: {}", old_id, e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{create_single_file_tar, DEFAULT_FILE_MODE};
    use crate::dist::{BuildpackLayersMetadata, LayerMetadata};
    use crate::image::fake::FakeImageStore;
    use crate::layer::{diff_id_of_bytes, diff_id_of_file};
    use tempfile::TempDir;

    fn metadata(sha: &str) -> CacheMetadata {
        let mut bp = BuildpackLayersMetadata {
            id: "bp.one".to_string(),
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

    #[tokio::test]
    async fn add_commit_and_retrieve() {
        let store = FakeImageStore::new().unwrap();
        let work = TempDir::new().unwrap();
        let tar = work.path().join("deps.tar");
        create_single_file_tar(&tar, "layers/deps/file", b"cached", DEFAULT_FILE_MODE).unwrap();
        let diff_id = diff_id_of_file(&tar).unwrap();

        let mut cache = ImageCache::new(&store, "pack-cache-0123456789ab", true)
            .await
            .unwrap();
        assert_eq!(cache.get_metadata().await.unwrap(), CacheMetadata::default());
        cache.add_layer("bp.one:deps", &diff_id, &tar).await.unwrap();
        cache.set_metadata(&metadata(&diff_id)).await.unwrap();
        cache.commit().await.unwrap();

        let mut reopened = ImageCache::new(&store, "pack-cache-0123456789ab", true)
            .await
            .unwrap();
        assert_eq!(reopened.get_metadata().await.unwrap(), metadata(&diff_id));
        let mut bytes = Vec::new();
        reopened
            .retrieve_layer(&diff_id)
            .await
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(diff_id_of_bytes(&bytes), diff_id);
    }

    #[tokio::test]
    async fn reuse_and_replace_previous_image() {
        let store = FakeImageStore::new().unwrap();
        let diff_id = store.add_blob(b"layer").unwrap();
        store.insert(
            "cache",
            crate::image::fake::FakeImageState::default()
                .with_layers(&[diff_id.clone()])
                .with_label(labels::CACHE_METADATA, "{}"),
        );
        let old_id = store.get("cache").unwrap().id;

        let mut cache = ImageCache::new(&store, "cache", true).await.unwrap();
        cache.reuse_layer("bp.one:deps", &diff_id).await.unwrap();
        cache.set_metadata(&metadata(&diff_id)).await.unwrap();
        cache.commit().await.unwrap();

        let saved = store.get("cache").unwrap();
        assert_eq!(saved.layers, vec![diff_id.clone()]);
        assert_eq!(saved.reused_layers, vec![diff_id]);
        assert_eq!(store.deleted(), vec![old_id]);
    }
}
