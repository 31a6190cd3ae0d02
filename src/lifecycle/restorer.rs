//! Bring cached layers back into the layers directory

use super::layers::BuildpackLayersDir;
use crate::archive;
use crate::cache::Cache;
use crate::dist::OrderEntry;
use crate::error::{PackError, PackResult};
use std::path::PathBuf;
use tracing::{info, warn};

pub struct Restorer {
    pub group: Vec<OrderEntry>,
    pub layers_dir: PathBuf,
    /// Where layer tars are unpacked; their entries carry absolute paths
    pub root: PathBuf,
}

impl Restorer {
    pub fn new(group: Vec<OrderEntry>, layers_dir: impl Into<PathBuf>) -> Self {
        Self {
            group,
            layers_dir: layers_dir.into(),
            root: PathBuf::from("/"),
        }
    }

    /// Write metadata for every `cache = true` layer and unpack its contents.
    ///
    /// A layer whose tar is missing from the cache keeps its metadata only.
    pub async fn restore(&self, cache: &mut dyn Cache) -> PackResult<Vec<String>> {
        let mut log = Vec::new();
        let metadata = cache.get_metadata().await?;
        if metadata.buildpacks.is_empty() {
            let message = format!("Cache '{}' is empty, nothing to restore", cache.name());
            info!("{}", message);
            log.push(message);
            return Ok(log);
        }

        for bp in &self.group {
            let dir = BuildpackLayersDir::read(&self.layers_dir, &bp.id)?;
            let cached = metadata.for_buildpack(&bp.id);
            for (name, md) in cached.layers.iter().filter(|(_, md)| md.cache) {
                let layer = dir.layer(name);
                let message = format!("Restoring cached layer '{}'", layer.identifier());
                info!("{}", message);
                log.push(message);

                layer.write_metadata(md)?;
                if md.launch {
                    layer.write_sha(&md.sha)?;
                }

                match cache.retrieve_layer(&md.sha).await {
                    Ok(reader) => archive::extract_tar(reader, &self.root)?,
                    Err(PackError::NotFound(what)) => {
                        let message = format!(
                            "Skipping contents of '{}': {} is missing",
                            layer.identifier(),
                            what
                        );
                        warn!("{}", message);
                        log.push(message);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Owner;
    use crate::cache::VolumeCache;
    use crate::dist::{BuildpackLayersMetadata, CacheMetadata, LayerMetadata};
    use crate::layer::LayerStore;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn cache_metadata(sha: &str) -> CacheMetadata {
        let mut bp = BuildpackLayersMetadata {
            id: "bp.one".to_string(),
            version: "1.0".to_string(),
            ..Default::default()
        };
        bp.layers.insert(
            "deps".to_string(),
            LayerMetadata {
                sha: sha.to_string(),
                data: json!({"lang": "go"}),
                launch: true,
                cache: true,
                ..Default::default()
            },
        );
        CacheMetadata {
            buildpacks: vec![bp],
        }
    }

    #[tokio::test]
    async fn restores_metadata_sha_and_contents() {
        let layers = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();

        // Export a layer, then wipe it so only the cache has it
        let dir = BuildpackLayersDir::read(layers.path(), "bp.one").unwrap();
        let deps = dir.layer("deps");
        fs::create_dir_all(deps.path()).unwrap();
        fs::write(deps.path().join("lib.so"), "binary").unwrap();
        let store = LayerStore::new(artifacts.path()).unwrap();
        let layer = deps.export(&store, Owner::ROOT).unwrap();
        fs::remove_dir_all(deps.path()).unwrap();

        let mut cache = VolumeCache::new(cache_dir.path()).await.unwrap();
        cache.add_layer("bp.one:deps", &layer.diff_id, &layer.path).await.unwrap();
        cache.set_metadata(&cache_metadata(&layer.diff_id)).await.unwrap();
        cache.commit().await.unwrap();

        let mut cache = VolumeCache::new(cache_dir.path()).await.unwrap();
        let restorer = Restorer::new(vec![OrderEntry::new("bp.one", "1.0")], layers.path());
        let log = restorer.restore(&mut cache).await.unwrap();

        assert_eq!(log, vec!["Restoring cached layer 'bp.one:deps'".to_string()]);
        assert_eq!(fs::read_to_string(deps.path().join("lib.so")).unwrap(), "binary");
        let md = deps.read().unwrap();
        assert_eq!(md.sha, layer.diff_id);
        assert_eq!(md.data, json!({"lang": "go"}));
    }

    #[tokio::test]
    async fn missing_tar_keeps_metadata_only() {
        let layers = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();

        let mut cache = VolumeCache::new(cache_dir.path()).await.unwrap();
        cache.set_metadata(&cache_metadata("sha256:corrupt")).await.unwrap();
        cache.commit().await.unwrap();

        let mut cache = VolumeCache::new(cache_dir.path()).await.unwrap();
        let restorer = Restorer::new(vec![OrderEntry::new("bp.one", "1.0")], layers.path());
        let log = restorer.restore(&mut cache).await.unwrap();

        assert!(log[1].starts_with("Skipping contents of 'bp.one:deps'"));
        let deps = BuildpackLayersDir::read(layers.path(), "bp.one")
            .unwrap()
            .layer("deps");
        assert_eq!(deps.read().unwrap().sha, "sha256:corrupt");
        assert!(!deps.has_local_contents());
    }

    #[tokio::test]
    async fn empty_cache_restores_nothing() {
        let layers = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let mut cache = VolumeCache::new(cache_dir.path()).await.unwrap();
        let restorer = Restorer::new(vec![OrderEntry::new("bp.one", "1.0")], layers.path());
        let log = restorer.restore(&mut cache).await.unwrap();
        assert!(log[0].contains("nothing to restore"));
        assert!(!layers.path().join("bp.one").exists());
    }
}
