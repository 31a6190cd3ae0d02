//! Write `cache = true` layers into the cache

use super::layers::BuildpackLayersDir;
use crate::archive::Owner;
use crate::cache::Cache;
use crate::dist::{BuildpackLayersMetadata, CacheMetadata, OrderEntry};
use crate::error::{PackError, PackResult};
use crate::layer::LayerStore;
use std::path::PathBuf;
use tracing::info;

pub struct Cacher {
    pub group: Vec<OrderEntry>,
    pub layers_dir: PathBuf,
    pub artifacts: LayerStore,
    pub owner: Owner,
}

impl Cacher {
    /// Add changed layers, reuse unchanged ones, then commit
    pub async fn cache(&self, cache: &mut dyn Cache) -> PackResult<Vec<String>> {
        let mut log = Vec::new();
        let previous = cache.get_metadata().await?;
        let mut metadata = CacheMetadata::default();

        for bp in &self.group {
            let dir = BuildpackLayersDir::read(&self.layers_dir, &bp.id)?;
            let prev_layers = previous.for_buildpack(&bp.id).layers;
            let mut bp_md = BuildpackLayersMetadata {
                id: bp.id.clone(),
                version: bp.version.clone(),
                ..Default::default()
            };

            for layer in dir.find_layers(|md| md.cache) {
                let mut md = layer.read()?;
                let prev = prev_layers.get(&layer.name());

                if !layer.has_local_contents() {
                    // Metadata-only layers can carry over a cached tar with the same sha
                    let Some(prev) = prev.filter(|p| !md.sha.is_empty() && p.sha == md.sha) else {
                        return Err(PackError::NotFound(format!(
                            "contents of layer '{}' to cache",
                            layer.identifier()
                        )));
                    };
                    cache.reuse_layer(layer.identifier(), &prev.sha).await?;
                    note(&mut log, format!("Reusing cache layer '{}'", layer.identifier()));
                    bp_md.layers.insert(layer.name(), md);
                    continue;
                }

                let exported = layer.export(&self.artifacts, self.owner)?;
                if prev.is_some_and(|prev| prev.sha == exported.diff_id) {
                    cache.reuse_layer(layer.identifier(), &exported.diff_id).await?;
                    note(&mut log, format!("Reusing cache layer '{}'", layer.identifier()));
                } else {
                    cache
                        .add_layer(layer.identifier(), &exported.diff_id, &exported.path)
                        .await?;
                    note(&mut log, format!("Caching layer '{}'", layer.identifier()));
                }

                md.sha = exported.diff_id;
                bp_md.layers.insert(layer.name(), md);
            }
            metadata.buildpacks.push(bp_md);
        }

        cache.set_metadata(&metadata).await?;
        cache.commit().await?;
        Ok(log)
    }
}

fn note(log: &mut Vec<String>, message: String) {
    info!("{}", message);
    log.push(message);
}
