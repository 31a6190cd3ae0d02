//! Stitch buildpack output onto the run image
//!
//! Layer order is fixed: app, config, launcher, then each buildpack of the
//! group in group order with its layers sorted by name. A layer whose tar
//! hashes to the diffID recorded on the previous image is reused rather
//! than added.

use super::layers::{tar_prefix, BuildpackLayersDir};
use crate::archive::{self, Owner};
use crate::dist::metadata::ShaRef;
use crate::dist::{
    env, labels, BuildMetadata, BuildpackLayersMetadata, BuildpackRef, LauncherBuildMetadata,
    LayersMetadata, OrderEntry, StackMetadata,
};
use crate::error::{PackError, PackResult};
use crate::image::{Image, ImageFetcher};
use crate::layer::{Layer, LayerStore};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The image to produce
pub struct ExportTarget<'a> {
    pub fetcher: &'a dyn ImageFetcher,
    pub image: &'a str,
    pub run_image: &'a str,
    pub additional_tags: &'a [String],
    /// Export to the daemon rather than a registry
    pub daemon: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportReport {
    pub image_id: String,
    pub metadata: LayersMetadata,
    /// Identifiers of layers written with new bytes
    pub added: Vec<String>,
    /// Identifiers of layers carried over from the previous image
    pub reused: Vec<String>,
    pub log: Vec<String>,
}

pub struct Exporter {
    pub group: Vec<OrderEntry>,
    pub layers_dir: PathBuf,
    pub app_dir: PathBuf,
    /// Launcher binary, exported as a single file layer at the same path
    pub launcher: PathBuf,
    pub artifacts: LayerStore,
    pub owner: Owner,
    pub stack: StackMetadata,
    pub launcher_metadata: LauncherBuildMetadata,
}

impl Exporter {
    pub async fn export(&self, target: ExportTarget<'_>) -> PackResult<ExportReport> {
        let run_image = target
            .fetcher
            .fetch(target.run_image, target.daemon, false)
            .await?;
        let previous = target.fetcher.open(target.image, target.daemon).await?;
        let prev_md = if previous.found() {
            previous
                .label(labels::LAYERS_METADATA)
                .map(|raw| LayersMetadata::from_label(&raw))
                .transpose()?
                .unwrap_or_default()
        } else {
            LayersMetadata::default()
        };

        let mut image = target
            .fetcher
            .new_image(target.image, Some(target.run_image), target.daemon)
            .await?;
        let mut report = ExportReport::default();
        let mut metadata = LayersMetadata {
            stack: self.stack.clone(),
            ..Default::default()
        };
        metadata.run_image.top_layer = run_image.top_layer()?;
        metadata.run_image.reference = run_image.identifier()?;

        let app = self.dir_layer("app", &self.app_dir)?;
        metadata.app = ShaRef {
            sha: add_or_reuse(image.as_mut(), "app", app, &prev_md.app.sha, &mut report).await?,
        };

        let config = self.dir_layer("config", &self.layers_dir.join("config"))?;
        metadata.config = ShaRef {
            sha: add_or_reuse(image.as_mut(), "config", config, &prev_md.config.sha, &mut report)
                .await?,
        };

        let launcher = self.launcher_layer()?;
        metadata.launcher = ShaRef {
            sha: add_or_reuse(
                image.as_mut(),
                "launcher",
                launcher,
                &prev_md.launcher.sha,
                &mut report,
            )
            .await?,
        };

        for bp in &self.group {
            let bp_md = self
                .export_buildpack(image.as_mut(), bp, &prev_md, &mut report)
                .await?;
            metadata.buildpacks.push(bp_md);
        }

        image.set_label(labels::LAYERS_METADATA, &metadata.to_label()?);
        image.set_label(
            labels::BUILD_METADATA,
            &serde_json::to_string(&self.build_metadata()?)?,
        );
        image.set_env(env::LAYERS_DIR, &self.layers_dir.to_string_lossy());
        image.set_env(env::APP_DIR, &self.app_dir.to_string_lossy());
        image.set_entrypoint(&[self.launcher.to_string_lossy().into_owned()]);
        image.set_cmd(&[]);

        self.remove_buildpacks_not_in_group()?;

        report.image_id = image.save(target.additional_tags).await?;
        info!("Saved {} ({})", target.image, report.image_id);
        report.metadata = metadata;
        Ok(report)
    }

    async fn export_buildpack(
        &self,
        image: &mut dyn Image,
        bp: &OrderEntry,
        prev_md: &LayersMetadata,
        report: &mut ExportReport,
    ) -> PackResult<BuildpackLayersMetadata> {
        let dir = BuildpackLayersDir::read(&self.layers_dir, &bp.id)?;
        let prev_layers = prev_md.for_buildpack(&bp.id).layers;
        let mut bp_md = BuildpackLayersMetadata {
            id: bp.id.clone(),
            version: bp.version.clone(),
            ..Default::default()
        };

        let malformed: Vec<String> = dir
            .malformed_layers()
            .iter()
            .map(|l| l.identifier().to_string())
            .collect();
        if !malformed.is_empty() {
            return Err(PackError::ConfigInvalid(format!(
                "failed to parse metadata for layers '{}'",
                malformed.join("', '")
            )));
        }

        for layer in dir.layers() {
            let mut md = layer.read()?;
            let name = layer.name();
            if !md.launch {
                if !md.cache {
                    layer.remove()?;
                }
                continue;
            }

            if layer.has_local_contents() {
                let exported = layer.export(&self.artifacts, self.owner)?;
                let prev_sha = prev_layers.get(&name).map(|l| l.sha.as_str()).unwrap_or("");
                md.sha = add_or_reuse(image, layer.identifier(), exported, prev_sha, report).await?;
                layer.write_sha(&md.sha)?;
            } else {
                let prev = prev_layers.get(&name).ok_or_else(|| {
                    PackError::NotFound(format!(
                        "cannot reuse '{}', previous image has no metadata for it",
                        layer.identifier()
                    ))
                })?;
                image.reuse_layer(&prev.sha).await.map_err(|e| match e {
                    PackError::NotFound(what) => PackError::NotFound(format!(
                        "reusing layer '{}': {}",
                        layer.identifier(),
                        what
                    )),
                    other => other,
                })?;
                note_reuse(report, layer.identifier(), &prev.sha);
                md.sha = prev.sha.clone();
            }
            bp_md.layers.insert(name, md);
        }
        Ok(bp_md)
    }

    /// Tar a directory at its own path; a missing directory gives an empty layer
    fn dir_layer(&self, id: &str, dir: &Path) -> PackResult<Layer> {
        if dir.is_dir() {
            self.artifacts
                .create_layer(id, dir, &tar_prefix(dir), self.owner, None)
        } else {
            self.artifacts.create_layer_with(id, |_| Ok(()))
        }
    }

    fn launcher_layer(&self) -> PackResult<Layer> {
        let content = fs::read(&self.launcher)
            .map_err(|e| PackError::io(format!("reading {}", self.launcher.display()), e))?;
        let path = tar_prefix(&self.launcher);
        self.artifacts.create_layer_with("launcher", |builder| {
            archive::add_parent_dirs(builder, &path, Owner::ROOT, 0o755)?;
            archive::add_file(builder, &path, &content, Owner::ROOT, 0o755)
        })
    }

    fn build_metadata(&self) -> PackResult<BuildMetadata> {
        let bom_path = self.layers_dir.join("config").join("metadata.toml");
        let bom = match fs::read_to_string(&bom_path) {
            Ok(raw) => {
                let parsed: toml::Table = toml::from_str(&raw)?;
                match parsed.get("bom") {
                    Some(value) => serde_json::to_value(value)?,
                    None => serde_json::Value::Null,
                }
            }
            Err(_) => serde_json::Value::Null,
        };
        Ok(BuildMetadata {
            bom,
            buildpacks: self
                .group
                .iter()
                .map(|bp| BuildpackRef {
                    id: bp.id.clone(),
                    version: bp.version.clone(),
                })
                .collect(),
            launcher: self.launcher_metadata.clone(),
        })
    }

    fn remove_buildpacks_not_in_group(&self) -> PackResult<()> {
        let keep: Vec<String> = self
            .group
            .iter()
            .map(|bp| crate::dist::buildpack::escape_id(&bp.id))
            .collect();
        let entries = fs::read_dir(&self.layers_dir)
            .map_err(|e| PackError::io(format!("reading {}", self.layers_dir.display()), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() && name != "config" && !keep.contains(&name) {
                debug!("Removing {} from layers dir", path.display());
                fs::remove_dir_all(&path)
                    .map_err(|e| PackError::io(format!("removing {}", path.display()), e))?;
            }
        }
        Ok(())
    }
}

fn note_reuse(report: &mut ExportReport, identifier: &str, sha: &str) {
    let message = format!("Reusing layer '{}' with SHA {}", identifier, sha);
    info!("{}", message);
    report.log.push(message);
    report.reused.push(identifier.to_string());
}

async fn add_or_reuse(
    image: &mut dyn Image,
    identifier: &str,
    layer: Layer,
    previous_sha: &str,
    report: &mut ExportReport,
) -> PackResult<String> {
    if layer.diff_id == previous_sha {
        image.reuse_layer(&layer.diff_id).await?;
        note_reuse(report, identifier, &layer.diff_id);
    } else {
        image.add_layer_with_diff_id(&layer.path, &layer.diff_id)?;
        let message = format!("Adding layer '{}' with diffID {}", identifier, layer.diff_id);
        info!("{}", message);
        report.log.push(message);
        report.added.push(identifier.to_string());
    }
    Ok(layer.diff_id)
}
