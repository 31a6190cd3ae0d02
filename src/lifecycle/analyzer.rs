//! Validate restored layers against the previous app image

use super::layers::{BuildpackLayersDir, CacheType};
use crate::dist::buildpack::escape_id;
use crate::dist::{labels, LayerMetadata, LayersMetadata, OrderEntry};
use crate::error::{PackError, PackResult};
use crate::image::Image;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

pub struct Analyzer {
    pub group: Vec<OrderEntry>,
    pub layers_dir: PathBuf,
    pub app_dir: PathBuf,
}

impl Analyzer {
    /// Reconcile `layers_dir` with the metadata of `previous`.
    ///
    /// Returns the messages logged along the way.
    pub fn analyze(&self, previous: &dyn Image) -> PackResult<Vec<String>> {
        let mut log = Vec::new();
        let metadata = if previous.found() {
            previous_metadata(previous, &mut log)
        } else {
            note(
                &mut log,
                format!(
                    "Image '{}' not found or requires authentication to access",
                    previous.name()
                ),
            );
            LayersMetadata::default()
        };

        self.remove_buildpacks_not_in_group(&mut log)?;

        for bp in &self.group {
            let dir = BuildpackLayersDir::read(&self.layers_dir, &bp.id)?;
            let mut remaining: BTreeMap<String, LayerMetadata> =
                metadata.for_buildpack(&bp.id).layers;

            for layer in dir.layers() {
                let id = layer.identifier();
                match layer.classify(&remaining) {
                    CacheType::StaleNoMetadata => {
                        note(
                            &mut log,
                            format!("Removing stale cached launch layer '{}', not in metadata", id),
                        );
                        layer.remove()?;
                    }
                    CacheType::StaleWrongSha => {
                        note(&mut log, format!("Removing stale cached launch layer '{}'", id));
                        layer.remove()?;
                    }
                    CacheType::Malformed => {
                        note(&mut log, format!("Removing malformed cached layer '{}'", id));
                        layer.remove()?;
                    }
                    CacheType::NotForLaunch => {
                        note(&mut log, format!("Using cached layer '{}'", id));
                    }
                    CacheType::Valid => {
                        note(&mut log, format!("Using cached launch layer '{}'", id));
                        if let Some(md) = remaining.remove(&layer.name()) {
                            layer.write_metadata(&md)?;
                        }
                    }
                }
            }

            for (name, md) in &remaining {
                if md.build {
                    continue;
                }
                let layer = dir.layer(name);
                note(
                    &mut log,
                    format!("Writing metadata for uncached layer '{}'", layer.identifier()),
                );
                layer.write_metadata(md)?;
                layer.write_sha(&md.sha)?;
            }
        }
        Ok(log)
    }

    fn remove_buildpacks_not_in_group(&self, log: &mut Vec<String>) -> PackResult<()> {
        let in_group: BTreeSet<String> = self.group.iter().map(|bp| escape_id(&bp.id)).collect();
        let app_dir = fs::canonicalize(&self.app_dir).ok();

        let entries = match fs::read_dir(&self.layers_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(PackError::io(
                    format!("reading {}", self.layers_dir.display()),
                    e,
                ))
            }
        };
        for entry in entries {
            let entry = entry
                .map_err(|e| PackError::io(format!("reading {}", self.layers_dir.display()), e))?;
            let path = entry.path();
            if !path.is_dir() || fs::canonicalize(&path).ok() == app_dir {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if in_group.contains(&name) {
                continue;
            }
            note(
                log,
                format!(
                    "Removing cached layers for buildpack '{}' not in group",
                    name.replace('_', "/")
                ),
            );
            fs::remove_dir_all(&path)
                .map_err(|e| PackError::io(format!("removing {}", path.display()), e))?;
        }
        Ok(())
    }
}

fn note(log: &mut Vec<String>, message: String) {
    info!("{}", message);
    log.push(message);
}

fn previous_metadata(image: &dyn Image, log: &mut Vec<String>) -> LayersMetadata {
    let Some(raw) = image.label(labels::LAYERS_METADATA).filter(|l| !l.is_empty()) else {
        let message = format!(
            "Previous image '{}' does not have '{}' label",
            image.name(),
            labels::LAYERS_METADATA
        );
        warn!("{}", message);
        log.push(message);
        return LayersMetadata::default();
    };
    match LayersMetadata::from_label(&raw) {
        Ok(md) => md,
        Err(_) => {
            let message = format!(
                "Previous image '{}' has incompatible '{}' label",
                image.name(),
                labels::LAYERS_METADATA
            );
            warn!("{}", message);
            log.push(message);
            LayersMetadata::default()
        }
    }
}
