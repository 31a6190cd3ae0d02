//! Daemon-backed images
//!
//! Reads go through `inspect`; previous layers are extracted lazily from a
//! `save` archive; writes stream a docker-archive into `load`. Layers that
//! already exist in the daemon as the bottom of the same chain are sent as
//! empty placeholders, which `load` skips.

use super::{layer_index, layers_above, Image, ImageFetcher};
use crate::archive::{self, Owner, NORMALIZED_MTIME};
use crate::error::{PackError, PackResult};
use crate::layer::digest_hex;
use crate::runtime::{ContainerRuntime, ImageInspect};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::debug;

/// Where the bytes of a layer come from
#[derive(Debug, Clone, PartialEq, Eq)]
enum LayerSource {
    File(PathBuf),
    /// A layer of an image already in the daemon
    Daemon(String),
}

#[derive(Debug, Clone)]
struct LocalLayer {
    diff_id: String,
    source: LayerSource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunConfig {
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    working_dir: String,
    #[serde(default)]
    user: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RootFs {
    #[serde(rename = "type")]
    kind: String,
    diff_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageConfigFile {
    architecture: String,
    os: String,
    created: String,
    config: RunConfig,
    rootfs: RootFs,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

/// Append `:latest` when a reference carries neither tag nor digest
fn with_default_tag(name: &str) -> String {
    let last = name.rsplit('/').next().unwrap_or(name);
    if last.contains(':') || last.contains('@') {
        name.to_string()
    } else {
        format!("{}:latest", name)
    }
}

fn created_timestamp() -> String {
    DateTime::from_timestamp(NORMALIZED_MTIME as i64, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Image handle backed by the engine's image store
pub struct LocalImage {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    found: bool,
    id: Option<String>,
    digest: Option<String>,
    os: String,
    architecture: String,
    config: RunConfig,
    layers: Vec<LocalLayer>,
    /// Bottom layers that exist in the daemon as one chain
    base_count: usize,
    /// Image previously stored under `name`, with its layers
    prev: Option<(String, Vec<String>)>,
    publish: bool,
    scratch: TempDir,
    extracted: BTreeMap<String, BTreeMap<String, PathBuf>>,
}

impl LocalImage {
    fn empty(runtime: Arc<dyn ContainerRuntime>, name: &str, publish: bool) -> PackResult<Self> {
        let scratch = TempDir::new().map_err(|e| PackError::io("creating image scratch dir", e))?;
        Ok(Self {
            runtime,
            name: name.to_string(),
            found: false,
            id: None,
            digest: None,
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            config: RunConfig::default(),
            layers: Vec::new(),
            base_count: 0,
            prev: None,
            publish,
            scratch,
            extracted: BTreeMap::new(),
        })
    }

    /// Take config and layers from an inspected image
    fn adopt(&mut self, inspect: &ImageInspect) {
        let source = LayerSource::Daemon(inspect.id.clone());
        self.layers = inspect
            .diff_ids()
            .iter()
            .map(|d| LocalLayer {
                diff_id: d.clone(),
                source: source.clone(),
            })
            .collect();
        self.base_count = self.layers.len();
        if !inspect.os.is_empty() {
            self.os = inspect.os.clone();
        }
        if !inspect.architecture.is_empty() {
            self.architecture = inspect.architecture.clone();
        }
        let c = &inspect.config;
        self.config = RunConfig {
            env: c.env.clone().unwrap_or_default(),
            labels: c.labels.clone().unwrap_or_default(),
            entrypoint: c.entrypoint.clone(),
            cmd: c.cmd.clone(),
            working_dir: c.working_dir.clone(),
            user: c.user.clone(),
        };
    }

    /// Open an inspected image for editing in place
    pub fn from_inspect(
        runtime: Arc<dyn ContainerRuntime>,
        name: &str,
        inspect: Option<ImageInspect>,
        publish: bool,
    ) -> PackResult<Self> {
        let mut image = Self::empty(runtime, name, publish)?;
        if let Some(inspect) = inspect {
            image.adopt(&inspect);
            image.found = true;
            image.id = Some(inspect.id.clone());
            image.digest = inspect.digest().map(str::to_string);
            image.prev = Some((inspect.id.clone(), inspect.diff_ids().to_vec()));
        }
        Ok(image)
    }

    /// Start a new image on top of `base`, remembering any image already
    /// stored under `name` for layer reuse
    pub fn from_base(
        runtime: Arc<dyn ContainerRuntime>,
        name: &str,
        base: Option<&ImageInspect>,
        prev: Option<&ImageInspect>,
        publish: bool,
    ) -> PackResult<Self> {
        let mut image = Self::empty(runtime, name, publish)?;
        if let Some(base) = base {
            image.adopt(base);
        }
        image.prev = prev.map(|p| (p.id.clone(), p.diff_ids().to_vec()));
        Ok(image)
    }

    fn layer_position(&self, diff_id: &str) -> Option<usize> {
        let ids: Vec<String> = self.layers.iter().map(|l| l.diff_id.clone()).collect();
        layer_index(&ids, diff_id)
    }

    /// Path of the tar for a layer, extracting its source image if needed
    async fn materialize(&mut self, layer: &LocalLayer) -> PackResult<PathBuf> {
        let image = match &layer.source {
            LayerSource::File(path) => return Ok(path.clone()),
            LayerSource::Daemon(image) => image.clone(),
        };
        if !self.extracted.contains_key(&image) {
            let layers = self.extract(&image).await?;
            self.extracted.insert(image.clone(), layers);
        }
        self.extracted
            .get(&image)
            .and_then(|layers| layers.get(&layer.diff_id))
            .cloned()
            .ok_or_else(|| {
                PackError::NotFound(format!("layer {} in image {}", layer.diff_id, image))
            })
    }

    async fn extract(&self, image: &str) -> PackResult<BTreeMap<String, PathBuf>> {
        debug!("Extracting layers of {}", image);
        let dir = self.scratch.path().join(format!("saved-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir)
            .map_err(|e| PackError::io(format!("creating {}", dir.display()), e))?;
        let archive_path = dir.join("image.tar");
        self.runtime.save_image(image, &archive_path).await?;

        let contents = dir.join("contents");
        let file = File::open(&archive_path)
            .map_err(|e| PackError::io(format!("opening {}", archive_path.display()), e))?;
        archive::extract_tar(file, &contents)?;
        read_saved_layers(&contents)
    }

    fn write_archive(&self, path: &Path, names: &[String], layer_paths: &[Option<PathBuf>]) -> PackResult<String> {
        let config = ImageConfigFile {
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            created: created_timestamp(),
            config: self.config.clone(),
            rootfs: RootFs {
                kind: "layers".to_string(),
                diff_ids: self.layers.iter().map(|l| l.diff_id.clone()).collect(),
            },
        };
        let config_bytes = serde_json::to_vec(&config)?;
        let config_hex = hex::encode(Sha256::digest(&config_bytes));
        let config_name = format!("{}.json", config_hex);

        let file = File::create(path)
            .map_err(|e| PackError::io(format!("creating {}", path.display()), e))?;
        let mut builder = tar::Builder::new(BufWriter::new(file));
        archive::add_file(&mut builder, &config_name, &config_bytes, Owner::ROOT, 0o644)?;

        let mut written = BTreeSet::new();
        let mut layer_names = Vec::new();
        for (layer, source) in self.layers.iter().zip(layer_paths) {
            let entry = format!("{}/layer.tar", digest_hex(&layer.diff_id));
            layer_names.push(entry.clone());
            if !written.insert(entry.clone()) {
                continue;
            }
            match source {
                Some(src) => {
                    let content = fs::read(src)
                        .map_err(|e| PackError::io(format!("reading layer {}", src.display()), e))?;
                    archive::add_file(&mut builder, &entry, &content, Owner::ROOT, 0o644)?;
                }
                None => archive::add_file(&mut builder, &entry, &[], Owner::ROOT, 0o644)?,
            }
        }

        let manifest = vec![ManifestEntry {
            config: config_name,
            repo_tags: Some(names.iter().map(|n| with_default_tag(n)).collect()),
            layers: layer_names,
        }];
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        archive::add_file(&mut builder, "manifest.json", &manifest_bytes, Owner::ROOT, 0o644)?;
        builder
            .into_inner()
            .and_then(|mut w| w.flush())
            .map_err(|e| PackError::io(format!("finishing {}", path.display()), e))?;

        Ok(format!("sha256:{}", config_hex))
    }
}

/// Map diffIDs to layer tars inside an extracted `save` archive
fn read_saved_layers(contents: &Path) -> PackResult<BTreeMap<String, PathBuf>> {
    let manifest_path = contents.join("manifest.json");
    let raw = fs::read(&manifest_path)
        .map_err(|e| PackError::io(format!("reading {}", manifest_path.display()), e))?;
    let manifest: Vec<ManifestEntry> = serde_json::from_slice(&raw)?;
    let entry = manifest
        .into_iter()
        .next()
        .ok_or_else(|| PackError::Internal("saved image archive has an empty manifest".into()))?;

    let config_path = contents.join(&entry.config);
    let raw = fs::read(&config_path)
        .map_err(|e| PackError::io(format!("reading {}", config_path.display()), e))?;
    let config: serde_json::Value = serde_json::from_slice(&raw)?;
    let diff_ids: Vec<String> = config["rootfs"]["diff_ids"]
        .as_array()
        .map(|ids| ids.iter().filter_map(|d| d.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    Ok(diff_ids
        .into_iter()
        .zip(entry.layers)
        .map(|(diff_id, layer)| (diff_id, contents.join(layer)))
        .collect())
}

#[async_trait]
impl Image for LocalImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn found(&self) -> bool {
        self.found
    }

    fn label(&self, key: &str) -> Option<String> {
        self.config.labels.get(key).cloned()
    }

    fn env(&self, key: &str) -> Option<String> {
        self.config
            .env
            .iter()
            .rev()
            .find_map(|kv| kv.split_once('=').filter(|(k, _)| *k == key).map(|(_, v)| v.to_string()))
    }

    fn identifier(&self) -> PackResult<String> {
        let id = if self.publish {
            self.digest.clone().or_else(|| self.id.clone())
        } else {
            self.id.clone()
        };
        id.ok_or_else(|| PackError::NotFound(format!("id of unsaved image '{}'", self.name)))
    }

    fn diff_ids(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.diff_id.clone()).collect()
    }

    fn set_label(&mut self, key: &str, value: &str) {
        self.config.labels.insert(key.to_string(), value.to_string());
    }

    fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        let prefix = format!("{}=", key);
        match self.config.env.iter_mut().find(|e| e.starts_with(&prefix)) {
            Some(existing) => *existing = entry,
            None => self.config.env.push(entry),
        }
    }

    fn set_working_dir(&mut self, dir: &str) {
        self.config.working_dir = dir.to_string();
    }

    fn set_entrypoint(&mut self, entrypoint: &[String]) {
        self.config.entrypoint = Some(entrypoint.to_vec());
    }

    fn set_cmd(&mut self, cmd: &[String]) {
        self.config.cmd = if cmd.is_empty() {
            None
        } else {
            Some(cmd.to_vec())
        };
    }

    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> PackResult<()> {
        self.layers.push(LocalLayer {
            diff_id: diff_id.to_string(),
            source: LayerSource::File(path.to_path_buf()),
        });
        Ok(())
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> PackResult<()> {
        let (prev_id, prev_layers) = self.prev.as_ref().ok_or_else(|| {
            PackError::NotFound(format!("previous image '{}' to reuse layers from", self.name))
        })?;
        if !prev_layers.iter().any(|l| l == diff_id) {
            return Err(PackError::NotFound(format!(
                "layer {} in previous image '{}'",
                diff_id, self.name
            )));
        }
        let source = LayerSource::Daemon(prev_id.clone());
        self.layers.push(LocalLayer {
            diff_id: diff_id.to_string(),
            source,
        });
        Ok(())
    }

    async fn get_layer(&mut self, diff_id: &str) -> PackResult<PathBuf> {
        let index = self.layer_position(diff_id).ok_or_else(|| {
            PackError::NotFound(format!("layer {} in image '{}'", diff_id, self.name))
        })?;
        let layer = self.layers[index].clone();
        self.materialize(&layer).await
    }

    async fn rebase(&mut self, base_top_layer: &str, new_base: &dyn Image) -> PackResult<()> {
        let ids = self.diff_ids();
        let kept = layers_above(&ids, base_top_layer)?;
        let kept_layers: Vec<LocalLayer> = self.layers[self.layers.len() - kept.len()..].to_vec();

        let base_ids = new_base.diff_ids();
        let base_source = LayerSource::Daemon(new_base.name().to_string());
        let mut layers: Vec<LocalLayer> = base_ids
            .iter()
            .map(|d| LocalLayer {
                diff_id: d.clone(),
                source: base_source.clone(),
            })
            .collect();
        layers.extend(kept_layers);

        self.base_count = base_ids.len();
        self.layers = layers;
        Ok(())
    }

    async fn save(&mut self, additional_names: &[String]) -> PackResult<String> {
        let mut names = vec![self.name.clone()];
        names.extend(additional_names.iter().cloned());

        let mut layer_paths = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.clone().iter().enumerate() {
            let in_daemon = matches!(layer.source, LayerSource::Daemon(_)) && i < self.base_count;
            if in_daemon {
                layer_paths.push(None);
            } else {
                layer_paths.push(Some(self.materialize(layer).await?));
            }
        }

        let archive_path = self
            .scratch
            .path()
            .join(format!("load-{}.tar", uuid::Uuid::new_v4()));
        let id = self.write_archive(&archive_path, &names, &layer_paths)?;
        self.runtime.load_image(&archive_path).await?;
        fs::remove_file(&archive_path).ok();
        debug!("Loaded {} as {}", self.name, id);

        if self.publish {
            for name in &names {
                self.runtime.push_image(name).await?;
            }
            if let Some(inspect) = self.runtime.inspect_image(&self.name).await? {
                self.digest = inspect.digest().map(str::to_string);
            }
        }

        self.id = Some(id.clone());
        Ok(id)
    }

    async fn delete(&mut self) -> PackResult<()> {
        self.runtime.remove_image(&self.name).await
    }
}

/// [`ImageFetcher`] backed by a container engine
#[derive(Clone)]
pub struct DaemonFetcher {
    runtime: Arc<dyn ContainerRuntime>,
}

impl DaemonFetcher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ImageFetcher for DaemonFetcher {
    async fn fetch(&self, name: &str, daemon: bool, pull: bool) -> PackResult<Box<dyn Image>> {
        if pull || !daemon {
            match self.runtime.pull_image(name).await {
                Ok(()) => {}
                Err(PackError::NotFound(_)) => return Err(PackError::ImageNotFound(name.to_string())),
                Err(e) => return Err(e),
            }
        }
        let inspect = self
            .runtime
            .inspect_image(name)
            .await?
            .ok_or_else(|| PackError::ImageNotFound(name.to_string()))?;
        Ok(Box::new(LocalImage::from_inspect(
            self.runtime.clone(),
            name,
            Some(inspect),
            !daemon,
        )?))
    }

    async fn open(&self, name: &str, daemon: bool) -> PackResult<Box<dyn Image>> {
        if !daemon {
            match self.runtime.pull_image(name).await {
                Ok(()) | Err(PackError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let inspect = self.runtime.inspect_image(name).await?;
        Ok(Box::new(LocalImage::from_inspect(
            self.runtime.clone(),
            name,
            inspect,
            !daemon,
        )?))
    }

    async fn new_image(
        &self,
        name: &str,
        base: Option<&str>,
        daemon: bool,
    ) -> PackResult<Box<dyn Image>> {
        let base = match base {
            Some(base) => Some(
                self.runtime
                    .inspect_image(base)
                    .await?
                    .ok_or_else(|| PackError::ImageNotFound(base.to_string()))?,
            ),
            None => None,
        };
        let prev = self.runtime.inspect_image(name).await?;
        Ok(Box::new(LocalImage::from_base(
            self.runtime.clone(),
            name,
            base.as_ref(),
            prev.as_ref(),
            !daemon,
        )?))
    }
}
