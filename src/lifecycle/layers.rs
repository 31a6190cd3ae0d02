//! Buildpack layer directories
//!
//! Under `<layers>/<escaped-buildpack-id>/` each layer `<name>` is made of
//! up to three siblings: `<name>.toml` (metadata), `<name>.sha` (diffID of
//! the last export) and `<name>/` (contents).

use crate::archive::Owner;
use crate::dist::buildpack::escape_id;
use crate::dist::LayerMetadata;
use crate::error::{PackError, PackResult};
use crate::layer::{Layer, LayerStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// On-disk form of `<name>.toml`; the diffID lives in `<name>.sha`
#[derive(Debug, Default, Serialize, Deserialize)]
struct LayerToml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<toml::Value>,
    #[serde(default)]
    build: bool,
    #[serde(default)]
    launch: bool,
    #[serde(default)]
    cache: bool,
}

/// How a cached layer relates to the previous image's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    StaleNoMetadata,
    StaleWrongSha,
    /// Staleness cannot be judged for layers that are not exported
    NotForLaunch,
    Valid,
    Malformed,
}

/// Which siblings of a layer are present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerContents {
    /// `<name>/` exists
    Local,
    /// Only `<name>.toml`
    Metadata,
    /// Only `<name>.sha`
    Sha,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildpackLayer {
    path: PathBuf,
    identifier: String,
}

fn remove_if_exists(path: &Path) -> PackResult<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PackError::io(format!("removing {}", path.display()), e)),
    }
}

fn sibling(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(ext);
    PathBuf::from(name)
}

impl BuildpackLayer {
    /// `<buildpack-id>:<name>`
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn toml_path(&self) -> PathBuf {
        sibling(&self.path, ".toml")
    }

    fn sha_path(&self) -> PathBuf {
        sibling(&self.path, ".sha")
    }

    pub fn contents(&self) -> LayerContents {
        if self.path.is_dir() {
            LayerContents::Local
        } else if self.toml_path().is_file() {
            LayerContents::Metadata
        } else {
            LayerContents::Sha
        }
    }

    pub fn has_local_contents(&self) -> bool {
        self.contents() == LayerContents::Local
    }

    /// Metadata from `<name>.toml` plus the diffID from `<name>.sha`.
    ///
    /// A missing toml reads as default metadata; an unparseable one fails.
    pub fn read(&self) -> PackResult<LayerMetadata> {
        let toml_path = self.toml_path();
        let mut metadata = match fs::read_to_string(&toml_path) {
            Ok(raw) => {
                let parsed: LayerToml = toml::from_str(&raw).map_err(|e| {
                    PackError::ConfigFile {
                        path: toml_path.clone(),
                        reason: e.to_string(),
                    }
                })?;
                LayerMetadata {
                    sha: String::new(),
                    data: match parsed.metadata {
                        Some(value) => serde_json::to_value(value)?,
                        None => serde_json::Value::Null,
                    },
                    build: parsed.build,
                    launch: parsed.launch,
                    cache: parsed.cache,
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LayerMetadata::default()),
            Err(e) => return Err(PackError::io(format!("reading {}", toml_path.display()), e)),
        };

        match fs::read_to_string(self.sha_path()) {
            Ok(sha) => metadata.sha = sha.trim().to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(PackError::io(
                    format!("reading {}", self.sha_path().display()),
                    e,
                ))
            }
        }
        Ok(metadata)
    }

    /// The diffID in `<name>.sha`, if any
    pub fn read_sha(&self) -> PackResult<Option<String>> {
        match fs::read_to_string(self.sha_path()) {
            Ok(sha) => Ok(Some(sha.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PackError::io(
                format!("reading {}", self.sha_path().display()),
                e,
            )),
        }
    }

    pub fn classify(&self, previous: &BTreeMap<String, LayerMetadata>) -> CacheType {
        let Ok(cached) = self.read() else {
            return CacheType::Malformed;
        };
        if !cached.launch {
            return CacheType::NotForLaunch;
        }
        match previous.get(&self.name()) {
            None => CacheType::StaleNoMetadata,
            Some(prev) if prev.sha != cached.sha => CacheType::StaleWrongSha,
            Some(_) => CacheType::Valid,
        }
    }

    pub fn write_metadata(&self, metadata: &LayerMetadata) -> PackResult<()> {
        let toml_path = self.toml_path();
        if let Some(parent) = toml_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PackError::io(format!("creating {}", parent.display()), e))?;
        }
        let data = if metadata.data.is_null() {
            None
        } else {
            Some(toml::Value::try_from(&metadata.data).map_err(|e| {
                PackError::ConfigInvalid(format!(
                    "metadata of layer '{}' cannot be written as TOML: {}",
                    self.identifier, e
                ))
            })?)
        };
        let raw = toml::to_string(&LayerToml {
            metadata: data,
            build: metadata.build,
            launch: metadata.launch,
            cache: metadata.cache,
        })?;
        fs::write(&toml_path, raw)
            .map_err(|e| PackError::io(format!("writing {}", toml_path.display()), e))
    }

    pub fn write_sha(&self, sha: &str) -> PackResult<()> {
        let path = self.sha_path();
        fs::write(&path, sha).map_err(|e| PackError::io(format!("writing {}", path.display()), e))
    }

    /// Delete contents, metadata and sha
    pub fn remove(&self) -> PackResult<()> {
        remove_if_exists(&self.path)?;
        remove_if_exists(&self.sha_path())?;
        remove_if_exists(&self.toml_path())
    }

    /// Tar the layer contents, rooted at the layer's own path
    pub fn export(&self, store: &LayerStore, owner: Owner) -> PackResult<Layer> {
        store.create_layer(
            &self.identifier,
            &self.path,
            &tar_prefix(&self.path),
            owner,
            None,
        )
    }
}

/// Tar prefix for content living at `path`.
///
/// Layer tars carry the absolute path of their contents, so extracting
/// them at `/` puts everything back where it was exported from.
pub fn tar_prefix(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// The layers of one buildpack
#[derive(Debug, Clone)]
pub struct BuildpackLayersDir {
    pub id: String,
    pub path: PathBuf,
    layers: BTreeMap<String, BuildpackLayer>,
}

impl BuildpackLayersDir {
    /// Scan `<layers_dir>/<escaped id>`; a missing directory has no layers
    pub fn read(layers_dir: &Path, buildpack_id: &str) -> PackResult<Self> {
        let path = layers_dir.join(escape_id(buildpack_id));
        let mut dir = Self {
            id: buildpack_id.to_string(),
            path,
            layers: BTreeMap::new(),
        };

        let entries = match fs::read_dir(&dir.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(dir),
            Err(e) => return Err(PackError::io(format!("reading {}", dir.path.display()), e)),
        };
        for entry in entries {
            let entry =
                entry.map_err(|e| PackError::io(format!("reading {}", dir.path.display()), e))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .map_err(|e| PackError::io(format!("reading {}", entry.path().display()), e))?
                .is_dir();
            let name = if is_dir {
                Some(file_name.as_str())
            } else {
                file_name
                    .strip_suffix(".toml")
                    .or_else(|| file_name.strip_suffix(".sha"))
            };
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                let layer = dir.layer(name);
                dir.layers.insert(name.to_string(), layer);
            }
        }
        Ok(dir)
    }

    /// Handle for layer `name`, whether or not it exists yet
    pub fn layer(&self, name: &str) -> BuildpackLayer {
        BuildpackLayer {
            path: self.path.join(name),
            identifier: format!("{}:{}", self.id, name),
        }
    }

    /// Layers in lexicographic name order
    pub fn layers(&self) -> impl Iterator<Item = &BuildpackLayer> {
        self.layers.values()
    }

    pub fn find_layers<F>(&self, filter: F) -> Vec<&BuildpackLayer>
    where
        F: Fn(&LayerMetadata) -> bool,
    {
        self.layers
            .values()
            .filter(|l| l.read().map(|md| filter(&md)).unwrap_or(false))
            .collect()
    }

    pub fn malformed_layers(&self) -> Vec<&BuildpackLayer> {
        self.layers.values().filter(|l| l.read().is_err()).collect()
    }
}
