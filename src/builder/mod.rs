//! Builder images
//!
//! A builder is a build image carrying a lifecycle, a set of buildpacks and
//! the order they detect in, described by the `io.buildpacks.builder.metadata`
//! label. [`Builder`] reads that description back and assembles new builders
//! on top of a base image. Lifecycles older than 0.4.0 also get the legacy
//! `/buildpacks` layout.

pub mod config;
mod layers;

pub use config::{read_config, BuilderConfig, BuildpackConfig, LifecycleConfig, StackConfig};

use crate::archive::Owner;
use crate::build::phases::CNB_LAYOUT_MIN_LIFECYCLE;
use crate::dist::lifecycle::{ASSUMED_LIFECYCLE_VERSION, DEFAULT_LIFECYCLE_VERSION};
use crate::dist::metadata::{BuilderBuildpackMetadata, LifecycleApiMetadata, LifecycleMetadata};
use crate::dist::{
    env, labels, Blob, BuilderMetadata, Buildpack, Lifecycle, OrderEntry, OrderGroup,
    StackMetadata, StackRunImage,
};
use crate::download::{lifecycle_uri, Downloader};
use crate::error::{PackError, PackResult};
use crate::image::{stack_id, Image, ImageFetcher};
use crate::layer::LayerStore;
use crate::lifecycle::paths;
use semver::Version;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Builder image being read or assembled
pub struct Builder {
    image: Box<dyn Image>,
    owner: Owner,
    stack_id: String,
    metadata: BuilderMetadata,
    lifecycle: Option<Lifecycle>,
    buildpacks: Vec<Buildpack>,
    env: BTreeMap<String, String>,
    replace_order: bool,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.image.name())
            .field("stack_id", &self.stack_id)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

fn parse_id(image: &dyn Image, key: &str) -> PackResult<u64> {
    let raw = image.env(key).filter(|v| !v.is_empty()).ok_or_else(|| {
        PackError::ConfigInvalid(format!(
            "image '{}' missing required env var {}",
            image.name(),
            key
        ))
    })?;
    raw.trim().parse().map_err(|_| {
        PackError::ConfigInvalid(format!(
            "failed to parse {}, value '{}' should be an integer",
            key, raw
        ))
    })
}

/// Build user and stack of a build image
fn identity(image: &dyn Image) -> PackResult<(Owner, String)> {
    let owner = Owner::new(
        parse_id(image, env::USER_ID)?,
        parse_id(image, env::GROUP_ID)?,
    );
    let stack = stack_id(image);
    if stack.is_empty() {
        return Err(PackError::ConfigInvalid(format!(
            "image '{}' missing label {}",
            image.name(),
            labels::STACK_ID
        )));
    }
    Ok((owner, stack))
}

impl Builder {
    /// Read an existing builder
    pub fn from_image(image: Box<dyn Image>) -> PackResult<Self> {
        let (owner, stack_id) = identity(image.as_ref())?;
        let label = image.label(labels::BUILDER_METADATA).unwrap_or_default();
        if label.trim().is_empty() {
            return Err(PackError::ConfigInvalid(format!(
                "builder '{}' missing label {} -- try recreating builder",
                image.name(),
                labels::BUILDER_METADATA
            )));
        }
        let metadata = BuilderMetadata::from_label(&label)?;
        Ok(Self::with_parts(image, owner, stack_id, metadata))
    }

    /// Start a builder named `name` from a build image or another builder
    pub fn new(mut image: Box<dyn Image>, name: &str) -> PackResult<Self> {
        let (owner, stack_id) = identity(image.as_ref())?;
        let metadata = match image.label(labels::BUILDER_METADATA) {
            Some(label) if !label.trim().is_empty() => BuilderMetadata::from_label(&label)?,
            _ => BuilderMetadata::default(),
        };
        image.rename(name);
        Ok(Self::with_parts(image, owner, stack_id, metadata))
    }

    fn with_parts(
        image: Box<dyn Image>,
        owner: Owner,
        stack_id: String,
        metadata: BuilderMetadata,
    ) -> Self {
        Self {
            image,
            owner,
            stack_id,
            metadata,
            lifecycle: None,
            buildpacks: Vec::new(),
            env: BTreeMap::new(),
            replace_order: false,
        }
    }

    pub fn name(&self) -> &str {
        self.image.name()
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn stack_id(&self) -> &str {
        &self.stack_id
    }

    pub fn metadata(&self) -> &BuilderMetadata {
        &self.metadata
    }

    pub fn description(&self) -> &str {
        &self.metadata.description
    }

    pub fn stack(&self) -> &StackMetadata {
        &self.metadata.stack
    }

    pub fn order(&self) -> &[OrderGroup] {
        &self.metadata.order
    }

    pub fn buildpacks(&self) -> &[BuilderBuildpackMetadata] {
        &self.metadata.buildpacks
    }

    /// Version of the lifecycle on the builder, assumed when unrecorded
    pub fn lifecycle_version(&self) -> Version {
        match &self.lifecycle {
            Some(lifecycle) => lifecycle.version().clone(),
            None => Version::parse(&self.metadata.lifecycle.version)
                .unwrap_or(ASSUMED_LIFECYCLE_VERSION),
        }
    }

    pub fn set_description(&mut self, description: &str) {
        self.metadata.description = description.to_string();
    }

    pub fn set_stack(&mut self, run_image: &str, mirrors: &[String]) {
        self.metadata.stack = StackMetadata {
            run_image: StackRunImage {
                image: run_image.to_string(),
                mirrors: mirrors.to_vec(),
            },
        };
    }

    pub fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        self.metadata.lifecycle = LifecycleMetadata {
            version: lifecycle.version().to_string(),
            api: LifecycleApiMetadata {
                buildpack: lifecycle.descriptor.api.buildpack,
                platform: lifecycle.descriptor.api.platform,
            },
        };
        self.lifecycle = Some(lifecycle);
    }

    pub fn set_env(&mut self, env: BTreeMap<String, String>) {
        self.env = env;
    }

    /// Add a buildpack; one already present with the same id and version is replaced
    pub fn add_buildpack(&mut self, bp: Buildpack) -> PackResult<()> {
        if !bp.descriptor.supports_stack(&self.stack_id) {
            return Err(PackError::InvalidBuildpack(format!(
                "buildpack '{}' does not support stack '{}'",
                bp.descriptor.full_name(),
                self.stack_id
            )));
        }
        let same = |id: &str, version: &str| id == bp.id() && version == bp.version();
        self.buildpacks.retain(|b| !same(b.id(), b.version()));
        self.metadata.buildpacks.retain(|b| !same(&b.id, &b.version));
        self.metadata.buildpacks.push(BuilderBuildpackMetadata {
            id: bp.id().to_string(),
            version: bp.version().to_string(),
            latest: false,
        });
        debug!("Added buildpack {}", bp.descriptor.full_name());
        self.buildpacks.push(bp);
        Ok(())
    }

    /// Replace the detection order.
    ///
    /// Every entry must name a buildpack on the builder; entries without a
    /// version take the only version present.
    pub fn set_order(&mut self, order: &[OrderGroup]) -> PackResult<()> {
        let mut resolved = Vec::with_capacity(order.len());
        for group in order {
            let mut entries = Vec::with_capacity(group.group.len());
            for entry in &group.group {
                entries.push(self.resolve_entry(entry)?);
            }
            resolved.push(OrderGroup { group: entries });
        }
        self.metadata.order = resolved;
        self.replace_order = true;
        Ok(())
    }

    fn resolve_entry(&self, entry: &OrderEntry) -> PackResult<OrderEntry> {
        let versions: Vec<&str> = self
            .metadata
            .buildpacks
            .iter()
            .filter(|b| b.id == entry.id)
            .map(|b| b.version.as_str())
            .collect();
        if versions.is_empty() {
            return Err(PackError::ConfigInvalid(format!(
                "no versions of buildpack '{}' were found on the builder",
                entry.id
            )));
        }
        if entry.version.is_empty() {
            return match versions.as_slice() {
                [only] => Ok(OrderEntry {
                    version: only.to_string(),
                    ..entry.clone()
                }),
                _ => Err(PackError::ConfigInvalid(format!(
                    "multiple versions of buildpack '{}' found on the builder, an explicit version is required",
                    entry.id
                ))),
            };
        }
        if !versions.contains(&entry.version.as_str()) {
            return Err(PackError::ConfigInvalid(format!(
                "buildpack '{}' with version '{}' was not found on the builder",
                entry.id, entry.version
            )));
        }
        Ok(entry.clone())
    }

    /// Highest version of each buildpack id on the builder
    fn latest_versions(&self) -> BTreeMap<String, String> {
        let mut latest: BTreeMap<String, String> = BTreeMap::new();
        for bp in &self.metadata.buildpacks {
            match latest.get(&bp.id) {
                Some(current) if version_key(current) >= version_key(&bp.version) => {}
                _ => {
                    latest.insert(bp.id.clone(), bp.version.clone());
                }
            }
        }
        latest
    }

    /// Write every layer, label and env var, then save the image
    pub async fn save(mut self) -> PackResult<String> {
        let scratch =
            TempDir::new().map_err(|e| PackError::io("creating builder scratch dir", e))?;
        let store = LayerStore::new(scratch.path())?;
        let legacy = self.lifecycle_version() < CNB_LAYOUT_MIN_LIFECYCLE;

        let latest = if legacy {
            self.latest_versions()
        } else {
            BTreeMap::new()
        };
        for bp in &mut self.metadata.buildpacks {
            bp.latest = latest.get(&bp.id) == Some(&bp.version);
        }

        let mut emitted = vec![
            layers::default_dirs(&store, self.owner)?,
            layers::env(&store, &self.env)?,
        ];
        if let Some(lifecycle) = &self.lifecycle {
            emitted.push(layers::lifecycle(&store, lifecycle)?);
        }
        for bp in &self.buildpacks {
            emitted.push(layers::buildpack(&store, bp, self.owner)?);
        }
        if self.replace_order {
            emitted.push(layers::order(&store, &self.metadata.order)?);
        }
        emitted.push(layers::stack(&store, &self.metadata.stack)?);
        if legacy {
            emitted.push(layers::compat(
                &store,
                &layers::Compat {
                    buildpacks: &self.buildpacks,
                    latest: &latest,
                    stack: &self.metadata.stack,
                    order: self.replace_order.then_some(self.metadata.order.as_slice()),
                },
            )?);
        }

        for layer in layers::unique(emitted) {
            self.image.add_layer_with_diff_id(&layer.path, &layer.diff_id)?;
        }

        let label = serde_json::to_string(&self.metadata)?;
        self.image.set_label(labels::BUILDER_METADATA, &label);
        self.image.set_env(env::USER_ID, &self.owner.uid.to_string());
        self.image.set_env(env::GROUP_ID, &self.owner.gid.to_string());
        self.image.set_working_dir(paths::LAYERS_DIR);

        let id = self.image.save(&[]).await?;
        info!("Saved builder {}", self.image.name());
        Ok(id)
    }
}

/// Semver versions sort above anything else; the rest sort as strings
fn version_key(version: &str) -> (Option<Version>, &str) {
    (Version::parse(version).ok(), version)
}

pub(crate) async fn fetch_asset(downloader: &Downloader, uri: &str) -> PackResult<PathBuf> {
    let downloader = downloader.clone();
    let uri = uri.to_string();
    tokio::task::spawn_blocking(move || downloader.download(&uri))
        .await
        .map_err(|e| PackError::Internal(format!("download task failed: {}", e)))?
}

/// Open the lifecycle a builder config asks for
pub async fn resolve_lifecycle(
    downloader: &Downloader,
    config: &LifecycleConfig,
) -> PackResult<Lifecycle> {
    let version = config.parsed_version()?;
    let uri = if config.uri.is_empty() {
        lifecycle_uri(version.as_ref().unwrap_or(&DEFAULT_LIFECYCLE_VERSION))
    } else {
        config.uri.clone()
    };
    let path = fetch_asset(downloader, &uri).await?;
    let lifecycle = Lifecycle::from_blob(Blob::from_path(path)?)?;
    if let Some(version) = version {
        if !config.uri.is_empty() && &version != lifecycle.version() {
            warn!(
                "lifecycle at {} is version {}, not the configured {}",
                uri,
                lifecycle.version(),
                version
            );
        }
    }
    Ok(lifecycle)
}

/// Open a buildpack and check it is the one the config names
pub async fn resolve_buildpack(
    downloader: &Downloader,
    config: &BuildpackConfig,
) -> PackResult<Buildpack> {
    let path = fetch_asset(downloader, &config.uri).await?;
    let bp = Buildpack::from_blob(Blob::from_path(path)?)?;
    if bp.id() != config.id {
        return Err(PackError::ConfigInvalid(format!(
            "buildpack from URI '{}' has ID '{}' which does not match ID '{}' from builder config",
            config.uri,
            bp.id(),
            config.id
        )));
    }
    if !config.version.is_empty() && bp.version() != config.version {
        return Err(PackError::ConfigInvalid(format!(
            "buildpack from URI '{}' has version '{}' which does not match version '{}' from builder config",
            config.uri,
            bp.version(),
            config.version
        )));
    }
    Ok(bp)
}

/// Options of create-builder
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    pub publish: bool,
    pub pull: bool,
}

/// Assemble and save a builder named `name` from `config`
pub async fn create(
    fetcher: &dyn ImageFetcher,
    downloader: &Downloader,
    config: &BuilderConfig,
    name: &str,
    opts: CreateOptions,
) -> PackResult<String> {
    config.validate()?;

    let daemon = !opts.publish;
    let base = fetcher
        .fetch(&config.stack.build_image, daemon, opts.pull)
        .await?;
    let mut builder = Builder::new(base, name)?;
    if builder.stack_id() != config.stack.id {
        return Err(PackError::stack_mismatch(&config.stack.id, builder.stack_id()));
    }

    builder.set_description(&config.description);
    builder.set_lifecycle(resolve_lifecycle(downloader, &config.lifecycle).await?);
    for bp in &config.buildpacks {
        builder.add_buildpack(resolve_buildpack(downloader, bp).await?)?;
    }
    builder.set_order(&config.order)?;
    builder.set_stack(&config.stack.run_image, &config.stack.run_image_mirrors);
    builder.save().await
}

/// Name for a throwaway builder
pub fn ephemeral_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("pack.local/builder/{}", &suffix[..10])
}

/// What an ephemeral builder adds to its base
#[derive(Debug, Default)]
pub struct EphemeralOptions {
    pub env: BTreeMap<String, String>,
    pub buildpacks: Vec<Buildpack>,
    /// Replacement order as a single group
    pub group: Option<Vec<OrderEntry>>,
}

/// Derive a temporary builder from `base` and return its name
pub async fn create_ephemeral(
    fetcher: &dyn ImageFetcher,
    base: &str,
    opts: EphemeralOptions,
    daemon: bool,
) -> PackResult<String> {
    let name = ephemeral_name();
    let image = fetcher.new_image(&name, Some(base), daemon).await?;
    let mut builder = Builder::new(image, &name)?;
    builder.set_env(opts.env);
    for bp in opts.buildpacks {
        builder.add_buildpack(bp)?;
    }
    if let Some(group) = opts.group {
        builder.set_order(&[OrderGroup { group }])?;
    }
    builder.save().await?;
    debug!("Created ephemeral builder {}", name);
    Ok(name)
}
