//! Entry points behind the CLI
//!
//! [`Client`] resolves builders, run images, env vars and buildpacks from
//! user input and the pack config, then hands off to the orchestrator,
//! the rebaser and the builder assembler.

use crate::auth::Keychain;
use crate::build::{self, BuildOptions, CancelToken};
use crate::builder::{self, Builder, CreateOptions, EphemeralOptions};
use crate::config::{pack_home, Config};
use crate::dist::metadata::BuilderBuildpackMetadata;
use crate::dist::{
    labels, Blob, BuildMetadata, Buildpack, BuildpackRef, LayersMetadata, OrderEntry, OrderGroup,
    RunImageMetadata, StackRunImage,
};
use crate::download::Downloader;
use crate::error::{PackError, PackResult};
use crate::image::{select_run_image, stack_id, DaemonFetcher, ImageFetcher};
use crate::rebase::{self, RebaseOptions};
use crate::runtime::{create_runtime, ContainerRuntime};
use semver::Version;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A build as requested on the command line
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub image: String,
    pub app_dir: PathBuf,
    /// Falls back to the configured default builder
    pub builder: Option<String>,
    pub run_image: Option<String>,
    pub env_files: Vec<PathBuf>,
    /// `KEY=VALUE`, or `KEY` to take the value from the environment
    pub env: Vec<String>,
    /// `id@version`, `id`, a buildpack directory or archive, or a URL
    pub buildpacks: Vec<String>,
    pub publish: bool,
    pub pull: bool,
    pub clear_cache: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RebaseRequest {
    pub image: String,
    pub run_image: Option<String>,
    pub publish: bool,
    pub pull: bool,
    pub additional_tags: Vec<String>,
}

/// What `inspect-builder` reports
#[derive(Debug, Clone, PartialEq)]
pub struct BuilderInfo {
    pub description: String,
    pub stack_id: String,
    pub run_image: StackRunImage,
    pub local_mirrors: Vec<String>,
    pub lifecycle_version: Version,
    pub buildpacks: Vec<BuilderBuildpackMetadata>,
    pub order: Vec<OrderGroup>,
}

/// What `inspect-image` reports
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    pub stack_id: String,
    pub base: RunImageMetadata,
    pub run_image: StackRunImage,
    pub local_mirrors: Vec<String>,
    pub buildpacks: Vec<BuildpackRef>,
    pub bom: serde_json::Value,
}

pub struct Client {
    runtime: Arc<dyn ContainerRuntime>,
    fetcher: Arc<dyn ImageFetcher>,
    keychain: Keychain,
    downloader: Downloader,
    config: Config,
}

impl Client {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        fetcher: Arc<dyn ImageFetcher>,
        keychain: Keychain,
        downloader: Downloader,
        config: Config,
    ) -> Self {
        Self {
            runtime,
            fetcher,
            keychain,
            downloader,
            config,
        }
    }

    /// Client talking to the configured (or detected) engine
    pub fn from_config(config: Config, progress: bool) -> PackResult<Self> {
        let runtime = create_runtime(config.engine)?;
        let fetcher = Arc::new(DaemonFetcher::new(runtime.clone()));
        let downloader = Downloader::new(&pack_home()).with_progress(progress);
        Ok(Self::new(runtime, fetcher, Keychain::new(), downloader, config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build `req.app_dir` into `req.image`
    pub async fn build(&self, req: &BuildRequest, cancel: CancelToken) -> PackResult<()> {
        self.runtime.ensure_ready().await?;

        let builder_name = req
            .builder
            .clone()
            .or_else(|| self.config.default_builder_image.clone())
            .ok_or(PackError::NoDefaultBuilder)?;
        let builder = Builder::from_image(self.fetcher.fetch(&builder_name, true, req.pull).await?)?;
        debug!(
            "Using builder {} (stack {}, lifecycle {})",
            builder_name,
            builder.stack_id(),
            builder.lifecycle_version()
        );

        let run_image = self.resolve_run_image(req, &builder)?;
        let run = self.fetcher.fetch(&run_image, !req.publish, req.pull).await?;
        let run_stack = stack_id(run.as_ref());
        if run_stack != builder.stack_id() {
            return Err(PackError::stack_mismatch(builder.stack_id(), run_stack));
        }
        info!("Using run image {}", run_image);

        let env = resolve_env(&req.env_files, &req.env)?;
        let ephemeral = if env.is_empty() && req.buildpacks.is_empty() {
            None
        } else {
            let opts = self.ephemeral_options(env, &req.buildpacks).await?;
            Some(builder::create_ephemeral(self.fetcher.as_ref(), &builder_name, opts, true).await?)
        };

        let opts = BuildOptions {
            app_dir: absolute(&req.app_dir)?,
            image: req.image.clone(),
            builder_image: ephemeral.clone().unwrap_or(builder_name),
            run_image,
            lifecycle_version: builder.lifecycle_version(),
            owner: builder.owner(),
            clear_cache: req.clear_cache,
            publish: req.publish,
            proxy: self.config.proxy_env(),
            verbose: req.verbose,
        };
        let result = build::Lifecycle::new(self.runtime.as_ref(), &self.keychain, cancel)
            .execute(&opts)
            .await;

        if let Some(name) = ephemeral {
            if let Err(e) = self.delete_image(&name).await {
                warn!("Failed to remove ephemeral builder {}: {}", name, e);
            }
        }
        result?;
        info!("Successfully built image {}", req.image);
        Ok(())
    }

    fn resolve_run_image(&self, req: &BuildRequest, builder: &Builder) -> PackResult<String> {
        if let Some(run_image) = &req.run_image {
            return Ok(run_image.clone());
        }
        let stack = &builder.stack().run_image;
        if stack.image.is_empty() {
            return Err(PackError::ConfigInvalid(format!(
                "builder '{}' names no run image, pass --run-image",
                builder.name()
            )));
        }
        let mirrors = self.config.run_image_mirrors(&stack.image);
        Ok(select_run_image(&req.image, stack, &mirrors))
    }

    async fn ephemeral_options(
        &self,
        env: BTreeMap<String, String>,
        refs: &[String],
    ) -> PackResult<EphemeralOptions> {
        let mut buildpacks = Vec::new();
        let mut group = Vec::with_capacity(refs.len());
        for reference in refs {
            if is_blob_ref(reference) {
                let path = builder::fetch_asset(&self.downloader, reference).await?;
                let bp = Buildpack::from_blob(Blob::from_path(path)?)?;
                group.push(OrderEntry::new(bp.id(), bp.version()));
                buildpacks.push(bp);
            } else {
                let (id, version) = reference.split_once('@').unwrap_or((reference.as_str(), ""));
                group.push(OrderEntry::new(id, version));
            }
        }
        Ok(EphemeralOptions {
            env,
            buildpacks,
            group: (!group.is_empty()).then_some(group),
        })
    }

    async fn delete_image(&self, name: &str) -> PackResult<()> {
        let mut image = self.fetcher.open(name, true).await?;
        if image.found() {
            image.delete().await?;
        }
        Ok(())
    }

    /// Move an app image onto a new run image
    pub async fn rebase(&self, req: &RebaseRequest) -> PackResult<String> {
        let run_image_mirrors = self
            .config
            .run_images
            .iter()
            .map(|r| (r.image.clone(), r.mirrors.clone()))
            .collect();
        let opts = RebaseOptions {
            image: req.image.clone(),
            run_image: req.run_image.clone(),
            run_image_mirrors,
            publish: req.publish,
            pull: req.pull,
            additional_tags: req.additional_tags.clone(),
        };
        rebase::rebase(self.fetcher.as_ref(), &opts).await
    }

    /// Assemble a builder from a `builder.toml`, returning its id and any
    /// warnings about the config
    pub async fn create_builder(
        &self,
        name: &str,
        config_path: &Path,
        opts: CreateOptions,
    ) -> PackResult<(String, Vec<String>)> {
        let (config, warnings) = builder::read_config(config_path)?;
        for warning in &warnings {
            warn!("{}", warning);
        }
        let id = builder::create(self.fetcher.as_ref(), &self.downloader, &config, name, opts).await?;
        Ok((id, warnings))
    }

    /// Describe a builder, `None` when it does not exist
    pub async fn inspect_builder(&self, name: &str, daemon: bool) -> PackResult<Option<BuilderInfo>> {
        let image = self.fetcher.open(name, daemon).await?;
        if !image.found() {
            return Ok(None);
        }
        let builder = Builder::from_image(image)?;
        let run_image = builder.stack().run_image.clone();
        Ok(Some(BuilderInfo {
            description: builder.description().to_string(),
            stack_id: builder.stack_id().to_string(),
            local_mirrors: self.config.run_image_mirrors(&run_image.image),
            run_image,
            lifecycle_version: builder.lifecycle_version(),
            buildpacks: builder.buildpacks().to_vec(),
            order: builder.order().to_vec(),
        }))
    }

    /// Describe an app image, `None` when it does not exist
    pub async fn inspect_image(&self, name: &str, daemon: bool) -> PackResult<Option<ImageInfo>> {
        let image = self.fetcher.open(name, daemon).await?;
        if !image.found() {
            return Ok(None);
        }
        let layers = LayersMetadata::from_label(
            &image.label(labels::LAYERS_METADATA).unwrap_or_default(),
        )?;
        let build =
            BuildMetadata::from_label(&image.label(labels::BUILD_METADATA).unwrap_or_default())?;
        let run_image = layers.stack.run_image;
        Ok(Some(ImageInfo {
            stack_id: stack_id(image.as_ref()),
            base: layers.run_image,
            local_mirrors: self.config.run_image_mirrors(&run_image.image),
            run_image,
            buildpacks: build.buildpacks,
            bom: build.bom,
        }))
    }
}

/// Anything that has to be opened as a blob rather than looked up on the builder
fn is_blob_ref(reference: &str) -> bool {
    reference.contains("://") || Path::new(reference).exists()
}

fn absolute(path: &Path) -> PackResult<PathBuf> {
    std::path::absolute(path)
        .map_err(|e| PackError::io(format!("resolving {}", path.display()), e))
}

/// Parse one `KEY=VALUE` entry; a bare `KEY` takes its value from the
/// process environment
pub fn parse_env_entry(entry: &str) -> PackResult<(String, String)> {
    let (key, value) = match entry.split_once('=') {
        Some((key, value)) => (key.trim(), value.to_string()),
        None => {
            let key = entry.trim();
            (key, std::env::var(key).unwrap_or_default())
        }
    };
    if key.is_empty() {
        return Err(PackError::User(format!("invalid env entry '{}'", entry)));
    }
    Ok((key.to_string(), value))
}

/// Read an env file: one entry per line, blank lines and `#` comments skipped
pub fn read_env_file(path: &Path) -> PackResult<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| PackError::io(format!("reading env file {}", path.display()), e))?;
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_env_entry)
        .collect()
}

/// Env files in order, then `--env` entries, later values winning
pub fn resolve_env(files: &[PathBuf], entries: &[String]) -> PackResult<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for file in files {
        env.extend(read_env_file(file)?);
    }
    for entry in entries {
        let (key, value) = parse_env_entry(entry)?;
        env.insert(key, value);
    }
    Ok(env)
}
