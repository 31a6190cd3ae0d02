//! Lifecycle orchestration
//!
//! A build runs six phases in fresh containers of the builder image:
//! DETECT, RESTORE, ANALYZE, BUILD, EXPORT and CACHE. State flows between
//! them through two named volumes created for the build and removed when it
//! ends, whatever the outcome.

pub mod phase;
pub mod phases;

pub use phase::{Phase, PhaseRunner, ProxyEnv};
pub use phases::Layout;

use crate::archive::Owner;
use crate::auth::Keychain;
use crate::cache::{BuildCache, CachePolicy};
use crate::error::{PackError, PackResult};
use crate::logging::PhaseOutput;
use crate::runtime::ContainerRuntime;
use semver::Version;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cooperative cancellation shared by the orchestrator and its phases
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// A build with its builder and run image already resolved
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub app_dir: PathBuf,
    pub image: String,
    /// Image every phase runs in
    pub builder_image: String,
    pub run_image: String,
    pub lifecycle_version: Version,
    /// Owner of the copied application files
    pub owner: Owner,
    pub clear_cache: bool,
    pub publish: bool,
    pub proxy: ProxyEnv,
    /// Print phase transcripts instead of logging them at debug level
    pub verbose: bool,
}

/// Drives the phases of one build
pub struct Lifecycle<'a> {
    runtime: &'a dyn ContainerRuntime,
    keychain: &'a Keychain,
    cancel: CancelToken,
}

impl<'a> Lifecycle<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, keychain: &'a Keychain, cancel: CancelToken) -> Self {
        Self {
            runtime,
            keychain,
            cancel,
        }
    }

    pub async fn execute(&self, opts: &BuildOptions) -> PackResult<()> {
        let suffix = Uuid::new_v4().simple().to_string();
        let layers_volume = format!("pack-layers-{}", &suffix[..10]);
        let app_volume = format!("pack-app-{}", &suffix[..10]);

        let result = self.run(opts, &layers_volume, &app_volume).await;
        let teardown = self.teardown(&[&layers_volume, &app_volume]).await;

        match (result, teardown) {
            (Err(e), Err(teardown)) => {
                warn!("Failed to clean up build volumes: {}", teardown);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), teardown) => teardown,
        }
    }

    async fn run(&self, opts: &BuildOptions, layers_volume: &str, app_volume: &str) -> PackResult<()> {
        self.runtime.create_volume(layers_volume).await?;
        self.runtime.create_volume(app_volume).await?;

        let cache = BuildCache::for_target(
            CachePolicy::for_lifecycle(&opts.lifecycle_version),
            &opts.image,
        )?;
        debug!("Using cache {}", cache.name());
        if opts.clear_cache {
            cache.clear(self.runtime).await?;
        }

        let layout = Layout::for_lifecycle(&opts.lifecycle_version);
        let runner = PhaseRunner::new(
            self.runtime,
            self.keychain,
            &opts.builder_image,
            (layers_volume, app_volume),
            layout.lifecycle_dir,
            opts.app_dir.clone(),
            opts.owner,
            opts.proxy.clone(),
            PhaseOutput::for_verbosity(opts.verbose),
            self.cancel.clone(),
        );

        info!("===> DETECTING");
        runner.run(&phases::detect(&layout)).await?;

        if opts.clear_cache {
            info!("Skipping restore and analyze, cache was cleared");
        } else {
            info!("===> RESTORING");
            runner.run(&phases::restore(&cache)).await?;
            info!("===> ANALYZING");
            runner.run(&phases::analyze(&opts.image, opts.publish)).await?;
        }

        info!("===> BUILDING");
        runner.run(&phases::build(&layout)).await?;

        info!("===> EXPORTING");
        runner
            .run(&phases::export(&opts.image, &opts.run_image, opts.publish, &cache))
            .await?;

        info!("===> CACHING");
        runner.run(&phases::cache(&cache)).await
    }

    /// Remove every volume, returning the first failure
    async fn teardown(&self, volumes: &[&str]) -> PackResult<()> {
        let mut first: Option<PackError> = None;
        for volume in volumes {
            if let Err(e) = self.runtime.remove_volume(volume).await {
                warn!("Failed to remove volume {}: {}", volume, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
