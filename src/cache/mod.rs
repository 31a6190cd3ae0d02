//! Build caches
//!
//! Cached layers are kept between builds so unchanged buildpack output can
//! be restored instead of rebuilt. Two stores share the [`Cache`] contract:
//!
//! | Kind | Backing | Metadata |
//! |------|---------|----------|
//! | Volume | `committed/` + `staging/` directories | JSON file |
//! | Image | layers of a dedicated image | image label |
//!
//! The orchestrator only needs names and teardown, see [`BuildCache`].

mod image;
mod volume;

pub use image::ImageCache;
pub use volume::VolumeCache;

use crate::auth::ImageRef;
use crate::dist::CacheMetadata;
use crate::error::PackResult;
use crate::runtime::ContainerRuntime;
use async_trait::async_trait;
use semver::Version;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

/// Lifecycles from this version on read caches from a mounted volume
pub const VOLUME_CACHE_MIN_LIFECYCLE: Version = Version::new(0, 2, 0);

#[async_trait]
pub trait Cache: Send {
    fn name(&self) -> &str;

    /// Committed metadata, empty when absent or unreadable
    async fn get_metadata(&self) -> PackResult<CacheMetadata>;

    /// Stage metadata for the next commit
    async fn set_metadata(&mut self, metadata: &CacheMetadata) -> PackResult<()>;

    /// Stage the tar at `tar_path` under its diffID
    async fn add_layer(&mut self, identifier: &str, diff_id: &str, tar_path: &Path)
        -> PackResult<()>;

    /// Carry a committed layer into the staged state without copying bytes
    async fn reuse_layer(&mut self, identifier: &str, diff_id: &str) -> PackResult<()>;

    /// Read a committed layer
    async fn retrieve_layer(&mut self, diff_id: &str) -> PackResult<Box<dyn Read + Send>>;

    /// Make the staged state the committed one
    async fn commit(&mut self) -> PackResult<()>;
}

/// Which cache store a build uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Volume,
    Image,
}

impl CachePolicy {
    pub fn for_lifecycle(version: &Version) -> Self {
        if *version >= VOLUME_CACHE_MIN_LIFECYCLE {
            CachePolicy::Volume
        } else {
            CachePolicy::Image
        }
    }
}

/// `pack-cache-<12 hex of sha256(normalized target)>`
pub fn cache_name(target: &str) -> PackResult<String> {
    let normalized = ImageRef::parse(target)?.normalized();
    let digest = hex::encode(Sha256::digest(normalized.as_bytes()));
    Ok(format!("pack-cache-{}", &digest[..12]))
}

/// The cache of one target image, as the orchestrator sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildCache {
    /// Named volumes holding build and launch layers
    Volume { build: String, launch: String },
    /// A cache image
    Image { name: String },
}

impl BuildCache {
    pub fn for_target(policy: CachePolicy, target: &str) -> PackResult<Self> {
        let base = cache_name(target)?;
        Ok(match policy {
            CachePolicy::Volume => BuildCache::Volume {
                build: format!("{}.build", base),
                launch: format!("{}.launch", base),
            },
            CachePolicy::Image => BuildCache::Image { name: base },
        })
    }

    /// Build volume or image name
    pub fn name(&self) -> &str {
        match self {
            BuildCache::Volume { build, .. } => build,
            BuildCache::Image { name } => name,
        }
    }

    pub fn is_volume(&self) -> bool {
        matches!(self, BuildCache::Volume { .. })
    }

    /// Drop every cached layer
    pub async fn clear(&self, runtime: &dyn ContainerRuntime) -> PackResult<()> {
        info!("Clearing cache {}", self.name());
        match self {
            BuildCache::Volume { build, launch } => {
                runtime.remove_volume(build).await?;
                runtime.remove_volume(launch).await?;
            }
            BuildCache::Image { name } => {
                runtime.remove_image(name).await?;
            }
        }
        debug!("Cache {} cleared", self.name());
        Ok(())
    }
}
