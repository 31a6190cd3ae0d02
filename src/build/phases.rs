//! Arguments and privileges of the six lifecycle phases

use super::phase::Phase;
use crate::cache::BuildCache;
use crate::lifecycle::paths;
use semver::Version;

/// Lifecycles before this version read buildpacks from `/buildpacks`
pub const CNB_LAYOUT_MIN_LIFECYCLE: Version = Version::new(0, 4, 0);

/// Where the builder keeps the lifecycle, buildpacks and order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub lifecycle_dir: &'static str,
    pub buildpacks_dir: &'static str,
    pub order_path: &'static str,
}

impl Layout {
    pub fn for_lifecycle(version: &Version) -> Self {
        if *version >= CNB_LAYOUT_MIN_LIFECYCLE {
            Self {
                lifecycle_dir: paths::LIFECYCLE_DIR,
                buildpacks_dir: paths::BUILDPACKS_DIR,
                order_path: paths::ORDER_PATH,
            }
        } else {
            Self {
                lifecycle_dir: "/lifecycle",
                buildpacks_dir: "/buildpacks",
                order_path: "/buildpacks/order.toml",
            }
        }
    }
}

pub fn detect(layout: &Layout) -> Phase {
    Phase::new("detector").with_args([
        "-buildpacks",
        layout.buildpacks_dir,
        "-order",
        layout.order_path,
        "-group",
        paths::GROUP_PATH,
        "-plan",
        paths::PLAN_PATH,
        "-app",
        paths::APP_DIR,
    ])
}

/// Volume caches are mounted; image caches are read through the daemon
fn with_cache(phase: Phase, cache: &BuildCache) -> Phase {
    match cache {
        BuildCache::Volume { build, .. } => phase
            .with_binds([format!("{}:{}", build, paths::CACHE_DIR)])
            .with_args(["-path", paths::CACHE_DIR]),
        BuildCache::Image { name } => phase
            .with_daemon_access()
            .with_args(["-image", name.as_str()]),
    }
}

pub fn restore(cache: &BuildCache) -> Phase {
    with_cache(Phase::new("restorer"), cache).with_args([
        "-group",
        paths::GROUP_PATH,
        "-layers",
        paths::LAYERS_DIR,
    ])
}

pub fn analyze(image: &str, publish: bool) -> Phase {
    let phase = Phase::new("analyzer");
    let args = ["-layers", paths::LAYERS_DIR, "-group", paths::GROUP_PATH];
    if publish {
        phase
            .with_registry_access(&[image])
            .with_args(args)
            .with_args([image])
    } else {
        phase
            .with_daemon_access()
            .with_args(args)
            .with_args(["-daemon", image])
    }
}

pub fn build(layout: &Layout) -> Phase {
    Phase::new("builder").with_args([
        "-buildpacks",
        layout.buildpacks_dir,
        "-layers",
        paths::LAYERS_DIR,
        "-app",
        paths::APP_DIR,
        "-group",
        paths::GROUP_PATH,
        "-plan",
        paths::PLAN_PATH,
        "-platform",
        paths::PLATFORM_DIR,
    ])
}

/// The launch cache only applies to daemon exports
pub fn export(image: &str, run_image: &str, publish: bool, cache: &BuildCache) -> Phase {
    let phase = Phase::new("exporter");
    let args = [
        "-image",
        run_image,
        "-layers",
        paths::LAYERS_DIR,
        "-app",
        paths::APP_DIR,
        "-group",
        paths::GROUP_PATH,
    ];
    if publish {
        return phase
            .with_registry_access(&[image, run_image])
            .with_args(args)
            .with_args([image]);
    }

    let mut phase = phase.with_daemon_access().with_args(args);
    if let BuildCache::Volume { launch, .. } = cache {
        phase = phase
            .with_binds([format!("{}:{}", launch, paths::LAUNCH_CACHE_DIR)])
            .with_args(["-launch-cache", paths::LAUNCH_CACHE_DIR]);
    }
    phase.with_args(["-daemon", image])
}

pub fn cache(cache: &BuildCache) -> Phase {
    with_cache(Phase::new("cacher"), cache).with_args([
        "-group",
        paths::GROUP_PATH,
        "-layers",
        paths::LAYERS_DIR,
    ])
}
