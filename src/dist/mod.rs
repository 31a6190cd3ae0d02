//! Distribution formats shared by builders, the lifecycle and images
//!
//! Covers buildpack and lifecycle descriptors, the blobs they ship in,
//! detection order files, and the JSON metadata stored in image labels.

pub mod blob;
pub mod buildpack;
pub mod lifecycle;
pub mod metadata;
pub mod order;

pub use blob::Blob;
pub use buildpack::{Buildpack, BuildpackDescriptor, BuildpackInfo, Stack};
pub use lifecycle::{Lifecycle, LifecycleDescriptor};
pub use metadata::{
    BuildMetadata, BuilderMetadata, BuildpackLayersMetadata, BuildpackRef, CacheMetadata,
    LauncherBuildMetadata, LayerMetadata, LayersMetadata, RunImageMetadata, StackMetadata,
    StackRunImage,
};
pub use order::{Order, OrderEntry, OrderGroup};

/// Image label keys
pub mod labels {
    /// Stack identifier shared by build and run images
    pub const STACK_ID: &str = "io.buildpacks.stack.id";
    /// Builder contents (buildpacks, order, stack, lifecycle)
    pub const BUILDER_METADATA: &str = "io.buildpacks.builder.metadata";
    /// Layer metadata of an exported app image
    pub const LAYERS_METADATA: &str = "io.buildpacks.lifecycle.metadata";
    /// Bill of materials and buildpacks that built an app image
    pub const BUILD_METADATA: &str = "io.buildpacks.build.metadata";
    /// Layer metadata of a cache
    pub const CACHE_METADATA: &str = "io.buildpacks.lifecycle.cache.metadata";
}

/// Environment keys read from builder images
pub mod env {
    pub const USER_ID: &str = "CNB_USER_ID";
    pub const GROUP_ID: &str = "CNB_GROUP_ID";
    pub const LAYERS_DIR: &str = "CNB_LAYERS_DIR";
    pub const APP_DIR: &str = "CNB_APP_DIR";
    pub const REGISTRY_AUTH: &str = "CNB_REGISTRY_AUTH";
}
