//! Lifecycle phase semantics
//!
//! The lifecycle binaries run inside build containers; this module holds
//! the behaviour pack relies on when it interoperates with them: how
//! restored layers are validated, how cached layers come back, how the app
//! image is stitched together, and how the cache is written.

mod analyzer;
mod cacher;
mod exporter;
pub mod layers;
mod restorer;

pub use analyzer::Analyzer;
pub use cacher::Cacher;
pub use exporter::{ExportReport, ExportTarget, Exporter};
pub use layers::{BuildpackLayer, BuildpackLayersDir, CacheType, LayerContents};
pub use restorer::Restorer;

use crate::dist::OrderEntry;
use crate::error::{PackError, PackResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Container paths shared by every phase
pub mod paths {
    pub const LAYERS_DIR: &str = "/layers";
    pub const APP_DIR: &str = "/workspace";
    pub const PLATFORM_DIR: &str = "/platform";
    pub const CNB_DIR: &str = "/cnb";
    pub const BUILDPACKS_DIR: &str = "/cnb/buildpacks";
    pub const LIFECYCLE_DIR: &str = "/cnb/lifecycle";
    pub const ORDER_PATH: &str = "/cnb/order.toml";
    pub const STACK_PATH: &str = "/cnb/stack.toml";
    pub const GROUP_PATH: &str = "/layers/group.toml";
    pub const PLAN_PATH: &str = "/layers/plan.toml";
    pub const CACHE_DIR: &str = "/cache";
    pub const LAUNCH_CACHE_DIR: &str = "/launch-cache";
    pub const LAUNCHER_PATH: &str = "/cnb/lifecycle/launcher";
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GroupToml {
    #[serde(default, alias = "group")]
    buildpacks: Vec<OrderEntry>,
}

/// Parse `group.toml`, the buildpacks that passed detection
pub fn parse_group(raw: &str) -> PackResult<Vec<OrderEntry>> {
    let group: GroupToml = toml::from_str(raw)?;
    Ok(group.buildpacks)
}

pub fn read_group(path: &Path) -> PackResult<Vec<OrderEntry>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| PackError::io(format!("reading {}", path.display()), e))?;
    parse_group(&raw)
}

pub fn write_group(path: &Path, group: &[OrderEntry]) -> PackResult<()> {
    let raw = toml::to_string(&GroupToml {
        buildpacks: group.to_vec(),
    })?;
    std::fs::write(path, raw).map_err(|e| PackError::io(format!("writing {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_schemas() {
        let current = parse_group("[[group]]\nid = \"bp.one\"\nversion = \"1.0\"\n").unwrap();
        let legacy = parse_group("[[buildpacks]]\nid = \"bp.one\"\nversion = \"1.0\"\n").unwrap();
        assert_eq!(current, legacy);
        assert_eq!(current, vec![OrderEntry::new("bp.one", "1.0")]);
    }

    #[test]
    fn group_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("group.toml");
        let group = vec![OrderEntry::new("bp.one", "1.0"), OrderEntry::new("bp.two", "2.0")];
        write_group(&path, &group).unwrap();
        assert_eq!(read_group(&path).unwrap(), group);
    }
}
