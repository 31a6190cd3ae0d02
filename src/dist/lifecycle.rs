//! Lifecycle bundles and their `lifecycle.toml` descriptor

use crate::api::ApiVersion;
use crate::archive::clean_entry_name;
use crate::dist::blob::Blob;
use crate::error::{PackError, PackResult};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Version assumed when a bundle carries no descriptor
pub const ASSUMED_LIFECYCLE_VERSION: Version = Version::new(0, 3, 0);
pub const ASSUMED_PLATFORM_API: ApiVersion = ApiVersion::new(0, 1);
pub const ASSUMED_BUILDPACK_API: ApiVersion = ApiVersion::new(0, 1);

/// Version downloaded when a builder config names no lifecycle
pub const DEFAULT_LIFECYCLE_VERSION: Version = Version::new(0, 4, 0);

/// Binaries every lifecycle bundle must ship
pub const REQUIRED_BINARIES: [&str; 7] = [
    "detector", "restorer", "analyzer", "builder", "exporter", "cacher", "launcher",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleInfo {
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleApis {
    #[serde(default = "assumed_platform")]
    pub platform: ApiVersion,
    #[serde(default = "assumed_buildpack")]
    pub buildpack: ApiVersion,
}

fn assumed_platform() -> ApiVersion {
    ASSUMED_PLATFORM_API
}

fn assumed_buildpack() -> ApiVersion {
    ASSUMED_BUILDPACK_API
}

impl Default for LifecycleApis {
    fn default() -> Self {
        Self {
            platform: ASSUMED_PLATFORM_API,
            buildpack: ASSUMED_BUILDPACK_API,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleDescriptor {
    #[serde(rename = "lifecycle")]
    pub info: LifecycleInfo,
    #[serde(default)]
    pub api: LifecycleApis,
}

impl Default for LifecycleDescriptor {
    fn default() -> Self {
        Self {
            info: LifecycleInfo {
                version: ASSUMED_LIFECYCLE_VERSION,
            },
            api: LifecycleApis::default(),
        }
    }
}

impl LifecycleDescriptor {
    pub fn parse(raw: &str) -> PackResult<Self> {
        toml::from_str(raw)
            .map_err(|e| PackError::InvalidLifecycle(format!("decoding lifecycle.toml: {}", e)))
    }

    pub fn version(&self) -> &Version {
        &self.info.version
    }
}

/// A validated lifecycle bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    pub descriptor: LifecycleDescriptor,
    pub blob: Blob,
}

impl Lifecycle {
    /// Read the descriptor (or assume defaults) and check for binaries
    pub fn from_blob(blob: Blob) -> PackResult<Self> {
        let descriptor = match blob.read_file("lifecycle.toml")? {
            Some(raw) => {
                let raw = String::from_utf8(raw).map_err(|_| {
                    PackError::InvalidLifecycle("lifecycle.toml is not valid UTF-8".to_string())
                })?;
                LifecycleDescriptor::parse(&raw)?
            }
            None => LifecycleDescriptor::default(),
        };

        let found = binaries_in(&blob.entry_names()?);
        for required in REQUIRED_BINARIES {
            if !found.contains(required) {
                return Err(PackError::InvalidLifecycle(format!(
                    "missing required lifecycle binary {}",
                    required
                )));
            }
        }

        Ok(Self { descriptor, blob })
    }

    pub fn version(&self) -> &Version {
        self.descriptor.version()
    }
}

/// Name of the binary for entries exactly one directory deep
pub fn binary_name(entry: &str) -> Option<String> {
    let cleaned = clean_entry_name(entry);
    let mut parts = cleaned.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(dir), Some(name), None) if !dir.is_empty() && !name.is_empty() => {
            Some(name.to_string())
        }
        _ => None,
    }
}

fn binaries_in(entries: &[String]) -> BTreeSet<String> {
    entries.iter().filter_map(|e| binary_name(e)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn bundle(binaries: &[&str], descriptor: Option<&str>) -> (TempDir, Blob) {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("lifecycle")).unwrap();
        for bin in binaries {
            fs::write(temp.path().join("lifecycle").join(bin), "bin").unwrap();
        }
        if let Some(d) = descriptor {
            fs::write(temp.path().join("lifecycle.toml"), d).unwrap();
        }
        let blob = Blob::Dir(temp.path().to_path_buf());
        (temp, blob)
    }

    #[test]
    fn binary_name_matches_single_depth() {
        assert_eq!(binary_name("lifecycle/detector"), Some("detector".to_string()));
        assert_eq!(binary_name("./lifecycle/detector"), Some("detector".to_string()));
        assert_eq!(binary_name("detector"), None);
        assert_eq!(binary_name("a/b/detector"), None);
    }

    #[test]
    fn descriptor_parses() {
        let d = LifecycleDescriptor::parse(
            "[api]\nplatform = \"0.2\"\nbuildpack = \"0.2\"\n[lifecycle]\nversion = \"0.5.0\"\n",
        )
        .unwrap();
        assert_eq!(d.version(), &Version::new(0, 5, 0));
        assert_eq!(d.api.platform, ApiVersion::new(0, 2));
    }

    #[test]
    fn defaults_when_descriptor_missing() {
        let (_temp, blob) = bundle(&REQUIRED_BINARIES, None);
        let lifecycle = Lifecycle::from_blob(blob).unwrap();
        assert_eq!(lifecycle.version(), &Version::new(0, 3, 0));
        assert_eq!(lifecycle.descriptor.api.platform, ApiVersion::new(0, 1));
        assert_eq!(lifecycle.descriptor.api.buildpack, ApiVersion::new(0, 1));
    }

    #[test]
    fn missing_binary_is_invalid() {
        let without_exporter: Vec<&str> = REQUIRED_BINARIES
            .iter()
            .copied()
            .filter(|b| *b != "exporter")
            .collect();
        let (_temp, blob) = bundle(&without_exporter, Some("[lifecycle]\nversion = \"0.4.0\"\n"));
        let err = Lifecycle::from_blob(blob).unwrap_err();
        assert!(matches!(err, PackError::InvalidLifecycle(_)));
        assert_eq!(err.to_string(), "missing required lifecycle binary exporter");
    }
}
