//! `builder.toml`, the input of create-builder

use crate::dist::Order;
use crate::error::{PackError, PackResult};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackConfig {
    pub id: String,
    #[serde(default)]
    pub version: String,
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StackConfig {
    pub id: String,
    pub build_image: String,
    pub run_image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_image_mirrors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub version: String,
}

impl LifecycleConfig {
    /// The pinned version, if any
    pub fn parsed_version(&self) -> PackResult<Option<Version>> {
        if self.version.is_empty() {
            return Ok(None);
        }
        Version::parse(&self.version).map(Some).map_err(|e| {
            PackError::ConfigInvalid(format!(
                "lifecycle version '{}' is not a semantic version: {}",
                self.version, e
            ))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub buildpacks: Vec<BuildpackConfig>,
    #[serde(default)]
    pub order: Order,
    pub stack: StackConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl BuilderConfig {
    /// Required fields are present and versions parse
    pub fn validate(&self) -> PackResult<()> {
        let missing = |field: &str| {
            PackError::ConfigInvalid(format!("builder config is missing '{}'", field))
        };
        if self.stack.id.is_empty() {
            return Err(missing("stack.id"));
        }
        if self.stack.build_image.is_empty() {
            return Err(missing("stack.build-image"));
        }
        if self.stack.run_image.is_empty() {
            return Err(missing("stack.run-image"));
        }
        for bp in &self.buildpacks {
            if bp.uri.is_empty() {
                return Err(PackError::ConfigInvalid(format!(
                    "buildpack '{}' is missing 'uri'",
                    bp.id
                )));
            }
        }
        self.lifecycle.parsed_version()?;
        Ok(())
    }
}

/// Read a builder config, resolving relative URIs against its directory.
///
/// Returns warnings for obsolete fields and an empty order alongside.
pub fn read_config(path: &Path) -> PackResult<(BuilderConfig, Vec<String>)> {
    let raw = fs::read_to_string(path)
        .map_err(|e| PackError::io(format!("opening config file {}", path.display()), e))?;
    let parse_err = |reason: String| PackError::ConfigFile {
        path: path.to_path_buf(),
        reason,
    };

    let document: toml::Table = toml::from_str(&raw).map_err(|e| parse_err(e.to_string()))?;
    let mut warnings = obsolete_field_warnings(&document);

    let mut config: BuilderConfig = toml::from_str(&raw).map_err(|e| parse_err(e.to_string()))?;
    config.validate()?;

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let base = std::path::absolute(parent.unwrap_or(Path::new(".")))
        .map_err(|e| PackError::io(format!("resolving directory of {}", path.display()), e))?;
    for bp in &mut config.buildpacks {
        bp.uri = resolve_uri(&bp.uri, &base);
    }
    if !config.lifecycle.uri.is_empty() {
        config.lifecycle.uri = resolve_uri(&config.lifecycle.uri, &base);
    }

    if config.order.is_empty() {
        warnings.push("empty 'order' definition".to_string());
    }
    Ok((config, warnings))
}

fn obsolete_field_warnings(document: &toml::Table) -> Vec<String> {
    let mut warnings = Vec::new();
    let latest_used = document
        .get("buildpacks")
        .and_then(|v| v.as_array())
        .is_some_and(|bps| bps.iter().any(|bp| bp.get("latest").is_some()));
    if latest_used {
        warnings.push("'latest' field on a buildpack is obsolete and will be ignored".to_string());
    }
    if document.contains_key("groups") {
        warnings.push(
            "'groups' field is obsolete in favor of 'order' and will be ignored".to_string(),
        );
    }
    warnings
}

/// Relative paths become absolute under `base`; URIs with a scheme are kept
fn resolve_uri(uri: &str, base: &Path) -> String {
    if uri.contains("://") {
        return uri.to_string();
    }
    let path = Path::new(uri);
    if path.is_absolute() {
        uri.to_string()
    } else {
        base.join(path).to_string_lossy().into_owned()
    }
}
