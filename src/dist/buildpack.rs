//! Buildpack descriptors (`buildpack.toml`)

use crate::api::ApiVersion;
use crate::dist::blob::Blob;
use crate::dist::order::Order;
use crate::error::{PackError, PackResult};
use serde::{Deserialize, Serialize};

/// Buildpack API assumed when `buildpack.toml` does not declare one
pub const ASSUMED_BUILDPACK_API: ApiVersion = ApiVersion::new(0, 1);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackInfo {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mixins: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackDescriptor {
    #[serde(default = "assumed_api")]
    pub api: ApiVersion,
    pub buildpack: BuildpackInfo,
    #[serde(default)]
    pub stacks: Vec<Stack>,
    #[serde(default)]
    pub order: Order,
}

fn assumed_api() -> ApiVersion {
    ASSUMED_BUILDPACK_API
}

impl BuildpackDescriptor {
    /// Parse and validate `buildpack.toml` content
    pub fn parse(raw: &str) -> PackResult<Self> {
        let descriptor: Self = toml::from_str(raw)
            .map_err(|e| PackError::InvalidBuildpack(format!("decoding buildpack.toml: {}", e)))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// A buildpack declares stacks or an order, never both or neither
    pub fn validate(&self) -> PackResult<()> {
        if self.buildpack.id.is_empty() {
            return Err(PackError::InvalidBuildpack(
                "buildpack.toml is missing buildpack.id".to_string(),
            ));
        }
        match (self.stacks.is_empty(), self.order.is_empty()) {
            (true, true) => Err(PackError::InvalidBuildpack(format!(
                "buildpack '{}' must have either stacks or an order defined",
                self.full_name()
            ))),
            (false, false) => Err(PackError::InvalidBuildpack(format!(
                "buildpack '{}' cannot have both stacks and an order defined",
                self.full_name()
            ))),
            _ => Ok(()),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}@{}", self.buildpack.id, self.buildpack.version)
    }

    pub fn escaped_id(&self) -> String {
        escape_id(&self.buildpack.id)
    }

    /// Order buildpacks defer stack checks to the buildpacks they reference
    pub fn supports_stack(&self, stack_id: &str) -> bool {
        !self.order.is_empty() || self.stacks.iter().any(|s| s.id == stack_id)
    }
}

/// `/` becomes `_` so ids can be used as a single path segment
pub fn escape_id(id: &str) -> String {
    id.replace('/', "_")
}

/// A buildpack descriptor together with the blob it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buildpack {
    pub descriptor: BuildpackDescriptor,
    pub blob: Blob,
}

impl Buildpack {
    /// Read `buildpack.toml` from the root of `blob`
    pub fn from_blob(blob: Blob) -> PackResult<Self> {
        let raw = blob.read_file("buildpack.toml")?.ok_or_else(|| {
            PackError::InvalidBuildpack(format!(
                "could not find buildpack.toml in {}",
                blob.path().display()
            ))
        })?;
        let raw = String::from_utf8(raw).map_err(|_| {
            PackError::InvalidBuildpack(format!(
                "buildpack.toml in {} is not valid UTF-8",
                blob.path().display()
            ))
        })?;
        let descriptor = BuildpackDescriptor::parse(&raw)?;
        Ok(Self { descriptor, blob })
    }

    pub fn id(&self) -> &str {
        &self.descriptor.buildpack.id
    }

    pub fn version(&self) -> &str {
        &self.descriptor.buildpack.version
    }

    pub fn escaped_id(&self) -> String {
        self.descriptor.escaped_id()
    }
}
