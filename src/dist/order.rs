//! Detection order and stack files
//!
//! `order.toml` is written in two schemas: the current `[[order]]
//! [[order.group]]` one and the legacy `[[groups]] [[groups.buildpacks]]`
//! one consumed by lifecycles older than 0.4.0.

use crate::dist::metadata::StackRunImage;
use crate::error::PackResult;
use serde::{Deserialize, Serialize};

fn is_false(b: &bool) -> bool {
    !*b
}

/// Reference to a buildpack inside an order group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
}

impl OrderEntry {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            optional: false,
        }
    }

    /// `id@version`, or the bare id when no version is pinned
    pub fn full_name(&self) -> String {
        if self.version.is_empty() {
            self.id.clone()
        } else {
            format!("{}@{}", self.id, self.version)
        }
    }
}

/// An ordered set of buildpacks that detect together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderGroup {
    #[serde(default)]
    pub group: Vec<OrderEntry>,
}

pub type Order = Vec<OrderGroup>;

#[derive(Serialize, Deserialize)]
struct OrderToml {
    #[serde(default)]
    order: Order,
}

#[derive(Serialize, Deserialize)]
struct LegacyGroup {
    #[serde(default)]
    buildpacks: Vec<OrderEntry>,
}

#[derive(Serialize, Deserialize)]
struct LegacyOrderToml {
    #[serde(default)]
    groups: Vec<LegacyGroup>,
}

/// Render `order.toml` in the current schema
pub fn order_toml(order: &[OrderGroup]) -> PackResult<String> {
    Ok(toml::to_string(&OrderToml {
        order: order.to_vec(),
    })?)
}

/// Render `order.toml` in the pre-0.4.0 schema
pub fn legacy_order_toml(order: &[OrderGroup]) -> PackResult<String> {
    let groups = order
        .iter()
        .map(|g| LegacyGroup {
            buildpacks: g.group.clone(),
        })
        .collect();
    Ok(toml::to_string(&LegacyOrderToml { groups })?)
}

/// Parse either schema
pub fn parse_order_toml(raw: &str) -> PackResult<Order> {
    let current: OrderToml = toml::from_str(raw)?;
    if !current.order.is_empty() {
        return Ok(current.order);
    }
    let legacy: LegacyOrderToml = toml::from_str(raw)?;
    Ok(legacy
        .groups
        .into_iter()
        .map(|g| OrderGroup { group: g.buildpacks })
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackToml {
    #[serde(rename = "run-image", default)]
    pub run_image: StackRunImage,
}

/// Render `stack.toml` for a run image and its mirrors
pub fn stack_toml(run_image: &str, mirrors: &[String]) -> PackResult<String> {
    Ok(toml::to_string(&StackToml {
        run_image: StackRunImage {
            image: run_image.to_string(),
            mirrors: mirrors.to_vec(),
        },
    })?)
}
