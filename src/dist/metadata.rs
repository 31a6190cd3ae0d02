//! JSON metadata carried in image labels

use crate::api::ApiVersion;
use crate::dist::order::OrderGroup;
use crate::error::{PackError, PackResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn is_false(b: &bool) -> bool {
    !*b
}

/// Per-buildpack, per-layer metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadata {
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub build: bool,
    #[serde(default)]
    pub launch: bool,
    #[serde(default)]
    pub cache: bool,
}

/// Layers contributed by one buildpack
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackLayersMetadata {
    #[serde(rename = "key", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub layers: BTreeMap<String, LayerMetadata>,
}

/// A layer referenced only by its diffID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaRef {
    #[serde(default)]
    pub sha: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunImageMetadata {
    #[serde(default)]
    pub top_layer: String,
    /// Image id (daemon) or digest (registry) of the base actually used
    #[serde(default, alias = "sha")]
    pub reference: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRunImage {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackMetadata {
    #[serde(default)]
    pub run_image: StackRunImage,
}

/// Value of the `io.buildpacks.lifecycle.metadata` label
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayersMetadata {
    #[serde(default)]
    pub app: ShaRef,
    #[serde(default)]
    pub config: ShaRef,
    #[serde(default)]
    pub launcher: ShaRef,
    #[serde(default)]
    pub buildpacks: Vec<BuildpackLayersMetadata>,
    #[serde(default)]
    pub run_image: RunImageMetadata,
    #[serde(default)]
    pub stack: StackMetadata,
}

impl LayersMetadata {
    /// Decode a label value; an empty label yields empty metadata
    pub fn from_label(raw: &str) -> PackResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_label(&self) -> PackResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Layers recorded for `id`, empty when the buildpack is unknown
    pub fn for_buildpack(&self, id: &str) -> BuildpackLayersMetadata {
        self.buildpacks
            .iter()
            .find(|bp| bp.id == id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every diffID this metadata points at, app layers first
    pub fn layer_shas(&self) -> Vec<String> {
        let mut shas = vec![
            self.app.sha.clone(),
            self.config.sha.clone(),
            self.launcher.sha.clone(),
        ];
        for bp in &self.buildpacks {
            shas.extend(bp.layers.values().map(|l| l.sha.clone()));
        }
        shas.retain(|s| !s.is_empty());
        shas
    }
}

/// Value of the cache metadata label or file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    #[serde(default)]
    pub buildpacks: Vec<BuildpackLayersMetadata>,
}

impl CacheMetadata {
    pub fn for_buildpack(&self, id: &str) -> BuildpackLayersMetadata {
        self.buildpacks
            .iter()
            .find(|bp| bp.id == id)
            .cloned()
            .unwrap_or_default()
    }

    /// Decode leniently; corrupt metadata is treated as absent
    pub fn from_label_lenient(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackRef {
    pub id: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub commit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherSource {
    #[serde(default)]
    pub git: GitSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherBuildMetadata {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub source: LauncherSource,
}

/// Value of the `io.buildpacks.build.metadata` label
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildMetadata {
    #[serde(default)]
    pub bom: serde_json::Value,
    #[serde(default)]
    pub buildpacks: Vec<BuildpackRef>,
    #[serde(default)]
    pub launcher: LauncherBuildMetadata,
}

impl BuildMetadata {
    pub fn from_label(raw: &str) -> PackResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }
}

/// A buildpack as listed in builder metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderBuildpackMetadata {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub latest: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleApiMetadata {
    pub buildpack: ApiVersion,
    pub platform: ApiVersion,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleMetadata {
    pub version: String,
    #[serde(default)]
    pub api: LifecycleApiMetadata,
}

/// Value of the `io.buildpacks.builder.metadata` label
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub buildpacks: Vec<BuilderBuildpackMetadata>,
    #[serde(default, alias = "groups")]
    pub order: Vec<OrderGroup>,
    #[serde(default)]
    pub stack: StackMetadata,
    #[serde(default)]
    pub lifecycle: LifecycleMetadata,
}

impl BuilderMetadata {
    pub fn from_label(raw: &str) -> PackResult<Self> {
        if raw.trim().is_empty() {
            return Err(PackError::ConfigInvalid(
                "builder image has no io.buildpacks.builder.metadata label".to_string(),
            ));
        }
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn layers_metadata_label_shape() {
        let mut layers = BTreeMap::new();
        layers.insert(
            "deps".to_string(),
            LayerMetadata {
                sha: "sha256:abc".to_string(),
                data: json!({"lang": "go"}),
                launch: true,
                cache: true,
                build: false,
            },
        );
        let md = LayersMetadata {
            app: ShaRef { sha: "sha256:app".into() },
            buildpacks: vec![BuildpackLayersMetadata {
                id: "bp.one".into(),
                version: "1.0".into(),
                layers,
            }],
            run_image: RunImageMetadata {
                top_layer: "sha256:top".into(),
                reference: "sha256:id".into(),
            },
            ..Default::default()
        };

        let value: serde_json::Value = serde_json::from_str(&md.to_label().unwrap()).unwrap();
        assert_eq!(value["buildpacks"][0]["key"], "bp.one");
        assert_eq!(value["buildpacks"][0]["layers"]["deps"]["data"]["lang"], "go");
        assert_eq!(value["runImage"]["topLayer"], "sha256:top");
        assert_eq!(value["runImage"]["reference"], "sha256:id");
    }

    #[test]
    fn empty_label_is_default() {
        assert_eq!(LayersMetadata::from_label("").unwrap(), LayersMetadata::default());
        assert!(LayersMetadata::from_label("{not json").is_err());
    }

    #[test]
    fn cache_metadata_lenient() {
        assert_eq!(CacheMetadata::from_label_lenient("garbage"), CacheMetadata::default());
    }

    #[test]
    fn for_buildpack_defaults_when_missing() {
        let md = LayersMetadata::default();
        assert!(md.for_buildpack("nope").layers.is_empty());
    }

    fn arb_layer() -> impl Strategy<Value = LayerMetadata> {
        (
            "[a-f0-9]{0,16}",
            proptest::option::of("[a-z]{1,6}"),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(sha, data, build, launch, cache)| LayerMetadata {
                sha,
                data: data.map(|d| json!({ "v": d })).unwrap_or(serde_json::Value::Null),
                build,
                launch,
                cache,
            })
    }

    fn arb_metadata() -> impl Strategy<Value = LayersMetadata> {
        let bp = (
            "[a-z.]{1,10}",
            "[0-9.]{1,5}",
            proptest::collection::btree_map("[a-z]{1,6}", arb_layer(), 0..4),
        )
            .prop_map(|(id, version, layers)| BuildpackLayersMetadata { id, version, layers });
        (
            proptest::collection::vec(bp, 0..4),
            "[a-f0-9]{0,12}",
            "[a-z:/]{0,12}",
            proptest::collection::vec("[a-z]{1,8}", 0..3),
        )
            .prop_map(|(buildpacks, top, image, mirrors)| LayersMetadata {
                app: ShaRef { sha: format!("sha256:{}", top) },
                buildpacks,
                run_image: RunImageMetadata {
                    top_layer: top.clone(),
                    reference: top,
                },
                stack: StackMetadata {
                    run_image: StackRunImage { image, mirrors },
                },
                ..Default::default()
            })
    }

    proptest! {
        #[test]
        fn layers_metadata_roundtrips(md in arb_metadata()) {
            let label = md.to_label().unwrap();
            prop_assert_eq!(LayersMetadata::from_label(&label).unwrap(), md);
        }
    }
}
