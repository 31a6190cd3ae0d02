//! Layers a builder image is assembled from

use super::version_key;
use crate::archive::{self, Owner, DEFAULT_FILE_MODE};
use crate::dist::lifecycle::binary_name;
use crate::dist::order::{legacy_order_toml, order_toml, stack_toml};
use crate::dist::{Buildpack, Lifecycle, OrderGroup, StackMetadata};
use crate::error::PackResult;
use crate::layer::{Layer, LayerStore};
use crate::lifecycle::paths;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

pub(super) const DIR_MODE: u32 = 0o755;
const BINARY_MODE: u32 = 0o755;

pub(super) const PLATFORM_ENV_DIR: &str = "/platform/env";
pub(super) const LEGACY_LIFECYCLE_DIR: &str = "/lifecycle";
pub(super) const LEGACY_BUILDPACKS_DIR: &str = "/buildpacks";
const LEGACY_ORDER_PATH: &str = "/buildpacks/order.toml";
const LEGACY_STACK_PATH: &str = "/buildpacks/stack.toml";

fn file_layer(store: &LayerStore, id: &str, path: &str, content: &str) -> PackResult<Layer> {
    store.create_layer_with(id, |tar| {
        archive::add_parent_dirs(tar, path, Owner::ROOT, DIR_MODE)?;
        archive::add_file(tar, path, content.as_bytes(), Owner::ROOT, DEFAULT_FILE_MODE)
    })
}

/// App and layers dirs owned by the build user, the rest by root
pub(super) fn default_dirs(store: &LayerStore, owner: Owner) -> PackResult<Layer> {
    store.create_layer_with("dirs", |tar| {
        archive::add_dir(tar, paths::APP_DIR, owner, DIR_MODE)?;
        archive::add_dir(tar, paths::LAYERS_DIR, owner, DIR_MODE)?;
        for dir in [
            paths::CNB_DIR,
            paths::BUILDPACKS_DIR,
            paths::PLATFORM_DIR,
            PLATFORM_ENV_DIR,
        ] {
            archive::add_dir(tar, dir, Owner::ROOT, DIR_MODE)?;
        }
        Ok(())
    })
}

/// One file per variable under `/platform/env`
pub(super) fn env(store: &LayerStore, env: &BTreeMap<String, String>) -> PackResult<Layer> {
    store.create_layer_with("env", |tar| {
        archive::add_dir(tar, paths::PLATFORM_DIR, Owner::ROOT, DIR_MODE)?;
        archive::add_dir(tar, PLATFORM_ENV_DIR, Owner::ROOT, DIR_MODE)?;
        for (key, value) in env {
            let path = format!("{}/{}", PLATFORM_ENV_DIR, key);
            archive::add_file(tar, &path, value.as_bytes(), Owner::ROOT, DEFAULT_FILE_MODE)?;
        }
        Ok(())
    })
}

/// Lifecycle binaries under `/cnb/lifecycle`, linked from `/lifecycle`
pub(super) fn lifecycle(store: &LayerStore, lifecycle: &Lifecycle) -> PackResult<Layer> {
    store.create_layer_with("lifecycle", |tar| {
        archive::add_dir(tar, paths::CNB_DIR, Owner::ROOT, DIR_MODE)?;
        archive::add_dir(tar, paths::LIFECYCLE_DIR, Owner::ROOT, DIR_MODE)?;
        lifecycle
            .blob
            .copy_entries(tar, Owner::ROOT, Some(BINARY_MODE), |name| {
                binary_name(name).map(|bin| format!("{}/{}", paths::LIFECYCLE_DIR, bin))
            })?;
        archive::add_symlink(tar, LEGACY_LIFECYCLE_DIR, paths::LIFECYCLE_DIR, Owner::ROOT)
    })
}

pub(super) fn buildpack_dir(bp: &Buildpack) -> String {
    format!("{}/{}/{}", paths::BUILDPACKS_DIR, bp.escaped_id(), bp.version())
}

/// Buildpack content re-rooted at `/cnb/buildpacks/<id>/<version>`
pub(super) fn buildpack(store: &LayerStore, bp: &Buildpack, owner: Owner) -> PackResult<Layer> {
    let base = buildpack_dir(bp);
    let id = format!("buildpack.{}.{}", bp.escaped_id(), bp.version());
    store.create_layer_with(&id, |tar| {
        archive::add_parent_dirs(tar, &base, Owner::ROOT, DIR_MODE)?;
        archive::add_dir(tar, &base, Owner::ROOT, DIR_MODE)?;
        bp.blob.write_to_tar(tar, &base, owner, None)
    })
}

pub(super) fn order(store: &LayerStore, order: &[OrderGroup]) -> PackResult<Layer> {
    file_layer(store, "order", paths::ORDER_PATH, &order_toml(order)?)
}

pub(super) fn stack(store: &LayerStore, stack: &StackMetadata) -> PackResult<Layer> {
    let content = stack_toml(&stack.run_image.image, &stack.run_image.mirrors)?;
    file_layer(store, "stack", paths::STACK_PATH, &content)
}

/// What the pre-0.4.0 layout needs besides the current one
pub(super) struct Compat<'a> {
    pub buildpacks: &'a [Buildpack],
    /// Highest version per buildpack id
    pub latest: &'a BTreeMap<String, String>,
    pub stack: &'a StackMetadata,
    /// Written when the order was replaced
    pub order: Option<&'a [OrderGroup]>,
}

/// `/buildpacks` links, a `latest` link per id, legacy stack and order files
pub(super) fn compat(store: &LayerStore, compat: &Compat<'_>) -> PackResult<Layer> {
    let mut by_id: BTreeMap<String, Vec<&Buildpack>> = BTreeMap::new();
    for bp in compat.buildpacks {
        by_id.entry(bp.escaped_id()).or_default().push(bp);
    }
    for bps in by_id.values_mut() {
        bps.sort_by(|a, b| version_key(a.version()).cmp(&version_key(b.version())));
    }

    store.create_layer_with("compat", |tar| {
        archive::add_dir(tar, LEGACY_BUILDPACKS_DIR, Owner::ROOT, DIR_MODE)?;
        for (escaped, bps) in &by_id {
            let dir = format!("{}/{}", LEGACY_BUILDPACKS_DIR, escaped);
            archive::add_dir(tar, &dir, Owner::ROOT, DIR_MODE)?;
            for bp in bps {
                let target = buildpack_dir(bp);
                archive::add_symlink(tar, &format!("{}/{}", dir, bp.version()), &target, Owner::ROOT)?;
                if compat.latest.get(bp.id()).map(String::as_str) == Some(bp.version()) {
                    archive::add_symlink(tar, &format!("{}/latest", dir), &target, Owner::ROOT)?;
                }
            }
        }

        let stack = stack_toml(&compat.stack.run_image.image, &compat.stack.run_image.mirrors)?;
        archive::add_file(tar, LEGACY_STACK_PATH, stack.as_bytes(), Owner::ROOT, DEFAULT_FILE_MODE)?;
        if let Some(order) = compat.order {
            let order = legacy_order_toml(order)?;
            archive::add_file(tar, LEGACY_ORDER_PATH, order.as_bytes(), Owner::ROOT, DEFAULT_FILE_MODE)?;
        }
        Ok(())
    })
}

/// Drop layers whose diffID was already emitted, keeping the first
pub(super) fn unique(layers: Vec<Layer>) -> Vec<Layer> {
    let mut seen = HashSet::new();
    layers
        .into_iter()
        .filter(|layer| {
            let first = seen.insert(layer.diff_id.clone());
            if !first {
                debug!("Skipping duplicate layer {}", layer.diff_id);
            }
            first
        })
        .collect()
}

/// Raw entry names of a layer tar
#[cfg(test)]
pub(super) fn entry_names(layer: &Layer) -> Vec<String> {
    let mut archive = archive::open_archive(&layer.path).unwrap();
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::{Blob, OrderEntry, StackRunImage};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sample_buildpack(root: &TempDir, id: &str, version: &str) -> Buildpack {
        let dir = root.path().join(format!("{}-{}", id, version));
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(
            dir.join("buildpack.toml"),
            format!(
                "[buildpack]\nid = \"{}\"\nversion = \"{}\"\n[[stacks]]\nid = \"stacks.bionic\"\n",
                id, version
            ),
        )
        .unwrap();
        fs::write(dir.join("bin/build"), "#!/bin/sh").unwrap();
        Buildpack::from_blob(Blob::Dir(dir)).unwrap()
    }

    fn sample_stack() -> StackMetadata {
        StackMetadata {
            run_image: StackRunImage {
                image: "cnb/run".to_string(),
                mirrors: vec!["gcr.io/cnb/run".to_string()],
            },
        }
    }

    fn store(temp: &TempDir) -> LayerStore {
        LayerStore::new(temp.path().join("layers")).unwrap()
    }

    #[test]
    fn default_dirs_ownership() {
        let temp = TempDir::new().unwrap();
        let layer = default_dirs(&store(&temp), Owner::new(1000, 1001)).unwrap();
        let mut archive = archive::open_archive(&layer.path).unwrap();
        let owners: Vec<(String, u64)> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().into_owned(),
                    e.header().uid().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            owners,
            vec![
                ("workspace/".to_string(), 1000),
                ("layers/".to_string(), 1000),
                ("cnb/".to_string(), 0),
                ("cnb/buildpacks/".to_string(), 0),
                ("platform/".to_string(), 0),
                ("platform/env/".to_string(), 0),
            ]
        );
    }

    #[test]
    fn env_files() {
        let temp = TempDir::new().unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("KEY".to_string(), "value".to_string());
        let layer = env(&store(&temp), &vars).unwrap();
        assert_eq!(
            entry_names(&layer),
            vec!["platform/", "platform/env/", "platform/env/KEY"]
        );
        let (_, content) = archive::read_tar_entry(&layer.path, &["platform/env/KEY"]).unwrap();
        assert_eq!(content, b"value");
    }

    #[test]
    fn buildpack_is_rerooted() {
        let temp = TempDir::new().unwrap();
        let bp = sample_buildpack(&temp, "org/bp", "1.0");
        let layer = buildpack_layer(&temp, &bp);
        assert_eq!(
            entry_names(&layer),
            vec![
                "cnb/",
                "cnb/buildpacks/",
                "cnb/buildpacks/org_bp/",
                "cnb/buildpacks/org_bp/1.0/",
                "cnb/buildpacks/org_bp/1.0/bin/",
                "cnb/buildpacks/org_bp/1.0/bin/build",
                "cnb/buildpacks/org_bp/1.0/buildpack.toml",
            ]
        );
    }

    fn buildpack_layer(temp: &TempDir, bp: &Buildpack) -> Layer {
        buildpack(&store(temp), bp, Owner::new(1000, 1000)).unwrap()
    }

    #[test]
    fn compat_links_and_legacy_files() {
        let temp = TempDir::new().unwrap();
        let bps = vec![
            sample_buildpack(&temp, "bp.one", "1.0"),
            sample_buildpack(&temp, "bp.one", "1.2"),
        ];
        let mut latest = BTreeMap::new();
        latest.insert("bp.one".to_string(), "1.2".to_string());
        let order = vec![OrderGroup {
            group: vec![OrderEntry::new("bp.one", "1.2")],
        }];
        let stack = sample_stack();
        let layer = compat(
            &store(&temp),
            &Compat {
                buildpacks: &bps,
                latest: &latest,
                stack: &stack,
                order: Some(&order),
            },
        )
        .unwrap();

        assert_eq!(
            entry_names(&layer),
            vec![
                "buildpacks/",
                "buildpacks/bp.one/",
                "buildpacks/bp.one/1.0",
                "buildpacks/bp.one/1.2",
                "buildpacks/bp.one/latest",
                "buildpacks/stack.toml",
                "buildpacks/order.toml",
            ]
        );
        let mut archive = archive::open_archive(&layer.path).unwrap();
        let latest_target = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().ends_with("latest"))
            .and_then(|e| e.link_name().unwrap().map(|p| p.into_owned()))
            .unwrap();
        assert_eq!(latest_target, PathBuf::from("/cnb/buildpacks/bp.one/1.2"));

        let (_, order) = archive::read_tar_entry(&layer.path, &["buildpacks/order.toml"]).unwrap();
        assert!(String::from_utf8(order).unwrap().contains("[[groups]]"));
    }

    #[test]
    fn compat_links_sorted_by_version() {
        let temp = TempDir::new().unwrap();
        let bps = vec![
            sample_buildpack(&temp, "bp.two", "1.0.0"),
            sample_buildpack(&temp, "bp.one", "1.10.0"),
            sample_buildpack(&temp, "bp.one", "1.2.0"),
        ];
        let mut latest = BTreeMap::new();
        latest.insert("bp.one".to_string(), "1.10.0".to_string());
        latest.insert("bp.two".to_string(), "1.0.0".to_string());
        let stack = sample_stack();
        let layer = compat(
            &store(&temp),
            &Compat {
                buildpacks: &bps,
                latest: &latest,
                stack: &stack,
                order: None,
            },
        )
        .unwrap();

        assert_eq!(
            entry_names(&layer),
            vec![
                "buildpacks/",
                "buildpacks/bp.one/",
                "buildpacks/bp.one/1.2.0",
                "buildpacks/bp.one/1.10.0",
                "buildpacks/bp.one/latest",
                "buildpacks/bp.two/",
                "buildpacks/bp.two/1.0.0",
                "buildpacks/bp.two/latest",
                "buildpacks/stack.toml",
            ]
        );
    }

    #[test]
    fn unique_keeps_first_occurrence() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let a = stack(&store, &sample_stack()).unwrap();
        let b = Layer {
            diff_id: a.diff_id.clone(),
            path: temp.path().join("other.tar"),
        };
        let c = order(&store, &[]).unwrap();
        let kept = unique(vec![a.clone(), b, c.clone()]);
        assert_eq!(kept, vec![a, c]);
    }
}
