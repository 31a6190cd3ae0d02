//! Image handles
//!
//! An [`Image`] is a mutable view of an image config plus its ordered
//! layers, identified by diffID. Edits stay local until [`Image::save`].
//! [`ImageFetcher`] opens existing images and starts new ones.

pub mod fake;
mod local;

pub use local::{DaemonFetcher, LocalImage};

use crate::auth::ImageRef;
use crate::dist::{labels, StackRunImage};
use crate::error::{PackError, PackResult};
use crate::layer::diff_id_of_file;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait Image: Send + Sync {
    fn name(&self) -> &str;

    fn rename(&mut self, name: &str);

    /// Whether the image existed when the handle was opened
    fn found(&self) -> bool;

    fn label(&self, key: &str) -> Option<String>;

    fn env(&self, key: &str) -> Option<String>;

    /// Image id for daemon images, digest for registry images
    fn identifier(&self) -> PackResult<String>;

    /// diffIDs bottom to top
    fn diff_ids(&self) -> Vec<String>;

    fn top_layer(&self) -> PackResult<String> {
        self.diff_ids()
            .last()
            .cloned()
            .ok_or_else(|| PackError::NotFound(format!("layers of image '{}'", self.name())))
    }

    fn set_label(&mut self, key: &str, value: &str);

    fn set_env(&mut self, key: &str, value: &str);

    fn set_working_dir(&mut self, dir: &str);

    fn set_entrypoint(&mut self, entrypoint: &[String]);

    /// An empty `cmd` clears it
    fn set_cmd(&mut self, cmd: &[String]);

    /// Append a layer tar, hashing it to find its diffID
    fn add_layer(&mut self, path: &Path) -> PackResult<String> {
        let diff_id = diff_id_of_file(path)?;
        self.add_layer_with_diff_id(path, &diff_id)?;
        Ok(diff_id)
    }

    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> PackResult<()>;

    /// Append a layer of the image previously saved under this name
    async fn reuse_layer(&mut self, diff_id: &str) -> PackResult<()>;

    /// Path to the uncompressed tar of a layer of this image
    async fn get_layer(&mut self, diff_id: &str) -> PackResult<PathBuf>;

    /// Replace every layer up to and including `base_top_layer` with the
    /// layers of `new_base`
    async fn rebase(&mut self, base_top_layer: &str, new_base: &dyn Image) -> PackResult<()>;

    /// Persist under the image name and `additional_names`, returning the id
    async fn save(&mut self, additional_names: &[String]) -> PackResult<String>;

    async fn delete(&mut self) -> PackResult<()>;
}

/// Opens and creates images
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Open an existing image, failing with `ImageNotFound` when absent.
    ///
    /// `daemon = false` means the registry copy; `pull` refreshes a daemon copy.
    async fn fetch(&self, name: &str, daemon: bool, pull: bool) -> PackResult<Box<dyn Image>>;

    /// Open an image that may not exist yet
    async fn open(&self, name: &str, daemon: bool) -> PackResult<Box<dyn Image>>;

    /// Start a new image named `name` from the saved state of `base`
    async fn new_image(
        &self,
        name: &str,
        base: Option<&str>,
        daemon: bool,
    ) -> PackResult<Box<dyn Image>>;
}

/// Value of the stack label, empty when unset
pub fn stack_id(image: &dyn Image) -> String {
    image.label(labels::STACK_ID).unwrap_or_default()
}

/// Run image for `target`: the first of the user's mirrors, the stack run
/// image and its mirrors that lives on the target's registry, falling back
/// to the stack run image
pub fn select_run_image(target: &str, stack: &StackRunImage, user_mirrors: &[String]) -> String {
    let registry = match ImageRef::parse(target) {
        Ok(reference) => reference.registry,
        Err(_) => return stack.image.clone(),
    };
    user_mirrors
        .iter()
        .chain(std::iter::once(&stack.image))
        .chain(stack.mirrors.iter())
        .find(|candidate| {
            ImageRef::parse(candidate).is_ok_and(|r| r.registry == registry)
        })
        .cloned()
        .unwrap_or_else(|| stack.image.clone())
}

/// Layer index of `diff_id`, searching from the bottom.
///
/// Base layers always sit at the bottom, and an app layer may share a diffID
/// with the base top layer (two empty tars), so the first match is the base.
pub(crate) fn layer_index(diff_ids: &[String], diff_id: &str) -> Option<usize> {
    diff_ids.iter().position(|d| d == diff_id)
}

/// Layers strictly above `base_top_layer`
pub(crate) fn layers_above(diff_ids: &[String], base_top_layer: &str) -> PackResult<Vec<String>> {
    let index = layer_index(diff_ids, base_top_layer).ok_or_else(|| {
        PackError::NotFound(format!("base top layer {} in image layers", base_top_layer))
    })?;
    Ok(diff_ids[index + 1..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn run_image_follows_target_registry() {
        let stack = StackRunImage {
            image: "cnb/run".to_string(),
            mirrors: vec!["gcr.io/cnb/run".to_string(), "quay.io/cnb/run".to_string()],
        };
        let user = ids(&["quay.io/me/run"]);

        assert_eq!(select_run_image("gcr.io/me/app", &stack, &user), "gcr.io/cnb/run");
        assert_eq!(select_run_image("quay.io/me/app", &stack, &user), "quay.io/me/run");
        assert_eq!(select_run_image("my/app", &stack, &user), "cnb/run");
        assert_eq!(select_run_image("registry.local:5000/app", &stack, &[]), "cnb/run");
    }

    #[test]
    fn layers_above_top() {
        let layers = ids(&["base1", "base2", "app", "deps"]);
        assert_eq!(layers_above(&layers, "base2").unwrap(), ids(&["app", "deps"]));
        assert!(layers_above(&layers, "deps").unwrap().is_empty());
        assert!(matches!(
            layers_above(&layers, "other"),
            Err(PackError::NotFound(_))
        ));
    }

    #[test]
    fn repeated_top_layer_matches_lowest() {
        let layers = ids(&["base1", "empty", "app", "empty", "launcher"]);
        assert_eq!(layer_index(&layers, "empty"), Some(1));
        assert_eq!(
            layers_above(&layers, "empty").unwrap(),
            ids(&["app", "empty", "launcher"])
        );
    }
}
