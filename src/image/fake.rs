//! In-memory image store for tests
//!
//! Saved images live in a shared map keyed by name. Layer bytes are kept in
//! a temporary directory keyed by diffID, so any image in the store can hand
//! out any layer it references.

use super::{layers_above, Image, ImageFetcher};
use crate::error::{PackError, PackResult};
use crate::layer::{diff_id_of_bytes, digest_hex};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;

/// Persisted state of a fake image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeImageState {
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub layers: Vec<String>,
    /// Layers appended with new bytes in the save that produced this state
    pub added_layers: Vec<String>,
    /// Layers carried over from the previous image in that save
    pub reused_layers: Vec<String>,
}

impl FakeImageState {
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_layers(mut self, layers: &[String]) -> Self {
        self.layers = layers.to_vec();
        self
    }
}

#[derive(Debug)]
struct StoreInner {
    images: BTreeMap<String, FakeImageState>,
    deleted: Vec<String>,
    saves: usize,
}

/// Shared image store; clones see the same images
#[derive(Debug, Clone)]
pub struct FakeImageStore {
    inner: Arc<Mutex<StoreInner>>,
    blobs: Arc<TempDir>,
}

impl FakeImageStore {
    pub fn new() -> PackResult<Self> {
        let blobs = TempDir::new().map_err(|e| PackError::io("creating fake blob dir", e))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                images: BTreeMap::new(),
                deleted: Vec::new(),
                saves: 0,
            })),
            blobs: Arc::new(blobs),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn blob_path(&self, diff_id: &str) -> PathBuf {
        self.blobs.path().join(format!("{}.tar", digest_hex(diff_id)))
    }

    /// Store layer bytes and return their diffID
    pub fn add_blob(&self, bytes: &[u8]) -> PackResult<String> {
        let diff_id = diff_id_of_bytes(bytes);
        let path = self.blob_path(&diff_id);
        fs::write(&path, bytes).map_err(|e| PackError::io(format!("writing {}", path.display()), e))?;
        Ok(diff_id)
    }

    fn add_blob_file(&self, path: &Path, diff_id: &str) -> PackResult<()> {
        let dest = self.blob_path(diff_id);
        fs::copy(path, &dest).map_err(|e| PackError::io(format!("copying {}", path.display()), e))?;
        Ok(())
    }

    /// Put an image into the store as if it had been saved
    pub fn insert(&self, name: &str, mut state: FakeImageState) {
        if state.id.is_empty() {
            state.id = fake_id(name, &state);
        }
        self.lock().images.insert(name.to_string(), state);
    }

    pub fn get(&self, name: &str) -> Option<FakeImageState> {
        self.lock().images.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().images.keys().cloned().collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    /// Number of `save` calls so far
    pub fn save_count(&self) -> usize {
        self.lock().saves
    }

    /// Bytes of a stored layer
    pub fn layer_bytes(&self, diff_id: &str) -> PackResult<Vec<u8>> {
        let path = self.blob_path(diff_id);
        fs::read(&path).map_err(|e| PackError::io(format!("reading layer {}", diff_id), e))
    }

    fn handle(&self, name: &str, state: Option<FakeImageState>) -> FakeImage {
        FakeImage {
            store: self.clone(),
            name: name.to_string(),
            found: state.is_some(),
            prev: self.get(name),
            state: state.unwrap_or_default(),
            added: Vec::new(),
            reused: Vec::new(),
        }
    }
}

fn fake_id(name: &str, state: &FakeImageState) -> String {
    diff_id_of_bytes(
        format!(
            "{}|{:?}|{:?}|{:?}|{:?}|{:?}",
            name, state.labels, state.env, state.entrypoint, state.cmd, state.layers
        )
        .as_bytes(),
    )
}

#[async_trait]
impl ImageFetcher for FakeImageStore {
    async fn fetch(&self, name: &str, _daemon: bool, _pull: bool) -> PackResult<Box<dyn Image>> {
        let state = self
            .get(name)
            .ok_or_else(|| PackError::ImageNotFound(name.to_string()))?;
        Ok(Box::new(self.handle(name, Some(state))))
    }

    async fn open(&self, name: &str, _daemon: bool) -> PackResult<Box<dyn Image>> {
        let state = self.get(name);
        Ok(Box::new(self.handle(name, state)))
    }

    async fn new_image(
        &self,
        name: &str,
        base: Option<&str>,
        _daemon: bool,
    ) -> PackResult<Box<dyn Image>> {
        let mut state = match base {
            Some(base) => self
                .get(base)
                .ok_or_else(|| PackError::ImageNotFound(base.to_string()))?,
            None => FakeImageState::default(),
        };
        state.id.clear();
        state.added_layers.clear();
        state.reused_layers.clear();
        let mut image = self.handle(name, None);
        image.state = state;
        Ok(Box::new(image))
    }
}

/// Handle onto a [`FakeImageStore`] image
#[derive(Debug)]
pub struct FakeImage {
    store: FakeImageStore,
    name: String,
    found: bool,
    state: FakeImageState,
    prev: Option<FakeImageState>,
    added: Vec<String>,
    reused: Vec<String>,
}

impl FakeImage {
    pub fn state(&self) -> &FakeImageState {
        &self.state
    }
}

#[async_trait]
impl Image for FakeImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn found(&self) -> bool {
        self.found
    }

    fn label(&self, key: &str) -> Option<String> {
        self.state.labels.get(key).cloned()
    }

    fn env(&self, key: &str) -> Option<String> {
        self.state.env.get(key).cloned()
    }

    fn identifier(&self) -> PackResult<String> {
        if self.state.id.is_empty() {
            Err(PackError::NotFound(format!("id of unsaved image '{}'", self.name)))
        } else {
            Ok(self.state.id.clone())
        }
    }

    fn diff_ids(&self) -> Vec<String> {
        self.state.layers.clone()
    }

    fn set_label(&mut self, key: &str, value: &str) {
        self.state.labels.insert(key.to_string(), value.to_string());
    }

    fn set_env(&mut self, key: &str, value: &str) {
        self.state.env.insert(key.to_string(), value.to_string());
    }

    fn set_working_dir(&mut self, dir: &str) {
        self.state.working_dir = dir.to_string();
    }

    fn set_entrypoint(&mut self, entrypoint: &[String]) {
        self.state.entrypoint = entrypoint.to_vec();
    }

    fn set_cmd(&mut self, cmd: &[String]) {
        self.state.cmd = cmd.to_vec();
    }

    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> PackResult<()> {
        self.store.add_blob_file(path, diff_id)?;
        self.state.layers.push(diff_id.to_string());
        self.added.push(diff_id.to_string());
        Ok(())
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> PackResult<()> {
        let prev = self.prev.as_ref().ok_or_else(|| {
            PackError::NotFound(format!("previous image '{}' to reuse layers from", self.name))
        })?;
        if !prev.layers.iter().any(|l| l == diff_id) {
            return Err(PackError::NotFound(format!(
                "layer {} in previous image '{}'",
                diff_id, self.name
            )));
        }
        self.state.layers.push(diff_id.to_string());
        self.reused.push(diff_id.to_string());
        Ok(())
    }

    async fn get_layer(&mut self, diff_id: &str) -> PackResult<PathBuf> {
        if !self.state.layers.iter().any(|l| l == diff_id) {
            return Err(PackError::NotFound(format!(
                "layer {} in image '{}'",
                diff_id, self.name
            )));
        }
        let path = self.store.blob_path(diff_id);
        if path.exists() {
            Ok(path)
        } else {
            Err(PackError::NotFound(format!("contents of layer {}", diff_id)))
        }
    }

    async fn rebase(&mut self, base_top_layer: &str, new_base: &dyn Image) -> PackResult<()> {
        let kept = layers_above(&self.state.layers, base_top_layer)?;
        let mut layers = new_base.diff_ids();
        layers.extend(kept);
        self.state.layers = layers;
        Ok(())
    }

    async fn save(&mut self, additional_names: &[String]) -> PackResult<String> {
        let mut state = self.state.clone();
        state.added_layers = std::mem::take(&mut self.added);
        state.reused_layers = std::mem::take(&mut self.reused);
        state.id = fake_id(&self.name, &state);

        let mut inner = self.store.lock();
        inner.saves += 1;
        for name in std::iter::once(&self.name).chain(additional_names) {
            inner.images.insert(name.clone(), state.clone());
        }
        drop(inner);

        self.state = state;
        Ok(self.state.id.clone())
    }

    async fn delete(&mut self) -> PackResult<()> {
        let mut inner = self.store.lock();
        inner.images.remove(&self.name);
        inner.deleted.push(self.name.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_fetch() {
        let store = FakeImageStore::new().unwrap();
        let layer = store.add_blob(b"base").unwrap();
        store.insert(
            "run:A",
            FakeImageState::default()
                .with_label("io.buildpacks.stack.id", "stacks.bionic")
                .with_layers(&[layer.clone()]),
        );

        let mut image = store.new_image("app", Some("run:A"), true).await.unwrap();
        assert!(!image.found());
        image.set_label("custom", "yes");
        let id = image.save(&["app:v1".to_string()]).await.unwrap();

        let fetched = store.fetch("app:v1", true, false).await.unwrap();
        assert_eq!(fetched.identifier().unwrap(), id);
        assert_eq!(fetched.label("custom").as_deref(), Some("yes"));
        assert_eq!(fetched.label("io.buildpacks.stack.id").as_deref(), Some("stacks.bionic"));
        assert_eq!(fetched.top_layer().unwrap(), layer);
    }

    #[tokio::test]
    async fn reuse_requires_previous_layer() {
        let store = FakeImageStore::new().unwrap();
        let temp = TempDir::new().unwrap();
        let tar = temp.path().join("l.tar");
        fs::write(&tar, b"layer").unwrap();

        let mut first = store.open("app", true).await.unwrap();
        let diff_id = first.add_layer(&tar).unwrap();
        first.save(&[]).await.unwrap();

        let mut second = store.new_image("app", None, true).await.unwrap();
        second.reuse_layer(&diff_id).await.unwrap();
        assert!(second.reuse_layer("sha256:missing").await.is_err());
        second.save(&[]).await.unwrap();

        let saved = store.get("app").unwrap();
        assert_eq!(saved.reused_layers, vec![diff_id.clone()]);
        assert!(saved.added_layers.is_empty());
        assert_eq!(store.layer_bytes(&diff_id).unwrap(), b"layer");
    }

    #[tokio::test]
    async fn fetch_missing_is_image_not_found() {
        let store = FakeImageStore::new().unwrap();
        assert!(matches!(
            store.fetch("nope", true, false).await,
            Err(PackError::ImageNotFound(_))
        ));
    }
}
