//! Recording runtime for tests
//!
//! Every call is recorded so tests can assert on the containers, volumes
//! and copies a build produced. Phase behaviour (exit code, output, hanging)
//! is keyed by the lifecycle binary name, the basename of `cmd[0]`.

use super::{ContainerConfig, ContainerRuntime, HostConfig, ImageInspect};
use crate::error::{PackError, PackResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// A container created through the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeContainer {
    pub id: String,
    pub config: ContainerConfig,
    pub host: HostConfig,
    pub started: bool,
}

impl FakeContainer {
    /// Lifecycle binary the container runs
    pub fn phase(&self) -> String {
        phase_of(&self.config)
    }
}

/// A `copy_to_container` call with the names of the copied entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCopy {
    pub container: String,
    pub dest: String,
    pub entries: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: Vec<FakeContainer>,
    copies: Vec<FakeCopy>,
    volumes: BTreeSet<String>,
    created_volumes: Vec<String>,
    removed_volumes: Vec<String>,
    removed_containers: Vec<String>,
    killed: BTreeSet<String>,
    images: BTreeMap<String, ImageInspect>,
    pulled: Vec<String>,
    pushed: Vec<String>,
    removed_images: Vec<String>,
    loaded: Vec<PathBuf>,
    exit_codes: BTreeMap<String, i64>,
    output: BTreeMap<String, (String, String)>,
    hang: Option<String>,
}

/// In-memory [`ContainerRuntime`]
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    killed: Notify,
}

fn phase_of(config: &ContainerConfig) -> String {
    config
        .cmd
        .first()
        .and_then(|c| c.rsplit('/').next())
        .unwrap_or_default()
        .to_string()
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `phase` exit with `code`
    pub fn with_exit_code(self, phase: &str, code: i64) -> Self {
        self.state().exit_codes.insert(phase.to_string(), code);
        self
    }

    /// Make `phase` print the given output
    pub fn with_output(self, phase: &str, stdout: &str, stderr: &str) -> Self {
        self.state()
            .output
            .insert(phase.to_string(), (stdout.to_string(), stderr.to_string()));
        self
    }

    /// Make `phase` run until it is killed
    pub fn with_hanging_phase(self, phase: &str) -> Self {
        self.state().hang = Some(phase.to_string());
        self
    }

    /// Register an image as present locally
    pub fn with_image(self, reference: &str, inspect: ImageInspect) -> Self {
        self.state().images.insert(reference.to_string(), inspect);
        self
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state().containers.clone()
    }

    /// Phases in the order they were started
    pub fn started_phases(&self) -> Vec<String> {
        self.state()
            .containers
            .iter()
            .filter(|c| c.started)
            .map(FakeContainer::phase)
            .collect()
    }

    pub fn copies(&self) -> Vec<FakeCopy> {
        self.state().copies.clone()
    }

    /// Volumes that currently exist
    pub fn volumes(&self) -> BTreeSet<String> {
        self.state().volumes.clone()
    }

    pub fn created_volumes(&self) -> Vec<String> {
        self.state().created_volumes.clone()
    }

    pub fn removed_volumes(&self) -> Vec<String> {
        self.state().removed_volumes.clone()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.state().removed_containers.clone()
    }

    pub fn killed_containers(&self) -> BTreeSet<String> {
        self.state().killed.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state().pulled.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state().removed_images.clone()
    }

    fn container(&self, id: &str) -> PackResult<FakeContainer> {
        self.state()
            .containers
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| PackError::NotFound(format!("container {}", id)))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_ready(&self) -> PackResult<()> {
        Ok(())
    }

    async fn create_container(
        &self,
        config: &ContainerConfig,
        host: &HostConfig,
    ) -> PackResult<String> {
        let mut state = self.state();
        let id = format!("container-{}", state.containers.len() + 1);
        state.containers.push(FakeContainer {
            id: id.clone(),
            config: config.clone(),
            host: host.clone(),
            started: false,
        });
        Ok(id)
    }

    async fn copy_to_container(&self, id: &str, dest: &str, tar_path: &Path) -> PackResult<()> {
        self.container(id)?;
        let entries = crate::archive::list_entries(tar_path)?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        self.state().copies.push(FakeCopy {
            container: id.to_string(),
            dest: dest.to_string(),
            entries,
        });
        Ok(())
    }

    async fn start_container(&self, id: &str) -> PackResult<()> {
        let mut state = self.state();
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| PackError::NotFound(format!("container {}", id)))?;
        container.started = true;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> PackResult<i64> {
        let phase = self.container(id)?.phase();
        let hangs = self.state().hang.as_deref() == Some(phase.as_str());
        if hangs {
            loop {
                let notified = self.killed.notified();
                if self.state().killed.contains(id) {
                    return Ok(137);
                }
                notified.await;
            }
        }
        Ok(self.state().exit_codes.get(&phase).copied().unwrap_or(0))
    }

    async fn stream_logs(
        &self,
        id: &str,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> PackResult<()> {
        let phase = self.container(id)?.phase();
        let output = self.state().output.get(&phase).cloned();
        if let Some((out, err)) = output {
            stdout
                .write_all(out.as_bytes())
                .and_then(|_| stdout.flush())
                .map_err(|e| PackError::io("writing fake stdout", e))?;
            stderr
                .write_all(err.as_bytes())
                .and_then(|_| stderr.flush())
                .map_err(|e| PackError::io("writing fake stderr", e))?;
        }
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> PackResult<()> {
        self.state().killed.insert(id.to_string());
        self.killed.notify_waiters();
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> PackResult<()> {
        self.state().removed_containers.push(id.to_string());
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> PackResult<()> {
        let mut state = self.state();
        state.volumes.insert(name.to_string());
        state.created_volumes.push(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> PackResult<()> {
        let mut state = self.state();
        state.volumes.remove(name);
        state.removed_volumes.push(name.to_string());
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> PackResult<()> {
        let mut state = self.state();
        state.pulled.push(reference.to_string());
        if state.images.contains_key(reference) {
            Ok(())
        } else {
            Err(PackError::NotFound(format!("image '{}'", reference)))
        }
    }

    async fn push_image(&self, reference: &str) -> PackResult<()> {
        self.state().pushed.push(reference.to_string());
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> PackResult<Option<ImageInspect>> {
        Ok(self.state().images.get(reference).cloned())
    }

    async fn save_image(&self, reference: &str, _dest: &Path) -> PackResult<()> {
        Err(PackError::Internal(format!(
            "fake runtime cannot save image '{}'",
            reference
        )))
    }

    async fn load_image(&self, archive: &Path) -> PackResult<()> {
        self.state().loaded.push(archive.to_path_buf());
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> PackResult<()> {
        let mut state = self.state();
        state.images.remove(reference);
        state.removed_images.push(reference.to_string());
        Ok(())
    }

    fn socket_path(&self) -> String {
        "/var/run/docker.sock".to_string()
    }

    fn runtime_name(&self) -> &'static str {
        "Fake"
    }
}
