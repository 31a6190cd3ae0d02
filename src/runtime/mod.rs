//! Container engine abstraction
//!
//! Phases, caches and daemon-backed images talk to the engine only through
//! [`ContainerRuntime`]. The production implementation drives the `docker`
//! or `podman` CLI; [`fake::FakeRuntime`] records calls for tests.

mod docker;
pub mod fake;
mod factory;

pub use docker::CliRuntime;
pub use factory::{create_runtime, Engine};

use crate::error::PackResult;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Label stamped on every container pack creates
pub const AUTHOR_LABEL: (&str, &str) = ("author", "pack");

/// Process-level settings of a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub image: String,
    /// Entrypoint override followed by its arguments
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub user: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Host-level settings of a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    /// `source:target` mounts, named volumes or host paths
    pub binds: Vec<String>,
    pub network_mode: Option<String>,
}

/// Subset of `inspect` output pack relies on
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspect {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub repo_digests: Option<Vec<String>>,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub config: InspectConfig,
    #[serde(default, rename = "RootFS")]
    pub root_fs: InspectRootFs,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub user: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectRootFs {
    #[serde(default)]
    pub layers: Option<Vec<String>>,
}

impl ImageInspect {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    /// Value of `key` in the image env, last definition wins
    pub fn env(&self, key: &str) -> Option<&str> {
        self.config
            .env
            .iter()
            .flatten()
            .rev()
            .find_map(|kv| kv.split_once('=').filter(|(k, _)| *k == key).map(|(_, v)| v))
    }

    pub fn diff_ids(&self) -> &[String] {
        self.root_fs.layers.as_deref().unwrap_or(&[])
    }

    pub fn digest(&self) -> Option<&str> {
        self.repo_digests
            .as_ref()
            .and_then(|d| d.first())
            .and_then(|d| d.split_once('@'))
            .map(|(_, digest)| digest)
    }
}

/// Interface to the container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fail with `EngineNotFound` when the engine cannot be reached
    async fn ensure_ready(&self) -> PackResult<()>;

    /// Create (but do not start) a container and return its id
    async fn create_container(
        &self,
        config: &ContainerConfig,
        host: &HostConfig,
    ) -> PackResult<String>;

    /// Unpack the tar at `tar_path` into the container filesystem under `dest`
    async fn copy_to_container(&self, id: &str, dest: &str, tar_path: &Path) -> PackResult<()>;

    async fn start_container(&self, id: &str) -> PackResult<()>;

    /// Block until the container exits and return its status code
    async fn wait_container(&self, id: &str) -> PackResult<i64>;

    /// Follow container output until it exits
    async fn stream_logs(
        &self,
        id: &str,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> PackResult<()>;

    async fn kill_container(&self, id: &str) -> PackResult<()>;

    /// Force-remove a container, succeeding if it is already gone
    async fn remove_container(&self, id: &str) -> PackResult<()>;

    async fn create_volume(&self, name: &str) -> PackResult<()>;

    /// Force-remove a volume, succeeding if it is already gone
    async fn remove_volume(&self, name: &str) -> PackResult<()>;

    async fn pull_image(&self, reference: &str) -> PackResult<()>;

    async fn push_image(&self, reference: &str) -> PackResult<()>;

    /// `None` when the image is not present locally
    async fn inspect_image(&self, reference: &str) -> PackResult<Option<ImageInspect>>;

    /// Write a docker-archive of `reference` to `dest`
    async fn save_image(&self, reference: &str, dest: &Path) -> PackResult<()>;

    /// Load a docker-archive into the engine
    async fn load_image(&self, archive: &Path) -> PackResult<()>;

    async fn remove_image(&self, reference: &str) -> PackResult<()>;

    /// Socket mounted into phases that need daemon access
    fn socket_path(&self) -> String;

    /// Human-readable engine name
    fn runtime_name(&self) -> &'static str;
}

/// Copy two output streams into their sinks until both close.
///
/// Chunks from each stream are written in the order they are read.
pub(crate) async fn stream_output<O, E>(
    mut stdout: O,
    mut stderr: E,
    out_sink: &mut (dyn Write + Send),
    err_sink: &mut (dyn Write + Send),
) -> std::io::Result<()>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !stdout_done || !stderr_done {
        tokio::select! {
            read = stdout.read(&mut out_buf), if !stdout_done => {
                match read {
                    Ok(0) | Err(_) => stdout_done = true,
                    Ok(n) => out_sink.write_all(&out_buf[..n])?,
                }
            }
            read = stderr.read(&mut err_buf), if !stderr_done => {
                match read {
                    Ok(0) | Err(_) => stderr_done = true,
                    Ok(n) => err_sink.write_all(&err_buf[..n])?,
                }
            }
        }
    }

    out_sink.flush()?;
    err_sink.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSPECT: &str = r#"{
        "Id": "sha256:1111",
        "RepoDigests": ["index.docker.io/cnb/run@sha256:2222"],
        "Os": "linux",
        "Architecture": "amd64",
        "Config": {
            "Env": ["PATH=/bin", "CNB_USER_ID=1000", "CNB_USER_ID=2000"],
            "Labels": {"io.buildpacks.stack.id": "stacks.bionic"},
            "Entrypoint": null,
            "Cmd": ["/bin/sh"],
            "WorkingDir": "",
            "User": "cnb"
        },
        "RootFS": {"Type": "layers", "Layers": ["sha256:a", "sha256:b"]}
    }"#;

    #[test]
    fn inspect_accessors() {
        let inspect: ImageInspect = serde_json::from_str(INSPECT).unwrap();
        assert_eq!(inspect.label("io.buildpacks.stack.id"), Some("stacks.bionic"));
        assert_eq!(inspect.env("CNB_USER_ID"), Some("2000"));
        assert_eq!(inspect.env("MISSING"), None);
        assert_eq!(inspect.diff_ids(), ["sha256:a", "sha256:b"]);
        assert_eq!(inspect.digest(), Some("sha256:2222"));
    }

    #[test]
    fn inspect_tolerates_nulls() {
        let inspect: ImageInspect =
            serde_json::from_str(r#"{"Id":"x","Config":{"Labels":null,"Env":null}}"#).unwrap();
        assert_eq!(inspect.label("anything"), None);
        assert!(inspect.diff_ids().is_empty());
        assert_eq!(inspect.digest(), None);
    }

    #[tokio::test]
    async fn stream_output_routes_streams() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        stream_output(&b"one\ntwo\n"[..], &b"oops\n"[..], &mut out, &mut err)
            .await
            .unwrap();
        assert_eq!(out, b"one\ntwo\n");
        assert_eq!(err, b"oops\n");
    }
}
