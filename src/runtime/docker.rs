//! Engine CLI runtime
//!
//! Implements [`ContainerRuntime`] by executing the `docker` or `podman`
//! binary. Both accept the same subcommands for everything pack needs.

use super::{stream_output, ContainerConfig, ContainerRuntime, Engine, HostConfig, ImageInspect};
use crate::error::{PackError, PackResult};
use async_trait::async_trait;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Container runtime that shells out to the engine CLI
#[derive(Debug, Clone)]
pub struct CliRuntime {
    engine: Engine,
}

impl CliRuntime {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    fn program(&self) -> &'static str {
        self.engine.program()
    }

    fn command_line(&self, args: &[&str]) -> String {
        format!("{} {}", self.program(), args.join(" "))
    }

    /// Execute an engine command and return the output
    async fn exec(&self, args: &[&str]) -> PackResult<std::process::Output> {
        debug!("Executing: {} {:?}", self.program(), args);

        Command::new(self.program())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PackError::command_failed(self.command_line(args), e))
    }

    /// Execute and fail on a non-zero status, returning trimmed stdout
    async fn exec_ok(&self, args: &[&str]) -> PackResult<String> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(&self.command_line(args), stderr.trim()))
        }
    }

    /// Like `exec_ok`, but a "no such ..." failure counts as success
    async fn exec_ignore_missing(&self, args: &[&str]) -> PackResult<()> {
        let output = self.exec(args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing(&stderr) {
            Ok(())
        } else {
            Err(PackError::command_exec(self.command_line(args), stderr.trim()))
        }
    }
}

fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such") || lower.contains("not found") || lower.contains("not known")
}

fn classify_failure(command: &str, stderr: &str) -> PackError {
    let lower = stderr.to_lowercase();
    if lower.contains("unauthorized") || lower.contains("authentication required") {
        PackError::Unauthorized(stderr.to_string())
    } else if lower.contains("cannot connect to the docker daemon") {
        PackError::EngineNotFound(stderr.to_string())
    } else {
        PackError::command_exec(command, stderr)
    }
}

/// Arguments for `create`, image and command last
pub(crate) fn create_args(config: &ContainerConfig, host: &HostConfig) -> Vec<String> {
    let mut args = vec!["create".to_string()];

    for (k, v) in &config.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", k, v));
    }
    if let Some(user) = &config.user {
        args.push("--user".to_string());
        args.push(user.clone());
    }
    if let Some(network) = &host.network_mode {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    for bind in &host.binds {
        args.push("-v".to_string());
        args.push(bind.clone());
    }
    for (k, v) in &config.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", k, v));
    }

    let mut cmd = config.cmd.iter();
    if let Some(entrypoint) = cmd.next() {
        args.push("--entrypoint".to_string());
        args.push(entrypoint.clone());
        args.push(config.image.clone());
        args.extend(cmd.cloned());
    } else {
        args.push(config.image.clone());
    }
    args
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn ensure_ready(&self) -> PackResult<()> {
        let output = Command::new(self.program())
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|_| PackError::EngineNotFound(self.program().to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(PackError::EngineNotFound(format!(
                "{}: {}",
                self.program(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn create_container(
        &self,
        config: &ContainerConfig,
        host: &HostConfig,
    ) -> PackResult<String> {
        let args = create_args(config, host);
        debug!("Creating container from {} ({:?})", config.image, config.cmd);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.exec_ok(&refs).await?;
        debug!("Created container {}", &id[..12.min(id.len())]);
        Ok(id)
    }

    async fn copy_to_container(&self, id: &str, dest: &str, tar_path: &Path) -> PackResult<()> {
        let file = File::open(tar_path)
            .map_err(|e| PackError::io(format!("opening {}", tar_path.display()), e))?;
        let target = format!("{}:{}", id, dest);
        let args = ["cp", "-", target.as_str()];
        debug!("Executing: {} {:?}", self.program(), args);

        let output = Command::new(self.program())
            .args(args)
            .stdin(Stdio::from(file))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PackError::command_failed(self.command_line(&args), e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(PackError::command_exec(
                self.command_line(&args),
                String::from_utf8_lossy(&output.stderr).trim(),
            ))
        }
    }

    async fn start_container(&self, id: &str) -> PackResult<()> {
        self.exec_ok(&["start", id]).await.map(|_| ())
    }

    async fn wait_container(&self, id: &str) -> PackResult<i64> {
        let out = self.exec_ok(&["wait", id]).await?;
        let last = out.lines().last().unwrap_or_default().trim().to_string();
        last.parse::<i64>()
            .map_err(|_| PackError::command_exec(format!("{} wait {}", self.program(), id), out))
    }

    async fn stream_logs(
        &self,
        id: &str,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> PackResult<()> {
        let args = ["logs", "--follow", id];
        let mut child = Command::new(self.program())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PackError::command_failed(self.command_line(&args), e))?;

        let (Some(out), Some(err)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(PackError::Internal("log streams were not captured".to_string()));
        };
        stream_output(out, err, stdout, stderr)
            .await
            .map_err(|e| PackError::io(format!("streaming logs of {}", id), e))?;

        child
            .wait()
            .await
            .map_err(|e| PackError::command_failed(self.command_line(&args), e))?;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> PackResult<()> {
        debug!("Killing container: {}", id);
        self.exec_ignore_missing(&["kill", id]).await
    }

    async fn remove_container(&self, id: &str) -> PackResult<()> {
        debug!("Removing container: {}", id);
        self.exec_ignore_missing(&["rm", "-f", id]).await
    }

    async fn create_volume(&self, name: &str) -> PackResult<()> {
        self.exec_ok(&["volume", "create", name]).await.map(|_| ())
    }

    async fn remove_volume(&self, name: &str) -> PackResult<()> {
        debug!("Removing volume: {}", name);
        self.exec_ignore_missing(&["volume", "rm", "-f", name]).await
    }

    async fn pull_image(&self, reference: &str) -> PackResult<()> {
        info!("Pulling image: {}", reference);
        let output = self.exec(&["pull", reference]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing(&stderr) || stderr.contains("manifest unknown") {
            Err(PackError::NotFound(format!("image '{}'", reference)))
        } else {
            Err(classify_failure(&format!("{} pull {}", self.program(), reference), stderr.trim()))
        }
    }

    async fn push_image(&self, reference: &str) -> PackResult<()> {
        info!("Pushing image: {}", reference);
        self.exec_ok(&["push", reference]).await.map(|_| ())
    }

    async fn inspect_image(&self, reference: &str) -> PackResult<Option<ImageInspect>> {
        let output = self.exec(&["image", "inspect", reference]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(None);
            }
            return Err(PackError::command_exec(
                format!("{} image inspect {}", self.program(), reference),
                stderr.trim(),
            ));
        }
        let mut list: Vec<ImageInspect> = serde_json::from_slice(&output.stdout)?;
        Ok(if list.is_empty() {
            None
        } else {
            Some(list.remove(0))
        })
    }

    async fn save_image(&self, reference: &str, dest: &Path) -> PackResult<()> {
        let dest = dest.to_string_lossy().into_owned();
        self.exec_ok(&["save", "-o", dest.as_str(), reference])
            .await
            .map(|_| ())
    }

    async fn load_image(&self, archive: &Path) -> PackResult<()> {
        let archive = archive.to_string_lossy().into_owned();
        let out = self.exec_ok(&["load", "-i", archive.as_str()]).await?;
        debug!("{}", out);
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> PackResult<()> {
        debug!("Removing image: {}", reference);
        self.exec_ignore_missing(&["rmi", "-f", reference]).await
    }

    fn socket_path(&self) -> String {
        self.engine.socket_path()
    }

    fn runtime_name(&self) -> &'static str {
        self.engine.name()
    }
}
