//! One sandboxed execution of a lifecycle binary

use super::CancelToken;
use crate::archive::{self, Owner};
use crate::auth::{build_env_var, Keychain};
use crate::dist::env;
use crate::error::{PackError, PackResult};
use crate::lifecycle::paths;
use crate::logging::PhaseOutput;
use crate::runtime::{ContainerConfig, ContainerRuntime, HostConfig, AUTHOR_LABEL};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Socket path inside daemon-access containers
const CONTAINER_SOCKET: &str = "/var/run/docker.sock";

/// Proxy settings forwarded to every phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyEnv {
    pub http: Option<String>,
    pub https: Option<String>,
    pub no_proxy: Option<String>,
}

impl ProxyEnv {
    /// Read `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY`, upper case first
    pub fn from_env() -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .or_else(|_| std::env::var(name.to_lowercase()))
                .ok()
                .filter(|v| !v.is_empty())
        };
        Self {
            http: read("HTTP_PROXY"),
            https: read("HTTPS_PROXY"),
            no_proxy: read("NO_PROXY"),
        }
    }

    /// Fill unset values from `other`
    pub fn or(self, other: ProxyEnv) -> Self {
        Self {
            http: self.http.or(other.http),
            https: self.https.or(other.https),
            no_proxy: self.no_proxy.or(other.no_proxy),
        }
    }

    /// Both spellings of each configured variable
    pub fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        for (name, value) in [
            ("HTTP_PROXY", &self.http),
            ("HTTPS_PROXY", &self.https),
            ("NO_PROXY", &self.no_proxy),
        ] {
            if let Some(value) = value {
                vars.insert(name.to_string(), value.clone());
                vars.insert(name.to_lowercase(), value.clone());
            }
        }
        vars
    }
}

/// What a phase runs and which privileges it needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Phase {
    pub name: String,
    pub args: Vec<String>,
    pub binds: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub daemon_access: bool,
    /// Images whose registries the phase talks to
    pub registry_access: Vec<String>,
}

impl Phase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Mount the engine socket and run as root
    pub fn with_daemon_access(mut self) -> Self {
        self.daemon_access = true;
        self
    }

    pub fn with_binds<I, S>(mut self, binds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.binds.extend(binds.into_iter().map(Into::into));
        self
    }

    /// Pass registry credentials for `images` and use host networking
    pub fn with_registry_access(mut self, images: &[&str]) -> Self {
        self.registry_access.extend(images.iter().map(|i| i.to_string()));
        self
    }
}

/// Shared settings of every phase in one build
pub struct PhaseRunner<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub keychain: &'a Keychain,
    pub builder_image: String,
    pub layers_volume: String,
    pub app_volume: String,
    /// `/cnb/lifecycle`, or `/lifecycle` for older builders
    pub lifecycle_dir: String,
    pub app_dir: PathBuf,
    pub owner: Owner,
    pub proxy: ProxyEnv,
    pub output: PhaseOutput,
    pub cancel: CancelToken,
    app_copied: OnceCell<()>,
}

impl<'a> PhaseRunner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        keychain: &'a Keychain,
        builder_image: &str,
        volumes: (&str, &str),
        lifecycle_dir: &str,
        app_dir: PathBuf,
        owner: Owner,
        proxy: ProxyEnv,
        output: PhaseOutput,
        cancel: CancelToken,
    ) -> Self {
        Self {
            runtime,
            keychain,
            builder_image: builder_image.to_string(),
            layers_volume: volumes.0.to_string(),
            app_volume: volumes.1.to_string(),
            lifecycle_dir: lifecycle_dir.to_string(),
            app_dir,
            owner,
            proxy,
            output,
            cancel,
            app_copied: OnceCell::new(),
        }
    }

    /// Container settings for `phase`; `registry_auth` is the encoded keychain
    pub fn container_config(
        &self,
        phase: &Phase,
        registry_auth: Option<String>,
    ) -> (ContainerConfig, HostConfig) {
        let mut cmd = vec![format!("{}/{}", self.lifecycle_dir, phase.name)];
        cmd.extend(phase.args.iter().cloned());

        let mut env_vars = self.proxy.vars();
        env_vars.extend(phase.env.clone());

        let mut binds = vec![
            format!("{}:{}", self.layers_volume, paths::LAYERS_DIR),
            format!("{}:{}", self.app_volume, paths::APP_DIR),
        ];
        let mut user = None;
        if phase.daemon_access {
            user = Some("root".to_string());
            binds.push(format!("{}:{}", self.runtime.socket_path(), CONTAINER_SOCKET));
            if let Ok(host) = std::env::var("DOCKER_HOST") {
                if host.starts_with("tcp://") {
                    env_vars.insert("DOCKER_HOST".to_string(), host);
                }
            }
        }
        binds.extend(phase.binds.iter().cloned());

        let mut network_mode = None;
        if let Some(auth) = registry_auth {
            env_vars.insert(env::REGISTRY_AUTH.to_string(), auth);
            network_mode = Some("host".to_string());
        }

        let config = ContainerConfig {
            image: self.builder_image.clone(),
            cmd,
            env: env_vars,
            user,
            labels: BTreeMap::from([(AUTHOR_LABEL.0.to_string(), AUTHOR_LABEL.1.to_string())]),
        };
        let host = HostConfig {
            binds,
            network_mode,
        };
        (config, host)
    }

    /// Create, run and remove the container for `phase`
    pub async fn run(&self, phase: &Phase) -> PackResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PackError::Canceled);
        }

        let registry_auth = if phase.registry_access.is_empty() {
            None
        } else {
            let images: Vec<&str> = phase.registry_access.iter().map(String::as_str).collect();
            Some(build_env_var(self.keychain, &images).await?)
        };
        let (config, host) = self.container_config(phase, registry_auth);
        debug!("Running {}", config.cmd.join(" "));

        let id = self.runtime.create_container(&config, &host).await?;
        let result = self.run_container(phase, &id).await;
        if let Err(e) = self.runtime.remove_container(&id).await {
            warn!("Failed to remove {} container {}: {}", phase.name, id, e);
        }
        result
    }

    async fn run_container(&self, phase: &Phase, id: &str) -> PackResult<()> {
        self.app_copied
            .get_or_try_init(|| self.copy_app(id))
            .await?;

        self.runtime.start_container(id).await?;
        let mut stdout = self.output.writer(&phase.name);
        let mut stderr = self.output.writer(&phase.name);

        let run = async {
            let (logs, code) = tokio::join!(
                self.runtime.stream_logs(id, stdout.as_mut(), stderr.as_mut()),
                self.runtime.wait_container(id)
            );
            if let Err(e) = logs {
                warn!("Lost output of {} phase: {}", phase.name, e);
            }
            code
        };

        let code = tokio::select! {
            code = run => code?,
            _ = self.cancel.cancelled() => {
                info!("Stopping {} phase", phase.name);
                self.runtime.kill_container(id).await?;
                self.runtime.wait_container(id).await?;
                return Err(PackError::Canceled);
            }
        };

        stdout
            .flush()
            .and_then(|_| stderr.flush())
            .map_err(|e| PackError::io(format!("writing {} output", phase.name), e))?;

        if code != 0 {
            return Err(PackError::PhaseFailed {
                phase: phase.name.clone(),
                code,
            });
        }
        Ok(())
    }

    /// Copy the application into the app volume through the first container
    async fn copy_app(&self, id: &str) -> PackResult<()> {
        let temp = TempDir::new().map_err(|e| PackError::io("creating temp dir for app", e))?;
        let tar_path = temp.path().join("app.tar");
        archive::create_tar_file(&tar_path, &self.app_dir, paths::APP_DIR, self.owner, None)?;
        debug!("Copying {} into {}", self.app_dir.display(), paths::APP_DIR);
        self.runtime.copy_to_container(id, "/", &tar_path).await
    }
}
