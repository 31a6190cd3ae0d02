//! Engine selection
//!
//! Picks the engine CLI from configuration, falling back to whichever of
//! `docker` or `podman` is on the `PATH`.

use super::{CliRuntime, ContainerRuntime};
use crate::error::{PackError, PackResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Container engine CLI flavour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Docker,
    Podman,
}

impl Engine {
    pub fn program(&self) -> &'static str {
        match self {
            Engine::Docker => "docker",
            Engine::Podman => "podman",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Engine::Docker => "Docker",
            Engine::Podman => "Podman",
        }
    }

    /// Control socket mounted into daemon-access phases.
    ///
    /// A `unix://` `DOCKER_HOST` takes precedence over the engine default.
    pub fn socket_path(&self) -> String {
        if let Ok(host) = std::env::var("DOCKER_HOST") {
            if let Some(path) = host.strip_prefix("unix://") {
                return path.to_string();
            }
        }
        match self {
            Engine::Docker => "/var/run/docker.sock".to_string(),
            Engine::Podman => match std::env::var("XDG_RUNTIME_DIR") {
                Ok(dir) if !dir.is_empty() => format!("{}/podman/podman.sock", dir),
                _ => "/run/podman/podman.sock".to_string(),
            },
        }
    }

    /// First engine found on the `PATH`
    pub fn detect() -> Option<Engine> {
        [Engine::Docker, Engine::Podman]
            .into_iter()
            .find(|e| on_path(e.program()))
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

impl FromStr for Engine {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Engine::Docker),
            "podman" => Ok(Engine::Podman),
            other => Err(PackError::ConfigInvalid(format!(
                "unknown engine '{}', expected docker or podman",
                other
            ))),
        }
    }
}

fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// Create the runtime for a configured engine, or the detected one
pub fn create_runtime(engine: Option<Engine>) -> PackResult<Arc<dyn ContainerRuntime>> {
    let engine = engine
        .or_else(Engine::detect)
        .ok_or_else(|| PackError::EngineNotFound("neither docker nor podman is installed".into()))?;
    Ok(Arc::new(CliRuntime::new(engine)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn parse_engine() {
        assert_eq!("docker".parse::<Engine>().unwrap(), Engine::Docker);
        assert_eq!("Podman".parse::<Engine>().unwrap(), Engine::Podman);
        assert!("containerd".parse::<Engine>().is_err());
    }

    #[test]
    #[serial]
    fn socket_path_defaults() {
        std::env::remove_var("DOCKER_HOST");
        assert_eq!(Engine::Docker.socket_path(), "/var/run/docker.sock");
    }

    #[test]
    #[serial]
    fn socket_path_honours_docker_host() {
        std::env::set_var("DOCKER_HOST", "unix:///tmp/custom.sock");
        assert_eq!(Engine::Docker.socket_path(), "/tmp/custom.sock");
        std::env::set_var("DOCKER_HOST", "tcp://10.0.0.1:2375");
        assert_eq!(Engine::Docker.socket_path(), "/var/run/docker.sock");
        std::env::remove_var("DOCKER_HOST");
    }

    #[test]
    fn explicit_engine_is_used() {
        let runtime = create_runtime(Some(Engine::Podman)).unwrap();
        assert_eq!(runtime.runtime_name(), "Podman");
    }
}
