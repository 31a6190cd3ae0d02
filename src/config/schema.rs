//! Configuration schema for pack
//!
//! Configuration is stored at `$PACK_HOME/config.toml`

use crate::build::ProxyEnv;
use crate::runtime::Engine;
use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Builder used when a build names none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_builder_image: Option<String>,

    /// Preferred mirrors per run image
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub run_images: Vec<RunImageConfig>,

    /// Container engine; detected from the `PATH` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<Engine>,

    /// Proxy settings passed to build containers
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunImageConfig {
    pub image: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProxyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
}

impl Config {
    /// User mirrors configured for `image`
    pub fn run_image_mirrors(&self, image: &str) -> Vec<String> {
        self.run_images
            .iter()
            .find(|r| r.image == image)
            .map(|r| r.mirrors.clone())
            .unwrap_or_default()
    }

    /// Configured proxies, with the process environment filling the gaps
    pub fn proxy_env(&self) -> ProxyEnv {
        ProxyEnv {
            http: self.proxy.http.clone(),
            https: self.proxy.https.clone(),
            no_proxy: self.proxy.no_proxy.clone(),
        }
        .or(ProxyEnv::from_env())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
default-builder-image = "cnb/builder:bionic"
engine = "podman"

[[run-images]]
image = "cnb/run"
mirrors = ["gcr.io/me/run"]

[proxy]
http = "http://proxy:3128"
no-proxy = "localhost"
"#,
        )
        .unwrap();

        assert_eq!(config.default_builder_image.as_deref(), Some("cnb/builder:bionic"));
        assert_eq!(config.engine, Some(Engine::Podman));
        assert_eq!(config.run_image_mirrors("cnb/run"), vec!["gcr.io/me/run"]);
        assert!(config.run_image_mirrors("other/run").is_empty());
        assert_eq!(config.proxy.no_proxy.as_deref(), Some("localhost"));
    }

    #[test]
    fn empty_config_serializes_small() {
        let content = toml::to_string(&Config::default()).unwrap();
        assert!(!content.contains("default-builder-image"));
        assert!(!content.contains("engine"));
    }

    #[test]
    #[serial]
    fn environment_fills_unset_proxies() {
        std::env::set_var("HTTPS_PROXY", "http://env-proxy:3128");
        std::env::set_var("HTTP_PROXY", "http://env-http:3128");
        let config = Config {
            proxy: ProxyConfig {
                http: Some("http://configured:3128".to_string()),
                ..ProxyConfig::default()
            },
            ..Config::default()
        };
        let proxy = config.proxy_env();
        std::env::remove_var("HTTPS_PROXY");
        std::env::remove_var("HTTP_PROXY");

        assert_eq!(proxy.http.as_deref(), Some("http://configured:3128"));
        assert_eq!(proxy.https.as_deref(), Some("http://env-proxy:3128"));
    }
}
