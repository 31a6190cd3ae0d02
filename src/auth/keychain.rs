//! Registry credential resolution
//!
//! Lookup order for a registry host:
//! 1. the `CNB_REGISTRY_AUTH` JSON map from the environment
//! 2. the docker config file, including credential helpers
//! 3. anonymous

use crate::auth::reference::{canonical_registry, ImageRef};
use crate::dist::env;
use crate::error::{PackError, PackResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Username a credential helper returns for identity tokens
const TOKEN_USERNAME: &str = "<token>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Anonymous,
    Basic { username: String, password: String },
    Bearer(String),
    /// A header value taken verbatim from `CNB_REGISTRY_AUTH`
    Header(String),
}

impl Authorization {
    /// Value for the HTTP `Authorization` header, `None` when anonymous
    pub fn header(&self) -> Option<String> {
        match self {
            Self::Anonymous => None,
            Self::Basic { username, password } => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", username, password))
            )),
            Self::Bearer(token) => Some(format!("Bearer {}", token)),
            Self::Header(value) => Some(value.clone()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "identitytoken")]
    identity_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
    #[serde(default)]
    cred_helpers: BTreeMap<String, String>,
    #[serde(default)]
    creds_store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelperResponse {
    #[serde(rename = "Username", default)]
    username: String,
    #[serde(rename = "Secret", default)]
    secret: String,
}

/// Host part of a docker config key such as `https://index.docker.io/v1/`
fn config_key_host(key: &str) -> String {
    let without_scheme = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    canonical_registry(host)
}

/// Credential helper implied by the registry host
pub fn default_helper(registry: &str) -> Option<&'static str> {
    if registry == "gcr.io" || registry.ends_with(".gcr.io") {
        Some("gcr")
    } else if registry.contains(".amazonaws.") {
        Some("ecr-login")
    } else if registry.ends_with(".azurecr.io") {
        Some("acr")
    } else {
        None
    }
}

fn decode_basic(encoded: &str) -> Option<Authorization> {
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Authorization::Basic {
        username: username.to_string(),
        password: password.to_string(),
    })
}

impl AuthEntry {
    fn authorization(&self) -> Option<Authorization> {
        if let Some(token) = self.identity_token.as_deref().filter(|t| !t.is_empty()) {
            return Some(Authorization::Bearer(token.to_string()));
        }
        if let Some(auth) = self.auth.as_deref().filter(|a| !a.is_empty()) {
            return decode_basic(auth);
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Authorization::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// Resolves credentials for registry hosts
#[derive(Debug, Clone)]
pub struct Keychain {
    docker_config: Option<PathBuf>,
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}

impl Keychain {
    /// Keychain reading `$DOCKER_CONFIG/config.json` or `~/.docker/config.json`
    pub fn new() -> Self {
        let docker_config = std::env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".docker")))
            .map(|dir| dir.join("config.json"));
        Self { docker_config }
    }

    /// Keychain reading the given docker config file
    pub fn with_docker_config(path: impl Into<PathBuf>) -> Self {
        Self {
            docker_config: Some(path.into()),
        }
    }

    pub async fn resolve(&self, registry: &str) -> PackResult<Authorization> {
        let registry = canonical_registry(registry);

        if let Some(header) = from_env(&registry)? {
            debug!("Using {} credentials for {}", env::REGISTRY_AUTH, registry);
            return Ok(Authorization::Header(header));
        }

        if let Some(path) = &self.docker_config {
            if let Some(auth) = from_docker_config(path, &registry).await? {
                return Ok(auth);
            }
        }

        debug!("Using anonymous access for {}", registry);
        Ok(Authorization::Anonymous)
    }
}

fn from_env(registry: &str) -> PackResult<Option<String>> {
    let Ok(raw) = std::env::var(env::REGISTRY_AUTH) else {
        return Ok(None);
    };
    let map: BTreeMap<String, String> = match serde_json::from_str(&raw) {
        Ok(map) => map,
        Err(e) => {
            debug!("Ignoring unparseable {}: {}", env::REGISTRY_AUTH, e);
            return Ok(None);
        }
    };
    Ok(map
        .into_iter()
        .find(|(host, _)| canonical_registry(host) == registry)
        .map(|(_, header)| header))
}

async fn from_docker_config(path: &Path, registry: &str) -> PackResult<Option<Authorization>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PackError::io(format!("reading {}", path.display()), e)),
    };
    let config: DockerConfig = serde_json::from_str(&raw).map_err(|e| PackError::ConfigFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if let Some(helper) = config
        .cred_helpers
        .iter()
        .find(|(host, _)| config_key_host(host) == registry)
        .map(|(_, helper)| helper)
    {
        return run_helper(helper, registry).await;
    }

    if let Some(auth) = config
        .auths
        .iter()
        .find(|(host, _)| config_key_host(host) == registry)
        .and_then(|(_, entry)| entry.authorization())
    {
        return Ok(Some(auth));
    }

    if let Some(store) = config.creds_store.as_deref().filter(|s| !s.is_empty()) {
        if let Some(auth) = run_helper(store, registry).await? {
            return Ok(Some(auth));
        }
    }

    match default_helper(registry) {
        Some(helper) => run_helper(helper, registry).await,
        None => Ok(None),
    }
}

/// Ask `docker-credential-<helper>` for the credentials of `registry`.
///
/// A helper that is not installed or has nothing stored yields `None`.
async fn run_helper(helper: &str, registry: &str) -> PackResult<Option<Authorization>> {
    let program = format!("docker-credential-{}", helper);
    debug!("Running {} get for {}", program, registry);

    let mut child = match Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} not installed", program);
            return Ok(None);
        }
        Err(e) => return Err(PackError::command_failed(format!("{} get", program), e)),
    };

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(registry.as_bytes())
            .await
            .map_err(|e| PackError::io(format!("writing to {}", program), e))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| PackError::command_failed(format!("{} get", program), e))?;
    if !output.status.success() {
        debug!(
            "{} found no credentials: {}",
            program,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Ok(None);
    }

    let response: HelperResponse = serde_json::from_slice(&output.stdout)?;
    if response.username == TOKEN_USERNAME {
        Ok(Some(Authorization::Bearer(response.secret)))
    } else {
        Ok(Some(Authorization::Basic {
            username: response.username,
            password: response.secret,
        }))
    }
}

/// Encode credentials for `images` as the `CNB_REGISTRY_AUTH` JSON map.
///
/// Registries resolving to anonymous access are left out; with none left
/// the result is `{}`.
pub async fn build_env_var(keychain: &Keychain, images: &[&str]) -> PackResult<String> {
    let mut headers = BTreeMap::new();
    for image in images.iter().filter(|i| !i.is_empty()) {
        let registry = ImageRef::parse(image)?.registry;
        if headers.contains_key(&registry) {
            continue;
        }
        if let Some(header) = keychain.resolve(&registry).await?.header() {
            headers.insert(registry, header);
        }
    }
    Ok(serde_json::to_string(&headers)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn basic_header_encoding() {
        let auth = Authorization::Basic {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        assert_eq!(auth.header().unwrap(), "Basic dXNlcjpwYXNz");
        assert_eq!(Authorization::Anonymous.header(), None);
        assert_eq!(
            Authorization::Bearer("tok".to_string()).header().unwrap(),
            "Bearer tok"
        );
    }

    #[test]
    fn helpers_by_host() {
        assert_eq!(default_helper("us.gcr.io"), Some("gcr"));
        assert_eq!(default_helper("gcr.io"), Some("gcr"));
        assert_eq!(
            default_helper("123.dkr.ecr.us-east-1.amazonaws.com"),
            Some("ecr-login")
        );
        assert_eq!(default_helper("me.azurecr.io"), Some("acr"));
        assert_eq!(default_helper("index.docker.io"), None);
    }

    #[test]
    fn hub_config_keys() {
        assert_eq!(config_key_host("https://index.docker.io/v1/"), "index.docker.io");
        assert_eq!(config_key_host("docker.io"), "index.docker.io");
        assert_eq!(config_key_host("localhost:5000"), "localhost:5000");
    }

    #[tokio::test]
    #[serial]
    async fn env_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"auths":{"registry.io":{"auth":"dXNlcjpwYXNz"}}}"#);
        std::env::set_var(env::REGISTRY_AUTH, r#"{"registry.io":"Bearer from-env"}"#);

        let auth = Keychain::with_docker_config(path)
            .resolve("registry.io")
            .await
            .unwrap();
        std::env::remove_var(env::REGISTRY_AUTH);
        assert_eq!(auth, Authorization::Header("Bearer from-env".to_string()));
    }

    #[tokio::test]
    #[serial]
    async fn docker_config_auths() {
        std::env::remove_var(env::REGISTRY_AUTH);
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{"auths":{"https://index.docker.io/v1/":{"auth":"dXNlcjpwYXNz"}}}"#,
        );
        let keychain = Keychain::with_docker_config(path);

        assert_eq!(
            keychain.resolve("docker.io").await.unwrap(),
            Authorization::Basic {
                username: "user".to_string(),
                password: "pass".to_string()
            }
        );
        assert_eq!(
            keychain.resolve("quay.io").await.unwrap(),
            Authorization::Anonymous
        );
    }

    #[tokio::test]
    #[serial]
    async fn missing_helper_is_anonymous() {
        std::env::remove_var(env::REGISTRY_AUTH);
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{"credHelpers":{"registry.io":"pack-test-helper-that-does-not-exist"}}"#,
        );
        let auth = Keychain::with_docker_config(path)
            .resolve("registry.io")
            .await
            .unwrap();
        assert_eq!(auth, Authorization::Anonymous);
    }

    #[tokio::test]
    #[serial]
    async fn env_var_encoding() {
        std::env::remove_var(env::REGISTRY_AUTH);
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"auths":{"registry.io":{"auth":"dXNlcjpwYXNz"}}}"#);
        let keychain = Keychain::with_docker_config(path);

        let value = build_env_var(&keychain, &["registry.io/app", "registry.io/run:1", "alpine"])
            .await
            .unwrap();
        assert_eq!(value, r#"{"registry.io":"Basic dXNlcjpwYXNz"}"#);

        let missing = Keychain::with_docker_config(dir.path().join("absent.json"));
        assert_eq!(build_env_var(&missing, &["alpine"]).await.unwrap(), "{}");
    }
}
