//! Configuration management for pack

pub mod schema;

pub use schema::{Config, ProxyConfig, RunImageConfig};

use crate::error::{PackError, PackResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use toml_edit::{value, Array, ArrayOfTables, DocumentMut, Item, Table};
use tracing::{debug, info};

/// Directory holding config, downloads and the completion script.
///
/// `PACK_HOME` when set, `~/.pack` otherwise.
pub fn pack_home() -> PathBuf {
    match std::env::var("PACK_HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pack"),
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: pack_home().join("config.toml"),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> PackResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        let content = self.read().await?;
        toml::from_str(&content).map_err(|e| PackError::ConfigFile {
            path: self.config_path.clone(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> PackResult<()> {
        let content = toml::to_string_pretty(config)?;
        self.write(&content).await?;
        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Record the builder used when none is given
    pub async fn set_default_builder(&self, builder: &str) -> PackResult<()> {
        let mut doc = self.document().await?;
        doc["default-builder-image"] = value(builder);
        self.write(&doc.to_string()).await
    }

    /// Set the user mirrors of a run image, replacing earlier ones
    pub async fn set_run_image_mirrors(&self, image: &str, mirrors: &[String]) -> PackResult<()> {
        let mut doc = self.document().await?;
        let entry = doc
            .entry("run-images")
            .or_insert(Item::ArrayOfTables(ArrayOfTables::new()));
        let tables = entry.as_array_of_tables_mut().ok_or_else(|| PackError::ConfigFile {
            path: self.config_path.clone(),
            reason: "'run-images' must be an array of tables".to_string(),
        })?;

        let mirrors_value = value(mirrors.iter().cloned().collect::<Array>());
        let existing = tables
            .iter()
            .position(|t| t.get("image").and_then(|v| v.as_str()) == Some(image));
        match existing {
            Some(index) => {
                if let Some(table) = tables.get_mut(index) {
                    table["mirrors"] = mirrors_value;
                }
            }
            None => {
                let mut table = Table::new();
                table["image"] = value(image);
                table["mirrors"] = mirrors_value;
                tables.push(table);
            }
        }
        self.write(&doc.to_string()).await
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Existing file as an editable document, keeping comments and layout
    async fn document(&self) -> PackResult<DocumentMut> {
        let content = if self.config_path.exists() {
            self.read().await?
        } else {
            String::new()
        };
        content.parse::<DocumentMut>().map_err(|e| PackError::ConfigFile {
            path: self.config_path.clone(),
            reason: e.to_string(),
        })
    }

    async fn read(&self) -> PackResult<String> {
        fs::read_to_string(&self.config_path).await.map_err(|e| {
            PackError::io(
                format!("reading config from {}", self.config_path.display()),
                e,
            )
        })
    }

    async fn write(&self, content: &str) -> PackResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                PackError::io(format!("creating directory {}", parent.display()), e)
            })?;
        }
        fs::write(&self.config_path, content).await.map_err(|e| {
            PackError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(temp.path().join("nonexistent.toml"));

        let config = manager.load().await.unwrap();
        assert_eq!(config, Config::default());
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(temp.path().join("nested/config.toml"));

        let config = Config {
            default_builder_image: Some("cnb/builder".to_string()),
            run_images: vec![RunImageConfig {
                image: "cnb/run".to_string(),
                mirrors: vec!["gcr.io/me/run".to_string()],
            }],
            ..Config::default()
        };
        manager.save(&config).await.unwrap();

        assert_eq!(manager.load().await.unwrap(), config);
    }

    #[tokio::test]
    async fn set_default_builder_keeps_comments() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            "# managed by hand\ndefault-builder-image = \"old/builder\"\n\n[proxy]\nhttp = \"http://proxy:3128\"\n",
        )
        .unwrap();
        let manager = ConfigManager::with_path(path.clone());

        manager.set_default_builder("cnb/builder:bionic").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# managed by hand\n"));
        let config = manager.load().await.unwrap();
        assert_eq!(config.default_builder_image.as_deref(), Some("cnb/builder:bionic"));
        assert_eq!(config.proxy.http.as_deref(), Some("http://proxy:3128"));
    }

    #[tokio::test]
    async fn run_image_mirrors_are_added_then_replaced() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(temp.path().join("config.toml"));

        manager
            .set_run_image_mirrors("cnb/run", &["gcr.io/a/run".to_string()])
            .await
            .unwrap();
        manager
            .set_run_image_mirrors("cnb/run", &["quay.io/b/run".to_string()])
            .await
            .unwrap();

        let config = manager.load().await.unwrap();
        assert_eq!(config.run_images.len(), 1);
        assert_eq!(config.run_image_mirrors("cnb/run"), vec!["quay.io/b/run"]);
    }

    #[tokio::test]
    async fn mirrors_for_another_image_are_appended() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(temp.path().join("config.toml"));

        manager
            .set_run_image_mirrors("cnb/run", &["gcr.io/a/run".to_string()])
            .await
            .unwrap();
        manager
            .set_run_image_mirrors("cnb/other", &["gcr.io/a/other".to_string()])
            .await
            .unwrap();
        manager
            .set_run_image_mirrors("cnb/run", &["quay.io/b/run".to_string()])
            .await
            .unwrap();

        let config = manager.load().await.unwrap();
        assert_eq!(config.run_images.len(), 2);
        assert_eq!(config.run_image_mirrors("cnb/run"), vec!["quay.io/b/run"]);
        assert_eq!(config.run_image_mirrors("cnb/other"), vec!["gcr.io/a/other"]);
    }

    #[tokio::test]
    async fn malformed_file_names_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "engine = [").unwrap();
        let err = ConfigManager::with_path(path.clone()).load().await.unwrap_err();
        assert!(matches!(err, PackError::ConfigFile { path: p, .. } if p == path));
    }

    #[test]
    #[serial]
    fn pack_home_from_env() {
        std::env::set_var("PACK_HOME", "/tmp/pack-home");
        assert_eq!(pack_home(), PathBuf::from("/tmp/pack-home"));
        std::env::remove_var("PACK_HOME");
        assert!(pack_home().ends_with(".pack"));
    }
}
