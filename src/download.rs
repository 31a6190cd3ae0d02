//! Buildpack and lifecycle assets
//!
//! URIs are either local (a path or `file://` URI, opened in place) or
//! remote (`http(s)://`, fetched once into `PACK_HOME/download-cache`).

use crate::error::{PackError, PackResult};
use indicatif::{ProgressBar, ProgressStyle};
use semver::Version;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

const DOWNLOAD_CACHE_DIR: &str = "download-cache";

/// Release bundle of a lifecycle version
pub fn lifecycle_uri(version: &Version) -> String {
    format!(
        "https://github.com/buildpack/lifecycle/releases/download/v{v}/lifecycle-v{v}+linux.x86-64.tgz",
        v = version
    )
}

#[derive(Debug, PartialEq, Eq)]
enum Source {
    Local(PathBuf),
    Remote(String),
}

fn classify(uri: &str) -> PackResult<Source> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(Source::Local(PathBuf::from(path)));
    }
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Source::Remote(uri.to_string()));
    }
    match uri.split_once("://") {
        Some((scheme, _)) => Err(PackError::Download {
            uri: uri.to_string(),
            reason: format!("unsupported protocol '{}'", scheme),
        }),
        None => Ok(Source::Local(PathBuf::from(uri))),
    }
}

/// Resolves asset URIs to local paths
#[derive(Debug, Clone)]
pub struct Downloader {
    cache_dir: PathBuf,
    progress: bool,
}

impl Downloader {
    pub fn new(pack_home: &Path) -> Self {
        Self {
            cache_dir: pack_home.join(DOWNLOAD_CACHE_DIR),
            progress: false,
        }
    }

    /// Draw a progress bar while fetching remote assets
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Where a remote asset is kept once downloaded
    pub fn cache_path(&self, uri: &str) -> PathBuf {
        self.cache_dir.join(hex::encode(Sha256::digest(uri.as_bytes())))
    }

    /// Local path holding the content of `uri`
    pub fn download(&self, uri: &str) -> PackResult<PathBuf> {
        match classify(uri)? {
            Source::Local(path) => {
                if !path.exists() {
                    return Err(PackError::NotFound(format!("asset {}", path.display())));
                }
                Ok(path)
            }
            Source::Remote(url) => {
                let dest = self.cache_path(&url);
                if dest.exists() {
                    debug!("Using cached {} from {}", url, dest.display());
                    return Ok(dest);
                }
                self.fetch(&url, &dest)?;
                Ok(dest)
            }
        }
    }

    fn fetch(&self, url: &str, dest: &Path) -> PackResult<()> {
        fs::create_dir_all(&self.cache_dir).map_err(|e| {
            PackError::io(format!("creating {}", self.cache_dir.display()), e)
        })?;
        info!("Downloading {}", url);

        let download_err = |reason: String| PackError::Download {
            uri: url.to_string(),
            reason,
        };
        let response = ureq::get(url).call().map_err(|e| download_err(e.to_string()))?;
        let length = response
            .headers()
            .get(ureq::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let bar = self.progress_bar(length);
        let mut reader = bar.wrap_read(response.into_body().into_reader());

        // Written beside the destination so the final rename stays on one filesystem
        let mut tmp = NamedTempFile::new_in(&self.cache_dir)
            .map_err(|e| PackError::io("creating download file", e))?;
        io::copy(&mut reader, &mut tmp).map_err(|e| download_err(e.to_string()))?;
        tmp.flush()
            .map_err(|e| PackError::io("flushing download file", e))?;
        bar.finish_and_clear();

        tmp.persist(dest)
            .map_err(|e| PackError::io(format!("saving {}", dest.display()), e.error))?;
        debug!("Saved {} to {}", url, dest.display());
        Ok(())
    }

    fn progress_bar(&self, length: Option<u64>) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        match length {
            Some(len) => {
                let bar = ProgressBar::new(len);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("  {spinner:.cyan} Downloading  {bar:20.cyan/dim} {bytes}/{total_bytes}  {elapsed:.dim}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("━╸─"),
                );
                bar
            }
            None => ProgressBar::new_spinner(),
        }
    }
}
