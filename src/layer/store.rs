//! Layer store backed by an artifacts directory

use super::{escape_identifier, DIGEST_PREFIX};
use crate::archive::{self, Owner};
use crate::error::{PackError, PackResult};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A layer tar persisted on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// `sha256:<hex>` of the uncompressed tar
    pub diff_id: String,
    pub path: PathBuf,
}

/// Writer that hashes everything passing through it
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Finish hashing and hand back the inner writer with the digest
    pub fn finish(self) -> (W, String) {
        let digest = format!("{}{}", DIGEST_PREFIX, hex::encode(self.hasher.finalize()));
        (self.inner, digest)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// diffID of an in-memory tar
pub fn diff_id_of_bytes(bytes: &[u8]) -> String {
    format!("{}{}", DIGEST_PREFIX, hex::encode(Sha256::digest(bytes)))
}

/// diffID of a tar file on disk
pub fn diff_id_of_file(path: &Path) -> PackResult<String> {
    let mut file =
        File::open(path).map_err(|e| PackError::io(format!("opening {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| PackError::io(format!("hashing {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{}{}", DIGEST_PREFIX, hex::encode(hasher.finalize())))
}

/// Writes layer tars into a directory, one file per identifier
#[derive(Debug, Clone)]
pub struct LayerStore {
    artifacts: PathBuf,
}

impl LayerStore {
    /// Use `artifacts` as the backing directory, creating it if needed
    pub fn new(artifacts: impl Into<PathBuf>) -> PackResult<Self> {
        let artifacts = artifacts.into();
        fs::create_dir_all(&artifacts).map_err(|e| {
            PackError::io(format!("creating layer directory {}", artifacts.display()), e)
        })?;
        Ok(Self { artifacts })
    }

    pub fn dir(&self) -> &Path {
        &self.artifacts
    }

    /// Path where the tar for `id` lives
    pub fn layer_path(&self, id: &str) -> PathBuf {
        self.artifacts.join(format!("{}.tar", escape_identifier(id)))
    }

    /// Tar `src_dir` under `tar_prefix` and record its diffID
    pub fn create_layer(
        &self,
        id: &str,
        src_dir: &Path,
        tar_prefix: &str,
        owner: Owner,
        mode: Option<u32>,
    ) -> PackResult<Layer> {
        self.create_layer_with(id, |builder| {
            archive::write_dir_to_tar(builder, src_dir, tar_prefix, owner, mode)
        })
    }

    /// Build a layer from arbitrary entries appended by `fill`
    pub fn create_layer_with<F>(&self, id: &str, fill: F) -> PackResult<Layer>
    where
        F: FnOnce(&mut tar::Builder<HashingWriter<BufWriter<File>>>) -> PackResult<()>,
    {
        let path = self.layer_path(id);
        let file = File::create(&path)
            .map_err(|e| PackError::io(format!("creating layer {}", path.display()), e))?;
        let mut builder = tar::Builder::new(HashingWriter::new(BufWriter::new(file)));
        fill(&mut builder)?;

        let writer = builder
            .into_inner()
            .map_err(|e| PackError::io(format!("finishing layer {}", path.display()), e))?;
        let (mut inner, diff_id) = writer.finish();
        inner
            .flush()
            .map_err(|e| PackError::io(format!("flushing layer {}", path.display()), e))?;

        debug!("Created layer {} ({})", id, diff_id);
        Ok(Layer { diff_id, path })
    }

    /// Copy an existing tar into the store and hash it
    pub fn import(&self, id: &str, mut reader: impl Read) -> PackResult<Layer> {
        let path = self.layer_path(id);
        let file = File::create(&path)
            .map_err(|e| PackError::io(format!("creating layer {}", path.display()), e))?;
        let mut writer = HashingWriter::new(BufWriter::new(file));
        io::copy(&mut reader, &mut writer)
            .map_err(|e| PackError::io(format!("writing layer {}", path.display()), e))?;
        let (mut inner, diff_id) = writer.finish();
        inner
            .flush()
            .map_err(|e| PackError::io(format!("flushing layer {}", path.display()), e))?;
        Ok(Layer { diff_id, path })
    }
}
