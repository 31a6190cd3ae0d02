//! Buildpack and lifecycle blobs
//!
//! A blob is either a directory or a (possibly gzipped) tar file. Both are
//! read through the same entry-level interface so builders can re-root
//! their contents into image layers.

use crate::archive::{self, clean_entry_name, Owner};
use crate::error::{PackError, PackResult};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tar::EntryType;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blob {
    Dir(PathBuf),
    Archive(PathBuf),
}

impl Blob {
    /// Classify an existing path
    pub fn from_path(path: impl Into<PathBuf>) -> PackResult<Self> {
        let path = path.into();
        let meta = fs::metadata(&path)
            .map_err(|e| PackError::io(format!("opening blob {}", path.display()), e))?;
        if meta.is_dir() {
            Ok(Self::Dir(path))
        } else {
            Ok(Self::Archive(path))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Dir(p) | Self::Archive(p) => p,
        }
    }

    /// Content of a file at the blob root, `None` when absent
    pub fn read_file(&self, name: &str) -> PackResult<Option<Vec<u8>>> {
        match self {
            Self::Dir(dir) => {
                let path = dir.join(name);
                match fs::read(&path) {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(PackError::io(format!("reading {}", path.display()), e)),
                }
            }
            Self::Archive(path) => match archive::read_tar_entry(path, &[name]) {
                Ok((_, bytes)) => Ok(Some(bytes)),
                Err(PackError::EntryNotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    /// Cleaned names of every entry in the blob
    pub fn entry_names(&self) -> PackResult<Vec<String>> {
        match self {
            Self::Dir(dir) => {
                let mut names = Vec::new();
                for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
                    let entry = entry.map_err(|e| {
                        PackError::io(
                            format!("walking {}", dir.display()),
                            e.into_io_error()
                                .unwrap_or_else(|| io::Error::other("filesystem loop detected")),
                        )
                    })?;
                    let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
                    names.push(clean_entry_name(&rel.to_string_lossy()));
                }
                Ok(names)
            }
            Self::Archive(path) => Ok(archive::list_entries(path)?
                .into_iter()
                .map(|(name, _)| name)
                .collect()),
        }
    }

    /// Copy every entry under `prefix`
    pub fn write_to_tar<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        prefix: &str,
        owner: Owner,
        mode: Option<u32>,
    ) -> PackResult<()> {
        let prefix = clean_entry_name(prefix);
        self.copy_entries(builder, owner, mode, |name| Some(format!("{}/{}", prefix, name)))
    }

    /// Copy entries whose destination `map` returns, normalizing headers.
    ///
    /// Directories, regular files and symlinks are copied; other entry
    /// types are skipped.
    pub fn copy_entries<W, F>(
        &self,
        builder: &mut tar::Builder<W>,
        owner: Owner,
        mode: Option<u32>,
        map: F,
    ) -> PackResult<()>
    where
        W: Write,
        F: Fn(&str) -> Option<String>,
    {
        match self {
            Self::Dir(dir) => copy_dir_entries(dir, builder, owner, mode, &map),
            Self::Archive(path) => copy_archive_entries(path, builder, owner, mode, &map),
        }
    }

    /// Unpack the blob into `dest`
    pub fn extract_to(&self, dest: &Path) -> PackResult<()> {
        match self {
            Self::Dir(dir) => {
                let mut builder = tar::Builder::new(Vec::new());
                archive::write_dir_to_tar(&mut builder, dir, "", Owner::ROOT, None)?;
                let bytes = builder
                    .into_inner()
                    .map_err(|e| PackError::io(format!("packing {}", dir.display()), e))?;
                archive::extract_tar(&bytes[..], dest)
            }
            Self::Archive(path) => {
                let reader = archive::open_archive(path)?.into_inner();
                archive::extract_tar(reader, dest)
            }
        }
    }
}

fn copy_dir_entries<W: Write>(
    dir: &Path,
    builder: &mut tar::Builder<W>,
    owner: Owner,
    mode: Option<u32>,
    map: &dyn Fn(&str) -> Option<String>,
) -> PackResult<()> {
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            PackError::io(
                format!("walking {}", dir.display()),
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::other("filesystem loop detected")),
            )
        })?;
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let Some(dest) = map(&clean_entry_name(&rel.to_string_lossy())) else {
            continue;
        };
        let meta = entry
            .path()
            .symlink_metadata()
            .map_err(|e| PackError::io(format!("reading {}", entry.path().display()), e))?;
        let entry_mode = mode.unwrap_or_else(|| file_mode(&meta));

        if meta.file_type().is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(|e| PackError::io(format!("reading {}", entry.path().display()), e))?;
            archive::add_symlink(builder, &dest, &target.to_string_lossy(), owner)?;
        } else if meta.is_dir() {
            archive::add_dir(builder, &dest, owner, entry_mode)?;
        } else if meta.is_file() {
            let file = File::open(entry.path())
                .map_err(|e| PackError::io(format!("opening {}", entry.path().display()), e))?;
            append_reader(builder, &dest, meta.len(), BufReader::new(file), owner, entry_mode)?;
        }
    }
    Ok(())
}

fn copy_archive_entries<W: Write>(
    path: &Path,
    builder: &mut tar::Builder<W>,
    owner: Owner,
    mode: Option<u32>,
    map: &dyn Fn(&str) -> Option<String>,
) -> PackResult<()> {
    let mut archive = archive::open_archive(path)?;
    let context = format!("reading blob {}", path.display());
    for entry in archive
        .entries()
        .map_err(|e| PackError::io(context.clone(), e))?
    {
        let mut entry = entry.map_err(|e| PackError::io(context.clone(), e))?;
        let name = clean_entry_name(
            &entry
                .path()
                .map_err(|e| PackError::io(context.clone(), e))?
                .to_string_lossy(),
        );
        if name.is_empty() {
            continue;
        }
        let Some(dest) = map(&name) else {
            continue;
        };
        let entry_mode = mode.unwrap_or_else(|| entry.header().mode().unwrap_or(0o644));

        match entry.header().entry_type() {
            EntryType::Directory => archive::add_dir(builder, &dest, owner, entry_mode)?,
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| PackError::io(context.clone(), e))?
                    .map(|t| t.to_string_lossy().into_owned())
                    .unwrap_or_default();
                archive::add_symlink(builder, &dest, &target, owner)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                let size = entry.header().size().unwrap_or(0);
                append_reader(builder, &dest, size, &mut entry, owner, entry_mode)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn append_reader<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    dest: &str,
    size: u64,
    reader: R,
    owner: Owner,
    mode: u32,
) -> PackResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(mode);
    header.set_uid(owner.uid);
    header.set_gid(owner.gid);
    header.set_mtime(archive::NORMALIZED_MTIME);
    header.set_size(size);
    let name = clean_entry_name(dest);
    builder
        .append_data(&mut header, &name, reader)
        .map_err(|e| PackError::io(format!("writing tar entry {}", name), e))
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    fn dir_blob() -> (TempDir, Blob) {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("buildpack.toml"), "[buildpack]\nid = \"bp\"").unwrap();
        fs::create_dir(temp.path().join("bin")).unwrap();
        fs::write(temp.path().join("bin/build"), "#!/bin/sh").unwrap();
        let blob = Blob::from_path(temp.path()).unwrap();
        (temp, blob)
    }

    #[test]
    fn dir_blob_reads_files() {
        let (_temp, blob) = dir_blob();
        assert!(matches!(blob, Blob::Dir(_)));
        assert!(blob.read_file("buildpack.toml").unwrap().is_some());
        assert!(blob.read_file("missing.toml").unwrap().is_none());
    }

    #[test]
    fn write_to_tar_reroots() {
        let (_temp, blob) = dir_blob();
        let mut builder = tar::Builder::new(Vec::new());
        blob.write_to_tar(&mut builder, "/cnb/buildpacks/bp/1.0", Owner::new(1000, 1000), None)
            .unwrap();
        let bytes = builder.into_inner().unwrap();
        assert_eq!(
            names(&bytes),
            vec![
                "cnb/buildpacks/bp/1.0/bin/",
                "cnb/buildpacks/bp/1.0/bin/build",
                "cnb/buildpacks/bp/1.0/buildpack.toml",
            ]
        );
    }

    #[test]
    fn archive_blob_roundtrip() {
        let (_temp, dir) = dir_blob();
        let out = TempDir::new().unwrap();
        let tar_path = out.path().join("bp.tar");
        let file = File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(file);
        dir.write_to_tar(&mut builder, "", Owner::ROOT, None).unwrap();
        builder.into_inner().unwrap();

        let blob = Blob::from_path(&tar_path).unwrap();
        assert!(matches!(blob, Blob::Archive(_)));
        assert_eq!(
            blob.read_file("buildpack.toml").unwrap().unwrap(),
            b"[buildpack]\nid = \"bp\""
        );
        assert!(blob.entry_names().unwrap().contains(&"bin/build".to_string()));

        let dest = TempDir::new().unwrap();
        blob.extract_to(dest.path()).unwrap();
        assert!(dest.path().join("bin/build").exists());
    }

    #[test]
    fn copy_entries_filters() {
        let (_temp, blob) = dir_blob();
        let mut builder = tar::Builder::new(Vec::new());
        blob.copy_entries(&mut builder, Owner::ROOT, Some(0o755), |name| {
            name.strip_prefix("bin/").map(|n| format!("cnb/lifecycle/{}", n))
        })
        .unwrap();
        let bytes = builder.into_inner().unwrap();
        assert_eq!(names(&bytes), vec!["cnb/lifecycle/build"]);
    }
}
