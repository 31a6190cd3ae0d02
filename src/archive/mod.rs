//! Deterministic tar streams
//!
//! Every entry written here carries a fixed mtime, the configured owner,
//! empty user/group names, and a stable lexicographic order. Layer digests
//! depend on it.

use crate::error::{PackError, PackResult};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{EntryType, Header};
use walkdir::WalkDir;

/// 1980-01-01T00:00:01Z, the timestamp stamped on every emitted entry
pub const NORMALIZED_MTIME: u64 = 315_532_801;

/// Default mode for single file entries
pub const DEFAULT_FILE_MODE: u32 = 0o644;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Owner applied to emitted entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Owner {
    pub uid: u64,
    pub gid: u64,
}

impl Owner {
    pub const ROOT: Owner = Owner { uid: 0, gid: 0 };

    pub fn new(uid: u64, gid: u64) -> Self {
        Self { uid, gid }
    }
}

/// Strip leading `/`, `./`, duplicate separators and trailing slashes.
///
/// `..` segments are resolved lexically and never climb above the root.
pub fn clean_entry_name(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn new_header(entry_type: EntryType, mode: u32, owner: Owner) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(owner.uid);
    header.set_gid(owner.gid);
    header.set_mtime(NORMALIZED_MTIME);
    header.set_size(0);
    header
}

fn tar_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> PackError {
    let context = context.into();
    move |e| PackError::io(context, e)
}

/// Append a directory entry, written with a single trailing slash
pub fn add_dir<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    owner: Owner,
    mode: u32,
) -> PackResult<()> {
    let name = format!("{}/", clean_entry_name(path));
    let mut header = new_header(EntryType::Directory, mode, owner);
    builder
        .append_data(&mut header, &name, io::empty())
        .map_err(tar_err(format!("writing tar entry {}", name)))
}

/// Append a regular file entry with in-memory content
pub fn add_file<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    content: &[u8],
    owner: Owner,
    mode: u32,
) -> PackResult<()> {
    let name = clean_entry_name(path);
    let mut header = new_header(EntryType::Regular, mode, owner);
    header.set_size(content.len() as u64);
    builder
        .append_data(&mut header, &name, content)
        .map_err(tar_err(format!("writing tar entry {}", name)))
}

/// Append a symlink entry; the target is written as given
pub fn add_symlink<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    target: &str,
    owner: Owner,
) -> PackResult<()> {
    let name = clean_entry_name(path);
    let mut header = new_header(EntryType::Symlink, 0o777, owner);
    builder
        .append_link(&mut header, &name, target)
        .map_err(tar_err(format!("writing tar symlink {}", name)))
}

/// Append every parent directory of `path` (exclusive), outermost first
pub fn add_parent_dirs<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    owner: Owner,
    mode: u32,
) -> PackResult<()> {
    let cleaned = clean_entry_name(path);
    let mut current = String::new();
    let segments: Vec<&str> = cleaned.split('/').collect();
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        add_dir(builder, &current, owner, mode)?;
    }
    Ok(())
}

/// Walk `src_dir` and emit its contents under `tar_prefix`.
///
/// `src_dir` itself is skipped. Only regular files, directories and
/// symlinks are written. When `mode` is set it replaces the permission
/// bits of every entry.
pub fn write_dir_to_tar<W: Write>(
    builder: &mut tar::Builder<W>,
    src_dir: &Path,
    tar_prefix: &str,
    owner: Owner,
    mode: Option<u32>,
) -> PackResult<()> {
    let prefix = clean_entry_name(tar_prefix);

    let walker = WalkDir::new(src_dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| src_dir.display().to_string());
            PackError::io(
                format!("walking {}", path),
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::other("filesystem loop detected")),
            )
        })?;

        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| PackError::Internal(format!("walked outside of source dir: {}", e)))?;
        let rel = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        let name = if prefix.is_empty() {
            rel
        } else {
            format!("{}/{}", prefix, rel)
        };

        let meta = entry
            .path()
            .symlink_metadata()
            .map_err(tar_err(format!("reading metadata of {}", entry.path().display())))?;
        let file_type = meta.file_type();
        let entry_mode = mode.unwrap_or_else(|| permission_bits(&meta));

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(tar_err(format!("reading link {}", entry.path().display())))?;
            add_symlink(builder, &name, &target.to_string_lossy(), owner)?;
        } else if file_type.is_dir() {
            add_dir(builder, &name, owner, entry_mode)?;
        } else if file_type.is_file() {
            let mut header = new_header(EntryType::Regular, entry_mode, owner);
            header.set_size(meta.len());
            let file = File::open(entry.path())
                .map_err(tar_err(format!("opening {}", entry.path().display())))?;
            builder
                .append_data(&mut header, &name, BufReader::new(file))
                .map_err(tar_err(format!("writing tar entry {}", name)))?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Write a normalized tar of `src_dir` to `tar_path`
pub fn create_tar_file(
    tar_path: &Path,
    src_dir: &Path,
    tar_prefix: &str,
    owner: Owner,
    mode: Option<u32>,
) -> PackResult<()> {
    let file = File::create(tar_path)
        .map_err(tar_err(format!("creating {}", tar_path.display())))?;
    let mut builder = tar::Builder::new(file);
    write_dir_to_tar(&mut builder, src_dir, tar_prefix, owner, mode)?;
    builder
        .into_inner()
        .and_then(|mut f| f.flush())
        .map_err(tar_err(format!("finishing {}", tar_path.display())))
}

/// Write a tar with exactly one regular file into `writer`
pub fn single_file_tar<W: Write>(
    writer: W,
    path: &str,
    content: &[u8],
    mode: u32,
) -> PackResult<W> {
    let mut builder = tar::Builder::new(writer);
    add_file(&mut builder, path, content, Owner::ROOT, mode)?;
    builder
        .into_inner()
        .map_err(tar_err(format!("finishing tar for {}", path)))
}

/// Create a single file tar at `tar_path`
pub fn create_single_file_tar(
    tar_path: &Path,
    path: &str,
    content: &[u8],
    mode: u32,
) -> PackResult<()> {
    let file = File::create(tar_path)
        .map_err(tar_err(format!("creating {}", tar_path.display())))?;
    let mut file = single_file_tar(file, path, content, mode)?;
    file.flush()
        .map_err(tar_err(format!("flushing {}", tar_path.display())))
}

/// Open a `.tar` or `.tgz` file, detecting gzip by its magic bytes
pub fn open_archive(path: &Path) -> PackResult<tar::Archive<Box<dyn Read>>> {
    let mut file =
        File::open(path).map_err(tar_err(format!("opening archive {}", path.display())))?;
    let mut magic = [0u8; 2];
    let read = read_up_to(&mut file, &mut magic)
        .map_err(tar_err(format!("reading archive {}", path.display())))?;

    let file = File::open(path).map_err(tar_err(format!("opening archive {}", path.display())))?;
    let reader: Box<dyn Read> = if read == 2 && magic == GZIP_MAGIC {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(tar::Archive::new(reader))
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Names of all entries in an archive, cleaned
pub fn list_entries(path: &Path) -> PackResult<Vec<(String, EntryType)>> {
    let mut archive = open_archive(path)?;
    let context = format!("reading archive {}", path.display());
    let mut names = Vec::new();
    for entry in archive.entries().map_err(tar_err(context.clone()))? {
        let entry = entry.map_err(tar_err(context.clone()))?;
        let name = entry.path().map_err(tar_err(context.clone()))?;
        names.push((
            clean_entry_name(&name.to_string_lossy()),
            entry.header().entry_type(),
        ));
    }
    Ok(names)
}

/// Find the first entry whose name matches one of `candidates`
pub fn read_tar_entry(tar_path: &Path, candidates: &[&str]) -> PackResult<(Header, Vec<u8>)> {
    let wanted: Vec<String> = candidates.iter().map(|c| clean_entry_name(c)).collect();
    let mut archive = open_archive(tar_path)?;
    let context = format!("reading archive {}", tar_path.display());

    for entry in archive.entries().map_err(tar_err(context.clone()))? {
        let mut entry = entry.map_err(tar_err(context.clone()))?;
        let name = clean_entry_name(&entry.path().map_err(tar_err(context.clone()))?.to_string_lossy());
        if wanted.iter().any(|w| *w == name) {
            let header = entry.header().clone();
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(tar_err(format!("reading entry {} of {}", name, tar_path.display())))?;
            return Ok((header, content));
        }
    }

    Err(PackError::EntryNotFound {
        archive: tar_path.to_path_buf(),
        candidates: candidates.join(", "),
    })
}

/// Materialize a tar stream under `dest`.
///
/// Parents are created with mode 0755. Only directories, regular files and
/// symlinks are accepted; anything else fails with `BadTarEntry`.
pub fn extract_tar<R: Read>(reader: R, dest: &Path) -> PackResult<()> {
    let mut archive = tar::Archive::new(reader);
    let context = format!("extracting into {}", dest.display());

    for entry in archive.entries().map_err(tar_err(context.clone()))? {
        let mut entry = entry.map_err(tar_err(context.clone()))?;
        let raw = entry.path().map_err(tar_err(context.clone()))?.to_string_lossy().into_owned();
        let name = clean_entry_name(&raw);
        if name.is_empty() {
            continue;
        }
        let target: PathBuf = dest.join(&name);
        let mode = entry.header().mode().unwrap_or(0o644);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)
                    .map_err(tar_err(format!("creating {}", target.display())))?;
                set_mode(&target, mode)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                ensure_parent(&target)?;
                let mut out = File::create(&target)
                    .map_err(tar_err(format!("creating {}", target.display())))?;
                io::copy(&mut entry, &mut out)
                    .map_err(tar_err(format!("writing {}", target.display())))?;
                set_mode(&target, mode)?;
            }
            EntryType::Symlink => {
                ensure_parent(&target)?;
                let link = entry
                    .link_name()
                    .map_err(tar_err(context.clone()))?
                    .ok_or_else(|| PackError::BadTarEntry {
                        path: raw.clone(),
                        kind: "symlink without target".to_string(),
                    })?;
                make_symlink(&link, &target)?;
            }
            other => {
                return Err(PackError::BadTarEntry {
                    path: raw,
                    kind: format!("{:?}", other),
                });
            }
        }
    }
    Ok(())
}

/// Extract a gzip compressed tar stream
pub fn extract_tar_gz<R: Read>(reader: R, dest: &Path) -> PackResult<()> {
    extract_tar(GzDecoder::new(reader), dest)
}

fn ensure_parent(path: &Path) -> PackResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .map_err(tar_err(format!("creating {}", parent.display())))?;
            set_mode(parent, 0o755)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> PackResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(tar_err(format!("setting permissions on {}", path.display())))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> PackResult<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> PackResult<()> {
    std::os::unix::fs::symlink(link, target)
        .map_err(tar_err(format!("creating symlink {}", target.display())))
}

#[cfg(not(unix))]
fn make_symlink(_link: &Path, target: &Path) -> PackResult<()> {
    Err(PackError::BadTarEntry {
        path: target.display().to_string(),
        kind: "symlinks are not supported on this platform".to_string(),
    })
}
