//! Layer extraction with OCI whiteout handling.
//!
//! Each layer blob is read twice. The first pass applies every whiteout in
//! the layer; the second materializes the remaining entries. A single pass
//! could meet a file before the whiteout that precedes it logically, so
//! deletions must be complete before anything is written.
//!
//! Whiteout semantics (OCI Image Spec v1.1):
//! - `.wh.<name>` removes the sibling `<name>` inherited from a lower layer.
//! - `.wh..wh..opq` clears the inherited contents of its directory.
//!
//! Blobs may be gzip, zstd, or plain tar; the format is sniffed from the
//! first bytes.

use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, File, Permissions};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt, chown, fchown, lchown, symlink};
use std::path::{Component, Path, PathBuf};

use flate2::read::MultiGzDecoder;
use tar::{Archive, EntryType};

use crate::{Error, IoResultExt, Result};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Mode for parent directories a layer never declared.
const IMPLICIT_DIR_MODE: u32 = 0o755;

/// Symlinks followed while resolving one path before giving up.
const MAX_SYMLINK_HOPS: u32 = 255;

/// Offset added to every entry's recorded uid/gid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct IdOffset {
    /// Added to entry uids.
    pub uid: u32,
    /// Added to entry gids.
    pub gid: u32,
}

impl IdOffset {
    /// Creates an offset.
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    fn apply(self, uid: u64, gid: u64) -> Option<(u32, u32)> {
        let uid = u32::try_from(uid).ok()?.checked_add(self.uid)?;
        let gid = u32::try_from(gid).ok()?.checked_add(self.gid)?;
        Some((uid, gid))
    }
}

/// Kind-specific part of a tar entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKind {
    Regular,
    Directory,
    /// Target is cleaned and relative to the rootfs.
    HardLink { target: PathBuf },
    /// Target is kept verbatim.
    Symlink { target: PathBuf },
    Other,
}

/// One tar header, decoded.
#[derive(Debug)]
struct TarEntry {
    kind: EntryKind,
    /// Cleaned, relative to the rootfs.
    path: PathBuf,
    mode: u32,
    uid: u64,
    gid: u64,
}

impl TarEntry {
    fn read<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Self> {
        let header = entry.header();
        let kind = match header.entry_type() {
            EntryType::Regular | EntryType::Continuous => EntryKind::Regular,
            EntryType::Directory => EntryKind::Directory,
            EntryType::Link => EntryKind::HardLink {
                target: sanitize(&link_name(entry)?),
            },
            EntryType::Symlink => EntryKind::Symlink {
                target: link_name(entry)?,
            },
            _ => EntryKind::Other,
        };
        Ok(Self {
            kind,
            path: sanitize(&entry.path()?),
            mode: header.mode()? & 0o7777,
            uid: header.uid()?,
            gid: header.gid()?,
        })
    }

    fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(OsStr::to_str)
    }

    fn is_whiteout(&self) -> bool {
        self.file_name()
            .is_some_and(|name| name.starts_with(WHITEOUT_PREFIX))
    }
}

fn link_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<PathBuf> {
    entry.link_name()?.map(Cow::into_owned).ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "link entry without a target",
        ))
    })
}

/// Applies one layer blob to `rootfs`.
///
/// Ownership of every materialized entry is its recorded uid/gid plus
/// `offset`.
pub fn extract_layer<R: Read + Seek>(blob: &mut R, rootfs: &Path, offset: IdOffset) -> Result<()> {
    tracing::debug!(rootfs = %rootfs.display(), "applying whiteouts");
    apply_whiteouts(&mut open_archive(blob)?, rootfs)?;

    tracing::debug!(rootfs = %rootfs.display(), "materializing entries");
    materialize(&mut open_archive(blob)?, rootfs, offset)
}

/// Rewinds `blob` and wraps it in the matching decompressor.
fn open_archive<'a, R: Read + Seek>(blob: &'a mut R) -> Result<Archive<Box<dyn Read + 'a>>> {
    blob.seek(SeekFrom::Start(0))?;
    let mut magic = Vec::with_capacity(ZSTD_MAGIC.len());
    blob.by_ref()
        .take(ZSTD_MAGIC.len() as u64)
        .read_to_end(&mut magic)?;
    blob.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn Read + 'a> = if magic.starts_with(GZIP_MAGIC) {
        Box::new(MultiGzDecoder::new(BufReader::new(blob)))
    } else if magic.starts_with(ZSTD_MAGIC) {
        Box::new(zstd::stream::read::Decoder::new(blob)?)
    } else {
        Box::new(BufReader::new(blob))
    };
    Ok(Archive::new(reader))
}

/// First pass: deletions only.
fn apply_whiteouts<R: Read>(archive: &mut Archive<R>, rootfs: &Path) -> Result<()> {
    for raw_entry in archive.entries()? {
        let entry = TarEntry::read(&raw_entry?)?;
        let Some(name) = entry.file_name() else {
            continue;
        };

        if name == OPAQUE_MARKER {
            let dir = scoped_path(rootfs, &entry.path)?;
            if let Some(dir) = dir.parent() {
                clear_dir(dir)?;
            }
        } else if let Some(victim) = name.strip_prefix(WHITEOUT_PREFIX) {
            if victim.is_empty() || victim == "." || victim == ".." {
                continue;
            }
            let marker = scoped_path(rootfs, &entry.path)?;
            remove_all(&marker.with_file_name(victim))?;
        }
    }
    Ok(())
}

/// Second pass: everything that is not a whiteout.
fn materialize<R: Read>(archive: &mut Archive<R>, rootfs: &Path, offset: IdOffset) -> Result<()> {
    for raw_entry in archive.entries()? {
        let mut raw_entry = raw_entry?;
        let entry = TarEntry::read(&raw_entry)?;
        if entry.is_whiteout() {
            continue;
        }
        write_entry(rootfs, &entry, &mut raw_entry, offset)?;
    }
    Ok(())
}

fn write_entry(rootfs: &Path, entry: &TarEntry, data: &mut impl Read, offset: IdOffset) -> Result<()> {
    let target = scoped_path(rootfs, &entry.path)?;
    let (uid, gid) = offset.apply(entry.uid, entry.gid).ok_or_else(|| Error::Extract {
        path: target.clone(),
        source: io::Error::new(
            io::ErrorKind::InvalidData,
            format!("owner {}:{} overflows with offset {offset:?}", entry.uid, entry.gid),
        ),
    })?;

    if entry.path.as_os_str().is_empty() && entry.kind != EntryKind::Directory {
        tracing::debug!(kind = ?entry.kind, "skipping non-directory entry for the rootfs itself");
        return Ok(());
    }

    match &entry.kind {
        EntryKind::Regular => {
            ensure_parent(&target)?;
            remove_all(&target)?;
            let mut file = File::create(&target).at(&target)?;
            io::copy(data, &mut file).at(&target)?;
            // chown clears setuid/setgid, so the mode goes on last.
            fchown(&file, Some(uid), Some(gid)).at(&target)?;
            file.set_permissions(Permissions::from_mode(entry.mode))
                .at(&target)?;
        }
        EntryKind::Directory => {
            match fs::symlink_metadata(&target) {
                Ok(meta) if !meta.is_dir() => remove_all(&target)?,
                _ => {}
            }
            DirBuilder::new()
                .recursive(true)
                .mode(entry.mode)
                .create(&target)
                .at(&target)?;
            chown(&target, Some(uid), Some(gid)).at(&target)?;
            fs::set_permissions(&target, Permissions::from_mode(entry.mode)).at(&target)?;
        }
        EntryKind::HardLink { target: source } => {
            ensure_parent(&target)?;
            remove_all(&target)?;
            let source = scoped_path(rootfs, source)?;
            fs::hard_link(&source, &target).at(&target)?;
        }
        EntryKind::Symlink { target: link } => {
            ensure_parent(&target)?;
            remove_all(&target)?;
            symlink(link, &target).at(&target)?;
            lchown(&target, Some(uid), Some(gid)).at(&target)?;
        }
        EntryKind::Other => {
            tracing::debug!(path = %entry.path.display(), "ignoring unsupported entry type");
        }
    }
    Ok(())
}

/// Creates missing parent directories of `path` with [`IMPLICIT_DIR_MODE`].
fn ensure_parent(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    DirBuilder::new()
        .recursive(true)
        .mode(IMPLICIT_DIR_MODE)
        .create(parent)
        .at(parent)
}

/// Removes whatever occupies `path`. Absence is not an error.
fn remove_all(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if is_absent(&e) => return Ok(()),
        Err(e) => return Err(e).at(path),
    };
    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Err(e) if is_absent(&e) => Ok(()),
        other => other.at(path),
    }
}

/// Removes all contents of a directory without removing the directory itself.
fn clear_dir(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if is_absent(&e) => return Ok(()),
        Err(e) => return Err(e).at(dir),
    };
    for entry in entries {
        remove_all(&entry.at(dir)?.path())?;
    }
    Ok(())
}

fn is_absent(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

/// Cleans `path` as if rooted at `/`: `.` and root components vanish and
/// `..` never climbs above the start. The result is relative.
fn sanitize(path: &Path) -> PathBuf {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::ParentDir => {
                clean.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    clean
}

/// Joins a sanitized `rel` onto `root`, resolving symlinks among its parent
/// directories as if `root` were `/`. The final component is never followed.
fn scoped_path(root: &Path, rel: &Path) -> Result<PathBuf> {
    let Some(name) = rel.file_name() else {
        return Ok(root.to_path_buf());
    };

    let mut pending: Vec<OsString> = Vec::new();
    if let Some(parent) = rel.parent() {
        push_components(&mut pending, parent);
    }

    let mut resolved = PathBuf::new();
    let mut hops = 0;
    while let Some(part) = pending.pop() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let on_disk = root.join(&candidate);
        match fs::symlink_metadata(&on_disk) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(Error::Extract {
                        path: root.join(rel),
                        source: io::Error::new(
                            io::ErrorKind::InvalidData,
                            "too many levels of symbolic links",
                        ),
                    });
                }
                let link = fs::read_link(&on_disk).at(&on_disk)?;
                if link.has_root() {
                    resolved.clear();
                }
                push_components(&mut pending, &link);
            }
            _ => resolved = candidate,
        }
    }
    Ok(root.join(resolved).join(name))
}

/// Pushes `path`'s components so they pop off `stack` in order.
fn push_components(stack: &mut Vec<OsString>, path: &Path) {
    for component in path.components().rev() {
        match component {
            Component::Normal(part) => stack.push(part.to_os_string()),
            Component::ParentDir => stack.push("..".into()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
}
