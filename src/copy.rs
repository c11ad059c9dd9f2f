//! Copying single entries from a source tree into its mirror.
//! Files keep their modification time; symbolic links are recreated with
//! their targets remapped onto the mirror root.

use crate::error::{FailureClass, MirrorError, Result};
use crate::logger::Logger;
use crate::pathmap::PathMapper;
use filetime::FileTime;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// What a single `copy_entry` call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    File { bytes: u64 },
    Link { target: PathBuf },
}

/// Statistics for tree-wide copy operations
#[derive(Debug, Default, Clone)]
pub struct CopyStats {
    pub files_copied: u64,
    pub links_created: u64,
    pub dirs_created: u64,
    pub bytes_copied: u64,
    pub errors: Vec<String>,
    /// Entries that failed with an error worth retrying.
    pub transient_failures: u64,
}

impl CopyStats {
    pub fn add_outcome(&mut self, outcome: &CopyOutcome) {
        match outcome {
            CopyOutcome::File { bytes } => {
                self.files_copied += 1;
                self.bytes_copied += bytes;
            }
            CopyOutcome::Link { .. } => self.links_created += 1,
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_failure(&mut self, error: &MirrorError) {
        if error.class() == FailureClass::Transient {
            self.transient_failures += 1;
        }
        self.add_error(error.to_string());
    }
}

/// Copy or re-link one entry, overwriting whatever is at `dst`.
pub fn copy_entry(
    src: &Path,
    dst: &Path,
    mapper: &PathMapper,
    logger: &dyn Logger,
) -> Result<CopyOutcome> {
    let meta = match fs::symlink_metadata(src) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(MirrorError::SourceVanished {
                path: src.to_path_buf(),
            })
        }
        Err(e) => return Err(MirrorError::io("stat", src, e)),
    };

    ensure_parent_exists(dst)?;

    if meta.file_type().is_symlink() {
        let raw = fs::read_link(src).map_err(|e| vanished_or_io("readlink", src, e))?;
        let target = mapper.rewrite_link_target(&raw);
        remove_entry(dst)?;
        create_symlink(&target, dst, src).map_err(|e| MirrorError::io("symlink", dst, e))?;
        logger.linked(src, dst, &target);
        Ok(CopyOutcome::Link { target })
    } else {
        let bytes = copy_file(src, dst)?;
        logger.copied(src, dst, bytes);
        Ok(CopyOutcome::File { bytes })
    }
}

/// Copy file bytes and modification time.
fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Ok(existing) = fs::symlink_metadata(dst) {
        if !existing.file_type().is_file() {
            remove_entry(dst)?;
        }
    }

    let bytes = fs::copy(src, dst).map_err(|e| vanished_or_io("copy", src, e))?;

    // mtime is read after the bytes are copied.
    let meta = fs::metadata(src).map_err(|e| vanished_or_io("stat", src, e))?;
    let mtime = FileTime::from_last_modification_time(&meta);
    filetime::set_file_mtime(dst, mtime).map_err(|e| MirrorError::io("set mtime", dst, e))?;

    Ok(bytes)
}

/// Map a failure to `SourceVanished` when the source is no longer there.
fn vanished_or_io(op: &'static str, src: &Path, e: io::Error) -> MirrorError {
    if e.kind() == io::ErrorKind::NotFound && fs::symlink_metadata(src).is_err() {
        MirrorError::SourceVanished {
            path: src.to_path_buf(),
        }
    } else {
        MirrorError::io(op, src, e)
    }
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path, _src: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path, src: &Path) -> io::Result<()> {
    // Windows needs to know up front whether the link names a directory.
    if fs::metadata(src).map(|m| m.is_dir()).unwrap_or(false) {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

/// Check if a file needs to be copied: missing, not a regular file, or
/// size/modification time differ. Content is never compared.
pub fn file_needs_copy(src: &Path, dst: &Path) -> Result<bool> {
    let dst_meta = match fs::symlink_metadata(dst) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(MirrorError::io("stat", dst, e)),
    };
    if !dst_meta.file_type().is_file() {
        return Ok(true);
    }

    let src_meta = fs::metadata(src).map_err(|e| vanished_or_io("stat", src, e))?;

    if src_meta.len() != dst_meta.len() {
        return Ok(true);
    }

    let src_time = FileTime::from_last_modification_time(&src_meta);
    let dst_time = FileTime::from_last_modification_time(&dst_meta);
    Ok(src_time != dst_time)
}

/// Remove a file, link or directory tree. Returns whether anything was there.
pub fn remove_entry(path: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(MirrorError::io("stat", path, e)),
    };

    let result = if meta.file_type().is_dir() {
        fs::remove_dir_all(path)
    } else if is_dir_link(&meta) {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(MirrorError::io("remove", path, e)),
    }
}

#[cfg(windows)]
fn is_dir_link(meta: &fs::Metadata) -> bool {
    use std::os::windows::fs::FileTypeExt;
    meta.file_type().is_symlink_dir()
}

#[cfg(not(windows))]
fn is_dir_link(_meta: &fs::Metadata) -> bool {
    false
}

/// True when `path` itself is a symbolic link, dangling or not.
pub fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Create directory with parent creation. Returns whether it was created.
pub fn ensure_dir_exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => return Ok(false),
        Ok(_) => {
            remove_entry(path)?;
        }
        Err(_) => {}
    }
    fs::create_dir_all(path).map_err(|e| MirrorError::io("create dir", path, e))?;
    Ok(true)
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.is_dir() {
            ensure_dir_exists(parent)?;
        }
    }
    Ok(())
}
