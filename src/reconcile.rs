//! Restore: make a live tree match a reference tree.
//!
//! Two passes, in order:
//! 1. delete entries in the live tree that the reference does not have;
//! 2. copy reference files that are missing or stale (size or mtime differ).
//!
//! There is no move detection, so a rename between the two trees becomes a
//! delete followed by a copy.

use crate::cancel::CancelToken;
use crate::copy::{copy_entry, ensure_dir_exists, file_needs_copy, is_symlink, remove_entry, CopyOutcome};
use crate::error::{MirrorError, Result};
use crate::logger::Logger;
use crate::pathmap::{CaseSensitivity, PathMapper};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Instant;
use walkdir::WalkDir;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreStats {
    pub files_deleted: u64,
    pub dirs_deleted: u64,
    pub files_copied: u64,
    pub links_created: u64,
    pub dirs_created: u64,
    pub bytes_copied: u64,
}

impl RestoreStats {
    /// Whether the restore wrote anything into the live tree.
    pub fn changed_anything(&self) -> bool {
        self.files_deleted + self.dirs_deleted + self.files_copied + self.links_created + self.dirs_created
            > 0
    }
}

/// Run both passes. The first error aborts the restore.
pub fn restore(
    live_root: &Path,
    reference_root: &Path,
    logger: &dyn Logger,
    cancel: &CancelToken,
) -> Result<RestoreStats> {
    let start = Instant::now();
    let mut stats = RestoreStats::default();

    delete_extras(live_root, reference_root, logger, cancel, &mut stats)?;
    copy_changed(reference_root, live_root, logger, cancel, &mut stats)?;

    let elapsed = start.elapsed().as_secs_f64();
    logger.done("restore", stats.files_copied, stats.bytes_copied, elapsed);
    crate::log_event!(
        "restore",
        "finished",
        "{} deleted, {} copied, {} dirs created in {:.2}s",
        stats.files_deleted + stats.dirs_deleted,
        stats.files_copied + stats.links_created,
        stats.dirs_created,
        elapsed
    );
    Ok(stats)
}

/// Skip walk errors for entries that disappeared mid-walk.
fn walk_entry(entry: walkdir::Result<walkdir::DirEntry>) -> Result<Option<walkdir::DirEntry>> {
    match entry {
        Ok(e) => Ok(Some(e)),
        Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Pass 1: remove live entries whose relative path is absent from the reference.
///
/// A non-directory survives when the reference has a file at that path, or
/// a symbolic link there (valid or dangling). A directory survives when the
/// reference has a directory there, and is then descended into.
pub fn delete_extras(
    live_root: &Path,
    reference_root: &Path,
    logger: &dyn Logger,
    cancel: &CancelToken,
    stats: &mut RestoreStats,
) -> Result<()> {
    if !live_root.is_dir() {
        return Ok(());
    }

    let mut it = WalkDir::new(live_root).min_depth(1).follow_links(false).into_iter();
    while let Some(entry) = it.next() {
        cancel.check()?;
        let Some(entry) = walk_entry(entry)? else {
            continue;
        };
        let Ok(rel) = entry.path().strip_prefix(live_root) else {
            continue;
        };
        let reference = reference_root.join(rel);

        if entry.file_type().is_dir() {
            if !reference.is_dir() {
                it.skip_current_dir();
                if remove_entry(entry.path())? {
                    logger.removed(entry.path());
                    stats.dirs_deleted += 1;
                    crate::log_event!("restore", "removed extra directory", "{}", entry.path().display());
                }
            }
        } else if !reference.is_file() && !is_symlink(&reference) {
            if remove_entry(entry.path())? {
                logger.removed(entry.path());
                stats.files_deleted += 1;
                crate::log_event!("restore", "removed extra file", "{}", entry.path().display());
            }
        }
    }
    Ok(())
}

/// Pass 2: copy reference entries that are missing or stale in the live tree.
///
/// Links in the reference are recreated with targets pointing back into the
/// live root when they pointed into the reference root.
pub fn copy_changed(
    reference_root: &Path,
    live_root: &Path,
    logger: &dyn Logger,
    cancel: &CancelToken,
    stats: &mut RestoreStats,
) -> Result<()> {
    if ensure_dir_exists(live_root)? {
        logger.created_dir(live_root);
        stats.dirs_created += 1;
    }

    // Exact prefix matching: both roots are already normalized by the caller.
    let mapper = PathMapper::new(reference_root, live_root, CaseSensitivity::Sensitive);

    for entry in WalkDir::new(reference_root).min_depth(1).follow_links(false) {
        cancel.check()?;
        let Some(entry) = walk_entry(entry)? else {
            continue;
        };
        let Ok(rel) = entry.path().strip_prefix(reference_root) else {
            continue;
        };
        let dest = live_root.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if ensure_dir_exists(&dest)? {
                logger.created_dir(&dest);
                stats.dirs_created += 1;
            }
        } else if file_type.is_symlink() {
            if link_needs_update(entry.path(), &dest, &mapper)? {
                copy_entry(entry.path(), &dest, &mapper, logger)?;
                stats.links_created += 1;
            }
        } else if file_needs_copy(entry.path(), &dest)? {
            if let CopyOutcome::File { bytes } = copy_entry(entry.path(), &dest, &mapper, logger)? {
                stats.files_copied += 1;
                stats.bytes_copied += bytes;
            }
            crate::log_event!("restore", "restored", "{}", rel.display());
        }
    }
    Ok(())
}

fn link_needs_update(src: &Path, dest: &Path, mapper: &PathMapper) -> Result<bool> {
    if !is_symlink(dest) {
        return Ok(true);
    }
    let wanted = fs::read_link(src).map_err(|e| MirrorError::io("readlink", src, e))?;
    let current = fs::read_link(dest).map_err(|e| MirrorError::io("readlink", dest, e))?;
    Ok(current != mapper.rewrite_link_target(&wanted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{NoopLogger, RecordingLogger};
    use filetime::FileTime;

    fn write_at(path: &Path, data: &[u8], secs: i64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, data).unwrap();
        filetime::set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[test]
    fn restores_shape_and_content() {
        let live = tempfile::tempdir().unwrap();
        let reference = tempfile::tempdir().unwrap();

        write_at(&reference.path().join("keep.txt"), b"reference", 1_000);
        write_at(&reference.path().join("docs/a.md"), b"# a", 1_000);
        write_at(&reference.path().join("docs/new/b.md"), b"# b", 1_000);

        write_at(&live.path().join("keep.txt"), b"edited locally", 2_000);
        write_at(&live.path().join("extra.txt"), b"junk", 2_000);
        write_at(&live.path().join("docs/a.md"), b"# a", 1_000);
        write_at(&live.path().join("cache/blob"), b"zzz", 2_000);

        let stats = restore(live.path(), reference.path(), &NoopLogger, &CancelToken::new()).unwrap();

        assert_eq!(fs::read(live.path().join("keep.txt")).unwrap(), b"reference");
        assert!(!live.path().join("extra.txt").exists());
        assert!(!live.path().join("cache").exists());
        assert_eq!(fs::read(live.path().join("docs/new/b.md")).unwrap(), b"# b");
        let mtime = FileTime::from_last_modification_time(&fs::metadata(live.path().join("keep.txt")).unwrap());
        assert_eq!(mtime, FileTime::from_unix_time(1_000, 0));

        assert_eq!(stats.files_deleted, 1);
        assert_eq!(stats.dirs_deleted, 1);
        // keep.txt (stale) and docs/new/b.md (missing); docs/a.md already matches.
        assert_eq!(stats.files_copied, 2);
    }

    #[test]
    fn second_run_writes_nothing() {
        let live = tempfile::tempdir().unwrap();
        let reference = tempfile::tempdir().unwrap();
        write_at(&reference.path().join("a/b/c.txt"), b"c", 1_500);
        write_at(&reference.path().join("d.txt"), b"d", 1_500);

        let first = restore(live.path(), reference.path(), &NoopLogger, &CancelToken::new()).unwrap();
        assert!(first.changed_anything());

        let logger = RecordingLogger::default();
        let second = restore(live.path(), reference.path(), &logger, &CancelToken::new()).unwrap();
        assert!(!second.changed_anything());
        assert_eq!(logger.count("COPY"), 0);
        assert_eq!(logger.count("DELETE"), 0);
    }

    #[test]
    fn delete_extras_keeps_paths_present_in_reference() {
        let live = tempfile::tempdir().unwrap();
        let reference = tempfile::tempdir().unwrap();
        write_at(&live.path().join("same-name.txt"), b"totally different bytes", 9);
        write_at(&reference.path().join("same-name.txt"), b"x", 1);

        let mut stats = RestoreStats::default();
        delete_extras(live.path(), reference.path(), &NoopLogger, &CancelToken::new(), &mut stats)
            .unwrap();
        assert!(live.path().join("same-name.txt").exists());
        assert_eq!(stats, RestoreStats::default());
    }

    #[test]
    fn rename_between_snapshots_is_delete_then_copy() {
        let live = tempfile::tempdir().unwrap();
        let reference = tempfile::tempdir().unwrap();
        write_at(&live.path().join("new-name.txt"), b"payload", 5);
        write_at(&reference.path().join("old-name.txt"), b"payload", 5);

        let stats = restore(live.path(), reference.path(), &NoopLogger, &CancelToken::new()).unwrap();
        assert!(!live.path().join("new-name.txt").exists());
        assert_eq!(fs::read(live.path().join("old-name.txt")).unwrap(), b"payload");
        assert_eq!((stats.files_deleted, stats.files_copied), (1, 1));
    }

    #[test]
    fn file_replaced_by_directory_in_reference() {
        let live = tempfile::tempdir().unwrap();
        let reference = tempfile::tempdir().unwrap();
        write_at(&live.path().join("thing"), b"file", 5);
        write_at(&reference.path().join("thing/inside.txt"), b"in", 5);

        restore(live.path(), reference.path(), &NoopLogger, &CancelToken::new()).unwrap();
        assert_eq!(fs::read(live.path().join("thing/inside.txt")).unwrap(), b"in");
    }

    #[test]
    fn cancelled_restore_fails() {
        let live = tempfile::tempdir().unwrap();
        let reference = tempfile::tempdir().unwrap();
        write_at(&reference.path().join("a.txt"), b"a", 5);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = restore(live.path(), reference.path(), &NoopLogger, &cancel).unwrap_err();
        assert!(matches!(err, MirrorError::Cancelled));
    }

    #[cfg(unix)]
    #[test]
    fn link_in_reference_suppresses_deletion() {
        let live = tempfile::tempdir().unwrap();
        let reference = tempfile::tempdir().unwrap();
        write_at(&live.path().join("shortcut"), b"plain file in live", 5);
        std::os::unix::fs::symlink("/definitely/not/here", reference.path().join("shortcut")).unwrap();

        let mut stats = RestoreStats::default();
        delete_extras(live.path(), reference.path(), &NoopLogger, &CancelToken::new(), &mut stats)
            .unwrap();
        assert!(live.path().join("shortcut").exists());
        assert_eq!(stats.files_deleted, 0);
    }

    #[cfg(unix)]
    #[test]
    fn links_are_remapped_back_into_live_root() {
        let live = tempfile::tempdir().unwrap();
        let reference = tempfile::tempdir().unwrap();
        write_at(&reference.path().join("data/file"), b"x", 5);
        std::os::unix::fs::symlink(reference.path().join("data/file"), reference.path().join("link"))
            .unwrap();

        let stats = restore(live.path(), reference.path(), &NoopLogger, &CancelToken::new()).unwrap();
        assert_eq!(stats.links_created, 1);
        assert_eq!(
            fs::read_link(live.path().join("link")).unwrap(),
            live.path().join("data/file")
        );

        let again = restore(live.path(), reference.path(), &NoopLogger, &CancelToken::new()).unwrap();
        assert!(!again.changed_anything());
    }
}
