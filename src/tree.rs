//! Full recursive copy of a source tree into its mirror.

use crate::cancel::CancelToken;
use crate::copy::{copy_entry, ensure_dir_exists, file_needs_copy, CopyStats};
use crate::error::{FailureClass, MirrorError, Result};
use crate::logger::Logger;
use crate::pathmap::PathMapper;
use std::path::Path;
use std::time::Instant;
use walkdir::WalkDir;

/// Mirror everything below `source_dir` into `target_dir`.
///
/// Depth-first and single-threaded. Files whose mirror already has the same
/// size and mtime are left alone, so walking a tree twice copies nothing the
/// second time. Failures on individual entries are logged and collected in
/// the returned stats; only cancellation or a failure to create `target_dir`
/// itself ends the walk early.
pub fn copy_directory(
    source_dir: &Path,
    target_dir: &Path,
    mapper: &PathMapper,
    logger: &dyn Logger,
    cancel: &CancelToken,
) -> Result<CopyStats> {
    let start = Instant::now();
    let mut stats = CopyStats::default();

    if ensure_dir_exists(target_dir)? {
        logger.created_dir(target_dir);
        stats.dirs_created += 1;
    }

    for entry in WalkDir::new(source_dir).min_depth(1).follow_links(false) {
        cancel.check()?;

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let err = MirrorError::from(e);
                tracing::warn!("[tree] skipping unreadable entry: {err}");
                stats.add_failure(&err);
                continue;
            }
        };

        let rel = match entry.path().strip_prefix(source_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let dst = target_dir.join(rel);

        let result = if entry.file_type().is_dir() {
            ensure_dir_exists(&dst).map(|created| {
                if created {
                    logger.created_dir(&dst);
                    stats.dirs_created += 1;
                }
            })
        } else if entry.file_type().is_file() && !file_needs_copy(entry.path(), &dst).unwrap_or(true) {
            // Already mirrored with the same size and mtime.
            Ok(())
        } else {
            copy_entry(entry.path(), &dst, mapper, logger).map(|outcome| stats.add_outcome(&outcome))
        };

        if let Err(e) = result {
            if e.class() == FailureClass::Vanished {
                crate::debug_event!("tree", "vanished", "{}", entry.path().display());
                continue;
            }
            tracing::warn!("[tree] failed to mirror {}: {e}", entry.path().display());
            logger.error("tree copy", entry.path(), &e.to_string());
            stats.add_failure(&e);
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    logger.done("tree copy", stats.files_copied, stats.bytes_copied, elapsed);
    crate::log_event!(
        "tree",
        "copied",
        "{} files, {} links, {} dirs into {} in {:.2}s",
        stats.files_copied,
        stats.links_created,
        stats.dirs_created,
        target_dir.display(),
        elapsed
    );

    Ok(stats)
}
