//! Applying individual change notifications to a mirror.

use crate::cancel::CancelToken;
use crate::config::RetryPolicy;
use crate::copy::{copy_entry, ensure_dir_exists, ensure_parent_exists, remove_entry, CopyStats};
use crate::error::{FailureClass, MirrorError, Result};
use crate::logger::Logger;
use crate::pathmap::PathMapper;
use crate::tree::copy_directory;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One filesystem change under a source root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl ChangeEvent {
    /// The path the event is about; the new name for renames.
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => p,
            ChangeEvent::Renamed { to, .. } => to,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Created(_) => "created",
            ChangeEvent::Modified(_) => "modified",
            ChangeEvent::Deleted(_) => "deleted",
            ChangeEvent::Renamed { .. } => "renamed",
        }
    }
}

/// How handling one event ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    /// The target tree was changed.
    Applied,
    /// Nothing to do: already convergent or the source vanished.
    Unchanged,
    /// The session was stopped before the mutation ran.
    Skipped,
    /// Transient failures exhausted the retry budget.
    Dropped { attempts: u32 },
    /// A permanent failure ended the event.
    Failed,
}

/// Retry state scoped to one event.
#[derive(Debug, Default)]
pub struct CopyAttempt {
    pub attempts: u32,
    pub last_error: Option<MirrorError>,
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out.
///
/// `op` returns whether it changed anything. Vanished sources end as
/// `Unchanged`; nothing is propagated to the caller.
pub fn run_with_retry<F>(
    policy: &RetryPolicy,
    context: &Path,
    stopped: &CancelToken,
    logger: &dyn Logger,
    mut op: F,
) -> EventOutcome
where
    F: FnMut() -> Result<bool>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = CopyAttempt::default();

    loop {
        if stopped.is_cancelled() {
            return EventOutcome::Skipped;
        }
        attempt.attempts += 1;

        let err = match op() {
            Ok(true) => return EventOutcome::Applied,
            Ok(false) => return EventOutcome::Unchanged,
            Err(MirrorError::Cancelled) => return EventOutcome::Skipped,
            Err(e) => e,
        };

        match err.class() {
            FailureClass::Vanished => {
                crate::debug_event!("change", "source vanished", "{}", context.display());
                return EventOutcome::Unchanged;
            }
            FailureClass::Permanent => {
                tracing::error!("[change] operation failed for {}: {err}", context.display());
                logger.error("change", context, &err.to_string());
                return EventOutcome::Failed;
            }
            FailureClass::Transient if attempt.attempts < max_attempts => {
                tracing::debug!(
                    "[change] attempt {}/{} failed for {}: {err}",
                    attempt.attempts,
                    max_attempts,
                    context.display()
                );
                attempt.last_error = Some(err);
                std::thread::sleep(policy.delay());
            }
            FailureClass::Transient => {
                tracing::warn!(
                    "[change] giving up on {} after {} attempts (file locked?): {err}",
                    context.display(),
                    attempt.attempts
                );
                logger.error("change", context, &err.to_string());
                return EventOutcome::Dropped {
                    attempts: attempt.attempts,
                };
            }
        }
    }
}

/// Applies change events for one (source, target) pair.
pub struct ChangeProcessor {
    mapper: PathMapper,
    retry: RetryPolicy,
    logger: Arc<dyn Logger>,
    stopped: CancelToken,
}

impl ChangeProcessor {
    pub fn new(
        mapper: PathMapper,
        retry: RetryPolicy,
        logger: Arc<dyn Logger>,
        stopped: CancelToken,
    ) -> Self {
        Self {
            mapper,
            retry,
            logger,
            stopped,
        }
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    /// Apply one event with the retry wrapper.
    pub fn process(&self, event: &ChangeEvent) -> EventOutcome {
        let outcome = run_with_retry(
            &self.retry,
            event.path(),
            &self.stopped,
            self.logger.as_ref(),
            || self.apply(event),
        );

        if outcome == EventOutcome::Applied {
            let rel = self
                .mapper
                .relative(event.path())
                .unwrap_or_else(|| event.path().to_path_buf());
            crate::log_event!("change", event.kind(), "{}", rel.display());
        }
        outcome
    }

    /// One attempt at mirroring `event`. Returns whether the target changed.
    fn apply(&self, event: &ChangeEvent) -> Result<bool> {
        match event {
            ChangeEvent::Created(path) => self.update(path, true),
            ChangeEvent::Modified(path) => self.update(path, false),
            ChangeEvent::Deleted(path) => self.delete(path),
            ChangeEvent::Renamed { from, to } => self.rename(from, to),
        }
    }

    fn update(&self, path: &Path, created: bool) -> Result<bool> {
        let target = self.mapper.to_target(path)?;
        let meta = match fs::symlink_metadata(path) {
            Ok(m) => m,
            // A notification is a hint; the entry may already be gone.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(MirrorError::io("stat", path, e)),
        };

        if meta.is_dir() {
            let made = ensure_dir_exists(&target)?;
            if made {
                self.logger.created_dir(&target);
            }
            if created {
                let stats = copy_directory(
                    path,
                    &target,
                    &self.mapper,
                    self.logger.as_ref(),
                    &self.stopped,
                )?;
                return subtree_outcome(path, made, &stats);
            }
            Ok(made)
        } else {
            copy_entry(path, &target, &self.mapper, self.logger.as_ref())?;
            Ok(true)
        }
    }

    fn delete(&self, path: &Path) -> Result<bool> {
        let target = self.mapper.to_target(path)?;
        let removed = remove_entry(&target)?;
        if removed {
            self.logger.removed(&target);
        }
        Ok(removed)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<bool> {
        let target_old = self.mapper.to_target(from)?;
        let target_new = self.mapper.to_target(to)?;

        if fs::symlink_metadata(&target_old).is_ok() {
            ensure_parent_exists(&target_new)?;
            remove_entry(&target_new)?;
            fs::rename(&target_old, &target_new)
                .map_err(|e| MirrorError::io("rename", &target_old, e))?;
            self.logger.renamed(&target_old, &target_new);
            return Ok(true);
        }

        // The old name never made it to the mirror; copy the new one fresh.
        match fs::symlink_metadata(to) {
            Ok(m) if m.is_dir() => self.update(to, true),
            Ok(_) => {
                copy_entry(to, &target_new, &self.mapper, self.logger.as_ref())?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MirrorError::io("stat", to, e)),
        }
    }
}

/// A subtree copy with retryable failures is reported as one transient
/// error so the whole directory is walked again; files already mirrored are
/// skipped on the next walk.
fn subtree_outcome(path: &Path, made: bool, stats: &CopyStats) -> Result<bool> {
    if stats.transient_failures > 0 {
        return Err(MirrorError::Incomplete {
            path: path.to_path_buf(),
            failed: stats.transient_failures,
        });
    }
    Ok(made || stats.files_copied + stats.links_created + stats.dirs_created > 0)
}
