//! Registry of active mirror pairs.
//!
//! Every pair admitted here satisfies the invariants the engine relies on:
//! the target is not nested with its source, a pair runs at most once, and
//! no two sessions share or nest a target root.

use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::error::MirrorError;
use crate::logger::Logger;
use crate::pathmap::{is_within, normalize_root, CaseSensitivity};
use crate::reconcile::{restore, RestoreStats};
use crate::session::{MirrorSession, SessionOptions, SessionState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("source {0} is not an existing directory")]
    SourceMissing(PathBuf),

    #[error("target {target} is inside source {src}")]
    TargetInsideSource { src: PathBuf, target: PathBuf },

    #[error("source {src} is inside target {target}")]
    SourceInsideTarget { src: PathBuf, target: PathBuf },

    #[error("{src} is already mirrored to {target}")]
    AlreadyActive { src: PathBuf, target: PathBuf },

    #[error("target {target} overlaps the active target {active}")]
    TargetInUse { target: PathBuf, active: PathBuf },

    #[error("target {0} exists and is not empty")]
    TargetNotEmpty(PathBuf),

    #[error("no active mirror from {src} to {target}")]
    NotFound { src: PathBuf, target: PathBuf },

    #[error("backup {0} does not exist")]
    ReferenceMissing(PathBuf),

    #[error("{0} exists and is not a directory")]
    NotADirectory(PathBuf),

    #[error("{inner} and {outer} are nested; restore needs two disjoint trees")]
    NestedRestore { inner: PathBuf, outer: PathBuf },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

/// A (source, target) pair compared under a case policy.
#[derive(Clone, Debug)]
pub struct PairKey {
    pub source: PathBuf,
    pub target: PathBuf,
    case: CaseSensitivity,
}

impl PairKey {
    pub fn new(source: PathBuf, target: PathBuf, case: CaseSensitivity) -> Self {
        Self {
            source,
            target,
            case,
        }
    }

    fn folded(&self) -> (String, String) {
        (self.case.fold(&self.source), self.case.fold(&self.target))
    }
}

impl PartialEq for PairKey {
    fn eq(&self, other: &Self) -> bool {
        self.folded() == other.folded()
    }
}

impl Eq for PairKey {}

impl Hash for PairKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded().hash(state);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairStatus {
    pub source: PathBuf,
    pub target: PathBuf,
    pub state: SessionState,
}

pub struct MirrorRegistry {
    sessions: Mutex<HashMap<PairKey, MirrorSession>>,
    settings: Settings,
    logger: Arc<dyn Logger>,
    cancel: CancelToken,
}

impl MirrorRegistry {
    pub fn new(settings: Settings, logger: Arc<dyn Logger>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            settings,
            logger,
            cancel: CancelToken::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn case(&self) -> CaseSensitivity {
        self.settings.case_sensitivity
    }

    /// Start mirroring `source` into each of `targets`.
    ///
    /// Each target is checked on its own; one rejection does not affect the
    /// others. Sessions start in the background.
    pub fn add(
        &self,
        source: &Path,
        targets: &[PathBuf],
    ) -> Vec<(PathBuf, Result<(), RegistryError>)> {
        let source = match normalize_root(source) {
            Ok(s) if s.is_dir() => s,
            Ok(s) => return reject_all(targets, || RegistryError::SourceMissing(s.clone())),
            Err(e) => return reject_all(targets, || io_error(source, &e)),
        };

        targets
            .iter()
            .map(|target| (target.clone(), self.add_one(&source, target)))
            .collect()
    }

    fn add_one(&self, source: &Path, target: &Path) -> Result<(), RegistryError> {
        let target = normalize_root(target).map_err(|e| io_error(target, &e))?;
        let case = self.case();

        if is_within(&target, source, case) {
            return Err(RegistryError::TargetInsideSource {
                src: source.to_path_buf(),
                target,
            });
        }
        if is_within(source, &target, case) {
            return Err(RegistryError::SourceInsideTarget {
                src: source.to_path_buf(),
                target,
            });
        }

        let mut sessions = self.sessions.lock();
        let key = PairKey::new(source.to_path_buf(), target.clone(), case);
        if sessions.contains_key(&key) {
            return Err(RegistryError::AlreadyActive {
                src: source.to_path_buf(),
                target,
            });
        }
        if let Some(active) = sessions
            .keys()
            .map(|k| &k.target)
            .find(|t| is_within(&target, t, case) || is_within(t, &target, case))
        {
            return Err(RegistryError::TargetInUse {
                target,
                active: active.clone(),
            });
        }
        // Another session's source nested in this target would be overwritten.
        if let Some(active) = sessions
            .keys()
            .find(|k| is_within(&k.source, &target, case))
        {
            return Err(RegistryError::SourceInsideTarget {
                src: active.source.clone(),
                target,
            });
        }

        if self.settings.require_empty_target && !is_empty_dir(&target)? {
            return Err(RegistryError::TargetNotEmpty(target));
        }
        fs::create_dir_all(&target).map_err(|e| io_error(&target, &e))?;

        let session = MirrorSession::start(
            source.to_path_buf(),
            target.clone(),
            SessionOptions::from_settings(&self.settings),
            self.logger.clone(),
        );
        crate::log_event!("registry", "added", "{} -> {}", source.display(), target.display());
        sessions.insert(key, session);
        Ok(())
    }

    /// Stop mirroring `source` into each of `targets`.
    pub fn end(
        &self,
        source: &Path,
        targets: &[PathBuf],
    ) -> Vec<(PathBuf, Result<(), RegistryError>)> {
        let source = match normalize_root(source) {
            Ok(s) => s,
            Err(e) => return reject_all(targets, || io_error(source, &e)),
        };

        targets
            .iter()
            .map(|target| {
                let result = normalize_root(target)
                    .map_err(|e| io_error(target, &e))
                    .and_then(|t| {
                        let key = PairKey::new(source.clone(), t.clone(), self.case());
                        match self.sessions.lock().remove(&key) {
                            Some(session) => {
                                session.stop();
                                crate::log_event!(
                                    "registry",
                                    "ended",
                                    "{} -> {}",
                                    source.display(),
                                    t.display()
                                );
                                Ok(())
                            }
                            None => Err(RegistryError::NotFound {
                                src: source.clone(),
                                target: t,
                            }),
                        }
                    });
                (target.clone(), result)
            })
            .collect()
    }

    /// Active pairs, sorted by source then target.
    pub fn list(&self) -> Vec<PairStatus> {
        let mut pairs: Vec<PairStatus> = self
            .sessions
            .lock()
            .iter()
            .map(|(key, session)| PairStatus {
                source: key.source.clone(),
                target: key.target.clone(),
                state: session.state(),
            })
            .collect();
        pairs.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
        pairs
    }

    /// Make `source` identical to `backup`. Runs on the caller's thread.
    ///
    /// The two trees must be disjoint. A `source` that no longer exists is
    /// recreated.
    pub fn restore(&self, source: &Path, backup: &Path) -> Result<RestoreStats, RegistryError> {
        let live = normalize_root(source).map_err(|e| io_error(source, &e))?;
        let reference = normalize_root(backup).map_err(|e| io_error(backup, &e))?;
        if !reference.is_dir() {
            return Err(RegistryError::ReferenceMissing(reference));
        }
        // A missing live root is rebuilt from the backup.
        if live.exists() && !live.is_dir() {
            return Err(RegistryError::NotADirectory(live));
        }
        let case = self.case();
        if is_within(&reference, &live, case) {
            return Err(RegistryError::NestedRestore {
                inner: reference,
                outer: live,
            });
        }
        if is_within(&live, &reference, case) {
            return Err(RegistryError::NestedRestore {
                inner: live,
                outer: reference,
            });
        }
        crate::log_event!(
            "registry",
            "restoring",
            "{} from {}",
            live.display(),
            reference.display()
        );
        Ok(restore(&live, &reference, self.logger.as_ref(), &self.cancel)?)
    }

    /// Cancel any running restore and stop every session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let drained: Vec<(PairKey, MirrorSession)> = self.sessions.lock().drain().collect();
        for (_, session) in &drained {
            session.stop();
        }
        crate::log_event!("registry", "shutdown", "{} sessions stopped", drained.len());
    }
}

fn io_error(path: &Path, e: &io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(e.kind(), e.to_string()),
    }
}

fn reject_all(
    targets: &[PathBuf],
    err: impl Fn() -> RegistryError,
) -> Vec<(PathBuf, Result<(), RegistryError>)> {
    targets.iter().map(|t| (t.clone(), Err(err()))).collect()
}

/// Missing directories count as empty.
fn is_empty_dir(path: &Path) -> Result<bool, RegistryError> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(io_error(path, &e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use std::time::Duration;

    fn registry() -> MirrorRegistry {
        MirrorRegistry::new(
            Settings {
                workers: 1,
                ..Settings::default()
            },
            Arc::new(NoopLogger),
        )
    }

    fn single(results: Vec<(PathBuf, Result<(), RegistryError>)>) -> Result<(), RegistryError> {
        assert_eq!(results.len(), 1);
        results.into_iter().next().unwrap().1
    }

    #[test]
    fn pair_keys_fold_case_when_insensitive() {
        let a = PairKey::new("/Src".into(), "/Dst".into(), CaseSensitivity::Insensitive);
        let b = PairKey::new("/src".into(), "/dst".into(), CaseSensitivity::Insensitive);
        assert_eq!(a, b);
        let c = PairKey::new("/Src".into(), "/Dst".into(), CaseSensitivity::Sensitive);
        let d = PairKey::new("/src".into(), "/dst".into(), CaseSensitivity::Sensitive);
        assert_ne!(c, d);
    }

    #[test]
    fn rejects_missing_source_for_every_target() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry();
        let results = reg.add(
            &tmp.path().join("nope"),
            &[tmp.path().join("t1"), tmp.path().join("t2")],
        );
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|(_, r)| matches!(r, Err(RegistryError::SourceMissing(_)))));
    }

    #[test]
    fn rejects_nesting_between_source_and_target() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir(&src).unwrap();
        let reg = registry();

        let inside = single(reg.add(&src, &[src.join("mirror")]));
        assert!(matches!(inside, Err(RegistryError::TargetInsideSource { .. })));

        let outer = single(reg.add(&src, &[tmp.path().to_path_buf()]));
        assert!(matches!(outer, Err(RegistryError::SourceInsideTarget { .. })));
        assert!(reg.list().is_empty());
    }

    #[test]
    fn rejects_non_empty_target() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir(&src).unwrap();
        fs::create_dir(&dst).unwrap();
        fs::write(dst.join("keep.txt"), b"mine").unwrap();

        let reg = registry();
        let result = single(reg.add(&src, &[dst.clone()]));
        assert!(matches!(result, Err(RegistryError::TargetNotEmpty(_))));
        assert_eq!(fs::read(dst.join("keep.txt")).unwrap(), b"mine");
    }

    #[test]
    fn add_list_end_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("a.txt"), b"hello").unwrap();
        let t1 = tmp.path().join("t1");
        let t2 = tmp.path().join("t2");

        let reg = registry();
        let results = reg.add(&src, &[t1.clone(), t2.clone()]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        let dup = single(reg.add(&src, &[t1.clone()]));
        assert!(matches!(dup, Err(RegistryError::AlreadyActive { .. })));

        let other = tmp.path().join("other");
        fs::create_dir(&other).unwrap();
        let nested = single(reg.add(&other, &[t1.join("inner")]));
        assert!(matches!(nested, Err(RegistryError::TargetInUse { .. })));

        let listed = reg.list();
        assert_eq!(listed.len(), 2);
        let mut waited = 0;
        while reg.list().iter().any(|p| p.state == SessionState::Starting) && waited < 500 {
            std::thread::sleep(Duration::from_millis(20));
            waited += 1;
        }
        assert!(reg.list().iter().all(|p| p.state == SessionState::Watching));
        assert_eq!(fs::read(t1.join("a.txt")).unwrap(), b"hello");

        assert!(single(reg.end(&src, &[t1.clone()])).is_ok());
        assert!(matches!(
            single(reg.end(&src, &[t1])),
            Err(RegistryError::NotFound { .. })
        ));
        assert_eq!(reg.list().len(), 1);

        reg.shutdown();
        assert!(reg.list().is_empty());
    }

    #[test]
    fn restore_requires_existing_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry();
        let err = reg
            .restore(tmp.path(), &tmp.path().join("missing-backup"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::ReferenceMissing(_)));
    }

    #[test]
    fn restore_brings_source_back_to_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("live");
        let backup = tmp.path().join("backup");
        fs::create_dir_all(live.join("junk")).unwrap();
        fs::create_dir(&backup).unwrap();
        fs::write(live.join("extra.txt"), b"x").unwrap();
        fs::write(backup.join("wanted.txt"), b"wanted").unwrap();

        let stats = registry().restore(&live, &backup).unwrap();
        assert!(stats.changed_anything());
        assert!(!live.join("extra.txt").exists());
        assert!(!live.join("junk").exists());
        assert_eq!(fs::read(live.join("wanted.txt")).unwrap(), b"wanted");
    }

    #[test]
    fn restore_rebuilds_a_missing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let lost = tmp.path().join("lost");
        let backup = tmp.path().join("backup");
        fs::create_dir_all(backup.join("nested")).unwrap();
        fs::write(backup.join("a.txt"), b"a").unwrap();
        fs::write(backup.join("nested/b.txt"), b"bb").unwrap();

        let stats = registry().restore(&lost, &backup).unwrap();
        assert!(stats.changed_anything());
        assert_eq!(fs::read(lost.join("a.txt")).unwrap(), b"a");
        assert_eq!(fs::read(lost.join("nested/b.txt")).unwrap(), b"bb");
    }

    #[test]
    fn restore_rejects_a_file_as_source() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain.txt");
        let backup = tmp.path().join("backup");
        fs::write(&file, b"x").unwrap();
        fs::create_dir(&backup).unwrap();

        let err = registry().restore(&file, &backup).unwrap_err();
        assert!(matches!(err, RegistryError::NotADirectory(_)));
        assert_eq!(fs::read(&file).unwrap(), b"x");
    }

    #[test]
    fn restore_rejects_nested_trees() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let inner_backup = src.join("backup");
        fs::create_dir_all(&inner_backup).unwrap();
        fs::write(inner_backup.join("precious.txt"), b"keep").unwrap();
        let reg = registry();

        let err = reg.restore(&src, &inner_backup).unwrap_err();
        assert!(matches!(err, RegistryError::NestedRestore { .. }));
        assert_eq!(fs::read(inner_backup.join("precious.txt")).unwrap(), b"keep");

        // Live root inside its backup.
        let outer_backup = tmp.path().join("outer");
        let live = outer_backup.join("live");
        fs::create_dir_all(&live).unwrap();
        let err = reg.restore(&live, &outer_backup).unwrap_err();
        assert!(matches!(err, RegistryError::NestedRestore { .. }));

        let err = reg.restore(&src, &src).unwrap_err();
        assert!(matches!(err, RegistryError::NestedRestore { .. }));
    }
}
