//! One live (source, target) mirror.
//!
//! A session runs on its own thread: it subscribes to the platform watcher,
//! performs the initial tree copy while events queue up, then feeds
//! translated events to a few worker lanes until it is stopped.

use crate::cancel::CancelToken;
use crate::change::{ChangeEvent, ChangeProcessor};
use crate::config::{RetryPolicy, Settings};
use crate::error::MirrorError;
use crate::logger::Logger;
use crate::pathmap::{CaseSensitivity, PathMapper};
use crate::tree::copy_directory;
use crate::watch::{subscribe, EventTranslator, RawEvents};
use notify::RecommendedWatcher;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(100);

/// Children written right after their directory can land before the
/// recursive watch covers it; such directories are scanned once more.
const SETTLE_DELAY: Duration = Duration::from_millis(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Subscribing and running the initial copy.
    Starting,
    /// Initial copy done; applying change events.
    Watching,
    /// Could not subscribe or could not create the target root.
    Failed,
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Watching => "watching",
            SessionState::Failed => "failed",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    pub case: CaseSensitivity,
    pub retry: RetryPolicy,
    pub workers: usize,
}

impl SessionOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            case: settings.case_sensitivity,
            retry: settings.retry,
            workers: settings.effective_workers(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

struct Shared {
    state: Mutex<SessionState>,
    stopped: CancelToken,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl Shared {
    /// Move to `next` unless the session has already been stopped.
    fn advance(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Stopped {
            return false;
        }
        *state = next;
        true
    }
}

pub struct MirrorSession {
    source_root: PathBuf,
    target_root: PathBuf,
    shared: Arc<Shared>,
}

impl MirrorSession {
    /// Start mirroring in the background. Returns immediately.
    pub fn start(
        source_root: PathBuf,
        target_root: PathBuf,
        options: SessionOptions,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Starting),
            stopped: CancelToken::new(),
            watcher: Mutex::new(None),
        });

        let worker = Worker {
            mapper: PathMapper::new(&source_root, &target_root, options.case),
            options,
            logger,
            shared: shared.clone(),
        };
        let name = format!(
            "mirror-{}",
            target_root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        if let Err(e) = thread::Builder::new().name(name).spawn(move || worker.run()) {
            tracing::error!("[session] failed to spawn session thread: {e}");
            shared.advance(SessionState::Failed);
        }

        Self {
            source_root,
            target_root,
            shared,
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn target_root(&self) -> &Path {
        &self.target_root
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn is_watching(&self) -> bool {
        self.state() == SessionState::Watching
    }

    /// Block until the session is watching, has failed, or `timeout` passes.
    pub fn wait_until_watching(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state() {
                SessionState::Watching => return true,
                SessionState::Failed | SessionState::Stopped => return false,
                SessionState::Starting if Instant::now() >= deadline => return false,
                SessionState::Starting => thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    /// Stop watching. Handlers already running may finish their current
    /// attempt; nothing further is applied.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == SessionState::Stopped {
                return;
            }
            *state = SessionState::Stopped;
        }
        self.shared.stopped.cancel();
        drop(self.shared.watcher.lock().take());
        crate::log_event!(
            "session",
            "stopped",
            "{} -> {}",
            self.source_root.display(),
            self.target_root.display()
        );
    }
}

impl Drop for MirrorSession {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    mapper: PathMapper,
    options: SessionOptions,
    logger: Arc<dyn Logger>,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(self) {
        let source = self.mapper.source_root().to_path_buf();
        let target = self.mapper.target_root().to_path_buf();
        crate::log_event!("session", "starting", "{} -> {}", source.display(), target.display());

        let (watcher, events) = match subscribe(&source) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!("[session] cannot watch {}: {e}", source.display());
                self.logger.error("subscribe", &source, &e.to_string());
                self.shared.advance(SessionState::Failed);
                return;
            }
        };
        {
            let mut slot = self.shared.watcher.lock();
            if self.shared.stopped.is_cancelled() {
                return;
            }
            *slot = Some(watcher);
        }

        match copy_directory(
            &source,
            &target,
            &self.mapper,
            self.logger.as_ref(),
            &self.shared.stopped,
        ) {
            Ok(stats) if !stats.errors.is_empty() => {
                tracing::warn!(
                    "[session] initial copy of {} finished with {} errors",
                    source.display(),
                    stats.errors.len()
                );
            }
            Ok(_) => {}
            Err(MirrorError::Cancelled) => return,
            Err(e) => {
                tracing::error!("[session] initial copy into {} failed: {e}", target.display());
                self.logger.error("initial copy", &target, &e.to_string());
                self.shared.advance(SessionState::Failed);
                drop(self.shared.watcher.lock().take());
                return;
            }
        }

        if !self.shared.advance(SessionState::Watching) {
            return;
        }
        crate::log_event!("session", "watching", "{} -> {}", source.display(), target.display());

        self.dispatch(events);
    }

    fn dispatch(&self, events: RawEvents) {
        let processor = Arc::new(ChangeProcessor::new(
            self.mapper.clone(),
            self.options.retry,
            self.logger.clone(),
            self.shared.stopped.clone(),
        ));

        let mut lanes: Vec<(Sender<ChangeEvent>, JoinHandle<()>)> = Vec::new();
        for i in 0..self.options.workers.max(1) {
            let (tx, rx) = mpsc::channel::<ChangeEvent>();
            let p = processor.clone();
            match thread::Builder::new()
                .name(format!("mirror-lane-{i}"))
                .spawn(move || {
                    for event in rx {
                        p.process(&event);
                    }
                }) {
                Ok(handle) => lanes.push((tx, handle)),
                Err(e) => tracing::warn!("[session] failed to spawn lane {i}: {e}"),
            }
        }

        let mut translator = EventTranslator::new();
        let mut settle = SettleQueue::default();
        loop {
            if self.shared.stopped.is_cancelled() {
                break;
            }
            let changes = match events.recv_timeout(TICK) {
                Ok(Ok(event)) => translator.translate(event),
                Ok(Err(e)) => {
                    // The subscription stays up; later events still arrive.
                    tracing::error!(
                        "[session] watcher error on {}: {e}",
                        self.mapper.source_root().display()
                    );
                    self.logger
                        .error("watch", self.mapper.source_root(), &e.to_string());
                    Vec::new()
                }
                Err(RecvTimeoutError::Timeout) => translator.flush_expired(Instant::now()),
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let now = Instant::now();
            for change in changes {
                if let Some(dir) = new_directory(&change) {
                    settle.push(dir.to_path_buf(), now);
                }
                self.route(change, &lanes, &processor);
            }
            for dir in settle.take_due(now) {
                crate::debug_event!("session", "rescan", "{}", dir.display());
                self.route(ChangeEvent::Created(dir), &lanes, &processor);
            }
        }

        let handles: Vec<JoinHandle<()>> = lanes.into_iter().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn route(
        &self,
        change: ChangeEvent,
        lanes: &[(Sender<ChangeEvent>, JoinHandle<()>)],
        processor: &ChangeProcessor,
    ) {
        let Some(rel) = self.mapper.relative(change.path()) else {
            processor.process(&change);
            return;
        };
        let Some(top) = rel.components().next() else {
            if matches!(change, ChangeEvent::Deleted(_)) {
                tracing::warn!(
                    "[session] source root {} was removed; mirror left as is",
                    self.mapper.source_root().display()
                );
            }
            return;
        };

        if lanes.is_empty() {
            processor.process(&change);
            return;
        }
        let lane = lane_for(top.as_os_str(), self.mapper.case(), lanes.len());
        if let Err(mpsc::SendError(change)) = lanes[lane].0.send(change) {
            processor.process(&change);
        }
    }
}

/// Directories that just appeared, waiting for their second scan.
#[derive(Default)]
struct SettleQueue {
    due: VecDeque<(Instant, PathBuf)>,
}

impl SettleQueue {
    fn push(&mut self, dir: PathBuf, now: Instant) {
        self.due.push_back((now + SETTLE_DELAY, dir));
    }

    fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut ready = Vec::new();
        while self.due.front().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, dir)) = self.due.pop_front() {
                ready.push(dir);
            }
        }
        ready
    }
}

/// The directory a create or rename brought into the tree, if any.
fn new_directory(change: &ChangeEvent) -> Option<&Path> {
    let path = match change {
        ChangeEvent::Created(p) => p,
        ChangeEvent::Renamed { to, .. } => to,
        _ => return None,
    };
    fs::symlink_metadata(path)
        .is_ok_and(|m| m.is_dir())
        .then_some(path.as_path())
}

/// Events under the same top-level entry share a lane and keep their order.
fn lane_for(top: &std::ffi::OsStr, case: CaseSensitivity, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    case.fold(Path::new(top)).hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use std::ffi::OsStr;

    #[test]
    fn lane_choice_is_stable_and_case_aware() {
        let a = lane_for(OsStr::new("Photos"), CaseSensitivity::Insensitive, 4);
        let b = lane_for(OsStr::new("photos"), CaseSensitivity::Insensitive, 4);
        assert_eq!(a, b);
        assert!(a < 4);
        assert_eq!(lane_for(OsStr::new("x"), CaseSensitivity::Sensitive, 1), 0);
    }

    #[test]
    fn settle_queue_releases_directories_after_the_delay() {
        let start = Instant::now();
        let mut q = SettleQueue::default();
        q.push(PathBuf::from("/src/a"), start);
        q.push(PathBuf::from("/src/b"), start + Duration::from_millis(50));

        assert!(q.take_due(start).is_empty());
        assert_eq!(q.take_due(start + SETTLE_DELAY), vec![PathBuf::from("/src/a")]);
        assert_eq!(
            q.take_due(start + SETTLE_DELAY * 2),
            vec![PathBuf::from("/src/b")]
        );
        assert!(q.take_due(start + SETTLE_DELAY * 3).is_empty());
    }

    #[test]
    fn only_new_directories_are_rescanned() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sub");
        let file = tmp.path().join("f.txt");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(&file, b"x").unwrap();

        assert_eq!(
            new_directory(&ChangeEvent::Created(dir.clone())),
            Some(dir.as_path())
        );
        assert_eq!(
            new_directory(&ChangeEvent::Renamed {
                from: tmp.path().join("old"),
                to: dir.clone(),
            }),
            Some(dir.as_path())
        );
        assert_eq!(new_directory(&ChangeEvent::Created(file)), None);
        assert_eq!(new_directory(&ChangeEvent::Modified(dir)), None);
    }

    #[test]
    fn missing_source_fails_the_session() {
        let tmp = tempfile::tempdir().unwrap();
        let session = MirrorSession::start(
            tmp.path().join("no-such-source"),
            tmp.path().join("target"),
            SessionOptions::default(),
            Arc::new(NoopLogger),
        );
        assert!(!session.wait_until_watching(Duration::from_secs(10)));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn stop_is_idempotent() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let session = MirrorSession::start(
            src.path().to_path_buf(),
            dst.path().join("mirror"),
            SessionOptions::default(),
            Arc::new(NoopLogger),
        );
        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!session.wait_until_watching(Duration::from_millis(50)));
    }
}
