//! Platform watcher subscription and translation of raw notify events.
//!
//! Backends report renames differently: inotify emits `From`, `To` and then
//! `Both` sharing a tracker cookie, Windows emits an untracked `From`/`To`
//! pair, and FSEvents only says "something was renamed" per path. The
//! translator folds all of these into [`ChangeEvent`]s.

use crate::change::ChangeEvent;
use crate::error::Result;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// How long a rename source waits for its destination before it is treated
/// as a move out of the watched tree.
pub const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(500);

const CONSUMED_TRACKERS: usize = 64;

pub type RawEvents = mpsc::Receiver<notify::Result<Event>>;

/// Start a recursive watch on `root`. Events queue up in the returned
/// channel until they are read.
pub fn subscribe(root: &Path) -> Result<(RecommendedWatcher, RawEvents)> {
    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(tx)?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

struct PendingFrom {
    path: PathBuf,
    tracker: Option<usize>,
    since: Instant,
}

/// Turns raw notify events into change events, stitching rename halves.
#[derive(Default)]
pub struct EventTranslator {
    pending: Option<PendingFrom>,
    consumed: VecDeque<usize>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: Event) -> Vec<ChangeEvent> {
        self.translate_at(event, Instant::now())
    }

    pub fn translate_at(&mut self, event: Event, now: Instant) -> Vec<ChangeEvent> {
        let tracker = event.attrs.tracker();
        let paths = event.paths;

        if let EventKind::Modify(ModifyKind::Name(mode)) = event.kind {
            return self.rename(mode, paths, tracker, now);
        }

        let mut out = self.take_pending();
        match event.kind {
            EventKind::Create(_) => out.extend(paths.into_iter().map(ChangeEvent::Created)),
            EventKind::Remove(_) => out.extend(paths.into_iter().map(ChangeEvent::Deleted)),
            EventKind::Modify(_) => out.extend(paths.into_iter().map(ChangeEvent::Modified)),
            EventKind::Access(_) => {}
            EventKind::Any | EventKind::Other => out.extend(paths.into_iter().map(probe)),
        }
        out
    }

    /// Rename sources whose destination never showed up become deletions.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let expired = self
            .pending
            .as_ref()
            .is_some_and(|p| now.duration_since(p.since) >= RENAME_PAIR_WINDOW);
        if expired {
            self.take_pending()
        } else {
            Vec::new()
        }
    }

    fn take_pending(&mut self) -> Vec<ChangeEvent> {
        self.pending
            .take()
            .map(|p| vec![ChangeEvent::Deleted(p.path)])
            .unwrap_or_default()
    }

    fn rename(
        &mut self,
        mode: RenameMode,
        paths: Vec<PathBuf>,
        tracker: Option<usize>,
        now: Instant,
    ) -> Vec<ChangeEvent> {
        let mut paths = paths.into_iter();
        match mode {
            RenameMode::From => {
                let out = self.take_pending();
                if let Some(path) = paths.next() {
                    self.pending = Some(PendingFrom {
                        path,
                        tracker,
                        since: now,
                    });
                }
                out
            }
            RenameMode::To => {
                let Some(to) = paths.next() else {
                    return Vec::new();
                };
                match self.pending.take() {
                    Some(from) if from.tracker == tracker => {
                        if let Some(t) = tracker {
                            self.remember(t);
                        }
                        vec![ChangeEvent::Renamed { from: from.path, to }]
                    }
                    unmatched => {
                        let mut out: Vec<ChangeEvent> = unmatched
                            .map(|p| ChangeEvent::Deleted(p.path))
                            .into_iter()
                            .collect();
                        out.push(ChangeEvent::Created(to));
                        out
                    }
                }
            }
            RenameMode::Both => {
                let (Some(from), Some(to)) = (paths.next(), paths.next()) else {
                    return Vec::new();
                };
                if let Some(t) = tracker {
                    if let Some(pos) = self.consumed.iter().position(|c| *c == t) {
                        self.consumed.remove(pos);
                        return Vec::new();
                    }
                }
                if self.pending.as_ref().is_some_and(|p| p.path == from) {
                    self.pending = None;
                }
                let mut out = self.take_pending();
                out.push(ChangeEvent::Renamed { from, to });
                out
            }
            RenameMode::Any | RenameMode::Other => {
                let mut out = self.take_pending();
                out.extend(paths.map(probe));
                out
            }
        }
    }

    fn remember(&mut self, tracker: usize) {
        if self.consumed.len() == CONSUMED_TRACKERS {
            self.consumed.pop_front();
        }
        self.consumed.push_back(tracker);
    }
}

/// Decide from the filesystem what an unspecific event means.
fn probe(path: PathBuf) -> ChangeEvent {
    if std::fs::symlink_metadata(&path).is_ok() {
        ChangeEvent::Created(path)
    } else {
        ChangeEvent::Deleted(path)
    }
}
