//! Mutation journal: one line per change applied to a mirror.
//!
//! Diagnostics go through `tracing`; this trait records what actually
//! happened to the target tree so it can be audited afterwards.

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

pub trait Logger: Send + Sync {
    fn copied(&self, _src: &Path, _dst: &Path, _bytes: u64) {}
    fn linked(&self, _src: &Path, _dst: &Path, _link_target: &Path) {}
    fn created_dir(&self, _path: &Path) {}
    fn removed(&self, _path: &Path) {}
    fn renamed(&self, _from: &Path, _to: &Path) {}
    fn error(&self, _context: &str, _path: &Path, _msg: &str) {}
    fn done(&self, _context: &str, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn copied(&self, src: &Path, dst: &Path, bytes: u64) {
        self.line(&format!(
            "COPY src={} dst={} bytes={}",
            src.display(),
            dst.display(),
            bytes
        ));
    }
    fn linked(&self, src: &Path, dst: &Path, link_target: &Path) {
        self.line(&format!(
            "LINK src={} dst={} target={}",
            src.display(),
            dst.display(),
            link_target.display()
        ));
    }
    fn created_dir(&self, path: &Path) {
        self.line(&format!("MKDIR path={}", path.display()));
    }
    fn removed(&self, path: &Path) {
        self.line(&format!("DELETE path={}", path.display()));
    }
    fn renamed(&self, from: &Path, to: &Path) {
        self.line(&format!("RENAME from={} to={}", from.display(), to.display()));
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path.display(), msg));
    }
    fn done(&self, context: &str, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!(
            "DONE ctx={context} files={files} bytes={bytes} seconds={seconds:.3}"
        ));
    }
}

/// In-memory journal for assertions in unit tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingLogger {
    pub lines: Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingLogger {
    pub fn count(&self, prefix: &str) -> usize {
        self.lines
            .lock()
            .iter()
            .filter(|l| l.starts_with(prefix))
            .count()
    }
}

#[cfg(test)]
impl Logger for RecordingLogger {
    fn copied(&self, _src: &Path, dst: &Path, _bytes: u64) {
        self.lines.lock().push(format!("COPY {}", dst.display()));
    }
    fn linked(&self, _src: &Path, dst: &Path, _link_target: &Path) {
        self.lines.lock().push(format!("LINK {}", dst.display()));
    }
    fn created_dir(&self, path: &Path) {
        self.lines.lock().push(format!("MKDIR {}", path.display()));
    }
    fn removed(&self, path: &Path) {
        self.lines.lock().push(format!("DELETE {}", path.display()));
    }
    fn renamed(&self, from: &Path, to: &Path) {
        self.lines
            .lock()
            .push(format!("RENAME {} {}", from.display(), to.display()));
    }
    fn error(&self, context: &str, path: &Path, _msg: &str) {
        self.lines
            .lock()
            .push(format!("ERROR {} {}", context, path.display()));
    }
}
