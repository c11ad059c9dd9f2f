//! treemirror library
//!
//! Continuous one-way mirroring of directory trees driven by filesystem
//! notifications, plus a restore that makes a live tree match a backup.

pub mod cancel;
pub mod change;
pub mod cli;
pub mod config;
pub mod copy;
pub mod error;
pub mod logger;
pub mod logging;
pub mod pathmap;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod tree;
pub mod watch;

pub use cancel::CancelToken;
pub use change::{ChangeEvent, ChangeProcessor, EventOutcome};
pub use config::Settings;
pub use error::{MirrorError, Result};
pub use pathmap::{CaseSensitivity, PathMapper};
pub use registry::{MirrorRegistry, RegistryError};
pub use session::{MirrorSession, SessionOptions, SessionState};
