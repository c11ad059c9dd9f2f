//! Leveled diagnostic logging.
//!
//! Output goes to stderr so it never mixes with the shell prompt on stdout.
//! Each line carries the emitting thread, which names the session
//! (`mirror-<target>`) or lane (`mirror-lane-<n>`) that produced it.
//!
//! Levels come from the `[logging]` section of the settings file. This
//! crate's modules may be named short (`session`) or in full
//! (`treemirror::session`); other crates are named as usual:
//! ```toml
//! [logging]
//! default = "info"
//! [logging.modules]
//! change = "debug"
//! ```
//! `RUST_LOG` replaces the configured filter entirely.

use std::sync::Once;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

const CRATE: &str = "treemirror";

static INIT: Once = Once::new();

/// Wall-clock time of day, millisecond precision.
struct ClockTime;

impl FormatTime for ClockTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

const MODULES: &[&str] = &[
    "cancel", "change", "cli", "config", "copy", "error", "logger", "logging", "pathmap",
    "reconcile", "registry", "session", "tree", "watch",
];

/// `session` -> `treemirror::session`. Other names, such as `notify`, are
/// kept as written.
fn qualify(module: &str) -> String {
    if MODULES.contains(&module) {
        format!("{CRATE}::{module}")
    } else {
        module.to_string()
    }
}

/// Filter directives built from the configured levels.
pub fn filter_directives(config: &LoggingConfig) -> String {
    std::iter::once(config.default.clone())
        .chain(
            config
                .modules
                .iter()
                .map(|(module, level)| format!("{}={level}", qualify(module))),
        )
        .collect::<Vec<_>>()
        .join(",")
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let directives = filter_directives(config);
    EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("Ignoring invalid [logging] levels ({e}); using \"info\"");
        EnvFilter::new("info")
    })
}

/// Install the stderr subscriber. Later calls, or a subscriber installed by
/// an embedding program, leave the existing one in place.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_timer(ClockTime)
            .with_target(false)
            .with_thread_names(true)
            .with_filter(build_filter(config));

        let _ = tracing_subscriber::registry().with(layer).try_init();
    });
}

/// Info-level event tagged with the component that emitted it.
///
/// ```ignore
/// log_event!("session", "watching", "{}", target.display());
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:expr, $event:expr) => {
        tracing::info!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::info!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

/// Debug-level counterpart of [`log_event!`].
#[macro_export]
macro_rules! debug_event {
    ($component:expr, $event:expr) => {
        tracing::debug!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::debug!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}
