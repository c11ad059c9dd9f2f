//! Settings file (`treemirror.toml`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pathmap::CaseSensitivity;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub case_sensitivity: CaseSensitivity,
    pub workers: usize, // 0 = auto
    pub require_empty_target: bool,
    pub log_file: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            case_sensitivity: CaseSensitivity::default(),
            workers: 0,
            require_empty_target: true,
            log_file: None,
            retry: RetryPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    /// Number of event lanes per session.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            num_cpus::get().clamp(1, 4)
        }
    }
}

/// Bounded retry for transient failures while applying one change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub default: String,
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: "info".to_string(),
            modules: BTreeMap::new(),
        }
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("treemirror");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("treemirror");
    }
    PathBuf::from(".treemirror")
}

fn default_config_path() -> PathBuf {
    config_dir().join("treemirror.toml")
}

/// Load settings from `path`, or from the default location if present.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(p) => {
            let data = std::fs::read_to_string(p)
                .with_context(|| format!("Failed to read settings file {}", p.display()))?;
            parse_settings(&data).with_context(|| format!("Invalid settings in {}", p.display()))
        }
        None => {
            let p = default_config_path();
            if let Ok(data) = std::fs::read_to_string(&p) {
                parse_settings(&data)
                    .with_context(|| format!("Invalid settings in {}", p.display()))
            } else {
                Ok(Settings::default())
            }
        }
    }
}

pub fn parse_settings(data: &str) -> Result<Settings> {
    Ok(toml::from_str(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let s = parse_settings("").unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.retry.max_attempts, 5);
        assert_eq!(s.retry.delay(), Duration::from_millis(200));
        assert_eq!(s.case_sensitivity, CaseSensitivity::Insensitive);
        assert!(s.require_empty_target);
    }

    #[test]
    fn parses_full_file() {
        let s = parse_settings(
            r#"
            case_sensitivity = "sensitive"
            workers = 2
            require_empty_target = false
            log_file = "/tmp/journal.log"

            [retry]
            max_attempts = 3
            delay_ms = 50

            [logging]
            default = "warn"
            [logging.modules]
            treemirror = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(s.case_sensitivity, CaseSensitivity::Sensitive);
        assert_eq!(s.effective_workers(), 2);
        assert!(!s.require_empty_target);
        assert_eq!(s.log_file, Some(PathBuf::from("/tmp/journal.log")));
        assert_eq!(s.retry, RetryPolicy { max_attempts: 3, delay_ms: 50 });
        assert_eq!(s.logging.default, "warn");
        assert_eq!(s.logging.modules.get("treemirror").map(String::as_str), Some("debug"));
    }

    #[test]
    fn unknown_case_policy_is_rejected() {
        assert!(parse_settings(r#"case_sensitivity = "sometimes""#).is_err());
    }

    #[test]
    fn auto_workers_is_bounded() {
        let s = Settings::default();
        let n = s.effective_workers();
        assert!((1..=4).contains(&n));
    }

    #[test]
    fn explicit_path_must_exist() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_settings(Some(&tmp.path().join("missing.toml"))).is_err());

        let p = tmp.path().join("s.toml");
        std::fs::write(&p, "workers = 7\n").unwrap();
        assert_eq!(load_settings(Some(&p)).unwrap().workers, 7);
    }
}
