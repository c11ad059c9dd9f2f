//! Mapping paths between a source root and a target root.

use crate::error::{MirrorError, Result};
use normpath::PathExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Component, Path, PathBuf};

/// How path components are compared when testing root containment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CaseSensitivity {
    /// `C:\Data` and `c:\data` are the same root (Windows/macOS convention).
    #[default]
    Insensitive,
    /// Exact byte comparison (typical Linux filesystems).
    Sensitive,
}

impl CaseSensitivity {
    /// Fold a path into a string usable as a comparison key.
    pub fn fold(self, path: &Path) -> String {
        let s = path.to_string_lossy();
        match self {
            CaseSensitivity::Insensitive => s.to_lowercase(),
            CaseSensitivity::Sensitive => s.into_owned(),
        }
    }

    fn component_eq(self, a: Component<'_>, b: Component<'_>) -> bool {
        if a == b {
            return true;
        }
        match self {
            CaseSensitivity::Sensitive => false,
            CaseSensitivity::Insensitive => {
                a.as_os_str().to_string_lossy().to_lowercase()
                    == b.as_os_str().to_string_lossy().to_lowercase()
            }
        }
    }
}

/// Strip `root` from the front of `path`, comparing whole components.
pub fn strip_root(path: &Path, root: &Path, case: CaseSensitivity) -> Option<PathBuf> {
    let mut rest = path.components();
    for root_part in root.components() {
        match rest.next() {
            Some(part) if case.component_eq(part, root_part) => {}
            _ => return None,
        }
    }
    Some(rest.as_path().to_path_buf())
}

/// True when `inner` equals `outer` or lies somewhere beneath it.
pub fn is_within(inner: &Path, outer: &Path, case: CaseSensitivity) -> bool {
    strip_root(inner, outer, case).is_some()
}

/// Translates paths under one mirror root into the other.
#[derive(Clone, Debug)]
pub struct PathMapper {
    source_root: PathBuf,
    target_root: PathBuf,
    case: CaseSensitivity,
}

impl PathMapper {
    pub fn new(
        source_root: impl Into<PathBuf>,
        target_root: impl Into<PathBuf>,
        case: CaseSensitivity,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            target_root: target_root.into(),
            case,
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn target_root(&self) -> &Path {
        &self.target_root
    }

    pub fn case(&self) -> CaseSensitivity {
        self.case
    }

    /// Path of `path` relative to the source root.
    pub fn relative(&self, path: &Path) -> Option<PathBuf> {
        strip_root(path, &self.source_root, self.case)
    }

    /// Map a path under the source root onto the target root.
    pub fn to_target(&self, path: &Path) -> Result<PathBuf> {
        match self.relative(path) {
            Some(rel) if rel.as_os_str().is_empty() => Ok(self.target_root.clone()),
            Some(rel) => Ok(self.target_root.join(rel)),
            None => Err(MirrorError::OutsideRoot {
                path: path.to_path_buf(),
                root: self.source_root.clone(),
            }),
        }
    }

    /// Rewrite a symbolic link's target if it points into the source root.
    ///
    /// Targets outside the root, including every relative target, come back
    /// unchanged and may dangle on the mirror side.
    pub fn rewrite_link_target(&self, link_target: &Path) -> PathBuf {
        if !link_target.is_absolute() {
            return link_target.to_path_buf();
        }
        self.to_target(link_target)
            .unwrap_or_else(|_| link_target.to_path_buf())
    }

    /// The same pair seen from the other side, used when restoring.
    pub fn reversed(&self) -> Self {
        Self {
            source_root: self.target_root.clone(),
            target_root: self.source_root.clone(),
            case: self.case,
        }
    }
}

/// Absolute, normalized form of a mirror root.
///
/// Roots that do not exist yet resolve their nearest existing ancestor and
/// keep the remaining components as given.
pub fn normalize_root(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }

    let mut resolved = match existing.normalize() {
        Ok(base) => base.into_path_buf(),
        Err(_) => existing.to_path_buf(),
    };
    for name in missing.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(case: CaseSensitivity) -> PathMapper {
        PathMapper::new("/data/src", "/backup/dst", case)
    }

    #[test]
    fn maps_nested_path_onto_target() {
        let m = mapper(CaseSensitivity::Insensitive);
        let mapped = m.to_target(Path::new("/data/src/sub/a.txt")).unwrap();
        assert_eq!(mapped, PathBuf::from("/backup/dst/sub/a.txt"));
        assert_eq!(
            m.to_target(Path::new("/data/src")).unwrap(),
            PathBuf::from("/backup/dst")
        );
    }

    #[test]
    fn prefix_match_respects_component_boundaries() {
        let m = mapper(CaseSensitivity::Insensitive);
        assert!(m.to_target(Path::new("/data/srcfoo/a.txt")).is_err());
        assert!(m.relative(Path::new("/data")).is_none());
    }

    #[test]
    fn case_policy_controls_prefix_comparison() {
        let insensitive = mapper(CaseSensitivity::Insensitive);
        assert_eq!(
            insensitive.to_target(Path::new("/Data/SRC/x")).unwrap(),
            PathBuf::from("/backup/dst/x")
        );

        let sensitive = mapper(CaseSensitivity::Sensitive);
        assert!(sensitive.to_target(Path::new("/Data/SRC/x")).is_err());
        assert!(sensitive.to_target(Path::new("/data/src/x")).is_ok());
    }

    #[test]
    fn link_targets_inside_root_are_remapped() {
        let m = mapper(CaseSensitivity::Insensitive);
        assert_eq!(
            m.rewrite_link_target(Path::new("/data/src/real/file")),
            PathBuf::from("/backup/dst/real/file")
        );
    }

    #[test]
    fn link_targets_outside_root_are_kept() {
        let m = mapper(CaseSensitivity::Insensitive);
        assert_eq!(
            m.rewrite_link_target(Path::new("/etc/hosts")),
            PathBuf::from("/etc/hosts")
        );
        assert_eq!(
            m.rewrite_link_target(Path::new("../sibling")),
            PathBuf::from("../sibling")
        );
    }

    #[test]
    fn reversed_swaps_roots() {
        let m = mapper(CaseSensitivity::Sensitive).reversed();
        assert_eq!(
            m.to_target(Path::new("/backup/dst/a")).unwrap(),
            PathBuf::from("/data/src/a")
        );
    }

    #[test]
    fn is_within_detects_nesting() {
        let case = CaseSensitivity::Sensitive;
        assert!(is_within(Path::new("/a/b/c"), Path::new("/a/b"), case));
        assert!(is_within(Path::new("/a/b"), Path::new("/a/b"), case));
        assert!(!is_within(Path::new("/a/bc"), Path::new("/a/b"), case));
    }

    #[test]
    fn normalize_root_handles_missing_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let base = normalize_root(tmp.path()).unwrap();
        let missing = tmp.path().join("not").join("there");
        let normalized = normalize_root(&missing).unwrap();
        assert_eq!(normalized, base.join("not").join("there"));
    }
}
