//! Adapter storage root containment
//!
//! Every adapter descriptor path must resolve strictly within the approved
//! adapter root. Absolute paths, `..` components and symlinks that leave the
//! root are rejected at registration time.

use std::path::{Component, Path, PathBuf};

use crate::error::{MnemeError, Result};

/// The approved directory adapters are loaded from
#[derive(Debug, Clone)]
pub struct AdapterRoot {
    root: PathBuf,
}

impl AdapterRoot {
    /// Create an adapter root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve a descriptor path to a location under the root.
    ///
    /// # Errors
    ///
    /// Returns [`MnemeError::InvalidPath`] when the path is empty, absolute,
    /// contains a parent component, or when any component that exists on
    /// disk canonicalizes to a location outside the root.
    pub fn resolve(&self, relative: &Path) -> Result<PathBuf> {
        if relative.as_os_str().is_empty() {
            return Err(MnemeError::InvalidPath("empty adapter path".to_string()));
        }

        let mut joined = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => joined.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(MnemeError::InvalidPath(format!(
                        "'{}' contains a parent directory component",
                        relative.display()
                    )));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(MnemeError::InvalidPath(format!(
                        "'{}' is absolute; adapter paths are relative to the adapter root",
                        relative.display()
                    )));
                }
            }
        }

        // Lexically contained; a symlinked component could still point
        // elsewhere. Check the deepest part of the path that exists on disk.
        let mut existing = joined.as_path();
        let mut missing = Vec::new();
        while existing.symlink_metadata().is_err() {
            if existing == self.root.as_path() {
                // Nothing under the root exists yet, so nothing can redirect
                return Ok(joined);
            }
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name);
                    existing = parent;
                }
                _ => return Ok(joined),
            }
        }

        let canonical_root = self.root.canonicalize().map_err(|e| {
            MnemeError::InvalidPath(format!(
                "adapter root '{}' cannot be resolved: {}",
                self.root.display(),
                e
            ))
        })?;
        let mut canonical = existing.canonicalize().map_err(|e| {
            MnemeError::InvalidPath(format!("'{}' cannot be resolved: {}", relative.display(), e))
        })?;
        if !canonical.starts_with(&canonical_root) {
            return Err(MnemeError::InvalidPath(format!(
                "'{}' resolves outside the adapter root",
                relative.display()
            )));
        }
        canonical.extend(missing.into_iter().rev());
        Ok(canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_relative_path_accepted() {
        let dir = TempDir::new().unwrap();
        let root = AdapterRoot::new(dir.path());
        let resolved = root.resolve(Path::new("vampire/./dialogue")).unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
        assert!(resolved.ends_with("vampire/dialogue"));
    }

    #[test]
    fn test_parent_component_rejected() {
        let dir = TempDir::new().unwrap();
        let root = AdapterRoot::new(dir.path());
        for bad in ["../secrets", "vampire/../../etc/passwd", "a/.."] {
            assert!(
                matches!(root.resolve(Path::new(bad)), Err(MnemeError::InvalidPath(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_absolute_and_empty_rejected() {
        let dir = TempDir::new().unwrap();
        let root = AdapterRoot::new(dir.path());
        assert!(matches!(
            root.resolve(Path::new("/etc/passwd")),
            Err(MnemeError::InvalidPath(_))
        ));
        assert!(matches!(
            root.resolve(Path::new("")),
            Err(MnemeError::InvalidPath(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let outside = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        let root = AdapterRoot::new(dir.path());
        assert!(matches!(
            root.resolve(Path::new("escape")),
            Err(MnemeError::InvalidPath(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_parent_of_missing_file_rejected() {
        let outside = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        let root = AdapterRoot::new(dir.path());
        assert!(matches!(
            root.resolve(Path::new("escape/new.bin")),
            Err(MnemeError::InvalidPath(_))
        ));
        assert!(matches!(
            root.resolve(Path::new("escape/deeper/new.bin")),
            Err(MnemeError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_missing_leaf_under_real_directory_accepted() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("wraith")).unwrap();
        let root = AdapterRoot::new(dir.path());
        let resolved = root.resolve(Path::new("wraith/combat/adapter.bin")).unwrap();
        assert_eq!(
            resolved,
            dir.path()
                .canonicalize()
                .unwrap()
                .join("wraith/combat/adapter.bin")
        );
    }

    #[test]
    fn test_existing_path_canonicalized() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("wraith/combat")).unwrap();
        let root = AdapterRoot::new(dir.path());
        let resolved = root.resolve(Path::new("wraith/combat")).unwrap();
        assert_eq!(
            resolved,
            dir.path().join("wraith/combat").canonicalize().unwrap()
        );
    }
}
