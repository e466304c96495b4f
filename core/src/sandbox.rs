//! Filesystem containment for everything the engine reads and writes.
//!
//! A [`SandboxRoot`] wraps one canonical directory and is the only way rule
//! code turns a caller-supplied path into something it may touch. Both the
//! project root (reads) and the session root (writes) are sandbox roots.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Result;
use crate::error::SxnErr;

/// A directory that is the enforced prefix of every path handed back by
/// [`SandboxRoot::contain`] and [`SandboxRoot::contain_for_create`].
#[derive(Debug, Clone)]
pub struct SandboxRoot {
    root: PathBuf,
}

impl SandboxRoot {
    /// Canonicalize `root` and require that it is an existing directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().canonicalize()?;
        if !root.is_dir() {
            return Err(SxnErr::NotContained {
                path: root.clone(),
                root,
            });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an **existing** path and assert it lives under the root.
    ///
    /// All symlinks are resolved before the prefix check, so a link inside
    /// the root that points elsewhere is rejected as an escape rather than
    /// silently followed.
    pub fn contain(&self, candidate: impl AsRef<Path>) -> Result<PathBuf> {
        let joined = self.join(candidate.as_ref())?;
        let canonical = joined.canonicalize()?;
        if canonical == self.root || canonical.starts_with(&self.root) {
            Ok(canonical)
        } else {
            Err(SxnErr::PathEscape {
                path: canonical,
                root: self.root.clone(),
            })
        }
    }

    /// Resolve a path that may not exist yet.
    ///
    /// The nearest existing ancestor is canonicalized and checked for
    /// containment; the remaining (purely lexical) components are re-joined
    /// onto it. Because normalization already happened, no `..` survives to
    /// the re-join.
    pub fn contain_for_create(&self, candidate: impl AsRef<Path>) -> Result<PathBuf> {
        let joined = self.join(candidate.as_ref())?;

        // Split off trailing components until we find something that exists.
        let mut existing = joined.clone();
        let mut trailing: Vec<std::ffi::OsString> = Vec::new();
        while !existing.exists() {
            match existing.file_name() {
                Some(name) => {
                    trailing.push(name.to_os_string());
                    existing.pop();
                }
                None => {
                    return Err(SxnErr::NotContained {
                        path: joined,
                        root: self.root.clone(),
                    });
                }
            }
        }

        let mut resolved = existing.canonicalize()?;
        if resolved != self.root && !resolved.starts_with(&self.root) {
            return Err(SxnErr::PathEscape {
                path: resolved,
                root: self.root.clone(),
            });
        }
        for name in trailing.iter().rev() {
            resolved.push(name);
        }
        Ok(resolved)
    }

    /// Join `candidate` onto the root (absolute candidates are taken as-is)
    /// and normalize away `.`/`..` without touching the filesystem. A `..`
    /// that would climb above the root is an escape.
    fn join(&self, candidate: &Path) -> Result<PathBuf> {
        let base = if candidate.is_absolute() {
            PathBuf::new()
        } else {
            self.root.clone()
        };
        let relative = !candidate.is_absolute();
        let mut out = base;
        for comp in candidate.components() {
            match comp {
                Component::ParentDir => {
                    let popped = out.pop();
                    if !popped || (relative && !out.starts_with(&self.root)) {
                        return Err(SxnErr::PathEscape {
                            path: candidate.to_path_buf(),
                            root: self.root.clone(),
                        });
                    }
                }
                Component::CurDir => {}
                other => out.push(other.as_os_str()),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn contain_resolves_inside_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file.txt"), b"x").unwrap();

        let sandbox = SandboxRoot::new(dir.path()).unwrap();
        let contained = sandbox.contain("sub/file.txt").unwrap();
        assert_eq!(contained, sandbox.root().join("sub/file.txt"));
    }

    #[test]
    fn contain_rejects_dot_dot_escape() {
        let dir = TempDir::new().unwrap();
        let sandbox = SandboxRoot::new(dir.path()).unwrap();
        let err = sandbox.contain("../outside.txt").unwrap_err();
        assert!(matches!(err, SxnErr::PathEscape { .. }), "{err}");
    }

    #[test]
    fn contain_rejects_interior_dot_dot_escape() {
        let dir = TempDir::new().unwrap();
        let sandbox = SandboxRoot::new(dir.path()).unwrap();
        let err = sandbox.contain("sub/../../outside.txt").unwrap_err();
        assert!(matches!(err, SxnErr::PathEscape { .. }), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn contain_rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();

        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("link"))
            .unwrap();

        let sandbox = SandboxRoot::new(dir.path()).unwrap();
        let err = sandbox.contain("link").unwrap_err();
        assert!(matches!(err, SxnErr::PathEscape { .. }), "{err}");
    }

    #[test]
    fn contain_for_create_allows_missing_leaf() {
        let dir = TempDir::new().unwrap();
        let sandbox = SandboxRoot::new(dir.path()).unwrap();
        let resolved = sandbox.contain_for_create("new/nested/file.txt").unwrap();
        assert!(resolved.starts_with(sandbox.root()));
        assert!(resolved.ends_with("new/nested/file.txt"));
    }

    #[test]
    fn contain_for_create_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let sandbox = SandboxRoot::new(dir.path()).unwrap();
        let err = sandbox.contain_for_create("../evil.txt").unwrap_err();
        assert!(matches!(err, SxnErr::PathEscape { .. }), "{err}");
    }

    #[test]
    fn absolute_candidate_outside_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        std::fs::write(other.path().join("f"), b"x").unwrap();

        let sandbox = SandboxRoot::new(dir.path()).unwrap();
        let err = sandbox.contain(other.path().join("f")).unwrap_err();
        assert!(matches!(err, SxnErr::PathEscape { .. }), "{err}");
    }
}
