//! Persistent state directory layout.
//!
//! The bridge keeps its durable state under a single directory
//! (`$PYXIS_STATE_DIR` or `~/MCPs`):
//!
//! ```text
//! ~/MCPs/                      (StateDir)
//! ├── user_tools/                (mounted at /projects in the sandbox)
//! │   ├── user_tools.py            (append-only saved functions)
//! │   └── memory/                  (one JSON record per memory key)
//! └── pyxis-ipc-*/               (per-invocation IPC directories)
//! ```
//!
//! The same directory doubles as the primary catalog source: `*.json` files
//! directly under it describe upstream servers.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Name prefix for per-invocation IPC directories.
pub const IPC_DIR_PREFIX: &str = "pyxis-ipc-";

/// Persistent state directory (`~/MCPs` or `$PYXIS_STATE_DIR`).
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Resolve the state directory.
    ///
    /// An explicit override wins; otherwise `~/MCPs` is used.
    ///
    /// # Errors
    ///
    /// Returns an error if no override is given and the home directory
    /// cannot be determined.
    pub fn resolve(override_path: Option<&Path>) -> io::Result<Self> {
        let root = match override_path {
            Some(path) => path.to_path_buf(),
            None => {
                let user_dirs = directories::UserDirs::new().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "cannot determine home directory")
                })?;
                user_dirs.home_dir().join("MCPs")
            },
        };
        Ok(Self { root })
    }

    /// Create from an explicit path (useful for testing).
    #[must_use]
    pub fn from_path(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root of the state directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory mounted into the sandbox at `/projects`.
    #[must_use]
    pub fn user_tools_dir(&self) -> PathBuf {
        self.root.join("user_tools")
    }

    /// Ensure the directory structure exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.user_tools_dir())?;
        Ok(())
    }

    /// Remove old IPC directories, keeping the `keep` most recently
    /// modified. Returns the number of directories removed.
    ///
    /// Invocations normally clean up after themselves; this sweep bounds
    /// disk usage when a previous bridge process died mid-invocation.
    pub fn cleanup_stale_ipc_dirs(&self, keep: usize) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return 0;
        };

        let mut ipc_dirs: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_ipc = path.is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(IPC_DIR_PREFIX));
            if !is_ipc {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            ipc_dirs.push((path, modified));
        }

        if ipc_dirs.len() <= keep {
            return 0;
        }

        // Oldest first; everything beyond the keep budget goes.
        ipc_dirs.sort_by_key(|(_, modified)| *modified);
        let excess = ipc_dirs.len().saturating_sub(keep);
        let mut removed: usize = 0;
        for (path, _) in ipc_dirs.into_iter().take(excess) {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed = removed.saturating_add(1),
                Err(error) => {
                    debug!(path = %path.display(), %error, "Failed to remove stale IPC dir");
                },
            }
        }

        if removed > 0 {
            info!(removed, keep, "Pruned stale IPC directories");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_path_and_layout() {
        let state = StateDir::from_path("/tmp/pyxis-state");
        assert_eq!(state.root(), Path::new("/tmp/pyxis-state"));
        assert_eq!(
            state.user_tools_dir(),
            PathBuf::from("/tmp/pyxis-state/user_tools")
        );
    }

    #[test]
    fn cleanup_keeps_most_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateDir::from_path(tmp.path());

        for index in 0..5 {
            let dir = tmp.path().join(format!("{IPC_DIR_PREFIX}{index}"));
            std::fs::create_dir(&dir).unwrap();
        }
        // Unrelated directories are never touched.
        std::fs::create_dir(tmp.path().join("user_tools")).unwrap();

        let removed = state.cleanup_stale_ipc_dirs(2);
        assert_eq!(removed, 3);

        let remaining: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(IPC_DIR_PREFIX))
            })
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(tmp.path().join("user_tools").is_dir());
    }

    #[test]
    fn cleanup_is_noop_under_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateDir::from_path(tmp.path());
        std::fs::create_dir(tmp.path().join(format!("{IPC_DIR_PREFIX}only"))).unwrap();
        assert_eq!(state.cleanup_stale_ipc_dirs(50), 0);
    }
}
