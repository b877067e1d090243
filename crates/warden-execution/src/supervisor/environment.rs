//! Environment preparation for engine processes.

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Prefix and suffix of the working-directory marker files the engine's
/// shell tool leaves in its temp directory.
const MARKER_PREFIX: &str = "claude-";
const MARKER_SUFFIX: &str = "-cwd";

fn common_bin_dirs(home: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if cfg!(unix) {
        for dir in ["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin", "/bin"] {
            dirs.push(PathBuf::from(dir));
        }
        if let Some(home) = home {
            dirs.push(home.join(".local").join("bin"));
            dirs.push(home.join(".volta").join("bin"));
        }
    }
    dirs
}

/// Builds the engine's `PATH`: the runtime's own directory first, then the
/// inherited entries, then common install directories that were missing.
///
/// Returns `None` if the result cannot be represented as a `PATH` value.
pub fn augmented_path(
    current: Option<&OsStr>,
    runtime_dir: Option<&Path>,
    home: Option<&Path>,
) -> Option<OsString> {
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut entries: Vec<PathBuf> = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dir.as_os_str().is_empty() && seen.insert(dir.clone()) {
            entries.push(dir);
        }
    };

    if let Some(dir) = runtime_dir {
        push(dir.to_path_buf());
    }
    if let Some(current) = current {
        for dir in std::env::split_paths(current) {
            push(dir);
        }
    }
    for dir in common_bin_dirs(home) {
        push(dir);
    }

    std::env::join_paths(entries).ok()
}

fn is_marker(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    name.starts_with(MARKER_PREFIX) && name.ends_with(MARKER_SUFFIX)
}

/// Marker files present in a temp directory before a turn started.
#[derive(Debug)]
pub struct TempMarkers {
    dir: PathBuf,
    before: HashSet<OsString>,
}

impl TempMarkers {
    pub fn snapshot(dir: &Path) -> Self {
        let before = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name())
                    .filter(|name| is_marker(name))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            dir: dir.to_path_buf(),
            before,
        }
    }

    /// Deletes markers created since the snapshot. Returns how many.
    pub fn cleanup(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            if !is_marker(&name) || self.before.contains(&name) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => tracing::debug!(
                    "[Supervisor] Could not remove marker {}: {}",
                    entry.path().display(),
                    e
                ),
            }
        }
        if removed > 0 {
            tracing::debug!(
                "[Supervisor] Removed {} marker file(s) from {}",
                removed,
                self.dir.display()
            );
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[test]
    fn test_runtime_dir_first_and_no_duplicates() {
        let path = augmented_path(
            Some(OsStr::new("/usr/bin:/custom/bin")),
            Some(Path::new("/opt/node/bin")),
            None,
        )
        .unwrap();
        let entries: Vec<PathBuf> = std::env::split_paths(&path).collect();

        assert_eq!(entries[0], PathBuf::from("/opt/node/bin"));
        assert_eq!(entries[1], PathBuf::from("/usr/bin"));
        assert_eq!(entries[2], PathBuf::from("/custom/bin"));
        assert_eq!(
            entries.iter().filter(|e| **e == PathBuf::from("/usr/bin")).count(),
            1
        );
        assert!(entries.contains(&PathBuf::from("/usr/local/bin")));
    }

    #[test]
    fn test_cleanup_only_removes_new_markers() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("claude-old-cwd"), "").unwrap();
        let markers = TempMarkers::snapshot(dir.path());

        std::fs::write(dir.path().join("claude-1a2b-cwd"), "").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "").unwrap();

        assert_eq!(markers.cleanup(), 1);
        assert!(dir.path().join("claude-old-cwd").exists());
        assert!(dir.path().join("unrelated.txt").exists());
        assert!(!dir.path().join("claude-1a2b-cwd").exists());
    }
}
