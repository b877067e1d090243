//! Working-directory resolution for engine turns.
//!
//! Priority: explicit directory, then `WARDEN_PROJECT_PATH`, then the process
//! working directory, then the user's home. Temp directories lose to any
//! later non-temp candidate.

use std::path::{Path, PathBuf};

use warden_core::{Result, WardenError};

pub const ENV_PROJECT_PATH: &str = "WARDEN_PROJECT_PATH";

/// Values some hosts pass for "no directory".
fn is_absent(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed == "undefined" || trimmed == "null"
}

fn normalize(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}

/// Whether `path` lies under one of `temp_roots` (case-insensitive).
pub fn is_temp_directory(path: &Path, temp_roots: &[PathBuf]) -> bool {
    let candidate = normalize(path);
    temp_roots.iter().any(|root| {
        let root = normalize(root);
        let root = root.trim_end_matches('/');
        !root.is_empty()
            && (candidate == root || candidate.starts_with(&format!("{root}/")))
    })
}

/// The usual temp locations of this host.
pub fn default_temp_roots() -> Vec<PathBuf> {
    let mut roots = vec![std::env::temp_dir()];
    for var in ["TMPDIR", "TEMP", "TMP"] {
        if let Some(value) = std::env::var_os(var) {
            if !value.is_empty() {
                roots.push(PathBuf::from(value));
            }
        }
    }
    if cfg!(unix) {
        for dir in ["/tmp", "/var/tmp", "/private/tmp"] {
            roots.push(PathBuf::from(dir));
        }
    }
    roots.sort();
    roots.dedup();
    roots
}

#[derive(Debug, Clone)]
pub struct WorkingDirectoryResolver {
    project_path: Option<String>,
    process_cwd: Option<PathBuf>,
    home: Option<PathBuf>,
    temp_roots: Vec<PathBuf>,
}

impl Default for WorkingDirectoryResolver {
    fn default() -> Self {
        Self::from_env()
    }
}

impl WorkingDirectoryResolver {
    /// Reads the project path variable, process cwd, home and temp roots
    /// from the running process.
    pub fn from_env() -> Self {
        Self {
            project_path: std::env::var(ENV_PROJECT_PATH).ok(),
            process_cwd: std::env::current_dir().ok(),
            home: dirs::home_dir(),
            temp_roots: default_temp_roots(),
        }
    }

    /// A resolver with no fallbacks and no temp roots.
    pub fn empty() -> Self {
        Self {
            project_path: None,
            process_cwd: None,
            home: None,
            temp_roots: Vec::new(),
        }
    }

    pub fn with_project_path(mut self, project_path: Option<String>) -> Self {
        self.project_path = project_path;
        self
    }

    pub fn with_process_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.process_cwd = cwd;
        self
    }

    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    pub fn with_temp_roots(mut self, temp_roots: Vec<PathBuf>) -> Self {
        self.temp_roots = temp_roots;
        self
    }

    /// Picks the working directory for a turn.
    ///
    /// # Errors
    ///
    /// - `InvalidWorkingDirectory` when the caller named a directory that
    ///   does not exist or is not a directory.
    /// - `InvalidWorkingDirectory` when no candidate exists at all.
    pub fn resolve(&self, explicit: Option<&str>) -> Result<PathBuf> {
        let explicit = explicit.filter(|v| !is_absent(v));
        if let Some(dir) = explicit {
            if !Path::new(dir).is_dir() {
                return Err(WardenError::invalid_working_directory(dir));
            }
        }

        let candidates = explicit
            .map(PathBuf::from)
            .into_iter()
            .chain(
                self.project_path
                    .as_deref()
                    .filter(|v| !is_absent(v))
                    .map(PathBuf::from),
            )
            .chain(self.process_cwd.clone())
            .chain(self.home.clone())
            .filter(|p| p.is_dir());

        let mut first_temp: Option<PathBuf> = None;
        for candidate in candidates {
            if is_temp_directory(&candidate, &self.temp_roots) {
                tracing::debug!(
                    "[WorkdirResolver] Skipping temp directory {}",
                    candidate.display()
                );
                first_temp.get_or_insert(candidate);
                continue;
            }
            return Ok(candidate);
        }

        first_temp.ok_or_else(|| {
            WardenError::invalid_working_directory(explicit.unwrap_or("<none>").to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_temp_detection_is_prefix_and_case_insensitive() {
        let roots = vec![PathBuf::from("/tmp"), PathBuf::from("/Private/Tmp/")];
        assert!(is_temp_directory(Path::new("/tmp"), &roots));
        assert!(is_temp_directory(Path::new("/tmp/abc"), &roots));
        assert!(is_temp_directory(Path::new("/private/tmp/x"), &roots));
        assert!(!is_temp_directory(Path::new("/tmpfoo"), &roots));
        assert!(!is_temp_directory(Path::new("/home/me"), &roots));
    }

    #[test]
    fn test_explicit_directory_wins() {
        let project = TempDir::new().unwrap();
        let resolver = WorkingDirectoryResolver::empty()
            .with_process_cwd(Some(PathBuf::from("/")));
        let resolved = resolver
            .resolve(Some(project.path().to_str().unwrap()))
            .unwrap();
        assert_eq!(resolved, project.path());
    }

    #[test]
    fn test_missing_explicit_directory_is_invalid() {
        let resolver = WorkingDirectoryResolver::empty().with_home(Some(PathBuf::from("/")));
        let err = resolver.resolve(Some("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, WardenError::InvalidWorkingDirectory { .. }));
    }

    #[test]
    fn test_absent_markers_fall_through() {
        let home = TempDir::new().unwrap();
        let resolver = WorkingDirectoryResolver::empty()
            .with_project_path(Some("undefined".into()))
            .with_home(Some(home.path().to_path_buf()));
        assert_eq!(resolver.resolve(Some("null")).unwrap(), home.path());
        assert_eq!(resolver.resolve(Some("")).unwrap(), home.path());
    }

    #[test]
    fn test_temp_directory_skipped_for_better_candidate() {
        let scratch = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let resolver = WorkingDirectoryResolver::empty()
            .with_project_path(Some(project.path().to_string_lossy().into_owned()))
            .with_temp_roots(vec![scratch.path().to_path_buf()]);

        let resolved = resolver
            .resolve(Some(scratch.path().to_str().unwrap()))
            .unwrap();
        assert_eq!(resolved, project.path());
    }

    #[test]
    fn test_temp_directory_used_when_nothing_better() {
        let scratch = TempDir::new().unwrap();
        let resolver =
            WorkingDirectoryResolver::empty().with_temp_roots(vec![scratch.path().to_path_buf()]);
        assert_eq!(
            resolver.resolve(Some(scratch.path().to_str().unwrap())).unwrap(),
            scratch.path()
        );
    }

    #[test]
    fn test_no_candidates_is_invalid() {
        let resolver = WorkingDirectoryResolver::empty();
        assert!(resolver.resolve(None).is_err());
    }
}
