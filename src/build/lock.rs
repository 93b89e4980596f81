//! Per-environment active-build marker.
//!
//! `locks/<environment>.lock` holds the id of the one non-terminal build for
//! that environment. Acquisition hard-links a fully written temp file into
//! place, which fails atomically when the lock already exists, so the
//! check-and-set holds across processes as well as tasks.

use std::path::{Path, PathBuf};

use crate::errors::BuildError;

pub struct ActiveBuildLock {
    dir: PathBuf,
}

/// Environment names double as file names.
pub(crate) fn is_valid_environment(environment: &str) -> bool {
    !environment.is_empty()
        && environment.len() <= 64
        && environment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ActiveBuildLock {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, BuildError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| BuildError::storage(&dir, e))?;
        Ok(Self { dir })
    }

    fn path_for(&self, environment: &str) -> Result<PathBuf, BuildError> {
        if !is_valid_environment(environment) {
            return Err(BuildError::UnknownEnvironment {
                environment: environment.to_string(),
            });
        }
        Ok(self.dir.join(format!("{}.lock", environment)))
    }

    /// Claim `environment` for `build_id`, or report the current holder.
    pub fn try_acquire(&self, environment: &str, build_id: &str) -> Result<(), BuildError> {
        let path = self.path_for(environment)?;
        let tmp_path = self.dir.join(format!(
            "{}.lock.{}.{}.tmp",
            environment,
            std::process::id(),
            build_id
        ));
        std::fs::write(&tmp_path, build_id).map_err(|e| BuildError::storage(&tmp_path, e))?;

        let linked = std::fs::hard_link(&tmp_path, &path);
        let _ = std::fs::remove_file(&tmp_path);

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = self.holder(environment)?.unwrap_or_default();
                Err(BuildError::AlreadyRunning {
                    environment: environment.to_string(),
                    build_id: holder,
                })
            }
            Err(e) => Err(BuildError::storage(path, e)),
        }
    }

    /// Build id currently holding `environment`, if any.
    pub fn holder(&self, environment: &str) -> Result<Option<String>, BuildError> {
        let path = self.path_for(environment)?;
        read_holder(&path)
    }

    /// Release `environment` if (and only if) `build_id` holds it.
    ///
    /// Returns whether a lock was removed.
    pub fn release(&self, environment: &str, build_id: &str) -> Result<bool, BuildError> {
        let path = self.path_for(environment)?;
        match read_holder(&path)? {
            Some(holder) if holder == build_id => match std::fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(BuildError::storage(path, e)),
            },
            _ => Ok(false),
        }
    }

    /// All held locks as `(environment, build_id)` pairs.
    pub fn list(&self) -> Result<Vec<(String, String)>, BuildError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| BuildError::storage(&self.dir, e))?;
        let mut locks = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("lock") {
                continue;
            }
            let Some(environment) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(holder) = read_holder(&path)? {
                locks.push((environment.to_string(), holder));
            }
        }
        locks.sort();
        Ok(locks)
    }
}

fn read_holder(path: &Path) -> Result<Option<String>, BuildError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BuildError::storage(path, e)),
    }
}
