//! Durable per-build status records.
//!
//! Each build owns `<build_id>.json`. Every write goes through a uniquely
//! named temp file and `rename`, so readers see either the previous record
//! or the new one and never a partial write.
//!
//! Two side files settle races between writers, including writers in other
//! processes:
//! - `<build_id>.final` holds the terminal record. It is hard-linked into
//!   place, so exactly one finalizer wins and nothing replaces it later.
//! - `<build_id>.kill` marks a cancellation request. Reads merge it into the
//!   record, so a progress write cannot drop it.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use crate::errors::BuildError;

use super::models::{BuildRecord, is_valid_transition};

pub struct StatusStore {
    dir: PathBuf,
    /// Serializes writers within this process.
    write_lock: Mutex<()>,
}

/// Build ids are opaque, but they name files, so only a safe alphabet is addressable.
pub(crate) fn is_valid_build_id(build_id: &str) -> bool {
    !build_id.is_empty()
        && build_id.len() <= 64
        && build_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn read_json(path: &Path) -> Result<Option<BuildRecord>, BuildError> {
    match std::fs::read(path) {
        Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BuildError::storage(path, e)),
    }
}

impl StatusStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, BuildError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| BuildError::storage(&dir, e))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, build_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", build_id))
    }

    fn final_path(&self, build_id: &str) -> PathBuf {
        self.dir.join(format!("{}.final", build_id))
    }

    fn kill_path(&self, build_id: &str) -> PathBuf {
        self.dir.join(format!("{}.kill", build_id))
    }

    fn check_id(build_id: &str) -> Result<(), BuildError> {
        if is_valid_build_id(build_id) {
            Ok(())
        } else {
            Err(BuildError::InvalidConfig(format!(
                "invalid build id '{}'",
                build_id
            )))
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, BuildError> {
        self.write_lock
            .lock()
            .map_err(|e| anyhow::anyhow!("status store lock poisoned: {}", e).into())
    }

    /// Serialize `record` into a fresh temp file next to its final location.
    fn write_temp(&self, record: &BuildRecord) -> Result<PathBuf, BuildError> {
        let tmp_path = self.dir.join(format!(
            "{}.{}.tmp",
            record.build_id,
            Uuid::new_v4().simple()
        ));
        let json = serde_json::to_vec_pretty(record)?;
        let written = std::fs::File::create(&tmp_path).and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(BuildError::storage(tmp_path, e));
        }
        Ok(tmp_path)
    }

    /// Replace the record for `record.build_id` atomically.
    ///
    /// The status must be a valid transition from the stored one. A terminal
    /// record is committed through [`finalize`](Self::finalize); losing that
    /// race is reported as an invalid transition.
    pub fn write(&self, record: &BuildRecord) -> Result<(), BuildError> {
        Self::check_id(&record.build_id)?;
        if record.is_terminal() {
            return match self.finalize(record)? {
                None => Ok(()),
                Some(current) => Err(BuildError::InvalidTransition {
                    build_id: record.build_id.clone(),
                    from: current.status,
                    to: record.status,
                }),
            };
        }

        let _guard = self.guard()?;
        if let Ok(Some(current)) = self.read(&record.build_id)
            && !is_valid_transition(current.status, record.status)
        {
            return Err(BuildError::InvalidTransition {
                build_id: record.build_id.clone(),
                from: current.status,
                to: record.status,
            });
        }

        let path = self.record_path(&record.build_id);
        let tmp_path = self.write_temp(record)?;
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(BuildError::storage(path, e));
        }
        Ok(())
    }

    /// Commit `record` as the build's terminal state, once.
    ///
    /// Returns `None` when this call committed it, or the terminal record a
    /// different writer committed first.
    pub fn finalize(&self, record: &BuildRecord) -> Result<Option<BuildRecord>, BuildError> {
        Self::check_id(&record.build_id)?;
        if !record.is_terminal() {
            return Err(BuildError::InvalidConfig(format!(
                "build {} cannot be finalized as {}",
                record.build_id, record.status
            )));
        }

        let _guard = self.guard()?;
        let final_path = self.final_path(&record.build_id);
        if let Some(current) = read_json(&final_path)? {
            return Ok(Some(current));
        }
        if let Ok(Some(current)) = read_json(&self.record_path(&record.build_id)) {
            // The .json is only terminal once a .final exists beside it.
            if current.is_terminal() {
                return Ok(Some(read_json(&final_path)?.unwrap_or(current)));
            }
            if !is_valid_transition(current.status, record.status) {
                return Err(BuildError::InvalidTransition {
                    build_id: record.build_id.clone(),
                    from: current.status,
                    to: record.status,
                });
            }
        }

        let tmp_path = self.write_temp(record)?;
        match std::fs::hard_link(&tmp_path, &final_path) {
            Ok(()) => {}
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                if e.kind() == std::io::ErrorKind::AlreadyExists
                    && let Some(current) = read_json(&final_path)?
                {
                    return Ok(Some(current));
                }
                return Err(BuildError::storage(final_path, e));
            }
        }

        // Mirror into the plain record for anything reading the .json directly.
        let path = self.record_path(&record.build_id);
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            tracing::warn!(path = %path.display(), error = %e, "failed to mirror terminal record");
        }
        let _ = std::fs::remove_file(self.kill_path(&record.build_id));
        Ok(None)
    }

    /// Record that `build_id` should be cancelled.
    ///
    /// Returns `false` when a request was already recorded or the build has
    /// finished.
    pub fn request_kill(&self, build_id: &str) -> Result<bool, BuildError> {
        Self::check_id(build_id)?;
        if self.final_path(build_id).exists() {
            return Ok(false);
        }
        let path = self.kill_path(build_id);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(BuildError::storage(path, e)),
        }
    }

    /// Most recently completed write for `build_id`, or `None` if unknown.
    pub fn read(&self, build_id: &str) -> Result<Option<BuildRecord>, BuildError> {
        if !is_valid_build_id(build_id) {
            return Ok(None);
        }
        if let Some(record) = read_json(&self.final_path(build_id))? {
            return Ok(Some(record));
        }
        let Some(mut record) = read_json(&self.record_path(build_id))? else {
            return Ok(None);
        };
        if !record.is_terminal() && self.kill_path(build_id).exists() {
            record.kill_requested = true;
        }
        Ok(Some(record))
    }

    /// Every readable record in the store. Corrupt files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<BuildRecord>, BuildError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| BuildError::storage(&self.dir, e))?;

        let build_ids: BTreeSet<String> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("json" | "final")
                )
            })
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
            .collect();

        let mut records = Vec::new();
        for build_id in build_ids {
            match self.read(&build_id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(build_id = %build_id, error = %e, "skipping unreadable status record");
                }
            }
        }
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }
}
