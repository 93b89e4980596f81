//! Completed-build history, one JSONL file per environment.
//!
//! Entries are appended oldest-first on disk and listed newest-first.
//! Appends are de-duplicated by `build_id`. Retention drops whole entries
//! from the old end and rewrites the file through a temp file + rename.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::errors::BuildError;

use super::lock::is_valid_environment;
use super::models::BuildRecord;

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub max_entries: usize,
    pub max_age: Option<chrono::Duration>,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_age: None,
        }
    }
}

pub struct BuildHistory {
    dir: PathBuf,
    retention: Retention,
    // Serializes read-check-append so duplicates cannot race in.
    write_lock: Mutex<()>,
}

impl BuildHistory {
    pub fn open(dir: impl Into<PathBuf>, retention: Retention) -> Result<Self, BuildError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| BuildError::storage(&dir, e))?;
        Ok(Self {
            dir,
            retention,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, environment: &str) -> Result<PathBuf, BuildError> {
        if !is_valid_environment(environment) {
            return Err(BuildError::UnknownEnvironment {
                environment: environment.to_string(),
            });
        }
        Ok(self.dir.join(format!("{}.jsonl", environment)))
    }

    /// Oldest-first entries as stored on disk. Unparsable lines are skipped.
    fn read_all(&self, environment: &str) -> Result<Vec<BuildRecord>, BuildError> {
        let path = self.path_for(environment)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BuildError::storage(path, e)),
        };
        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BuildRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        line = idx + 1,
                        error = %e,
                        "skipping corrupt history entry"
                    );
                }
            }
        }
        Ok(records)
    }

    /// Append a terminal record. Returns `false` if `build_id` was already recorded.
    pub fn append(&self, record: &BuildRecord) -> Result<bool, BuildError> {
        if !record.is_terminal() {
            return Err(BuildError::InvalidConfig(format!(
                "build {} is still {} and cannot enter history",
                record.build_id, record.status
            )));
        }
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;

        let mut existing = self.read_all(&record.environment)?;
        if existing.iter().any(|r| r.build_id == record.build_id) {
            tracing::debug!(build_id = %record.build_id, "history entry already present");
            return Ok(false);
        }

        let path = self.path_for(&record.environment)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|e| BuildError::storage(&path, e))?;

        existing.push(record.clone());
        self.enforce_retention(&record.environment, existing, Utc::now())?;
        Ok(true)
    }

    fn enforce_retention(
        &self,
        environment: &str,
        entries: Vec<BuildRecord>,
        now: DateTime<Utc>,
    ) -> Result<(), BuildError> {
        let before = entries.len();
        let mut kept: Vec<BuildRecord> = match self.retention.max_age {
            Some(max_age) => entries
                .into_iter()
                .filter(|r| now - r.completed_at.unwrap_or(r.updated_at) <= max_age)
                .collect(),
            None => entries,
        };
        if kept.len() > self.retention.max_entries {
            let excess = kept.len() - self.retention.max_entries;
            kept.drain(..excess);
        }
        if kept.len() == before {
            return Ok(());
        }

        let path = self.path_for(environment)?;
        let tmp_path = path.with_extension("jsonl.tmp");
        let mut content = String::new();
        for record in &kept {
            content.push_str(&serde_json::to_string(record)?);
            content.push('\n');
        }
        std::fs::write(&tmp_path, content)
            .and_then(|_| std::fs::rename(&tmp_path, &path))
            .map_err(|e| BuildError::storage(&path, e))?;
        tracing::debug!(
            environment,
            pruned = before - kept.len(),
            "pruned build history"
        );
        Ok(())
    }

    /// Newest-first page of at most `limit` entries (capped at [`MAX_LIST_LIMIT`]).
    pub fn list(&self, environment: &str, limit: usize) -> Result<Vec<BuildRecord>, BuildError> {
        let mut records = self.read_all(environment)?;
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit.min(MAX_LIST_LIMIT));
        Ok(records)
    }
}
