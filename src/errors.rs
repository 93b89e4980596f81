//! Typed error hierarchy for the build supervisor.
//!
//! `BuildError` covers every failure an orchestration operation can report
//! to a caller. The HTTP layer maps each variant onto a status code in
//! `build::api`.

use std::path::PathBuf;

use thiserror::Error;

use crate::build::BuildStatus;

/// Errors from the build subsystem (supervisor, stores, and process control).
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("A build is already running for environment '{environment}' (build {build_id})")]
    AlreadyRunning {
        environment: String,
        build_id: String,
    },

    #[error("Build {build_id} not found")]
    NotFound { build_id: String },

    #[error("Unknown environment '{environment}'")]
    UnknownEnvironment { environment: String },

    #[error("Build {build_id} cannot move from {from} to {to}")]
    InvalidTransition {
        build_id: String,
        from: BuildStatus,
        to: BuildStatus,
    },

    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn build procedure for {build_id}: {source}")]
    SpawnFailed {
        build_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal build {build_id}: {source}")]
    Signal {
        build_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    /// Shorthand for wrapping an I/O failure on a storage path.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Storage {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_running_carries_holder() {
        let err = BuildError::AlreadyRunning {
            environment: "staging".to_string(),
            build_id: "abc-123".to_string(),
        };
        match &err {
            BuildError::AlreadyRunning {
                environment,
                build_id,
            } => {
                assert_eq!(environment, "staging");
                assert_eq!(build_id, "abc-123");
            }
            _ => panic!("Expected AlreadyRunning"),
        }
        let msg = err.to_string();
        assert!(msg.contains("staging"));
        assert!(msg.contains("abc-123"));
    }

    #[test]
    fn spawn_failed_keeps_io_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = BuildError::SpawnFailed {
            build_id: "b1".to_string(),
            source: io_err,
        };
        match &err {
            BuildError::SpawnFailed { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected SpawnFailed"),
        }
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn storage_helper_carries_path() {
        let err = BuildError::storage(
            "/data/status/b1.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        match &err {
            BuildError::Storage { path, source } => {
                assert_eq!(path, &PathBuf::from("/data/status/b1.json"));
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Storage"),
        }
    }

    #[test]
    fn serialization_converts_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: BuildError = json_err.into();
        assert!(matches!(err, BuildError::Serialization(_)));
    }

    #[test]
    fn invalid_transition_names_both_statuses() {
        let err = BuildError::InvalidTransition {
            build_id: "b1".to_string(),
            from: BuildStatus::Killed,
            to: BuildStatus::Running,
        };
        assert_eq!(err.to_string(), "Build b1 cannot move from killed to running");
    }

    #[test]
    fn not_found_message_includes_id() {
        let err = BuildError::NotFound {
            build_id: "missing".to_string(),
        };
        assert_eq!(err.to_string(), "Build missing not found");
    }
}
