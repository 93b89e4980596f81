//! Integration tests for the buildmaster CLI
//!
//! Each test writes a `buildmaster.toml` into a temp directory whose `dev`
//! environment runs a small `/bin/sh` script as the build procedure.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a buildmaster Command
fn buildmaster() -> Command {
    let mut cmd = cargo_bin_cmd!("buildmaster");
    cmd.env_remove("BUILDMASTER_CONFIG")
        .env_remove("BUILDMASTER_DATA_DIR")
        .env_remove("RUST_LOG");
    cmd
}

/// Helper to create a project whose `dev` build runs `script`
fn create_project(script: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    let script = script.replace('\\', "\\\\").replace('"', "\\\"");
    let toml = format!(
        r#"[storage]
data_dir = ".buildmaster"

[supervisor]
kill_grace_secs = 1

[environments.dev]
working_dir = "."
command = ["/bin/sh", "-c", "{}"]
"#,
        script
    );
    fs::write(dir.path().join("buildmaster.toml"), toml).unwrap();
    dir
}

fn run_build(dir: &TempDir) -> assert_cmd::assert::Assert {
    buildmaster()
        .current_dir(dir.path())
        .args(["run", "dev", "--mode", "quick"])
        .assert()
}

/// Build id of the most recent build in `dev`, read through `history --json`.
fn latest_build_id(dir: &TempDir) -> String {
    let output = buildmaster()
        .current_dir(dir.path())
        .args(["history", "dev", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let records: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    records[0]["build_id"].as_str().unwrap().to_string()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        buildmaster()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("run"));
    }

    #[test]
    fn test_version() {
        buildmaster()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("buildmaster"));
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let dir = create_project("exit 0");
        buildmaster()
            .current_dir(dir.path())
            .args(["run", "dev", "--mode", "turbo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid build mode"));
    }

    #[test]
    fn test_invalid_config_file_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("buildmaster.toml"), "[server\nport = ").unwrap();
        buildmaster()
            .current_dir(dir.path())
            .args(["history", "dev"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid config file"));
    }
}

// =============================================================================
// Foreground builds
// =============================================================================

mod run_command {
    use super::*;

    #[test]
    fn test_successful_build() {
        let dir = create_project(
            "echo '[STEP INIT]'; echo '[STEP BUILD 50] compiling'; echo '[STEP VERIFY]'; exit 0",
        );

        run_build(&dir)
            .success()
            .stdout(predicate::str::contains("finished: success"));

        assert!(dir.path().join(".buildmaster/status").is_dir());
        assert!(dir.path().join(".buildmaster/history/dev.jsonl").is_file());
    }

    #[test]
    fn test_out_of_memory_build_fails_with_category() {
        let dir = create_project(
            "echo '[STEP BUILD 40]'; echo 'FATAL ERROR: JavaScript heap out of memory' >&2; exit 1",
        );

        run_build(&dir)
            .failure()
            .stdout(predicate::str::contains("finished: error"))
            .stderr(predicate::str::contains("OUT_OF_MEMORY"));
    }

    #[test]
    fn test_unknown_environment_fails() {
        let dir = create_project("exit 0");
        buildmaster()
            .current_dir(dir.path())
            .args(["run", "staging"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown environment 'staging'"));
    }
}

// =============================================================================
// Read-only views
// =============================================================================

mod inspect_commands {
    use super::*;

    #[test]
    fn test_history_lists_finished_builds() {
        let dir = create_project("exit 0");
        run_build(&dir).success();
        run_build(&dir).success();

        buildmaster()
            .current_dir(dir.path())
            .args(["history", "dev"])
            .assert()
            .success()
            .stdout(predicate::str::contains("success").count(2))
            .stdout(predicate::str::contains("Slowest step"));
    }

    #[test]
    fn test_history_empty_environment() {
        let dir = create_project("exit 0");
        buildmaster()
            .current_dir(dir.path())
            .args(["history", "dev"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No builds recorded for 'dev'"));
    }

    #[test]
    fn test_status_and_logs_of_finished_build() {
        let dir = create_project("echo 'hello from the build'; exit 0");
        run_build(&dir).success();
        let build_id = latest_build_id(&dir);

        buildmaster()
            .current_dir(dir.path())
            .args(["status", &build_id, "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"success\""))
            .stdout(predicate::str::contains("\"stalled\": false"));

        buildmaster()
            .current_dir(dir.path())
            .args(["status", &build_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("Step timings:"))
            .stdout(predicate::str::contains("INIT"));

        buildmaster()
            .current_dir(dir.path())
            .args(["logs", &build_id, "-n", "50"])
            .assert()
            .success()
            .stdout(predicate::str::contains("hello from the build"));
    }

    #[test]
    fn test_status_of_unknown_build_fails() {
        let dir = create_project("exit 0");
        buildmaster()
            .current_dir(dir.path())
            .args(["status", "no-such-build"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_recover_with_nothing_to_do() {
        let dir = create_project("exit 0");
        buildmaster()
            .current_dir(dir.path())
            .arg("recover")
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to recover."));
    }

    #[test]
    fn test_recover_marks_orphaned_build_interrupted() {
        let dir = create_project("exit 0");
        run_build(&dir).success();
        let finished_id = latest_build_id(&dir);

        // Fake a running record for a process that no longer exists.
        let status_dir = dir.path().join(".buildmaster/status");
        let finished = fs::read_to_string(status_dir.join(format!("{}.json", finished_id))).unwrap();
        let mut record: serde_json::Value = serde_json::from_str(&finished).unwrap();
        record["build_id"] = "orphaned-build".into();
        record["status"] = "running".into();
        record["completed_at"] = serde_json::Value::Null;
        record["duration_seconds"] = serde_json::Value::Null;
        record["pid"] = 4_194_311.into();
        fs::write(
            status_dir.join("orphaned-build.json"),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();

        buildmaster()
            .current_dir(dir.path())
            .args(["recover", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("orphaned-build"));

        buildmaster()
            .current_dir(dir.path())
            .args(["status", "orphaned-build", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"error_type\": \"INTERRUPTED\""));
    }
}
