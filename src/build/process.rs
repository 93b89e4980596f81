//! Process-group helpers for build procedures.
//!
//! Every build runs as the leader of its own process group so that a kill
//! reaches the helpers it forks, not just the immediate child:
//! - `isolate_process_group` makes the spawned child a group leader.
//! - `signal_process_group` sends SIGTERM/SIGKILL to the whole group.
//! - `is_process_alive` checks a pid left behind by an earlier supervisor.
//!
//! On non-Unix platforms group signalling is unsupported and liveness is
//! always reported as dead.

use std::io;
use std::process::ExitStatus;

use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

#[cfg(unix)]
/// Start the command in a new process group led by the child itself.
pub fn isolate_process_group(command: &mut Command) {
    command.process_group(0);
}

#[cfg(not(unix))]
/// No-op on non-Unix platforms.
pub fn isolate_process_group(_command: &mut Command) {}

#[cfg(unix)]
/// Signal every process in group `pgid`.
///
/// Returns `Ok(false)` when the group no longer exists.
pub fn signal_process_group(pgid: u32, signal: Signal) -> io::Result<bool> {
    let pgid = pgid as libc::pid_t;
    if pgid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "refusing to signal a non-positive process group",
        ));
    }
    let result = unsafe { libc::killpg(pgid, signal.as_raw()) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(true)
}

#[cfg(not(unix))]
pub fn signal_process_group(_pgid: u32, _signal: Signal) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are not supported on this platform",
    ))
}

#[cfg(unix)]
/// Whether `pid` still names a process (possibly owned by another user).
pub fn is_process_alive(pid: u32) -> bool {
    let pid = pid as libc::pid_t;
    if pid <= 0 {
        return false;
    }
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return !is_zombie(pid);
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(target_os = "linux")]
/// A zombie still answers `kill(pid, 0)` until it is reaped.
fn is_zombie(pid: libc::pid_t) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // Format is "pid (comm) state ...", and comm may itself contain ')'.
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z" || state == "X")
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: libc::pid_t) -> bool {
    false
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

/// Exit code of a finished child, using the shell's `128 + signal`
/// convention when it was terminated by a signal.
pub fn exit_code_of(status: ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + signal);
        }
    }
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
    }

    #[tokio::test]
    async fn test_exited_child_is_not_alive() {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_signal_group_reaches_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", marker.display());

        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script).stdin(Stdio::null());
        isolate_process_group(&mut command);
        let mut child = command.spawn().unwrap();
        let pgid = child.id().unwrap();

        let mut grandchild = None;
        for _ in 0..50 {
            if let Ok(text) = std::fs::read_to_string(&marker)
                && let Ok(pid) = text.trim().parse::<u32>()
            {
                grandchild = Some(pid);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let grandchild = grandchild.expect("grandchild pid written");

        assert!(signal_process_group(pgid, Signal::Terminate).unwrap());
        let status = child.wait().await.unwrap();
        assert_eq!(exit_code_of(status), Some(128 + libc::SIGTERM));

        let mut gone = false;
        for _ in 0..50 {
            if !is_process_alive(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "grandchild survived group termination");
    }

    #[test]
    fn test_signal_missing_group_reports_false() {
        // pid_max on Linux tops out at 2^22, so this group cannot exist.
        assert!(!signal_process_group(4_194_304 + 7, Signal::Kill).unwrap());
    }

    #[test]
    fn test_exit_code_of_plain_exit() {
        let status = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 3")
            .status()
            .unwrap();
        assert_eq!(exit_code_of(status), Some(3));
    }
}
