//! Process liveness probes and tree termination.
//!
//! The supervisor needs two cheap, robust answers: "is pid P still alive?"
//! and "terminate the process tree rooted at P". On unix liveness is the
//! null signal; on Windows it is a `tasklist` query. Both are safe on
//! unknown pids and race cleanly with natural exit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

/// Basenames considered interchangeable when matching a recorded executable
/// against a live process (browser relaunches swap binaries freely).
const BROWSER_EXECUTABLES: [&str; 5] = ["chrome", "chromium", "google-chrome", "msedge", "node"];

/// Grace period between the terminate signal and the force kill.
const TERMINATE_GRACE: Duration = Duration::from_millis(100);

/// Whether the OS still has a not-fully-reaped process with this id.
/// `pid == 0` (and anything unrepresentable) is always dead.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    #[cfg(unix)]
    {
        #[allow(clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(pid as i32, 0) };
        ret == 0
    }

    #[cfg(not(unix))]
    {
        let output = std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
            .output();
        match output {
            Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()),
            Err(_) => false,
        }
    }
}

/// Resolve the executable path of a live process, best effort.
pub fn executable_path(pid: u32) -> Option<PathBuf> {
    if !is_alive(pid) {
        return None;
    }

    // /proc is authoritative where it exists.
    let proc_link = PathBuf::from(format!("/proc/{pid}/exe"));
    if let Ok(path) = std::fs::read_link(&proc_link) {
        return Some(path);
    }

    // Fallback: ps comm column (macOS and /proc-less unixes).
    let output = std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .output()
        .ok()?;
    let comm = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if comm.is_empty() {
        None
    } else {
        Some(PathBuf::from(comm))
    }
}

/// Direct children of a process, via `pgrep -P`.
pub fn children(pid: u32) -> Vec<u32> {
    let output = std::process::Command::new("pgrep")
        .args(["-P", &pid.to_string()])
        .output();
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect(),
        // pgrep exits non-zero when nothing matched; an empty tree is fine.
        Err(_) => Vec::new(),
    }
}

/// Terminate a process tree: children first (recursively), then the root.
/// Each process gets the graceful signal, [`TERMINATE_GRACE`], then a force
/// kill if it is still around.
pub async fn terminate_tree(pid: u32) {
    if !is_alive(pid) {
        return;
    }

    for child in children(pid) {
        Box::pin(terminate_tree(child)).await;
    }

    terminate(pid).await;
}

/// Terminate a single process with graceful escalation.
pub async fn terminate(pid: u32) {
    if !is_alive(pid) {
        return;
    }

    #[cfg(unix)]
    {
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        tokio::time::sleep(TERMINATE_GRACE).await;
        if is_alive(pid) {
            #[allow(clippy::cast_possible_wrap)]
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
            warn!("process {pid} required SIGKILL");
        }
    }

    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output();
        let _ = TERMINATE_GRACE;
    }
}

/// Whether a recorded executable path is compatible with the one currently
/// behind the pid: exact match, or both basenames on the browser allow-list.
pub fn executables_compatible(expected: &str, actual: &Path) -> bool {
    if Path::new(expected) == actual {
        return true;
    }

    let expected_base = Path::new(expected)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(expected);
    let actual_base = actual
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    BROWSER_EXECUTABLES.contains(&expected_base) && BROWSER_EXECUTABLES.contains(&actual_base)
}
