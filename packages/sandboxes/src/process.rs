// ABOUTME: Host process inspection and termination helpers
// ABOUTME: Liveness checks for registry reconciliation and crash-safe hypervisor kills

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use tracing::debug;

fn to_pid(pid: u32) -> Option<Pid> {
    // 0 and negative values address process groups
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// Whether `pid` names a live, non-zombie process.
pub fn is_process_alive(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    match kill(target, None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::ESRCH) => false,
        // Exists but owned by someone else
        Err(Errno::EPERM) => true,
        Err(e) => {
            debug!("Liveness check for pid {} failed: {}", pid, e);
            false
        }
    }
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The command name may contain spaces; the state follows the last ')'
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .map(|state| state == 'Z')
        .unwrap_or(false)
}

/// Send SIGKILL. Returns true if the signal was delivered.
pub fn kill_process(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    match kill(target, Signal::SIGKILL) {
        Ok(()) => true,
        Err(e) => {
            debug!("SIGKILL to pid {} failed: {}", pid, e);
            false
        }
    }
}

/// Command line of `pid` with NUL separators turned into spaces.
pub fn process_cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let text: String = String::from_utf8_lossy(&raw)
        .split('\0')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    Some(text)
}

/// Kill `pid` only if it is alive and its command line mentions `marker`.
/// Guards against killing an unrelated process that reused a recorded PID.
pub fn kill_if_owned(pid: u32, marker: &Path) -> bool {
    if !is_process_alive(pid) {
        return false;
    }
    let marker = marker.to_string_lossy();
    match process_cmdline(pid) {
        Some(cmdline) if cmdline.contains(marker.as_ref()) => kill_process(pid),
        Some(_) => {
            debug!("pid {} no longer belongs to {}, leaving it alone", pid, marker);
            false
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }

    #[test]
    fn test_exited_process_is_dead() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn test_zombie_counts_as_dead() {
        let child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Not reaped yet, so it lingers as a zombie
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(!is_process_alive(pid));
        drop(child);
    }

    #[test]
    fn test_kill_if_owned_checks_cmdline() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 5; true", "stratus-test", "/tmp/owned-marker"])
            .spawn()
            .unwrap();
        let pid = child.id();

        assert!(!kill_if_owned(pid, Path::new("/tmp/someone-else")));
        assert!(is_process_alive(pid));

        assert!(kill_if_owned(pid, Path::new("/tmp/owned-marker")));
        child.wait().unwrap();
        assert!(!is_process_alive(pid));
    }
}
