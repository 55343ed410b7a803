//! Hard termination of a child process together with all of its descendants.
//!
//! Used by the pool manager during error-induced shutdown: every PID still
//! present in the registry is killed along with its whole subtree. Processes
//! that already exited are not errors; the race between enumeration and
//! delivery is expected and tolerated.

use anyhow::Result;
use tracing::debug;

/// Kill `pid` and every process descended from it.
///
/// Descendants are terminated before their parent so the subtree cannot
/// re-spawn replacements mid-kill. A process that disappeared between
/// enumeration and delivery counts as already terminated.
#[cfg(unix)]
pub fn kill_tree(pid: u32) -> Result<()> {
    let targets = collect_tree(pid);
    debug!(pid, descendants = targets.len() - 1, "killing process tree");
    for &target in targets.iter().rev() {
        send_sigkill(target)?;
    }
    Ok(())
}

/// Enumerate `root` plus its transitive children from `/proc`.
///
/// Builds the full (pid, parent) table once, then walks the subtree
/// breadth-first. Entries that vanish while reading are skipped.
#[cfg(target_os = "linux")]
fn collect_tree(root: u32) -> Vec<u32> {
    let mut entries: Vec<(u32, u32)> = Vec::new();
    if let Ok(dir) = std::fs::read_dir("/proc") {
        for entry in dir.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            if let Some(ppid) = parent_of(pid) {
                entries.push((pid, ppid));
            }
        }
    }

    let mut subtree: Vec<u32> = vec![root];
    let mut i = 0;
    while i < subtree.len() {
        let parent = subtree[i];
        for &(pid, ppid) in &entries {
            if ppid == parent && !subtree.contains(&pid) {
                subtree.push(pid);
            }
        }
        i += 1;
    }
    subtree
}

/// Parent PID from `/proc/<pid>/stat`; field 4, after the parenthesised
/// command name (which may itself contain spaces or parentheses).
#[cfg(target_os = "linux")]
fn parent_of(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

// Without /proc there is no portable parent-chain enumeration; fall back to
// killing the registered process itself.
#[cfg(all(unix, not(target_os = "linux")))]
fn collect_tree(root: u32) -> Vec<u32> {
    vec![root]
}

#[cfg(unix)]
fn send_sigkill(pid: u32) -> Result<()> {
    // SAFETY: kill(2) is safe to call with any pid and a valid signal number.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH (3): no such process — already gone, treat as success.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err.into());
        }
    }
    Ok(())
}

/// Windows: terminate the subtree via a Toolhelp snapshot of the process
/// table, walking parent links breadth-first.
#[cfg(windows)]
pub fn kill_tree(root_pid: u32) -> Result<()> {
    use windows::Win32::Foundation::{CloseHandle, ERROR_INVALID_PARAMETER};
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, PROCESSENTRY32, Process32First, Process32Next,
        TH32CS_SNAPPROCESS,
    };
    use windows::Win32::System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess};

    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)
            .map_err(|e| anyhow::anyhow!("CreateToolhelp32Snapshot failed: {e}"))?;

        let mut entries: Vec<(u32, u32)> = Vec::new();
        let mut entry = PROCESSENTRY32 {
            dwSize: std::mem::size_of::<PROCESSENTRY32>() as u32,
            ..Default::default()
        };
        if Process32First(snapshot, &mut entry).is_ok() {
            loop {
                entries.push((entry.th32ProcessID, entry.th32ParentProcessID));
                entry = PROCESSENTRY32 {
                    dwSize: std::mem::size_of::<PROCESSENTRY32>() as u32,
                    ..Default::default()
                };
                if Process32Next(snapshot, &mut entry).is_err() {
                    break;
                }
            }
        }
        let _ = CloseHandle(snapshot);

        let mut subtree: Vec<u32> = vec![root_pid];
        let mut i = 0;
        while i < subtree.len() {
            let parent = subtree[i];
            for &(pid, ppid) in &entries {
                if ppid == parent && !subtree.contains(&pid) {
                    subtree.push(pid);
                }
            }
            i += 1;
        }

        debug!(
            pid = root_pid,
            descendants = subtree.len() - 1,
            "killing process tree"
        );
        for &target in subtree.iter().rev() {
            match OpenProcess(PROCESS_TERMINATE, false, target) {
                Ok(handle) => {
                    let result = TerminateProcess(handle, 1);
                    let _ = CloseHandle(handle);
                    result.map_err(|e| {
                        anyhow::anyhow!("TerminateProcess for pid {target} failed: {e}")
                    })?;
                }
                Err(e) => {
                    // ERROR_INVALID_PARAMETER (87): the process no longer
                    // exists, which is the outcome we wanted.
                    if e.code() != ERROR_INVALID_PARAMETER.to_hresult() {
                        return Err(anyhow::anyhow!("OpenProcess for pid {target} failed: {e}"));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn killing_an_exited_pid_is_not_an_error() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait for true");
        // The process is gone; the kill must still report success.
        kill_tree(pid).expect("kill of exited pid tolerated");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn tree_collection_finds_grandchildren() {
        use std::time::{Duration, Instant};

        // The outer sh keeps running `wait`, with a nested shell (which
        // itself forks a sleep) and a sibling sleep below it.
        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg("sh -c \"sleep 30 & wait\" & sleep 31 & wait")
            .spawn()
            .expect("spawn nested shells");
        let pid = child.id();

        // Give the shells a moment to fork.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut tree = collect_tree(pid);
        while tree.len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
            tree = collect_tree(pid);
        }
        assert!(
            tree.len() >= 3,
            "expected root plus descendants, got {tree:?}"
        );

        kill_tree(pid).expect("kill tree");
        child.wait().expect("reap root");

        // Shortly after the kill no process of the subtree may survive
        // (zombies held by init do not count; reaped ones disappear).
        let gone_deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let survivors: Vec<u32> = tree
                .iter()
                .copied()
                .filter(|&p| parent_of(p).is_some())
                .filter(|&p| {
                    // Still listed and not a zombie awaiting reaping.
                    std::fs::read_to_string(format!("/proc/{p}/stat"))
                        .map(|s| !s.contains(") Z "))
                        .unwrap_or(false)
                })
                .collect();
            if survivors.is_empty() {
                break;
            }
            assert!(
                Instant::now() < gone_deadline,
                "processes survived tree kill: {survivors:?}"
            );
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}
