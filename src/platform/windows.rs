//! Windows process tree termination via `taskkill /t`
//!
//! Windows does not reparent orphans, so descendants of an exited daemon still
//! carry its pid as `ParentProcessId`. They are found with a CIM query and
//! killed individually, since `taskkill /t` needs the root to be alive.

use super::{PlatformError, ProcessTreeTerminator};
use std::os::windows::process::CommandExt;
use std::process::Command;
use tracing::debug;

/// Child gets its own console process group
pub const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Keep helper invocations from flashing a console window
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub struct WindowsTerminator;

impl WindowsTerminator {
    pub fn new() -> Self {
        Self
    }

    fn taskkill(&self, pid: u32, force: bool) -> Result<(), PlatformError> {
        let pid_arg = pid.to_string();
        let mut args = vec!["/pid", pid_arg.as_str(), "/t"];
        if force {
            args.push("/f");
        }

        debug!("Running taskkill {}", args.join(" "));
        let output = Command::new("taskkill")
            .args(&args)
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| PlatformError::CommandError {
                command: "taskkill".to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlatformError::CommandError {
                command: "taskkill".to_string(),
                reason: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

impl Default for WindowsTerminator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTreeTerminator for WindowsTerminator {
    fn terminate(&self, pid: u32) -> Result<(), PlatformError> {
        self.taskkill(pid, false)
    }

    fn kill_tree(&self, pid: u32) -> Result<(), PlatformError> {
        let root = self.taskkill(pid, true);
        self.kill_orphans(pid)?;
        if process_exists(pid) { root } else { Ok(()) }
    }

    fn tree_alive(&self, pid: u32) -> bool {
        process_exists(pid) || !child_pids(pid).is_empty()
    }

    fn kill_orphans(&self, pid: u32) -> Result<(), PlatformError> {
        for child in child_pids(pid) {
            if let Err(e) = self.taskkill(child, true) {
                debug!("Failed to kill child {} of {}: {}", child, pid, e);
            }
        }
        Ok(())
    }
}

fn process_exists(pid: u32) -> bool {
    let filter = format!("PID eq {}", pid);
    let output = Command::new("tasklist")
        .args(["/FI", filter.as_str(), "/NH", "/FO", "CSV"])
        .creation_flags(CREATE_NO_WINDOW)
        .output();

    match output {
        Ok(output) => {
            let needle = format!("\"{}\"", pid);
            String::from_utf8_lossy(&output.stdout).contains(&needle)
        }
        Err(e) => {
            debug!("tasklist failed for {}: {}", pid, e);
            false
        }
    }
}

/// Direct children of `pid`, alive or orphaned
fn child_pids(pid: u32) -> Vec<u32> {
    let output = Command::new("powershell")
        .args([
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            &format!(
                "Get-CimInstance Win32_Process -Filter 'ParentProcessId={}' | Select-Object -ExpandProperty ProcessId",
                pid
            ),
        ])
        .creation_flags(CREATE_NO_WINDOW)
        .output();

    match output {
        Ok(output) if output.status.success() => {
            parse_pids(&String::from_utf8_lossy(&output.stdout), pid)
        }
        Ok(_) => {
            debug!("Child lookup for {} failed", pid);
            Vec::new()
        }
        Err(e) => {
            debug!("powershell failed for {}: {}", pid, e);
            Vec::new()
        }
    }
}

/// One pid per line; the parent itself and junk lines are skipped
fn parse_pids(stdout: &str, parent: u32) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|&pid| pid != parent && pid > 4)
        .collect()
}
