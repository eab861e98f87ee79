//! Unix process tree termination
//!
//! The daemon is spawned as the leader of its own process group, so a group
//! signal reaches everything it forked. Helpers that moved themselves to a
//! new group are caught by a parent-PID sweep with `pkill -P`.

use super::{PlatformError, ProcessTreeTerminator};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::process::Command;
use tracing::debug;

pub struct UnixTerminator;

impl UnixTerminator {
    pub fn new() -> Self {
        Self
    }

    fn signal_tree(&self, pid: u32, signal: Signal) -> Result<(), PlatformError> {
        let target = to_pid(pid)?;
        let mut delivered = false;
        let mut last_error = None;

        // Children first, so the sweep still finds them by parent PID. A
        // missing pkill is fine: the group signal below covers the tree.
        if let Err(e) = pkill_children(pid, signal) {
            debug!("Child sweep for {} failed: {}", pid, e);
        }

        match kill(target, signal) {
            Ok(()) => delivered = true,
            Err(Errno::ESRCH) => {}
            Err(e) => last_error = Some(signal_error(pid, e)),
        }

        match killpg(target, signal) {
            Ok(()) => delivered = true,
            Err(Errno::ESRCH) => {}
            Err(e) => last_error = Some(signal_error(pid, e)),
        }

        debug!(
            "Sent {} to tree of {} (delivered={})",
            signal.as_str(),
            pid,
            delivered
        );

        match last_error {
            Some(e) if !delivered => Err(e),
            _ => Ok(()),
        }
    }
}

impl Default for UnixTerminator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTreeTerminator for UnixTerminator {
    fn terminate(&self, pid: u32) -> Result<(), PlatformError> {
        self.signal_tree(pid, Signal::SIGTERM)
    }

    fn kill_tree(&self, pid: u32) -> Result<(), PlatformError> {
        self.signal_tree(pid, Signal::SIGKILL)
    }

    fn tree_alive(&self, pid: u32) -> bool {
        let Ok(target) = to_pid(pid) else {
            return false;
        };
        kill(target, None).is_ok() || killpg(target, None).is_ok()
    }

    fn kill_orphans(&self, pid: u32) -> Result<(), PlatformError> {
        let group = to_pid(pid)?;
        match killpg(group, Signal::SIGKILL) {
            Ok(()) => {
                debug!("Killed leftover process group {}", pid);
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(signal_error(pid, e)),
        }
    }
}

/// Pid 0 and negative values address whole groups, including our own
fn to_pid(pid: u32) -> Result<Pid, PlatformError> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 1 => Ok(Pid::from_raw(raw)),
        _ => Err(PlatformError::InvalidPid(pid)),
    }
}

fn signal_error(pid: u32, errno: Errno) -> PlatformError {
    PlatformError::SignalError {
        pid,
        reason: errno.desc().to_string(),
    }
}

/// `pkill` exits 1 when nothing matched, which is not a failure here
fn pkill_children(pid: u32, signal: Signal) -> Result<(), PlatformError> {
    let signal_arg = format!("-{}", signal as i32);
    let parent = pid.to_string();
    let output = Command::new("pkill")
        .args([signal_arg.as_str(), "-P", parent.as_str()])
        .output()
        .map_err(|e| PlatformError::CommandError {
            command: "pkill".to_string(),
            reason: e.to_string(),
        })?;

    match output.status.code() {
        Some(0) | Some(1) => Ok(()),
        _ => Err(PlatformError::CommandError {
            command: "pkill".to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
    }
}
