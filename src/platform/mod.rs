//! Platform-specific process handling

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to signal process {pid}: {reason}")]
    SignalError { pid: u32, reason: String },
    #[error("Failed to run {command}: {reason}")]
    CommandError { command: String, reason: String },
    #[error("Invalid process id: {0}")]
    InvalidPid(u32),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Platform-agnostic process tree termination
///
/// Each call is one best-effort pass; callers decide whether to escalate.
pub trait ProcessTreeTerminator: Send + Sync {
    /// Ask the process and its descendants to exit
    fn terminate(&self, pid: u32) -> Result<(), PlatformError>;
    /// Forcefully kill the process and every descendant
    fn kill_tree(&self, pid: u32) -> Result<(), PlatformError>;
    /// Whether the process or anything in its tree is still running
    fn tree_alive(&self, pid: u32) -> bool;
    /// Kill whatever is left of the tree of an already reaped process
    ///
    /// `pid` itself may have been reused by now, so it must not be signalled
    /// directly.
    fn kill_orphans(&self, pid: u32) -> Result<(), PlatformError>;
}

/// Get the terminator for the current platform
pub fn get_terminator() -> Result<Box<dyn ProcessTreeTerminator>, PlatformError> {
    #[cfg(unix)]
    {
        Ok(Box::new(unix::UnixTerminator::new()))
    }

    #[cfg(windows)]
    {
        Ok(Box::new(windows::WindowsTerminator::new()))
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

/// Configure a daemon command so its whole tree can be addressed later
///
/// On Unix the child leads a new process group; on Windows it gets its own
/// console process group.
pub fn prepare_command(command: &mut tokio::process::Command) {
    #[cfg(unix)]
    {
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        command.creation_flags(windows::CREATE_NEW_PROCESS_GROUP);
    }
}

/// Platform name as used by the packaged resource tree
pub fn platform_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

/// Architecture name as used by the packaged resource tree
pub fn arch_name() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_names() {
        let name = platform_name();
        assert!(!name.is_empty());
        assert_ne!(name, "macos");
        assert_ne!(name, "windows");

        let arch = arch_name();
        assert_ne!(arch, "x86_64");
        assert_ne!(arch, "aarch64");
    }

    #[test]
    fn test_get_terminator() {
        assert!(get_terminator().is_ok());
    }
}
