//! Locating the daemon and its companion helpers
//!
//! Packaged builds ship binaries under
//! `<resources>/bin/<platform>-<arch>/`. Development checkouts keep the
//! daemon in `../backend/` and the helpers in `resources/bin/<platform>-<arch>/`
//! relative to the working directory.

use super::SupervisorError;
use crate::platform::{arch_name, platform_name};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable that overrides the daemon path
pub const BINARY_ENV: &str = "BACKEND_BIN";

const DAEMON_NAME: &str = "bulletproofd";
const WARP_PLUS_NAME: &str = "warp-plus";
/// Searched in this order
const SING_BOX_NAMES: [&str; 2] = ["sb-helper", "sing-box"];

/// Where to look for binaries
#[derive(Debug, Clone, Default)]
pub struct SearchPaths {
    /// Explicit daemon path (config, else `BACKEND_BIN`)
    pub binary_override: Option<PathBuf>,
    /// Packaged resources root
    pub resources_dir: Option<PathBuf>,
    /// Working directory for development fallbacks
    pub cwd: PathBuf,
}

impl SearchPaths {
    /// Build search paths from config values and the process environment
    pub fn from_env(binary: Option<PathBuf>, resources_dir: Option<PathBuf>) -> Self {
        let binary_override = binary.or_else(|| {
            env::var_os(BINARY_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        });
        Self {
            binary_override,
            resources_dir: resources_dir.or_else(default_resources_dir),
            cwd: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    fn packaged_dir(&self) -> Option<PathBuf> {
        self.resources_dir.as_deref().map(platform_bin_dir)
    }

    fn dev_helper_dir(&self) -> PathBuf {
        platform_bin_dir(&self.cwd.join("resources"))
    }
}

/// Resolved companion helpers; either may be absent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Companions {
    pub warp_plus: Option<PathBuf>,
    pub sing_box: Option<PathBuf>,
}

/// `<root>/bin/<platform>-<arch>`
pub fn platform_bin_dir(root: &Path) -> PathBuf {
    root.join("bin")
        .join(format!("{}-{}", platform_name(), arch_name()))
}

/// Add the platform executable suffix
pub fn exe_name(base: &str) -> String {
    format!("{}{}", base, env::consts::EXE_SUFFIX)
}

/// Resources root next to the running executable
///
/// macOS app bundles keep resources in `Contents/Resources`, a sibling of
/// `Contents/MacOS`.
fn default_resources_dir() -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    let dir = exe.parent()?;
    if cfg!(target_os = "macos") {
        Some(dir.join("..").join("Resources"))
    } else {
        Some(dir.join("resources"))
    }
}

/// Resolve the daemon executable
///
/// Precedence: explicit override, packaged resources, development tree.
pub fn resolve_daemon(paths: &SearchPaths) -> Result<PathBuf, SupervisorError> {
    let name = exe_name(DAEMON_NAME);
    let mut searched = Vec::new();

    if let Some(path) = &paths.binary_override {
        if path.is_file() {
            debug!("Using daemon override: {}", path.display());
            return Ok(path.clone());
        }
        warn!("Daemon override {} does not exist", path.display());
    }

    let packaged = paths.packaged_dir().map(|dir| dir.join(&name));
    let dev = paths.cwd.join("..").join("backend").join(&name);

    for candidate in packaged.into_iter().chain(std::iter::once(dev)) {
        if candidate.is_file() {
            debug!("Resolved daemon: {}", candidate.display());
            return Ok(candidate);
        }
        searched.push(candidate);
    }

    if let Some(path) = &paths.binary_override {
        searched.insert(0, path.clone());
    }
    Err(SupervisorError::BinaryNotFound(searched))
}

/// Resolve companion helpers; missing ones are simply left out
pub fn resolve_companions(paths: &SearchPaths) -> Companions {
    let mut dirs: Vec<PathBuf> = paths.packaged_dir().into_iter().collect();
    dirs.push(paths.dev_helper_dir());

    let warp_plus = find_in(&dirs, &exe_name(WARP_PLUS_NAME));
    let sing_box = SING_BOX_NAMES
        .iter()
        .find_map(|base| find_in(&dirs, &exe_name(base)));

    Companions {
        warp_plus,
        sing_box,
    }
}

fn find_in(dirs: &[PathBuf], name: &str) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Warn when Gatekeeper will likely refuse to run a downloaded helper
#[cfg(target_os = "macos")]
pub fn warn_if_quarantined(path: &Path) {
    let quarantined = std::process::Command::new("xattr")
        .args(["-p", "com.apple.quarantine"])
        .arg(path)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if quarantined {
        warn!(
            "{} has a quarantine attribute. If execution fails, run: xattr -d com.apple.quarantine {}",
            path.display(),
            path.display()
        );
    }
}

#[cfg(not(target_os = "macos"))]
pub fn warn_if_quarantined(_path: &Path) {}
