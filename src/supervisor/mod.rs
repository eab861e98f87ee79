//! Daemon process supervision
//!
//! The supervisor is the only component allowed to start or kill
//! `bulletproofd`. It resolves the binary, spawns it with the derived
//! environment, watches for its exit, and tears the whole process tree down on
//! shutdown. Every shutdown trigger (quit, signals, drop, panic) ends up in
//! the same idempotent slot, so the daemon is killed at most once.

pub mod environment;
pub mod resolve;

pub use resolve::{Companions, SearchPaths};

use crate::control::ControlPlane;
use crate::platform::{self, PlatformError, ProcessTreeTerminator};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Daemon binary not found (searched: {})", format_paths(.0))]
    BinaryNotFound(Vec<PathBuf>),
    #[error("Failed to spawn {}: {source}", .path.display())]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Daemon not healthy after {0:?}")]
    HealthCheckTimeout(Duration),
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Control-plane address passed as `-addr`
    pub listen: String,
    pub search: SearchPaths,
    /// Inherit the controller's stdout/stderr instead of discarding them
    pub inherit_stdio: bool,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    /// How long a graceful stop may take before the tree is force-killed
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            listen: crate::control::protocol::DEFAULT_LISTEN.to_string(),
            search: SearchPaths::default(),
            inherit_stdio: true,
            health_interval: Duration::from_millis(300),
            health_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
        }
    }
}

/// The running daemon as recorded at spawn time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonProcess {
    pub pid: u32,
    pub binary_path: PathBuf,
    /// Variables injected on top of the inherited environment
    pub environment: BTreeMap<String, String>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    terminator: Arc<dyn ProcessTreeTerminator>,
    slot: Arc<Mutex<Option<DaemonProcess>>>,
    /// Pid of the live daemon, cleared by the exit monitor
    alive: Arc<watch::Sender<Option<u32>>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        Ok(Self::with_terminator(config, platform::get_terminator()?))
    }

    pub fn with_terminator(
        config: SupervisorConfig,
        terminator: Box<dyn ProcessTreeTerminator>,
    ) -> Self {
        let (alive, _) = watch::channel(None);
        Self {
            config,
            terminator: Arc::from(terminator),
            slot: Arc::new(Mutex::new(None)),
            alive: Arc::new(alive),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn resolve_binary(&self) -> Result<PathBuf, SupervisorError> {
        resolve::resolve_daemon(&self.config.search)
    }

    /// The current daemon, if one is running
    pub fn current(&self) -> Option<DaemonProcess> {
        lock(&self.slot).clone()
    }

    pub fn is_running(&self) -> bool {
        self.alive.borrow().is_some()
    }

    /// Observe daemon liveness; the value is the live pid
    pub fn subscribe(&self) -> watch::Receiver<Option<u32>> {
        self.alive.subscribe()
    }

    /// Spawn the daemon, or return the running one
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<DaemonProcess, SupervisorError> {
        let mut slot = lock(&self.slot);
        if let Some(existing) = slot.as_ref() {
            debug!("Daemon already running (pid {})", existing.pid);
            return Ok(existing.clone());
        }

        let binary = self.resolve_binary()?;
        let companions = resolve::resolve_companions(&self.config.search);
        let environment = environment::from_process(&companions);
        self.log_resolution(&binary, &companions, &environment);

        let mut command = Command::new(&binary);
        command
            .arg("-addr")
            .arg(&self.config.listen)
            .envs(&environment)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.config.inherit_stdio {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        platform::prepare_command(&mut command);

        let spawn_failed = |source| SupervisorError::SpawnFailed {
            path: binary.clone(),
            source,
        };
        let child = command.spawn().map_err(spawn_failed)?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_failed(std::io::Error::other("process exited during spawn")))?;

        info!("Daemon started: {} (pid {})", binary.display(), pid);

        let process = DaemonProcess {
            pid,
            binary_path: binary,
            environment,
        };
        *slot = Some(process.clone());
        drop(slot);

        self.alive.send_replace(Some(pid));
        tokio::spawn(monitor_exit(
            child,
            pid,
            Arc::clone(&self.terminator),
            Arc::clone(&self.slot),
            Arc::clone(&self.alive),
        ));

        Ok(process)
    }

    fn log_resolution(
        &self,
        binary: &std::path::Path,
        companions: &Companions,
        environment: &BTreeMap<String, String>,
    ) {
        let show = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(none)".to_string())
        };
        info!("Daemon binary: {}", binary.display());
        info!("warp-plus: {}", show(&companions.warp_plus));
        info!("sing-box: {}", show(&companions.sing_box));
        if let Some(warp_plus) = &companions.warp_plus {
            resolve::warn_if_quarantined(warp_plus);
        }
        let overrides = environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        debug!("Daemon env overrides: {}", overrides);
    }

    /// Poll health until it answers or `health_timeout` elapses
    pub async fn wait_healthy(&self, plane: &dyn ControlPlane) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + self.config.health_timeout;
        loop {
            if plane.health().await {
                info!("Daemon healthy");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    "Daemon health check timed out after {:?}",
                    self.config.health_timeout
                );
                return Err(SupervisorError::HealthCheckTimeout(
                    self.config.health_timeout,
                ));
            }
            sleep(self.config.health_interval).await;
        }
    }

    /// Stop the daemon and its children
    ///
    /// A graceful pass first, then a forced tree kill if anything is left
    /// after the grace period. Safe to call any number of times.
    pub async fn stop(&self) {
        let Some(process) = lock(&self.slot).take() else {
            debug!("Stop requested with no daemon running");
            return;
        };
        let pid = process.pid;
        info!("Stopping daemon (pid {})", pid);

        if let Err(e) = self.terminator.terminate(pid) {
            debug!("Graceful termination of {} failed: {}", pid, e);
        }

        let mut alive = self.alive.subscribe();
        let exited = timeout(
            self.config.stop_grace,
            alive.wait_for(|current| *current != Some(pid)),
        )
        .await
        .is_ok();

        if !exited {
            warn!(
                "Daemon did not exit within {:?}, killing process tree",
                self.config.stop_grace
            );
            self.force_kill(pid);
        } else if self.terminator.tree_alive(pid) {
            warn!("Daemon exited but descendants remain, killing process tree");
            self.force_kill(pid);
        } else {
            info!("Daemon stopped");
        }
    }

    /// Synchronous best-effort kill for drop and panic paths
    pub fn kill_now(&self) {
        if let Some(process) = lock(&self.slot).take() {
            warn!("Killing daemon (pid {})", process.pid);
            self.force_kill(process.pid);
        }
    }

    fn force_kill(&self, pid: u32) {
        if let Err(e) = self.terminator.kill_tree(pid) {
            error!("Failed to kill daemon tree {}: {}", pid, e);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.kill_now();
    }
}

/// Reap the child and whatever it left in its process group, then clear the
/// slot and liveness if they still refer to it
async fn monitor_exit(
    mut child: Child,
    pid: u32,
    terminator: Arc<dyn ProcessTreeTerminator>,
    slot: Arc<Mutex<Option<DaemonProcess>>>,
    alive: Arc<watch::Sender<Option<u32>>>,
) {
    match child.wait().await {
        Ok(status) => info!("Daemon (pid {}) exited: {}", pid, status),
        Err(e) => warn!("Failed to wait for daemon (pid {}): {}", pid, e),
    }

    if let Err(e) = terminator.kill_orphans(pid) {
        warn!("Failed to clean up after daemon (pid {}): {}", pid, e);
    }

    {
        let mut slot = lock(&slot);
        if slot.as_ref().is_some_and(|p| p.pid == pid) {
            *slot = None;
        }
    }

    alive.send_if_modified(|current| {
        if *current == Some(pid) {
            *current = None;
            true
        } else {
            false
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
