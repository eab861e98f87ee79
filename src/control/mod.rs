//! Control-plane access to the `bulletproofd` daemon
//!
//! The daemon exposes a small JSON API on a local address (default
//! `127.0.0.1:4765`). [`ControlPlane`] is the seam every other component talks
//! through; [`ControlPlaneClient`] is the real HTTP implementation.
//!
//! # Usage
//!
//! ```ignore
//! use bulletproof_vpn::control::{ControlPlane, ControlPlaneClient, REQUEST_TIMEOUT};
//!
//! let client = ControlPlaneClient::new("127.0.0.1:4765", REQUEST_TIMEOUT)?;
//! let status = client.get_status().await;
//! if let Some(err) = status.error {
//!     eprintln!("daemon: {}", err);
//! }
//! ```

pub mod client;
pub mod protocol;

pub use client::{ControlPlaneClient, REQUEST_TIMEOUT};
pub use protocol::{
    CommandReply, ConnectOptions, ConnectRequest, DiagnosticsReply, Identity, IdentityReply,
    Integration, PortProbe, Provider, ProxyTestReply, StatusReply,
};

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level failures, folded into a reply's `error` before leaving
/// the client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Control plane unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("Unexpected response: HTTP {0}")]
    Http(u16),
    #[error("Invalid response body: {0}")]
    InvalidBody(#[from] serde_json::Error),
}

const UNREACHABLE_PREFIX: &str = "Control plane unreachable";

/// Whether a normalized error came from the transport rather than the daemon
pub fn is_unreachable(error: &str) -> bool {
    error.starts_with(UNREACHABLE_PREFIX)
}

/// Operations offered by the daemon's control plane
///
/// None of these fail: errors are reported through the normalized `error`
/// field of each reply.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// `GET /v1/health` answered 2xx
    async fn health(&self) -> bool;
    async fn get_status(&self) -> StatusReply;
    async fn connect(&self, request: &ConnectRequest) -> CommandReply;
    async fn disconnect(&self) -> CommandReply;
    /// Functional check through the daemon's proxy at `bind`
    async fn test_proxy(&self, bind: Option<&str>) -> ProxyTestReply;
    /// Local TCP connect against `bind`
    async fn probe_port(&self, bind: Option<&str>) -> PortProbe;
    /// Round-trip time to `host` in milliseconds, `None` if unreachable
    async fn measure_latency(&self, host: &str) -> Option<u64>;
    async fn get_identity(&self) -> IdentityReply;
    async fn reset_identity(&self) -> CommandReply;
    async fn get_diagnostics(&self) -> DiagnosticsReply;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted control plane for orchestrator, reconciler and supervisor tests

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Script {
        statuses: VecDeque<StatusReply>,
        last_status: StatusReply,
        connect: CommandReply,
        disconnect: CommandReply,
        proxy: ProxyTestReply,
        listening: bool,
        latency: Option<u64>,
        healthy_after: usize,
        status_delay: Duration,
        panic_on_status: bool,
        calls: HashMap<&'static str, usize>,
        log: Vec<&'static str>,
    }

    /// Replies are queued up front; once the status queue drains the last
    /// status is repeated.
    #[derive(Default)]
    pub struct ScriptedControlPlane {
        script: Mutex<Script>,
        delay: Duration,
    }

    impl ScriptedControlPlane {
        pub fn new() -> Self {
            let plane = Self::default();
            plane.script.lock().unwrap().listening = true;
            plane
        }

        /// Every call sleeps `delay` before answering
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn push_status(&self, status: StatusReply) -> &Self {
            let mut s = self.script.lock().unwrap();
            s.last_status = status.clone();
            s.statuses.push_back(status);
            self
        }

        pub fn set_connect(&self, reply: CommandReply) -> &Self {
            self.script.lock().unwrap().connect = reply;
            self
        }

        pub fn set_disconnect(&self, reply: CommandReply) -> &Self {
            self.script.lock().unwrap().disconnect = reply;
            self
        }

        pub fn set_proxy(&self, reply: ProxyTestReply) -> &Self {
            self.script.lock().unwrap().proxy = reply;
            self
        }

        pub fn set_listening(&self, listening: bool) -> &Self {
            self.script.lock().unwrap().listening = listening;
            self
        }

        pub fn set_latency(&self, latency: Option<u64>) -> &Self {
            self.script.lock().unwrap().latency = latency;
            self
        }

        /// Health fails for the first `polls` checks
        pub fn set_healthy_after(&self, polls: usize) -> &Self {
            self.script.lock().unwrap().healthy_after = polls;
            self
        }

        /// Status calls take this long, on top of any general delay
        pub fn set_status_delay(&self, delay: Duration) -> &Self {
            self.script.lock().unwrap().status_delay = delay;
            self
        }

        pub fn set_panic_on_status(&self, panic: bool) -> &Self {
            self.script.lock().unwrap().panic_on_status = panic;
            self
        }

        pub fn calls(&self, name: &str) -> usize {
            self.script
                .lock()
                .unwrap()
                .calls
                .get(name)
                .copied()
                .unwrap_or(0)
        }

        /// Names of every call in the order made
        pub fn log(&self) -> Vec<&'static str> {
            self.script.lock().unwrap().log.clone()
        }

        fn record(&self, name: &'static str) {
            let mut s = self.script.lock().unwrap();
            *s.calls.entry(name).or_default() += 1;
            s.log.push(name);
        }

        async fn pause(&self) {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
    }

    #[async_trait]
    impl ControlPlane for ScriptedControlPlane {
        async fn health(&self) -> bool {
            self.record("health");
            self.pause().await;
            let s = self.script.lock().unwrap();
            s.calls["health"] > s.healthy_after
        }

        async fn get_status(&self) -> StatusReply {
            self.record("get_status");
            self.pause().await;
            let status_delay = self.script.lock().unwrap().status_delay;
            if !status_delay.is_zero() {
                tokio::time::sleep(status_delay).await;
            }
            let mut s = self.script.lock().unwrap();
            if s.panic_on_status {
                drop(s);
                panic!("scripted status failure");
            }
            match s.statuses.pop_front() {
                Some(status) => status,
                None => s.last_status.clone(),
            }
        }

        async fn connect(&self, _request: &ConnectRequest) -> CommandReply {
            self.record("connect");
            self.pause().await;
            self.script.lock().unwrap().connect.clone()
        }

        async fn disconnect(&self) -> CommandReply {
            self.record("disconnect");
            self.pause().await;
            self.script.lock().unwrap().disconnect.clone()
        }

        async fn test_proxy(&self, _bind: Option<&str>) -> ProxyTestReply {
            self.record("test_proxy");
            self.pause().await;
            self.script.lock().unwrap().proxy.clone()
        }

        async fn probe_port(&self, _bind: Option<&str>) -> PortProbe {
            self.record("probe_port");
            self.pause().await;
            PortProbe {
                listening: self.script.lock().unwrap().listening,
            }
        }

        async fn measure_latency(&self, _host: &str) -> Option<u64> {
            self.record("measure_latency");
            self.pause().await;
            self.script.lock().unwrap().latency
        }

        async fn get_identity(&self) -> IdentityReply {
            self.record("get_identity");
            IdentityReply::default()
        }

        async fn reset_identity(&self) -> CommandReply {
            self.record("reset_identity");
            CommandReply::default()
        }

        async fn get_diagnostics(&self) -> DiagnosticsReply {
            self.record("get_diagnostics");
            DiagnosticsReply::default()
        }
    }

    /// Status reply reporting a live connection on `bind`
    pub fn connected(bind: &str) -> StatusReply {
        StatusReply {
            connected: true,
            bind: Some(bind.to_string()),
            ..StatusReply::default()
        }
    }

    pub fn not_connected() -> StatusReply {
        StatusReply::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_classification() {
        assert!(is_unreachable("Control plane unreachable: connection refused"));
        assert!(!is_unreachable(&ClientError::Http(502).to_string()));
        assert!(!is_unreachable("unknown provider"));
    }
}
