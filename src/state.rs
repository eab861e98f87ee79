//! Shared connection state
//!
//! One [`ConnectionState`] exists per controller. It lives in a
//! `tokio::sync::watch` channel; writers go through [`SharedState::update`]
//! (a single `send_modify`) and readers either take a snapshot or subscribe.
//!
//! The orchestrator owns `phase`, `bind`, `message` and most of `last_error`.
//! The reconciler owns `daemon` and `probe`, and only touches `last_error`
//! while no orchestrator operation is in flight.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

impl Phase {
    /// An orchestrator operation is running
    pub fn is_transitional(self) -> bool {
        matches!(self, Phase::Connecting | Phase::Disconnecting)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Last coarse status observed by the reconciler
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSnapshot {
    /// The last status call got an answer
    pub reachable: bool,
    pub connected: bool,
    pub bind: Option<String>,
    pub message: Option<String>,
    pub system_proxy: bool,
    pub tun_active: bool,
}

/// Public egress identity as seen through the proxy
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Egress {
    pub ip: Option<String>,
    pub country: Option<String>,
    pub isp: Option<String>,
    pub asn: Option<String>,
}

/// Fine-grained samples taken while connected
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSample {
    pub listening: bool,
    pub latency_ms: Option<u64>,
    pub egress: Option<Egress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub phase: Phase,
    pub bind: Option<String>,
    pub message: String,
    pub last_error: Option<String>,
    pub daemon: DaemonSnapshot,
    pub probe: ProbeSample,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            message: "Disconnected".to_string(),
            ..Self::default()
        }
    }
}

/// Handle to the authoritative state; clones share the same channel
#[derive(Debug, Clone)]
pub struct SharedState {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl SharedState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.tx.borrow().phase
    }

    /// Apply one mutation and notify subscribers
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ConnectionState),
    {
        self.tx.send_modify(f);
    }

    /// Apply a mutation only if `f` reports a change
    pub fn update_if<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut ConnectionState) -> bool,
    {
        self.tx.send_if_modified(f)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
