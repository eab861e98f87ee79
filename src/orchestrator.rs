//! Connection orchestrator
//!
//! Turns connect/disconnect intent into control-plane calls and keeps the
//! shared [`ConnectionState`](crate::state::ConnectionState) coherent:
//!
//! ```text
//! Idle --toggle--> Connecting --(status connected)--> Connected
//!   ^                  |                                  |
//!   +-- error/timeout -+                               toggle
//!   |                                                     v
//!   +------------------------ always ----------------- Disconnecting
//! ```
//!
//! Only one operation runs at a time. A toggle while another is in flight is
//! ignored, and the in-flight flag is released on every exit path, panics
//! included.

use crate::config::Timings;
use crate::control::{ConnectRequest, ControlPlane, StatusReply, is_unreachable};
use crate::events::{EventKind, EventLog, EventRecord};
use crate::notifications;
use crate::state::{Phase, SharedState};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

pub const CONNECTING: &str = "Connecting…";
pub const DISCONNECTING: &str = "Disconnecting…";
pub const DISCONNECTED: &str = "Disconnected";
pub const PORT_NOT_LISTENING: &str = "Port not listening yet…";
pub const PROBE_FAILED: &str = "Connected (probe failed)";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("{0}")]
    ControlPlaneUnreachable(String),
    #[error("{0}")]
    CommandRejected(String),
    #[error("Connection timed out")]
    ConnectTimeout,
    #[error("Port {0} not listening")]
    ProbeFailed(String),
    #[error("Proxy test failed: {0}")]
    ProxyTestFailed(String),
    #[error("Unexpected error: {0}")]
    Fault(String),
}

impl ConnectError {
    /// Classify a normalized control-plane error
    fn from_reply(error: String) -> Self {
        if is_unreachable(&error) {
            ConnectError::ControlPlaneUnreachable(error)
        } else {
            ConnectError::CommandRejected(error)
        }
    }

    fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let text = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string());
        ConnectError::Fault(text)
    }
}

/// What a toggle (or explicit connect/disconnect) did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Connected,
    Disconnected,
    Failed,
    /// Another operation was in flight, or the phase did not allow it
    Ignored,
}

/// Daemon reports connected; the local verification may still have failed
struct Established {
    bind: Option<String>,
    verification: Result<(), ConnectError>,
}

/// Held for the duration of one operation
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Orchestrator {
    plane: Arc<dyn ControlPlane>,
    state: SharedState,
    events: Mutex<EventLog>,
    timings: Timings,
    in_flight: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(plane: Arc<dyn ControlPlane>, state: SharedState, timings: Timings) -> Self {
        Self {
            plane,
            state,
            events: Mutex::new(EventLog::new()),
            timings,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Set while an operation is running; the reconciler yields to it
    pub fn in_flight_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.in_flight)
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Recent events, newest first
    pub fn events(&self) -> Vec<EventRecord> {
        self.lock_events().records().cloned().collect()
    }

    /// The newest event while it is still toast-worthy
    pub fn toast(&self, now: Instant) -> Option<EventRecord> {
        self.lock_events().toast(now).cloned()
    }

    /// Connect when idle, disconnect when connected, otherwise ignore
    pub async fn toggle(&self, request: ConnectRequest) -> ToggleOutcome {
        match self.state.phase() {
            Phase::Idle => self.connect(request).await,
            Phase::Connected => self.disconnect().await,
            phase => {
                debug!("Toggle ignored while {}", phase);
                ToggleOutcome::Ignored
            }
        }
    }

    pub async fn connect(&self, request: ConnectRequest) -> ToggleOutcome {
        let Some(_guard) = FlightGuard::acquire(&self.in_flight) else {
            debug!("Connect ignored, operation in flight");
            return ToggleOutcome::Ignored;
        };
        if self.state.phase() != Phase::Idle {
            debug!("Connect ignored while {}", self.state.phase());
            return ToggleOutcome::Ignored;
        }

        info!("Connecting via {:?}", request.provider);
        self.state.update(|s| {
            s.phase = Phase::Connecting;
            s.last_error = None;
            s.message = CONNECTING.to_string();
        });
        self.emit(CONNECTING, EventKind::Info);

        let result = AssertUnwindSafe(self.establish(&request))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ConnectError::from_panic(panic)));

        match result {
            Ok(Established {
                bind,
                verification: Ok(()),
            }) => {
                let message = connected_message(bind.as_deref());
                info!("{}", message);
                self.state.update(|s| {
                    s.phase = Phase::Connected;
                    s.bind = bind;
                    s.message = message.clone();
                    s.last_error = None;
                });
                self.emit(message, EventKind::Success);
                ToggleOutcome::Connected
            }
            Ok(Established {
                bind,
                verification: Err(e),
            }) => {
                let text = e.to_string();
                warn!("Connected, but {}", text);
                self.state.update(|s| {
                    s.phase = Phase::Connected;
                    s.bind = bind;
                    s.message = PROBE_FAILED.to_string();
                    s.last_error = Some(text.clone());
                });
                self.emit(text, EventKind::Error);
                ToggleOutcome::Connected
            }
            Err(e) => {
                let text = e.to_string();
                error!("Connect failed: {}", text);
                self.state.update(|s| {
                    s.phase = Phase::Idle;
                    s.bind = None;
                    s.message = text.clone();
                    s.last_error = Some(text.clone());
                });
                self.emit(text, EventKind::Error);
                ToggleOutcome::Failed
            }
        }
    }

    pub async fn disconnect(&self) -> ToggleOutcome {
        let Some(_guard) = FlightGuard::acquire(&self.in_flight) else {
            debug!("Disconnect ignored, operation in flight");
            return ToggleOutcome::Ignored;
        };
        if self.state.phase() != Phase::Connected {
            debug!("Disconnect ignored while {}", self.state.phase());
            return ToggleOutcome::Ignored;
        }

        info!("Disconnecting");
        self.state.update(|s| {
            s.phase = Phase::Disconnecting;
            s.message = DISCONNECTING.to_string();
        });

        let error = match AssertUnwindSafe(self.plane.disconnect()).catch_unwind().await {
            Ok(reply) => reply.error,
            Err(panic) => Some(ConnectError::from_panic(panic).to_string()),
        };

        self.state.update(|s| {
            s.phase = Phase::Idle;
            s.bind = None;
            s.message = DISCONNECTED.to_string();
            s.last_error = error.clone();
        });

        match error {
            Some(e) => {
                warn!("Disconnect reported an error: {}", e);
                self.emit(e, EventKind::Error);
            }
            None => {
                info!("Disconnected");
                self.emit(DISCONNECTED, EventKind::Info);
            }
        }
        ToggleOutcome::Disconnected
    }

    /// connect, wait for the daemon, then check the local port and proxy
    async fn establish(&self, request: &ConnectRequest) -> Result<Established, ConnectError> {
        if let Some(e) = self.plane.connect(request).await.error {
            return Err(ConnectError::from_reply(e));
        }

        let status = timeout(self.timings.connect_timeout(), self.poll_until_connected())
            .await
            .map_err(|_| ConnectError::ConnectTimeout)?;
        let bind = status.bind;
        debug!("Daemon connected, bind={:?}", bind);

        if !self.plane.probe_port(bind.as_deref()).await.listening {
            warn!(
                "{}",
                ConnectError::ProbeFailed(bind.clone().unwrap_or_default())
            );
            self.state.update(|s| s.message = PORT_NOT_LISTENING.to_string());
            sleep(self.timings.probe_grace()).await;
        }

        let verification = match self.plane.test_proxy(bind.as_deref()).await.error {
            Some(e) => Err(ConnectError::ProxyTestFailed(e)),
            None => Ok(()),
        };

        Ok(Established { bind, verification })
    }

    async fn poll_until_connected(&self) -> StatusReply {
        loop {
            let status = self.plane.get_status().await;
            if status.connected {
                return status;
            }
            if let Some(e) = &status.error {
                debug!("Status poll: {}", e);
            }
            sleep(self.timings.status_poll()).await;
        }
    }

    fn emit(&self, text: impl Into<String>, kind: EventKind) {
        let record = EventRecord::new(text, kind);
        notifications::notify_event(&record);
        self.lock_events().push(record);
    }

    fn lock_events(&self) -> MutexGuard<'_, EventLog> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `Connected · <bind>`, or just `Connected` without a bind
pub fn connected_message(bind: Option<&str>) -> String {
    match bind {
        Some(bind) => format!("Connected · {}", bind),
        None => "Connected".to_string(),
    }
}
