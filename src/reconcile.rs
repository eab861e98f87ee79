//! Background status reconciliation
//!
//! Two timers share one task. The coarse timer polls daemon status and merges
//! it into `ConnectionState::daemon`. The fine timer runs only while connected
//! and samples port liveness, latency and egress identity into
//! `ConnectionState::probe`. Neither touches the phase.

use crate::config::{ProbeConfig, Timings};
use crate::control::ControlPlane;
use crate::state::{DaemonSnapshot, Egress, Phase, ProbeSample, SharedState};
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

/// Daemon messages containing any of these are surfaced as `last_error`
const FAILURE_KEYWORDS: [&str; 5] = ["fail", "error", "timeout", "denied", "not ready"];

pub struct Reconciler {
    plane: Arc<dyn ControlPlane>,
    state: SharedState,
    in_flight: Arc<AtomicBool>,
    timings: Timings,
    probe: ProbeConfig,
}

impl Reconciler {
    pub fn new(
        plane: Arc<dyn ControlPlane>,
        state: SharedState,
        in_flight: Arc<AtomicBool>,
        timings: Timings,
        probe: ProbeConfig,
    ) -> Self {
        Self {
            plane,
            state,
            in_flight,
            timings,
            probe,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut coarse = interval(self.timings.coarse_interval());
        coarse.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut fine = interval(self.timings.fine_interval());
        fine.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut changes = self.state.subscribe();
        let mut was_connected = false;

        loop {
            let connected = self.state.phase() == Phase::Connected;
            if connected && !was_connected {
                debug!("Fine reconciliation started");
                fine.reset_immediately();
            }
            if !connected && was_connected {
                debug!("Fine reconciliation stopped");
                self.clear_samples();
            }
            was_connected = connected;

            tokio::select! {
                _ = coarse.tick() => {
                    if connected {
                        self.coarse_tick_while_connected().await;
                    } else {
                        self.coarse_tick().await;
                    }
                }
                _ = fine.tick(), if connected => self.fine_tick().await,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    changes.borrow_and_update();
                }
            }
        }
    }

    /// Poll status and merge it into the daemon snapshot
    async fn coarse_tick(&self) {
        if self.in_flight.load(Ordering::Acquire) {
            debug!("Coarse tick skipped, operation in flight");
            return;
        }

        let status = self.plane.get_status().await;
        let snapshot = match &status.error {
            Some(e) => {
                debug!("Status poll failed: {}", e);
                DaemonSnapshot::default()
            }
            None => DaemonSnapshot {
                reachable: true,
                connected: status.connected,
                bind: status.bind.clone(),
                message: status.message.clone(),
                system_proxy: status.system_proxy,
                tun_active: status.tun_active,
            },
        };
        let failure = snapshot
            .message
            .as_deref()
            .filter(|m| indicates_failure(m))
            .map(str::to_string);
        let busy = self.in_flight.load(Ordering::Acquire);

        self.state.update_if(|s| {
            let mut changed = false;
            if s.daemon != snapshot {
                if s.daemon.reachable != snapshot.reachable {
                    info!("Daemon reachable: {}", snapshot.reachable);
                }
                debug!("Daemon status: {:?}", snapshot);
                s.daemon = snapshot;
                changed = true;
            }
            if let Some(failure) = failure.filter(|_| !busy)
                && s.last_error.as_deref() != Some(failure.as_str())
            {
                s.last_error = Some(failure);
                changed = true;
            }
            changed
        });
    }

    /// A coarse tick that clears the samples the moment the phase leaves
    /// Connected instead of when the status call returns
    async fn coarse_tick_while_connected(&self) {
        let mut changes = self.state.subscribe();
        let left = changes
            .wait_for(|s| s.phase != Phase::Connected)
            .map(|r| r.is_ok());
        let tick = self.coarse_tick();
        tokio::pin!(tick);

        tokio::select! {
            _ = &mut tick => return,
            true = left => {
                debug!("Phase left connected during status poll");
                self.clear_samples();
            }
        }
        tick.await;
    }

    /// Take one sample; abandon it as soon as the phase leaves Connected
    async fn fine_tick(&self) {
        let bind = self
            .state
            .snapshot()
            .bind
            .unwrap_or_else(|| self.probe.default_bind.clone());
        let mut changes = self.state.subscribe();

        tokio::select! {
            sample = self.sample(&bind) => self.apply_sample(sample),
            _ = changes.wait_for(|s| s.phase != Phase::Connected) => {
                debug!("Phase left connected, sample discarded");
            }
        }
    }

    /// The three probes run concurrently; one failing does not affect the others
    async fn sample(&self, bind: &str) -> ProbeSample {
        let (port, latency, proxy) = tokio::join!(
            self.plane.probe_port(Some(bind)),
            self.plane.measure_latency(&self.probe.latency_host),
            self.plane.test_proxy(Some(bind)),
        );

        let egress = match (&proxy.error, proxy.body.as_deref()) {
            (None, Some(body)) => parse_egress(body),
            (Some(e), _) => {
                debug!("Egress lookup failed: {}", e);
                None
            }
            (None, None) => None,
        };

        ProbeSample {
            listening: port.listening,
            latency_ms: latency,
            egress,
        }
    }

    fn apply_sample(&self, sample: ProbeSample) {
        self.state.update_if(|s| {
            if s.phase != Phase::Connected {
                return false;
            }
            if s.probe == sample {
                return false;
            }
            debug!(
                "Probe sample: listening={} latency={:?}",
                sample.listening, sample.latency_ms
            );
            s.probe = sample;
            true
        });
    }

    fn clear_samples(&self) {
        self.state.update_if(|s| {
            if s.probe == ProbeSample::default() {
                return false;
            }
            s.probe = ProbeSample::default();
            true
        });
    }
}

/// Whether a daemon message reads like a failure
pub fn indicates_failure(message: &str) -> bool {
    let message = message.to_lowercase();
    FAILURE_KEYWORDS.iter().any(|k| message.contains(k))
}

/// Parse an ip-api style body; every field is optional
pub fn parse_egress(body: &str) -> Option<Egress> {
    let value: Value = serde_json::from_str(body).ok()?;
    if !value.is_object() {
        return None;
    }

    let pick = |names: &[&str]| {
        names.iter().find_map(|name| match value.get(*name)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };

    let egress = Egress {
        ip: pick(&["query", "ip"]),
        country: pick(&["country"]),
        isp: pick(&["isp", "org"]),
        asn: pick(&["as", "asn"]),
    };

    if egress == Egress::default() {
        None
    } else {
        Some(egress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::mock::{ScriptedControlPlane, connected};
    use crate::control::{ProxyTestReply, StatusReply};
    use std::time::Duration;
    use tokio::time::sleep;

    fn reconciler(plane: &Arc<ScriptedControlPlane>, state: &SharedState) -> Reconciler {
        Reconciler::new(
            Arc::clone(plane) as Arc<dyn ControlPlane>,
            state.clone(),
            Arc::new(AtomicBool::new(false)),
            Timings::default(),
            ProbeConfig::default(),
        )
    }

    fn egress_reply() -> ProxyTestReply {
        ProxyTestReply {
            status_line: Some("HTTP/1.1 200 OK".to_string()),
            body: Some(
                r#"{"query":"104.28.1.1","country":"Germany","isp":"Cloudflare","as":"AS13335 Cloudflare, Inc."}"#
                    .to_string(),
            ),
            error: None,
        }
    }

    #[test]
    fn test_parse_egress() {
        let egress = parse_egress(
            r#"{"query":"1.2.3.4","country":"Netherlands","isp":"Example","as":"AS64500"}"#,
        )
        .unwrap();
        assert_eq!(egress.ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(egress.country.as_deref(), Some("Netherlands"));
        assert_eq!(egress.isp.as_deref(), Some("Example"));
        assert_eq!(egress.asn.as_deref(), Some("AS64500"));
    }

    #[test]
    fn test_parse_egress_tolerates_missing_fields() {
        let egress = parse_egress(r#"{"ip":"5.6.7.8","org":"Org","asn":13335}"#).unwrap();
        assert_eq!(egress.ip.as_deref(), Some("5.6.7.8"));
        assert!(egress.country.is_none());
        assert_eq!(egress.isp.as_deref(), Some("Org"));
        assert_eq!(egress.asn.as_deref(), Some("13335"));

        assert!(parse_egress("{}").is_none());
        assert!(parse_egress("not json").is_none());
        assert!(parse_egress("[1, 2]").is_none());
    }

    #[test]
    fn test_indicates_failure() {
        assert!(indicates_failure("WARP handshake FAILED"));
        assert!(indicates_failure("endpoint not ready"));
        assert!(indicates_failure("permission denied"));
        assert!(!indicates_failure("warp connected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_fine_samples_while_idle() {
        let plane = Arc::new(ScriptedControlPlane::new());
        plane
            .push_status(connected("127.0.0.1:8086"))
            .set_latency(Some(20))
            .set_proxy(egress_reply());
        let state = SharedState::new();
        let task = reconciler(&plane, &state).spawn();

        for _ in 0..10 {
            sleep(Duration::from_secs(2)).await;
            assert_eq!(state.snapshot().probe, ProbeSample::default());
        }
        task.abort();

        assert!(plane.calls("get_status") >= 10);
        assert_eq!(plane.calls("probe_port"), 0);
        assert_eq!(plane.calls("measure_latency"), 0);
        assert_eq!(plane.calls("test_proxy"), 0);
        assert_eq!(state.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coarse_merge_and_failure_heuristic() {
        let plane = Arc::new(ScriptedControlPlane::new());
        plane.push_status(StatusReply {
            connected: false,
            bind: Some("127.0.0.1:8086".to_string()),
            message: Some("WARP registration failed".to_string()),
            system_proxy: true,
            tun_active: false,
            ..StatusReply::default()
        });
        let state = SharedState::new();
        let task = reconciler(&plane, &state).spawn();

        sleep(Duration::from_millis(100)).await;
        task.abort();

        let snapshot = state.snapshot();
        assert!(snapshot.daemon.reachable);
        assert!(snapshot.daemon.system_proxy);
        assert_eq!(snapshot.daemon.bind.as_deref(), Some("127.0.0.1:8086"));
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some("WARP registration failed")
        );
        assert_eq!(snapshot.phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_daemon() {
        let plane = Arc::new(ScriptedControlPlane::new());
        plane.push_status(StatusReply::failed("Control plane unreachable: refused"));
        let state = SharedState::new();
        state.update(|s| s.daemon.reachable = true);
        let task = reconciler(&plane, &state).spawn();

        sleep(Duration::from_millis(100)).await;
        task.abort();

        let snapshot = state.snapshot();
        assert!(!snapshot.daemon.reachable);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_coarse_yields_to_orchestrator() {
        let plane = Arc::new(ScriptedControlPlane::new());
        let state = SharedState::new();
        let in_flight = Arc::new(AtomicBool::new(true));
        let task = Reconciler::new(
            Arc::clone(&plane) as Arc<dyn ControlPlane>,
            state.clone(),
            Arc::clone(&in_flight),
            Timings::default(),
            ProbeConfig::default(),
        )
        .spawn();

        sleep(Duration::from_secs(7)).await;
        assert_eq!(plane.calls("get_status"), 0);

        in_flight.store(false, Ordering::Release);
        sleep(Duration::from_secs(3)).await;
        task.abort();
        assert!(plane.calls("get_status") >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fine_samples_while_connected_then_cleared() {
        let plane = Arc::new(ScriptedControlPlane::new());
        plane
            .push_status(connected("127.0.0.1:8086"))
            .set_latency(Some(42))
            .set_proxy(egress_reply());
        let state = SharedState::new();
        state.update(|s| {
            s.phase = Phase::Connected;
            s.bind = Some("127.0.0.1:8086".to_string());
        });
        let task = reconciler(&plane, &state).spawn();

        sleep(Duration::from_millis(100)).await;
        let probe = state.snapshot().probe;
        assert!(probe.listening);
        assert_eq!(probe.latency_ms, Some(42));
        let egress = probe.egress.unwrap();
        assert_eq!(egress.ip.as_deref(), Some("104.28.1.1"));
        assert_eq!(egress.asn.as_deref(), Some("AS13335 Cloudflare, Inc."));

        state.update(|s| s.phase = Phase::Idle);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(state.snapshot().probe, ProbeSample::default());

        let samples = plane.calls("measure_latency");
        sleep(Duration::from_secs(20)).await;
        task.abort();
        assert_eq!(plane.calls("measure_latency"), samples);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_sample_is_discarded() {
        let plane = Arc::new(ScriptedControlPlane::new().with_delay(Duration::from_secs(1)));
        plane.set_latency(Some(42)).set_proxy(egress_reply());
        let state = SharedState::new();
        state.update(|s| s.phase = Phase::Connected);
        let task = reconciler(&plane, &state).spawn();

        sleep(Duration::from_millis(500)).await;
        state.update(|s| s.phase = Phase::Idle);
        sleep(Duration::from_secs(3)).await;
        task.abort();

        assert_eq!(state.snapshot().probe, ProbeSample::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_cleared_while_status_poll_in_flight() {
        let plane = Arc::new(ScriptedControlPlane::new());
        plane
            .push_status(connected("127.0.0.1:8086"))
            .set_status_delay(Duration::from_millis(1500))
            .set_latency(Some(42));
        let state = SharedState::new();
        state.update(|s| {
            s.phase = Phase::Connected;
            s.bind = Some("127.0.0.1:8086".to_string());
        });
        let task = reconciler(&plane, &state).spawn();

        // The second coarse poll runs from 2s to 3.5s
        sleep(Duration::from_millis(2400)).await;
        assert_eq!(state.snapshot().probe.latency_ms, Some(42));

        state.update(|s| s.phase = Phase::Idle);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(plane.calls("get_status"), 2);
        assert_eq!(state.snapshot().probe, ProbeSample::default());

        sleep(Duration::from_secs(2)).await;
        task.abort();
        assert_eq!(state.snapshot().probe, ProbeSample::default());
    }
}
