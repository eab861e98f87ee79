//! Headless console front-end for `bulletproof run`
//!
//! Reads one-letter commands from stdin and prints state changes and toasts
//! as they happen.

use crate::config::ConnectionSettings;
use crate::control::ControlPlane;
use crate::events::{EventKind, EventRecord};
use crate::orchestrator::Orchestrator;
use crate::state::ConnectionState;
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const HELP: &str = "Commands: t(oggle)  s(tatus)  h(istory)  d(iag)  q(uit)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Toggle,
    Status,
    History,
    Diagnostics,
    Quit,
    Help,
    Unknown(String),
}

/// Parse one input line; blank lines yield nothing
pub fn parse_command(line: &str) -> Option<ConsoleCommand> {
    let word = line.trim().to_ascii_lowercase();
    let command = match word.as_str() {
        "" => return None,
        "t" | "toggle" => ConsoleCommand::Toggle,
        "s" | "status" => ConsoleCommand::Status,
        "h" | "history" => ConsoleCommand::History,
        "d" | "diag" => ConsoleCommand::Diagnostics,
        "q" | "quit" | "exit" => ConsoleCommand::Quit,
        "?" | "help" => ConsoleCommand::Help,
        _ => ConsoleCommand::Unknown(word),
    };
    Some(command)
}

/// One-line summary used for change notifications
pub fn render_line(state: &ConnectionState) -> String {
    match &state.last_error {
        Some(e) if *e != state.message => {
            format!("[{}] {} (last error: {})", state.phase, state.message, e)
        }
        _ => format!("[{}] {}", state.phase, state.message),
    }
}

/// Full status view
pub fn render_state(state: &ConnectionState) -> String {
    let mut lines = vec![
        format!("Phase:      {}", state.phase),
        format!("Message:    {}", state.message),
        format!("Bind:       {}", state.bind.as_deref().unwrap_or("-")),
    ];
    if let Some(e) = &state.last_error {
        lines.push(format!("Last error: {}", e));
    }

    let daemon = &state.daemon;
    if daemon.reachable {
        lines.push(format!(
            "Daemon:     {} ({})",
            if daemon.connected { "connected" } else { "not connected" },
            daemon.message.as_deref().unwrap_or("no message")
        ));
        lines.push(format!(
            "System proxy: {}  TUN: {}",
            on_off(daemon.system_proxy),
            on_off(daemon.tun_active)
        ));
    } else {
        lines.push("Daemon:     unreachable".to_string());
    }

    let probe = &state.probe;
    if probe.listening || probe.latency_ms.is_some() || probe.egress.is_some() {
        let port = if probe.listening { "listening" } else { "closed" };
        lines.push(format!("Port:       {}", port));
        if let Some(ms) = probe.latency_ms {
            lines.push(format!("Latency:    {} ms", ms));
        }
        if let Some(egress) = &probe.egress {
            lines.push(format!(
                "Egress:     {} {} {} {}",
                egress.ip.as_deref().unwrap_or("?"),
                egress.country.as_deref().unwrap_or("?"),
                egress.isp.as_deref().unwrap_or("?"),
                egress.asn.as_deref().unwrap_or("")
            ));
        }
    }

    lines.join("\n")
}

pub fn render_event(event: &EventRecord) -> String {
    let marker = match event.kind {
        EventKind::Info => "·",
        EventKind::Success => "✓",
        EventKind::Error => "✗",
    };
    format!("{} {}", marker, event.text)
}

pub fn render_history(events: &[EventRecord]) -> String {
    if events.is_empty() {
        return "No recent activity".to_string();
    }
    events.iter().map(render_event).collect::<Vec<_>>().join("\n")
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

pub struct Console {
    orchestrator: Arc<Orchestrator>,
    plane: Arc<dyn ControlPlane>,
    settings: ConnectionSettings,
}

impl Console {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        plane: Arc<dyn ControlPlane>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            orchestrator,
            plane,
            settings,
        }
    }

    /// Run until `quit` or end of input
    pub async fn run(&self) {
        println!("{}", HELP);
        let mut lines = stdin_lines();

        while let Some(line) = lines.recv().await {
            let Some(command) = parse_command(&line) else {
                continue;
            };
            debug!("Console command: {:?}", command);
            match command {
                ConsoleCommand::Toggle => self.toggle(),
                ConsoleCommand::Status => {
                    println!("{}", render_state(&self.orchestrator.state().snapshot()))
                }
                ConsoleCommand::History => {
                    println!("{}", render_history(&self.orchestrator.events()))
                }
                ConsoleCommand::Diagnostics => self.diagnostics().await,
                ConsoleCommand::Help => println!("{}", HELP),
                ConsoleCommand::Quit => return,
                ConsoleCommand::Unknown(word) => {
                    println!("Unknown command '{}'. {}", word, HELP)
                }
            }
        }

        debug!("Console input closed");
    }

    /// Runs in the background so status and history stay responsive
    fn toggle(&self) {
        let request = match self.settings.to_request() {
            Ok(request) => request,
            Err(e) => {
                warn!("Cannot build connect request: {}", e);
                return;
            }
        };
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            let outcome = orchestrator.toggle(request).await;
            debug!("Toggle finished: {:?}", outcome);
        });
    }

    async fn diagnostics(&self) {
        let reply = self.plane.get_diagnostics().await;
        match reply.error {
            Some(e) => println!("Diagnostics failed: {}", e),
            None => match serde_json::to_string_pretty(&reply.body) {
                Ok(text) => println!("{}", text),
                Err(e) => println!("Diagnostics failed: {}", e),
            },
        }
    }
}

/// Lines from stdin, read on a detached thread so shutdown never waits on input
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Print a line on every visible state change, and each new toast
pub fn spawn_state_printer(orchestrator: Arc<Orchestrator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut changes = orchestrator.state().subscribe();
        let mut last_line = String::new();
        let mut last_toast: Option<(u64, String)> = None;

        while changes.changed().await.is_ok() {
            let line = render_line(&changes.borrow_and_update());
            if line != last_line {
                println!("{}", line);
                last_line = line;
            }

            if let Some(toast) = orchestrator.toast(Instant::now()) {
                let key = (toast.timestamp, toast.text.clone());
                if last_toast.as_ref() != Some(&key) {
                    println!("  {}", render_event(&toast));
                    last_toast = Some(key);
                }
            }
        }
    })
}
