//! Bulletproof VPN - desktop controller for the `bulletproofd` daemon

pub mod config;
pub mod console;
pub mod control;
pub mod events;
pub mod notifications;
pub mod orchestrator;
pub mod platform;
pub mod reconcile;
pub mod state;
pub mod supervisor;

pub use config::Config;
pub use orchestrator::{Orchestrator, ToggleOutcome};
pub use state::{ConnectionState, Phase, SharedState};
pub use supervisor::Supervisor;
