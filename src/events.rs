//! Recent activity log
//!
//! Holds the last few orchestrator events, newest first. The newest one is
//! shown as a toast for a short while; the rest make up the history view.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

pub const LOG_CAPACITY: usize = 3;

/// How long the newest event stays visible as a toast
pub const TOAST_DURATION: Duration = Duration::from_millis(1800);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    /// Unix timestamp in seconds
    pub timestamp: u64,
    #[serde(skip)]
    pub at: Instant,
    pub text: String,
    pub kind: EventKind,
}

impl EventRecord {
    pub fn new(text: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: unix_now(),
            at: Instant::now(),
            text: text.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    records: VecDeque<EventRecord>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            records: VecDeque::with_capacity(LOG_CAPACITY),
        }
    }

    pub fn push(&mut self, record: EventRecord) {
        self.records.push_front(record);
        self.records.truncate(LOG_CAPACITY);
    }

    /// Newest first
    pub fn records(&self) -> impl Iterator<Item = &EventRecord> {
        self.records.iter()
    }

    pub fn latest(&self) -> Option<&EventRecord> {
        self.records.front()
    }

    /// The newest record, while it is still within the toast window
    pub fn toast(&self, now: Instant) -> Option<&EventRecord> {
        self.latest()
            .filter(|r| now.saturating_duration_since(r.at) < TOAST_DURATION)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
