//! Scan notifications.
//!
//! The scan task publishes typed events on a `tokio::sync::broadcast` channel.
//! Delivery is fire-and-forget: publishing never waits, and a subscriber that
//! falls behind skips the oldest events (`RecvError::Lagged`) rather than
//! slowing the scan. The latest [`ScanState`] is additionally kept in a
//! `watch` channel so late observers can read it without replaying history.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut rx = handle.subscribe();
//! while let Ok(event) = rx.recv().await {
//!     if let ScanEvent::FlakeRecorded { index, .. } = event {
//!         println!("flake at capture {index}");
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Default number of events buffered per subscriber.
pub const EVENT_CAPACITY: usize = 256;

/// Lifecycle of one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    Idle,
    Initializing,
    AtOrigin,
    Calibrating,
    Scanning,
    Completed,
    Aborted,
    Cancelled,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Aborted | ScanState::Cancelled
        )
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Idle => "idle",
            ScanState::Initializing => "initializing",
            ScanState::AtOrigin => "at origin",
            ScanState::Calibrating => "calibrating",
            ScanState::Scanning => "scanning",
            ScanState::Completed => "completed",
            ScanState::Aborted => "aborted",
            ScanState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Everything an observer can learn about a running scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScanEvent {
    Started { session_id: String, total: usize },
    StateChanged(ScanState),
    /// Human-readable status line
    Status(String),
    Progress {
        completed: usize,
        total: usize,
        percent: f64,
    },
    RemainingTime(Duration),
    /// A flake-positive capture has been durably recorded
    FlakeRecorded { index: u64, score: u64 },
    Finished {
        state: ScanState,
        captured: u64,
        flakes: u64,
        message: String,
    },
}

/// Publishing side of the event and state channels.
#[derive(Debug, Clone)]
pub struct EventBus {
    events: broadcast::Sender<ScanEvent>,
    state: Arc<watch::Sender<ScanState>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (state, _) = watch::channel(ScanState::Idle);
        Self {
            events,
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    /// Publish without waiting. No subscribers is not an error.
    pub fn emit(&self, event: ScanEvent) {
        let _ = self.events.send(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        info!(status = %message);
        self.emit(ScanEvent::Status(message));
    }

    pub fn transition(&self, state: ScanState) {
        info!(%state, "Scan state");
        self.state.send_replace(state);
        self.emit(ScanEvent::StateChanged(state));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}
