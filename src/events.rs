//! Driver outcome events.
//!
//! The driver broadcasts progress and failures on a `tokio` broadcast channel;
//! any number of observers (a UI, a logger) can [`subscribe`](EventSink::subscribe).

use std::fmt;

use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the broadcast ring; slow receivers see `Lagged` past this.
const EVENT_CAPACITY: usize = 64;

/// Failure categories carried by [`PrinterEvent::Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    TransportUnavailable,
    ConnectTimeout,
    Discovery,
    LinkLost,
    NotConnected,
    Print,
    InvalidInput,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::TransportUnavailable => "transport unavailable",
            FailureKind::ConnectTimeout => "connect timeout",
            FailureKind::Discovery => "discovery failed",
            FailureKind::LinkLost => "link lost",
            FailureKind::NotConnected => "not connected",
            FailureKind::Print => "print failed",
            FailureKind::InvalidInput => "invalid input",
        };
        f.write_str(s)
    }
}

/// Everything the driver reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrinterEvent {
    /// Human-readable progress
    Status(String),
    /// Something went wrong; the same failure is also returned to the caller
    Failure { kind: FailureKind, detail: String },
    /// A print job was fully handed to the printer
    Completed,
}

/// Sending half of the event channel, owned by the driver.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: broadcast::Sender<PrinterEvent>,
}

impl EventSink {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn status(&self, text: impl Into<String>) {
        self.emit(PrinterEvent::Status(text.into()));
    }

    pub(crate) fn failure(&self, kind: FailureKind, detail: impl Into<String>) {
        self.emit(PrinterEvent::Failure {
            kind,
            detail: detail.into(),
        });
    }

    pub(crate) fn completed(&self) {
        self.emit(PrinterEvent::Completed);
    }

    fn emit(&self, event: PrinterEvent) {
        // No receivers is fine
        if self.tx.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }
}
