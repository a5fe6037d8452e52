//! BLE session state machine.
//!
//! ```text
//! Disconnected --begin--> Connecting --link up--> Connected --services ok--> Ready
//!                                                     |
//!                                                     +--services missing--> Error --> Disconnected
//! any --link lost--> Disconnected          Ready --disconnect--> Disconnected
//! ```
//!
//! Every transition runs under one mutex shared by driver calls and transport
//! callbacks. Transport requests (discovery, subscription, close) are issued
//! only after the guard is dropped.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::events::{EventSink, FailureKind};
use crate::protocol::{DATA_CHAR_UUID, NOTIFY_CHAR_UUID, PRINTER_SERVICE_UUID, WRITE_CHAR_UUID};
use crate::transport::{GattCallbacks, GattCharacteristic, GattLink, GattService, LinkState};

/// Lifecycle of the driver's single BLE session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Link up, service discovery pending
    Connected,
    /// Characteristics resolved, printing allowed
    Ready,
    /// Transient, always followed by teardown
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One session with one printer. Handles never leave this struct except as
/// short-lived clones for a single write.
struct Connection {
    address: String,
    link: Option<Arc<dyn GattLink>>,
    write_char: Option<GattCharacteristic>,
    data_char: Option<GattCharacteristic>,
    ready: bool,
}

impl Connection {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            link: None,
            write_char: None,
            data_char: None,
            ready: false,
        }
    }
}

/// Handles needed to run one print step.
#[derive(Clone)]
pub(crate) struct ReadyLink {
    pub link: Arc<dyn GattLink>,
    pub write_char: GattCharacteristic,
    pub data_char: GattCharacteristic,
}

/// Result of [`ConnectionMachine::begin`].
pub(crate) enum Begin {
    AlreadyReady,
    Started {
        attempt: u64,
        /// Link of the torn-down previous session, to be closed by the caller
        stale: Option<Arc<dyn GattLink>>,
    },
}

/// Progress of a connect attempt as seen by the polling caller.
pub(crate) enum Outcome {
    Pending,
    Ready,
    /// `reported` is set when a callback already broadcast the failure
    Failed { error: Error, reported: bool },
}

struct Inner {
    state: ConnectionState,
    /// Bumped by every `begin`; callbacks of older attempts are ignored
    attempt: u64,
    connection: Option<Connection>,
    /// Why the current attempt was torn down by a callback
    failure: Option<(u64, FailureKind, String)>,
}

impl Inner {
    fn set_state(&mut self, to: ConnectionState) {
        if self.state != to {
            debug!(from = %self.state, to = %to, "connection state");
            self.state = to;
        }
    }

    /// Drop the session and hand back its link for closing.
    fn release(&mut self) -> Option<Arc<dyn GattLink>> {
        self.set_state(ConnectionState::Disconnected);
        self.connection.take().and_then(|c| c.link)
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.attempt == attempt && self.connection.is_some()
    }
}

pub(crate) struct ConnectionMachine {
    inner: Mutex<Inner>,
    events: EventSink,
}

impl ConnectionMachine {
    pub(crate) fn new(events: EventSink) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                attempt: 0,
                connection: None,
                failure: None,
            }),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every transition leaves Inner consistent, so a poisoned guard is usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.events
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn address(&self) -> Option<String> {
        self.lock().connection.as_ref().map(|c| c.address.clone())
    }

    /// Start a new attempt, tearing down whatever session exists.
    pub(crate) fn begin(&self, address: &str) -> Begin {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Ready {
            return Begin::AlreadyReady;
        }
        let stale = inner.release();
        inner.attempt += 1;
        inner.failure = None;
        inner.connection = Some(Connection::new(address));
        inner.set_state(ConnectionState::Connecting);
        Begin::Started {
            attempt: inner.attempt,
            stale,
        }
    }

    /// Callback object bound to `attempt`.
    pub(crate) fn callbacks(self: &Arc<Self>, attempt: u64) -> Arc<dyn GattCallbacks> {
        Arc::new(AttemptCallbacks {
            machine: Arc::downgrade(self),
            attempt,
        })
    }

    /// Store the freshly opened link. `false` means the attempt is gone and
    /// the caller owns (and must close) the link.
    pub(crate) fn attach(&self, attempt: u64, link: Arc<dyn GattLink>) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(attempt) || inner.state != ConnectionState::Connecting {
            return false;
        }
        if let Some(conn) = inner.connection.as_mut() {
            conn.link = Some(link);
        }
        true
    }

    pub(crate) fn outcome(&self, attempt: u64) -> Outcome {
        let mut inner = self.lock();
        if inner.attempt != attempt {
            return Outcome::Failed {
                error: Error::LinkLost("superseded by a newer connect".into()),
                reported: false,
            };
        }
        match inner.state {
            ConnectionState::Ready => Outcome::Ready,
            ConnectionState::Disconnected | ConnectionState::Error => {
                let (error, reported) = match inner.failure.take() {
                    Some((a, FailureKind::Discovery, detail)) if a == attempt => {
                        (Error::Discovery(detail), true)
                    }
                    Some((a, _, detail)) if a == attempt => (Error::LinkLost(detail), true),
                    // Torn down by disconnect() or a newer attempt
                    _ => (Error::LinkLost("connection closed".into()), false),
                };
                Outcome::Failed { error, reported }
            }
            ConnectionState::Connecting | ConnectionState::Connected => Outcome::Pending,
        }
    }

    /// Roll `attempt` back to Disconnected, if it is still the live one.
    pub(crate) fn abort(&self, attempt: u64) {
        let link = {
            let mut inner = self.lock();
            if !inner.is_current(attempt) {
                return;
            }
            inner.release()
        };
        if let Some(link) = link {
            link.close();
        }
    }

    /// Unconditional teardown. Returns `true` if a session existed.
    pub(crate) fn teardown(&self) -> bool {
        let (existed, link) = {
            let mut inner = self.lock();
            let existed = inner.connection.is_some();
            (existed, inner.release())
        };
        if let Some(link) = link {
            link.close();
        }
        existed
    }

    pub(crate) fn ready_link(&self) -> Result<ReadyLink, Error> {
        let inner = self.lock();
        if inner.state != ConnectionState::Ready {
            return Err(Error::NotConnected);
        }
        match inner.connection.as_ref() {
            Some(Connection {
                link: Some(link),
                write_char: Some(write_char),
                data_char: Some(data_char),
                ready: true,
                ..
            }) => Ok(ReadyLink {
                link: link.clone(),
                write_char: write_char.clone(),
                data_char: data_char.clone(),
            }),
            _ => Err(Error::NotConnected),
        }
    }

    fn link_state_changed(&self, attempt: u64, state: LinkState) {
        match state {
            LinkState::Connected => {
                let link = {
                    let mut inner = self.lock();
                    if !inner.is_current(attempt) || inner.state != ConnectionState::Connecting {
                        debug!(attempt, "ignoring link-up for inactive attempt");
                        return;
                    }
                    inner.set_state(ConnectionState::Connected);
                    inner.connection.as_ref().and_then(|c| c.link.clone())
                };
                self.events.status("Connected, discovering services...");
                let requested = match link {
                    Some(link) => link.discover_services(),
                    None => Err(Error::NotConnected),
                };
                if let Err(e) = requested {
                    self.fail(attempt, FailureKind::Discovery, e.to_string());
                }
            }
            LinkState::Disconnected { reason } => {
                let link = {
                    let mut inner = self.lock();
                    if !inner.is_current(attempt) {
                        debug!(attempt, "ignoring link-down for inactive attempt");
                        return;
                    }
                    inner.failure = Some((attempt, FailureKind::LinkLost, reason.clone()));
                    inner.release()
                };
                if let Some(link) = link {
                    link.close();
                }
                warn!(%reason, "link lost");
                self.events
                    .failure(FailureKind::LinkLost, format!("Disconnected: {}", reason));
            }
        }
    }

    fn services_discovered(&self, attempt: u64, result: Result<Vec<GattService>, String>) {
        let resolved = {
            let mut inner = self.lock();
            if !inner.is_current(attempt) || inner.state != ConnectionState::Connected {
                debug!(attempt, "ignoring discovery result for inactive attempt");
                return;
            }
            match result.and_then(|services| resolve_printer(&services)) {
                Ok((write_char, data_char, notify_char)) => {
                    let conn = inner.connection.as_mut();
                    let link = conn.and_then(|c| {
                        c.write_char = Some(write_char);
                        c.data_char = Some(data_char);
                        c.ready = true;
                        c.link.clone()
                    });
                    inner.set_state(ConnectionState::Ready);
                    Ok((link, notify_char))
                }
                Err(detail) => Err(detail),
            }
        };

        match resolved {
            Ok((link, notify_char)) => {
                // Readiness does not depend on the subscription
                if let (Some(link), Some(notify)) = (link, notify_char) {
                    if let Err(e) = link.enable_notifications(&notify) {
                        warn!(error = %e, "could not subscribe to printer notifications");
                    }
                }
                info!("printer ready");
                self.events.status("Printer ready");
            }
            Err(detail) => self.fail(attempt, FailureKind::Discovery, detail),
        }
    }

    /// Connected -> Error -> Disconnected for a callback-detected failure.
    fn fail(&self, attempt: u64, kind: FailureKind, detail: String) {
        let link = {
            let mut inner = self.lock();
            if !inner.is_current(attempt) {
                return;
            }
            inner.set_state(ConnectionState::Error);
            inner.failure = Some((attempt, kind, detail.clone()));
            inner.release()
        };
        if let Some(link) = link {
            link.close();
        }
        warn!(%kind, %detail, "connect attempt failed");
        self.events.failure(kind, detail);
    }
}

/// Pick the printer characteristics out of a discovery result.
fn resolve_printer(
    services: &[GattService],
) -> Result<(GattCharacteristic, GattCharacteristic, Option<GattCharacteristic>), String> {
    let service = services
        .iter()
        .find(|s| s.uuid == PRINTER_SERVICE_UUID)
        .ok_or_else(|| format!("printer service {} not found", PRINTER_SERVICE_UUID))?;
    let write = service
        .characteristic(WRITE_CHAR_UUID)
        .ok_or_else(|| format!("write characteristic {} missing", WRITE_CHAR_UUID))?;
    let data = service
        .characteristic(DATA_CHAR_UUID)
        .ok_or_else(|| format!("data characteristic {} missing", DATA_CHAR_UUID))?;
    let notify = match service.characteristic(NOTIFY_CHAR_UUID) {
        Some(c) if c.can_notify() => Some(c.clone()),
        Some(_) => {
            warn!("notify characteristic has no CCCD, skipping subscription");
            None
        }
        None => None,
    };
    Ok((write.clone(), data.clone(), notify))
}

/// Transport-facing side of one connect attempt.
struct AttemptCallbacks {
    machine: Weak<ConnectionMachine>,
    attempt: u64,
}

impl GattCallbacks for AttemptCallbacks {
    fn on_link_state_changed(&self, state: LinkState) {
        if let Some(machine) = self.machine.upgrade() {
            machine.link_state_changed(self.attempt, state);
        }
    }

    fn on_services_discovered(&self, result: Result<Vec<GattService>, String>) {
        if let Some(machine) = self.machine.upgrade() {
            machine.services_discovered(self.attempt, result);
        }
    }
}
