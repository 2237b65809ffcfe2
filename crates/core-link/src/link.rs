//! Typed facade over the machine-controller client.
//!
//! Two locks, deliberately: a *state lock* protecting the connected/lost
//! bits and a *call lock* serialising every native client call. The state
//! lock is never held across I/O — holding one lock for both would serialise
//! cheap status queries behind slow writes.
//!
//! Connection-loss contract: the first non-transient failure flips
//! `connected`, emits [`LinkEvent::ConnectionLost`] exactly once, and every
//! later call fails fast with [`LinkError::Disconnected`] until a fresh
//! `connect` succeeds.

use crate::client::{ConnectOptions, FaultKind, PlcClient, TransportFault};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("machine link is disconnected")]
    Disconnected,
    #[error("connect timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("protocol error: {detail}")]
    Protocol { detail: String },
}

/// Out-of-band notifications from the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectionLost,
}

#[derive(Debug, Default)]
struct LinkState {
    connected: bool,
    lost_reported: bool,
}

pub struct MachineLink {
    state: Mutex<LinkState>,
    call: Mutex<Box<dyn PlcClient>>,
    events: Sender<LinkEvent>,
}

impl MachineLink {
    /// Wrap a client. The returned receiver carries at most one
    /// `ConnectionLost` per connection.
    pub fn new(client: Box<dyn PlcClient>) -> (Arc<Self>, Receiver<LinkEvent>) {
        let (events, rx) = unbounded();
        (
            Arc::new(Self {
                state: Mutex::new(LinkState::default()),
                call: Mutex::new(client),
                events,
            }),
            rx,
        )
    }

    pub fn connect(&self, endpoint: &str, options: &ConnectOptions) -> Result<(), LinkError> {
        let result = {
            let mut client = self.call.lock().expect("link call lock poisoned");
            client.connect(endpoint, options)
        };
        match result {
            Ok(()) => {
                let mut state = self.state.lock().expect("link state lock poisoned");
                state.connected = true;
                state.lost_reported = false;
                info!(target: "link", endpoint, "connected");
                Ok(())
            }
            Err(fault) => {
                warn!(target: "link", endpoint, fault = %fault, "connect failed");
                Err(match fault.kind {
                    FaultKind::Timeout => LinkError::Timeout,
                    FaultKind::Refused => LinkError::Refused,
                    _ => LinkError::Protocol {
                        detail: fault.detail,
                    },
                })
            }
        }
    }

    /// Idempotent teardown.
    pub fn disconnect(&self) {
        {
            let mut client = self.call.lock().expect("link call lock poisoned");
            client.disconnect();
        }
        let mut state = self.state.lock().expect("link state lock poisoned");
        if state.connected {
            info!(target: "link", "disconnected");
        }
        state.connected = false;
    }

    /// Diagnostic snapshot.
    pub fn is_connected(&self) -> bool {
        self.state.lock().expect("link state lock poisoned").connected
    }

    pub fn read_int(&self, name: &str) -> Result<i32, LinkError> {
        self.call_client(name, |c| c.read_int(name))
    }

    pub fn read_bool(&self, name: &str) -> Result<bool, LinkError> {
        self.call_client(name, |c| c.read_bool(name))
    }

    pub fn write_int(&self, name: &str, value: i32) -> Result<(), LinkError> {
        debug!(target: "link", name, value, "write_int");
        self.call_client(name, |c| c.write_int(name, value))
    }

    pub fn write_bool(&self, name: &str, value: bool) -> Result<(), LinkError> {
        debug!(target: "link", name, value, "write_bool");
        self.call_client(name, |c| c.write_bool(name, value))
    }

    /// Shared call path: fail fast when disconnected, serialise the I/O,
    /// retry a transient fault once, latch a loss.
    fn call_client<T>(
        &self,
        name: &str,
        mut f: impl FnMut(&mut dyn PlcClient) -> Result<T, TransportFault>,
    ) -> Result<T, LinkError> {
        {
            let state = self.state.lock().expect("link state lock poisoned");
            if !state.connected {
                return Err(LinkError::Disconnected);
            }
        }
        let result = {
            let mut client = self.call.lock().expect("link call lock poisoned");
            match f(client.as_mut()) {
                Ok(v) => Ok(v),
                Err(fault) if fault.kind == FaultKind::Transient => {
                    warn!(target: "link", name, fault = %fault, "transient fault, retrying once");
                    f(client.as_mut())
                }
                Err(fault) => Err(fault),
            }
        };
        result.map_err(|fault| {
            self.mark_lost(name, &fault);
            LinkError::Disconnected
        })
    }

    fn mark_lost(&self, name: &str, fault: &TransportFault) {
        let report = {
            let mut state = self.state.lock().expect("link state lock poisoned");
            state.connected = false;
            if state.lost_reported {
                false
            } else {
                state.lost_reported = true;
                true
            }
        };
        if report {
            warn!(target: "link", name, fault = %fault, "connection lost");
            let _ = self.events.send(LinkEvent::ConnectionLost);
        }
    }
}

impl std::fmt::Debug for MachineLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("link state lock poisoned");
        f.debug_struct("MachineLink")
            .field("connected", &state.connected)
            .field("lost_reported", &state.lost_reported)
            .finish()
    }
}
