//! The protocol-client seam.

use std::time::Duration;
use thiserror::Error;

/// How a failed native client call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Worth one retry; the session may still be alive.
    Transient,
    /// The session is gone; reconnect is required.
    ConnectionLost,
    /// Connect-time: the server did not answer in time.
    Timeout,
    /// Connect-time: the server actively refused.
    Refused,
    /// Connect-time: handshake or namespace resolution failed.
    Protocol,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transport fault ({kind:?}): {detail}")]
pub struct TransportFault {
    pub kind: FaultKind,
    pub detail: String,
}

impl TransportFault {
    pub fn new(kind: FaultKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlcValue {
    Int(i32),
    Bool(bool),
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Namespace URI whose index is resolved during connect.
    pub namespace_uri: String,
    pub session_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            namespace_uri: "urn:marcslm:plc".to_string(),
            session_timeout: Duration::from_secs(30),
        }
    }
}

/// Synchronous client against the machine controller. Implementations are
/// not required to be reentrant: [`crate::MachineLink`] serialises every
/// call.
pub trait PlcClient: Send {
    fn connect(&mut self, endpoint: &str, options: &ConnectOptions) -> Result<(), TransportFault>;

    fn read_int(&mut self, name: &str) -> Result<i32, TransportFault>;

    fn read_bool(&mut self, name: &str) -> Result<bool, TransportFault>;

    fn write_int(&mut self, name: &str, value: i32) -> Result<(), TransportFault>;

    fn write_bool(&mut self, name: &str, value: bool) -> Result<(), TransportFault>;

    fn disconnect(&mut self);
}
