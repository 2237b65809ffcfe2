//! Machine-controller link.
//!
//! The PLC owns powder recoating and platform motion; the runtime reads and
//! writes a fixed set of named variables on it to interleave "PLC prepares
//! surface" with "scanner executes layer". [`MachineLink`] is the typed
//! facade the rest of the runtime uses; [`PlcClient`] is the seam for the
//! concrete protocol client; [`SimPlc`] is the scripted in-process client
//! used by tests and simulation.

mod client;
mod link;
mod sim;
pub mod vars;

pub use client::{ConnectOptions, FaultKind, PlcClient, PlcValue, TransportFault};
pub use link::{LinkError, LinkEvent, MachineLink};
pub use sim::{SimPlc, WriteRecord};
