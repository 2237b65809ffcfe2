//! Scan-card access layer.
//!
//! [`CardPort`] is the narrow facade over the vendor's C-ABI scanner library;
//! [`DeviceHandle`] guarantees exactly-once native open/close with
//! reference-counted access; [`SimCard`] is a deterministic in-process card
//! used by tests and simulation runs. The real vendor binding lives behind
//! the `vendor-dsp` feature and is compiled out by default.

mod handle;
mod port;
mod sim;
#[cfg(feature = "vendor-dsp")]
mod vendor;

pub use handle::{DeviceError, DeviceGuard, DeviceHandle};
pub use port::{CardError, CardPort, CardStatus, codes};
pub use sim::{CardOp, SimCard};
#[cfg(feature = "vendor-dsp")]
pub use vendor::VendorCard;
