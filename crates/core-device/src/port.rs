//! The narrow interface every scan card implements.

use thiserror::Error;

/// Native error codes surfaced by card implementations. The vendor library
/// reports raw integers; the simulated card reuses the same space so error
/// handling above the port is identical for both.
pub mod codes {
    pub const OPEN_FAILED: i32 = 1;
    pub const NOT_OPENED: i32 = 2;
    pub const CORRECTION_REJECTED: i32 = 3;
    pub const LIST_OVERFLOW: i32 = 4;
    pub const NO_LIST_OPEN: i32 = 5;
    pub const BUSY: i32 = 6;
    pub const DOUBLE_OPEN: i32 = 7;
}

/// A failed native call: which operation, and the card's error code.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("card error {code} in {op}")]
pub struct CardError {
    pub code: i32,
    pub op: &'static str,
}

impl CardError {
    pub const fn new(op: &'static str, code: i32) -> Self {
        Self { code, op }
    }

    pub fn is_overflow(&self) -> bool {
        self.code == codes::LIST_OVERFLOW
    }
}

bitflags::bitflags! {
    /// Snapshot of the card status register.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CardStatus: u32 {
        /// A list is currently executing.
        const BUSY = 1;
        /// A list is open for command input.
        const LIST_OPEN = 2;
        /// The laser gate is enabled.
        const LASER_ENABLED = 4;
        /// The card has latched an error since the last readback.
        const ERROR = 8;
    }
}

/// C-ABI facade over one scan card.
///
/// Implementations serialise their own native calls internally (the vendor
/// library is not reentrant), so methods take `&self` and the port can be
/// shared behind an `Arc`. Exactly-once open/close discipline is NOT the
/// port's job — that is [`crate::DeviceHandle`].
pub trait CardPort: Send + Sync {
    fn open(&self) -> Result<(), CardError>;

    /// Close is infallible by contract: it is called from drop paths.
    fn close(&self);

    /// Load a correction table into the card. Content is opaque here; only
    /// card acceptance is checked.
    fn load_correction(&self, table: &[u8]) -> Result<(), CardError>;

    /// Open the command list for input.
    fn set_start_list(&self) -> Result<(), CardError>;

    /// Close the command list. The card discards an unclosed list on
    /// execute, so this must precede `execute_list`.
    fn set_end_of_list(&self) -> Result<(), CardError>;

    fn execute_list(&self) -> Result<(), CardError>;

    fn stop_execution(&self) -> Result<(), CardError>;

    fn jump_abs(&self, x: i32, y: i32) -> Result<(), CardError>;

    fn mark_abs(&self, x: i32, y: i32) -> Result<(), CardError>;

    fn set_laser_power(&self, power: u16) -> Result<(), CardError>;

    fn set_laser_mode(&self, mode: u8) -> Result<(), CardError>;

    /// Mark speed in device bits per millisecond.
    fn set_mark_speed(&self, bits_per_ms: f64) -> Result<(), CardError>;

    /// Jump speed in device bits per millisecond.
    fn set_jump_speed(&self, bits_per_ms: f64) -> Result<(), CardError>;

    fn set_wobble(&self, amplitude_bits: u32, frequency_hz: f32) -> Result<(), CardError>;

    /// Force the laser gate off. Must be safe to call at any time.
    fn laser_disable(&self) -> Result<(), CardError>;

    fn read_status(&self) -> CardStatus;

    /// Last nonzero native error code, 0 when clear.
    fn last_error(&self) -> i32;
}
