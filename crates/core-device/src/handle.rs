//! Reference-counted ownership of the native card handle.
//!
//! The vendor library tolerates exactly one open per process and corrupts
//! its internal state on concurrent open/close. `DeviceHandle` serialises
//! both through one mutex and counts users: the 0→1 acquire opens the card,
//! the 1→0 release closes it. The [`DeviceGuard`] is the only affordance for
//! reaching the port, so holding a guard proves the card is open.

use crate::port::{CardError, CardPort};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("native open failed: {0}")]
    Open(CardError),
}

#[derive(Debug, Default)]
struct HandleState {
    opened: bool,
    refcount: u32,
}

/// Shared manager for one card. Created at runtime assembly, shared by every
/// scanner instance; lifetime ends with the longest-lived guard.
pub struct DeviceHandle {
    card: Arc<dyn CardPort>,
    state: Mutex<HandleState>,
}

impl DeviceHandle {
    pub fn new(card: Arc<dyn CardPort>) -> Arc<Self> {
        Arc::new(Self {
            card,
            state: Mutex::new(HandleState::default()),
        })
    }

    /// Increment the refcount, opening the card on the 0→1 transition. On
    /// open failure the refcount stays at 0. The state lock is held across
    /// the native open; open/close are the only native calls allowed under
    /// this lock.
    pub fn acquire(self: &Arc<Self>) -> Result<DeviceGuard, DeviceError> {
        let mut state = self.state.lock().expect("device handle poisoned");
        if state.refcount == 0 {
            debug_assert!(!state.opened);
            self.card.open().map_err(DeviceError::Open)?;
            state.opened = true;
            info!(target: "device", "card_opened");
        }
        state.refcount += 1;
        debug!(target: "device", refcount = state.refcount, "card_acquired");
        Ok(DeviceGuard {
            handle: Arc::clone(self),
        })
    }

    /// Diagnostic snapshot; never used for correctness decisions.
    pub fn refcount(&self) -> u32 {
        self.state.lock().expect("device handle poisoned").refcount
    }

    /// Diagnostic snapshot; never used for correctness decisions.
    pub fn is_open(&self) -> bool {
        self.state.lock().expect("device handle poisoned").opened
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("device handle poisoned");
        debug_assert!(state.refcount > 0 && state.opened);
        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount == 0 {
            self.card.close();
            state.opened = false;
            info!(target: "device", "card_closed");
        } else {
            debug!(target: "device", refcount = state.refcount, "card_released");
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("device handle poisoned");
        f.debug_struct("DeviceHandle")
            .field("opened", &state.opened)
            .field("refcount", &state.refcount)
            .finish()
    }
}

/// Live reference to the open card. Dropping the last guard closes the card;
/// drop never fails.
pub struct DeviceGuard {
    handle: Arc<DeviceHandle>,
}

impl DeviceGuard {
    pub fn card(&self) -> &dyn CardPort {
        self.handle.card.as_ref()
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl std::fmt::Debug for DeviceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceGuard").finish_non_exhaustive()
    }
}
