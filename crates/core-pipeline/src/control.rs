//! Cross-task signalling primitives.
//!
//! Every suspension point in the pipeline polls through the injected clock,
//! so these are plain atomics: cheap to read in composite predicates
//! (`stop || emergency || primary-condition`) and free of wake-ordering
//! subtleties. `stop` is cooperative, `emergency` pre-empts geometry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared stop/emergency request flags for one job.
#[derive(Debug, Default)]
pub struct ControlFlags {
    stop: AtomicBool,
    emergency: AtomicBool,
}

impl ControlFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cooperative stop: workers finish the current batch and exit at their
    /// next wait point.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Pre-emptive abort: the consumer kills the laser at its next
    /// suspension point and executes no further geometry. Implies stop for
    /// the producer.
    pub fn request_emergency(&self) {
        self.emergency.store(true, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn emergency_requested(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }
}

/// One-shot re-armable "PLC is ready" event: set when the recoat completes,
/// cleared by the consumer after it consumes the cycle.
#[derive(Debug, Default)]
pub struct ReadyGate {
    set: AtomicBool,
}

impl ReadyGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.set.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }
}

/// Parks the consumer between layers. Distinct from [`ReadyGate`]: pausing
/// must not consume or fabricate a recoat cycle.
#[derive(Debug, Default)]
pub struct PauseGate {
    paused: AtomicBool,
}

impl PauseGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}
