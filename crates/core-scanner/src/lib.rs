//! Single-owner scanner driver.
//!
//! A [`Scanner`] wraps one [`DeviceGuard`] and enforces the two contracts
//! the raw card cannot: **thread affinity** (the task that ran `initialise`
//! is the only one allowed to call anything else; violations surface as
//! [`ScanError::WrongThread`] before any native call) and the **list state
//! machine** (`Empty → Open → Closed → Executing → Empty`). The DSP silently
//! discards commands queued into a list that was never closed before
//! execute, so `execute_list` always issues the native close primitive
//! first; `wait_for_idle` polls through the injected clock and times out
//! rather than wedge the pipeline on a stuck card.

use core_clock::Clock;
use core_device::{CardError, CardPort, CardStatus, DeviceError, DeviceGuard, DeviceHandle};
use core_styles::BuildStyle;
use core_units::{Calibration, Point};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ScanError {
    #[error("scanner operation invoked from a thread other than the owner")]
    WrongThread,
    #[error("scanner is not initialised")]
    NotInitialised,
    #[error("scanner is already initialised")]
    AlreadyInitialised,
    #[error("operation illegal in list state {state:?}")]
    BadState { state: ListState },
    #[error("command list overflow")]
    Overflow,
    #[error("native scanner error {code} during {op}")]
    Hardware { code: i32, op: &'static str },
    #[error("timed out waiting for {what}")]
    Timeout { what: &'static str },
}

/// The DSP command-list lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    Empty,
    Open,
    Closed,
    Executing,
}

/// Calibration and timing knobs for one scanner instance.
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    pub calibration: Calibration,
    /// Poll interval for busy-flag loops.
    pub poll_interval: Duration,
    /// Settle delay after the warm-up cycle completes.
    pub warmup_settle: Duration,
    /// Ceiling on the warm-up cycle reaching idle.
    pub warmup_timeout: Duration,
    /// Correction table bytes, loaded during initialise when present. The
    /// content is opaque; only card acceptance is checked.
    pub correction_table: Option<Vec<u8>>,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            calibration: Calibration::default(),
            poll_interval: Duration::from_millis(1),
            warmup_settle: Duration::from_millis(100),
            warmup_timeout: Duration::from_secs(5),
            correction_table: None,
        }
    }
}

/// Exclusive driver for one scan card.
///
/// Constructed cold; `initialise` binds it to the calling thread, acquires
/// the device and runs the warm-up cycle. The instance must stay on that
/// thread until `shutdown` (or drop, which shuts down).
pub struct Scanner {
    clock: Arc<dyn Clock>,
    settings: ScannerSettings,
    guard: Option<DeviceGuard>,
    owner: Option<ThreadId>,
    initialised: bool,
    list_state: ListState,
    /// Commands queued into the currently open list.
    queued: usize,
    scanning: bool,
    current_style: Option<u32>,
    last_error: Option<CardError>,
}

impl Scanner {
    pub fn new(clock: Arc<dyn Clock>, settings: ScannerSettings) -> Self {
        Self {
            clock,
            settings,
            guard: None,
            owner: None,
            initialised: false,
            list_state: ListState::Empty,
            queued: 0,
            scanning: false,
            current_style: None,
            last_error: None,
        }
    }

    /// Bind to the calling thread, open the device, load correction data and
    /// run the warm-up cycle. On any failure every acquired resource is
    /// released and the scanner reverts to the uninitialised state. Ends
    /// with an open list ready for layer input.
    pub fn initialise(&mut self, handle: &Arc<DeviceHandle>) -> Result<(), ScanError> {
        if self.initialised {
            return Err(ScanError::AlreadyInitialised);
        }
        let guard = handle.acquire().map_err(|DeviceError::Open(e)| {
            self.last_error = Some(e);
            ScanError::Hardware {
                code: e.code,
                op: e.op,
            }
        })?;
        match self.bring_up(&guard) {
            Ok(()) => {
                self.guard = Some(guard);
                self.owner = Some(thread::current().id());
                self.initialised = true;
                self.list_state = ListState::Open;
                self.queued = 0;
                self.scanning = false;
                self.current_style = None;
                info!(target: "scanner", "initialised");
                Ok(())
            }
            Err(e) => {
                let _ = guard.card().laser_disable();
                drop(guard);
                warn!(target: "scanner", error = %e, "initialise failed, device released");
                Err(e)
            }
        }
    }

    fn bring_up(&mut self, guard: &DeviceGuard) -> Result<(), ScanError> {
        let card = guard.card();
        if let Some(table) = self.settings.correction_table.clone() {
            self.capture(card.load_correction(&table))?;
        }
        // Warm-up: one complete list cycle with the laser gated off, so the
        // galvos and the list machinery are exercised before real geometry.
        self.capture(card.laser_disable())?;
        self.capture(card.set_start_list())?;
        self.capture(card.jump_abs(0, 0))?;
        self.capture(card.set_end_of_list())?;
        self.capture(card.execute_list())?;
        let deadline = self.clock.now() + self.settings.warmup_timeout;
        loop {
            if !card.read_status().contains(CardStatus::BUSY) {
                break;
            }
            if self.clock.now() >= deadline {
                return Err(ScanError::Timeout { what: "warm-up" });
            }
            self.clock.sleep(self.settings.poll_interval);
        }
        self.clock.sleep(self.settings.warmup_settle);
        // Re-open for layer input.
        self.capture(card.set_start_list())?;
        Ok(())
    }

    /// Append an absolute laser-off move to the open list.
    pub fn jump_to(&mut self, p: Point) -> Result<(), ScanError> {
        self.check()?;
        self.ensure_open()?;
        let result = self.card()?.jump_abs(p.x, p.y);
        self.capture(result)?;
        self.queued += 1;
        Ok(())
    }

    /// Append an absolute laser-on move to the open list.
    pub fn mark_to(&mut self, p: Point) -> Result<(), ScanError> {
        self.check()?;
        self.ensure_open()?;
        let result = self.card()?.mark_abs(p.x, p.y);
        self.capture(result)?;
        self.queued += 1;
        Ok(())
    }

    /// Queue a style's primitives (power, mode, speeds, wobble) ahead of the
    /// geometry that uses it.
    pub fn set_style(&mut self, style: &BuildStyle) -> Result<(), ScanError> {
        self.check()?;
        self.ensure_open()?;
        let cal = self.settings.calibration;
        let card = self.card()?;
        let queue_result = (|| {
            card.set_laser_power(style.laser_power)?;
            card.set_laser_mode(style.laser_mode)?;
            card.set_mark_speed(cal.speed_to_bits_per_ms(style.mark_speed_mm_s))?;
            card.set_jump_speed(cal.speed_to_bits_per_ms(style.jump_speed_mm_s))?;
            if let Some(wobble) = style.wobble {
                let amplitude_bits =
                    (wobble.amplitude_mm * cal.bits_per_mm).round().max(0.0) as u32;
                card.set_wobble(amplitude_bits, wobble.frequency_hz)?;
            }
            Ok(())
        })();
        self.capture(queue_result)?;
        self.queued += if style.wobble.is_some() { 5 } else { 4 };
        self.current_style = Some(style.id);
        debug!(target: "scanner", style = style.id, "style_queued");
        Ok(())
    }

    /// Close the list and start execution. The close primitive is mandatory:
    /// without it the DSP discards the queued commands.
    pub fn execute_list(&mut self) -> Result<(), ScanError> {
        self.check()?;
        if self.list_state != ListState::Open {
            return Err(ScanError::BadState {
                state: self.list_state,
            });
        }
        if self.queued == 0 {
            return Err(ScanError::BadState {
                state: ListState::Empty,
            });
        }
        let result = self.card()?.set_end_of_list();
        self.capture(result)?;
        self.list_state = ListState::Closed;
        let result = self.card()?.execute_list();
        self.capture(result)?;
        self.list_state = ListState::Executing;
        self.scanning = true;
        debug!(target: "scanner", commands = self.queued, "list_executing");
        Ok(())
    }

    /// Poll the busy flag until the card goes idle or `deadline` passes on
    /// the injected clock. The only legal exit from `Executing`; on timeout
    /// the state stays `Executing` and `reset_list` is the recovery.
    pub fn wait_for_idle(&mut self, deadline: Instant) -> Result<(), ScanError> {
        self.check()?;
        if self.list_state != ListState::Executing {
            return Err(ScanError::BadState {
                state: self.list_state,
            });
        }
        loop {
            if !self.card()?.read_status().contains(CardStatus::BUSY) {
                self.list_state = ListState::Empty;
                self.scanning = false;
                self.queued = 0;
                self.current_style = None;
                return Ok(());
            }
            if self.clock.now() >= deadline {
                return Err(ScanError::Timeout { what: "list idle" });
            }
            self.clock.sleep(self.settings.poll_interval);
        }
    }

    /// Stop execution, discard the list and re-open for the next layer. The
    /// single recovery path; if this also fails the scanner is dead and the
    /// job must end.
    pub fn reset_list(&mut self) -> Result<(), ScanError> {
        self.check()?;
        let result = self.card()?.stop_execution();
        self.capture(result)?;
        self.scanning = false;
        self.queued = 0;
        self.current_style = None;
        self.list_state = ListState::Empty;
        let result = self.card()?.set_start_list();
        self.capture(result)?;
        self.list_state = ListState::Open;
        Ok(())
    }

    /// Force the laser gate off. Idempotent; a native refusal is logged, not
    /// propagated, because this runs on abort paths.
    pub fn disable_laser(&mut self) -> Result<(), ScanError> {
        self.check()?;
        if let Err(e) = self.card()?.laser_disable() {
            self.last_error = Some(e);
            warn!(target: "scanner", code = e.code, "laser disable reported an error");
        }
        Ok(())
    }

    /// Stop execution, disable the laser and release the device. Idempotent
    /// and infallible; also runs on drop.
    pub fn shutdown(&mut self) {
        if !self.initialised {
            return;
        }
        if self.owner != Some(thread::current().id()) {
            // Contract violation; refuse to touch the card off-thread.
            tracing::error!(target: "scanner", "shutdown called off the owner thread; ignored");
            return;
        }
        if let Some(guard) = self.guard.take() {
            let card = guard.card();
            if let Err(e) = card.stop_execution() {
                warn!(target: "scanner", code = e.code, "stop_execution failed during shutdown");
            }
            if let Err(e) = card.laser_disable() {
                warn!(target: "scanner", code = e.code, "laser_disable failed during shutdown");
            }
        }
        self.initialised = false;
        self.owner = None;
        self.list_state = ListState::Empty;
        self.queued = 0;
        self.scanning = false;
        self.current_style = None;
        info!(target: "scanner", "shutdown");
    }

    /// Callable from any thread.
    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn list_state(&self) -> ListState {
        self.list_state
    }

    /// Style most recently queued into the current list, if any.
    pub fn current_style(&self) -> Option<u32> {
        self.current_style
    }

    /// Last captured native error, for diagnostics.
    pub fn last_error(&self) -> Option<CardError> {
        self.last_error
    }

    pub fn calibration(&self) -> Calibration {
        self.settings.calibration
    }

    // ---- internals -------------------------------------------------------

    /// Thread check first, then initialisation: a wrong-thread call must
    /// fail before any native function runs.
    fn check(&self) -> Result<(), ScanError> {
        match self.owner {
            Some(owner) if owner == thread::current().id() => Ok(()),
            Some(_) => Err(ScanError::WrongThread),
            None => Err(ScanError::NotInitialised),
        }
    }

    fn card(&self) -> Result<&dyn CardPort, ScanError> {
        self.guard
            .as_ref()
            .map(|g| g.card())
            .ok_or(ScanError::NotInitialised)
    }

    fn ensure_open(&mut self) -> Result<(), ScanError> {
        match self.list_state {
            ListState::Open => Ok(()),
            ListState::Empty | ListState::Closed => {
                let result = self.card()?.set_start_list();
                self.capture(result)?;
                self.list_state = ListState::Open;
                self.queued = 0;
                self.current_style = None;
                Ok(())
            }
            ListState::Executing => Err(ScanError::BadState {
                state: ListState::Executing,
            }),
        }
    }

    fn capture<T>(&mut self, result: Result<T, CardError>) -> Result<T, ScanError> {
        result.map_err(|e| {
            self.last_error = Some(e);
            if e.is_overflow() {
                ScanError::Overflow
            } else {
                ScanError::Hardware {
                    code: e.code,
                    op: e.op,
                }
            }
        })
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("initialised", &self.initialised)
            .field("list_state", &self.list_state)
            .field("queued", &self.queued)
            .field("scanning", &self.scanning)
            .finish_non_exhaustive()
    }
}
