//! Deterministic in-process scan card.
//!
//! Timing comes entirely from the injected clock: after `execute_list` the
//! card reports busy for a configurable duration of clock time, then idle.
//! Every native call is appended to an operation trace so tests can assert
//! ordering contracts (close-before-execute, laser-off on abort paths)
//! without touching hardware. Fault injection knobs cover the failure
//! scenarios the driver must survive.

use crate::port::{CardError, CardPort, CardStatus, codes};
use core_clock::Clock;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

/// One recorded native call.
#[derive(Debug, Clone, PartialEq)]
pub enum CardOp {
    Open,
    Close,
    LoadCorrection { bytes: usize },
    StartList,
    EndList,
    Execute,
    StopExecution,
    Jump { x: i32, y: i32 },
    Mark { x: i32, y: i32 },
    SetPower { power: u16 },
    SetLaserMode { mode: u8 },
    SetMarkSpeed { bits_per_ms: f64 },
    SetJumpSpeed { bits_per_ms: f64 },
    SetWobble { amplitude_bits: u32, frequency_hz: f32 },
    LaserDisable,
}

#[derive(Debug)]
struct SimState {
    opened: bool,
    list_open: bool,
    list_closed: bool,
    list_len: usize,
    executing_since: Option<Instant>,
    laser_enabled: bool,
    last_error: i32,
    // fault injection
    fail_open_code: Option<i32>,
    stick_busy: bool,
    stick_busy_after: Option<usize>,
    fail_execute_code: Option<i32>,
    fail_correction: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            opened: false,
            list_open: false,
            list_closed: false,
            list_len: 0,
            executing_since: None,
            laser_enabled: false,
            last_error: 0,
            fail_open_code: None,
            stick_busy: false,
            stick_busy_after: None,
            fail_execute_code: None,
            fail_correction: false,
        }
    }
}

/// Simulated card. Share as `Arc<SimCard>`: pass a clone to
/// [`crate::DeviceHandle::new`] and keep one for scripting and trace
/// assertions.
pub struct SimCard {
    clock: Arc<dyn Clock>,
    busy_duration: Mutex<Duration>,
    list_capacity: Mutex<usize>,
    state: Mutex<SimState>,
    trace: Mutex<Vec<CardOp>>,
    exec_starts: Mutex<Vec<Instant>>,
}

impl SimCard {
    pub const DEFAULT_BUSY: Duration = Duration::from_millis(50);

    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            busy_duration: Mutex::new(Self::DEFAULT_BUSY),
            list_capacity: Mutex::new(100_000),
            state: Mutex::new(SimState::default()),
            trace: Mutex::new(Vec::new()),
            exec_starts: Mutex::new(Vec::new()),
        })
    }

    // ---- scripting knobs -------------------------------------------------

    /// How long the card reports busy after each execute.
    pub fn set_busy_duration(&self, busy: Duration) {
        *self.busy_duration.lock().unwrap() = busy;
    }

    /// Wedge the card: busy never clears after execute.
    pub fn set_stick_busy(&self, stick: bool) {
        self.state.lock().unwrap().stick_busy = stick;
    }

    /// Wedge the card starting with the `n`-th execution (0-based), letting
    /// earlier cycles — the warm-up, already-finished layers — run normally.
    pub fn set_stick_busy_after(&self, n: usize) {
        self.state.lock().unwrap().stick_busy_after = Some(n);
    }

    pub fn fail_next_open(&self, code: i32) {
        self.state.lock().unwrap().fail_open_code = Some(code);
    }

    pub fn fail_execute(&self, code: i32) {
        self.state.lock().unwrap().fail_execute_code = Some(code);
    }

    pub fn reject_correction(&self, reject: bool) {
        self.state.lock().unwrap().fail_correction = reject;
    }

    pub fn set_list_capacity(&self, capacity: usize) {
        *self.list_capacity.lock().unwrap() = capacity;
    }

    // ---- trace access ----------------------------------------------------

    pub fn ops(&self) -> Vec<CardOp> {
        self.trace.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.trace.lock().unwrap().clear();
    }

    /// Clock instants at which a closed, non-empty list started executing.
    /// The matching busy window ends one busy-duration later.
    pub fn execution_starts(&self) -> Vec<Instant> {
        self.exec_starts.lock().unwrap().clone()
    }

    /// Configured busy window for one execution.
    pub fn busy_duration(&self) -> Duration {
        *self.busy_duration.lock().unwrap()
    }

    pub fn count_ops(&self, pred: impl Fn(&CardOp) -> bool) -> usize {
        self.trace.lock().unwrap().iter().filter(|op| pred(op)).count()
    }

    /// Every `Execute` in the trace must be immediately preceded by
    /// `EndList`. Returns the number of executions checked.
    pub fn assert_close_before_execute(&self) -> usize {
        let ops = self.trace.lock().unwrap();
        let mut executions = 0;
        for (i, op) in ops.iter().enumerate() {
            if *op == CardOp::Execute {
                executions += 1;
                assert!(
                    i > 0 && ops[i - 1] == CardOp::EndList,
                    "execute at trace index {i} not preceded by end-of-list"
                );
            }
        }
        executions
    }

    fn record(&self, op: CardOp) {
        trace!(target: "device.sim", ?op, "card_op");
        self.trace.lock().unwrap().push(op);
    }

    fn busy_now(&self, state: &SimState) -> bool {
        match state.executing_since {
            None => false,
            Some(_) if state.stick_busy => true,
            Some(since) => self.clock.now() < since + *self.busy_duration.lock().unwrap(),
        }
    }

    fn require_open(&self, state: &mut SimState, op: &'static str) -> Result<(), CardError> {
        if !state.opened {
            state.last_error = codes::NOT_OPENED;
            return Err(CardError::new(op, codes::NOT_OPENED));
        }
        Ok(())
    }

    fn queue(&self, op: CardOp, name: &'static str) -> Result<(), CardError> {
        let mut state = self.state.lock().unwrap();
        self.require_open(&mut state, name)?;
        if !state.list_open {
            state.last_error = codes::NO_LIST_OPEN;
            return Err(CardError::new(name, codes::NO_LIST_OPEN));
        }
        if state.list_len >= *self.list_capacity.lock().unwrap() {
            state.last_error = codes::LIST_OVERFLOW;
            return Err(CardError::new(name, codes::LIST_OVERFLOW));
        }
        state.list_len += 1;
        drop(state);
        self.record(op);
        Ok(())
    }
}

impl CardPort for SimCard {
    fn open(&self) -> Result<(), CardError> {
        let mut state = self.state.lock().unwrap();
        if let Some(code) = state.fail_open_code.take() {
            state.last_error = code;
            return Err(CardError::new("open", code));
        }
        if state.opened {
            state.last_error = codes::DOUBLE_OPEN;
            return Err(CardError::new("open", codes::DOUBLE_OPEN));
        }
        state.opened = true;
        drop(state);
        self.record(CardOp::Open);
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.opened = false;
        state.list_open = false;
        state.list_closed = false;
        state.list_len = 0;
        state.executing_since = None;
        state.laser_enabled = false;
        drop(state);
        self.record(CardOp::Close);
    }

    fn load_correction(&self, table: &[u8]) -> Result<(), CardError> {
        let mut state = self.state.lock().unwrap();
        self.require_open(&mut state, "load_correction")?;
        if state.fail_correction {
            state.last_error = codes::CORRECTION_REJECTED;
            return Err(CardError::new("load_correction", codes::CORRECTION_REJECTED));
        }
        drop(state);
        self.record(CardOp::LoadCorrection { bytes: table.len() });
        Ok(())
    }

    fn set_start_list(&self) -> Result<(), CardError> {
        let mut state = self.state.lock().unwrap();
        self.require_open(&mut state, "set_start_list")?;
        if self.busy_now(&state) {
            state.last_error = codes::BUSY;
            return Err(CardError::new("set_start_list", codes::BUSY));
        }
        state.list_open = true;
        state.list_closed = false;
        state.list_len = 0;
        state.executing_since = None;
        drop(state);
        self.record(CardOp::StartList);
        Ok(())
    }

    fn set_end_of_list(&self) -> Result<(), CardError> {
        let mut state = self.state.lock().unwrap();
        self.require_open(&mut state, "set_end_of_list")?;
        if !state.list_open {
            state.last_error = codes::NO_LIST_OPEN;
            return Err(CardError::new("set_end_of_list", codes::NO_LIST_OPEN));
        }
        state.list_open = false;
        state.list_closed = true;
        drop(state);
        self.record(CardOp::EndList);
        Ok(())
    }

    fn execute_list(&self) -> Result<(), CardError> {
        let mut state = self.state.lock().unwrap();
        self.require_open(&mut state, "execute_list")?;
        if let Some(code) = state.fail_execute_code.take() {
            state.last_error = code;
            return Err(CardError::new("execute_list", code));
        }
        if state.list_closed && state.list_len > 0 {
            let now = self.clock.now();
            state.executing_since = Some(now);
            let mut starts = self.exec_starts.lock().unwrap();
            if state.stick_busy_after.is_some_and(|n| starts.len() >= n) {
                state.stick_busy = true;
            }
            starts.push(now);
        } else {
            // The DSP silently discards a list that was never closed.
            state.executing_since = None;
            state.list_len = 0;
        }
        state.list_closed = false;
        drop(state);
        self.record(CardOp::Execute);
        Ok(())
    }

    fn stop_execution(&self) -> Result<(), CardError> {
        let mut state = self.state.lock().unwrap();
        self.require_open(&mut state, "stop_execution")?;
        state.executing_since = None;
        state.stick_busy = false;
        state.list_open = false;
        state.list_closed = false;
        state.list_len = 0;
        drop(state);
        self.record(CardOp::StopExecution);
        Ok(())
    }

    fn jump_abs(&self, x: i32, y: i32) -> Result<(), CardError> {
        self.queue(CardOp::Jump { x, y }, "jump_abs")
    }

    fn mark_abs(&self, x: i32, y: i32) -> Result<(), CardError> {
        {
            let mut state = self.state.lock().unwrap();
            state.laser_enabled = true;
        }
        self.queue(CardOp::Mark { x, y }, "mark_abs")
    }

    fn set_laser_power(&self, power: u16) -> Result<(), CardError> {
        self.queue(CardOp::SetPower { power }, "set_laser_power")
    }

    fn set_laser_mode(&self, mode: u8) -> Result<(), CardError> {
        self.queue(CardOp::SetLaserMode { mode }, "set_laser_mode")
    }

    fn set_mark_speed(&self, bits_per_ms: f64) -> Result<(), CardError> {
        self.queue(CardOp::SetMarkSpeed { bits_per_ms }, "set_mark_speed")
    }

    fn set_jump_speed(&self, bits_per_ms: f64) -> Result<(), CardError> {
        self.queue(CardOp::SetJumpSpeed { bits_per_ms }, "set_jump_speed")
    }

    fn set_wobble(&self, amplitude_bits: u32, frequency_hz: f32) -> Result<(), CardError> {
        self.queue(
            CardOp::SetWobble {
                amplitude_bits,
                frequency_hz,
            },
            "set_wobble",
        )
    }

    fn laser_disable(&self) -> Result<(), CardError> {
        let mut state = self.state.lock().unwrap();
        self.require_open(&mut state, "laser_disable")?;
        state.laser_enabled = false;
        drop(state);
        self.record(CardOp::LaserDisable);
        Ok(())
    }

    fn read_status(&self) -> CardStatus {
        let state = self.state.lock().unwrap();
        let mut status = CardStatus::empty();
        if self.busy_now(&state) {
            status |= CardStatus::BUSY;
        }
        if state.list_open {
            status |= CardStatus::LIST_OPEN;
        }
        if state.laser_enabled {
            status |= CardStatus::LASER_ENABLED;
        }
        if state.last_error != 0 {
            status |= CardStatus::ERROR;
        }
        status
    }

    fn last_error(&self) -> i32 {
        self.state.lock().unwrap().last_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_clock::FakeClock;

    fn card() -> (Arc<SimCard>, FakeClock) {
        let clock = FakeClock::new();
        let card = SimCard::new(Arc::new(clock.clone()));
        (card, clock)
    }

    #[test]
    fn closed_list_executes_and_goes_idle_after_busy_window() {
        let (card, clock) = card();
        card.open().unwrap();
        card.set_start_list().unwrap();
        card.jump_abs(0, 0).unwrap();
        card.mark_abs(100, 0).unwrap();
        card.set_end_of_list().unwrap();
        card.execute_list().unwrap();
        assert!(card.read_status().contains(CardStatus::BUSY));
        clock.advance(SimCard::DEFAULT_BUSY + Duration::from_millis(1));
        assert!(!card.read_status().contains(CardStatus::BUSY));
    }

    #[test]
    fn unclosed_list_is_silently_discarded() {
        let (card, _clock) = card();
        card.open().unwrap();
        card.set_start_list().unwrap();
        card.jump_abs(0, 0).unwrap();
        card.execute_list().unwrap();
        // No close, so nothing runs: never busy.
        assert!(!card.read_status().contains(CardStatus::BUSY));
    }

    #[test]
    fn queue_into_no_list_is_an_error() {
        let (card, _clock) = card();
        card.open().unwrap();
        let err = card.jump_abs(0, 0).unwrap_err();
        assert_eq!(err.code, codes::NO_LIST_OPEN);
        assert_eq!(card.last_error(), codes::NO_LIST_OPEN);
        assert!(card.read_status().contains(CardStatus::ERROR));
    }

    #[test]
    fn list_overflow_reports_dedicated_code() {
        let (card, _clock) = card();
        card.set_list_capacity(2);
        card.open().unwrap();
        card.set_start_list().unwrap();
        card.jump_abs(0, 0).unwrap();
        card.mark_abs(1, 1).unwrap();
        let err = card.mark_abs(2, 2).unwrap_err();
        assert!(err.is_overflow());
    }

    #[test]
    fn stick_busy_never_clears_until_stop() {
        let (card, clock) = card();
        card.set_stick_busy(true);
        card.open().unwrap();
        card.set_start_list().unwrap();
        card.jump_abs(0, 0).unwrap();
        card.set_end_of_list().unwrap();
        card.execute_list().unwrap();
        clock.advance(Duration::from_secs(3600));
        assert!(card.read_status().contains(CardStatus::BUSY));
        card.stop_execution().unwrap();
        assert!(!card.read_status().contains(CardStatus::BUSY));
    }

    #[test]
    fn trace_records_close_before_execute() {
        let (card, _clock) = card();
        card.open().unwrap();
        card.set_start_list().unwrap();
        card.jump_abs(0, 0).unwrap();
        card.set_end_of_list().unwrap();
        card.execute_list().unwrap();
        assert_eq!(card.assert_close_before_execute(), 1);
    }

    #[test]
    fn mark_enables_laser_and_disable_clears_it() {
        let (card, _clock) = card();
        card.open().unwrap();
        card.set_start_list().unwrap();
        card.jump_abs(0, 0).unwrap();
        card.mark_abs(5, 5).unwrap();
        assert!(card.read_status().contains(CardStatus::LASER_ENABLED));
        card.laser_disable().unwrap();
        assert!(!card.read_status().contains(CardStatus::LASER_ENABLED));
    }

    #[test]
    fn operations_on_unopened_card_fail() {
        let (card, _clock) = card();
        assert_eq!(
            card.set_start_list().unwrap_err().code,
            codes::NOT_OPENED
        );
    }
}
