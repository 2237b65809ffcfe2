//! Scripted in-process PLC.
//!
//! Models the recoater handshake against the injected clock: a `LaySurface`
//! request makes `LaySurface_Done` read true one configurable delay later,
//! and the false-write ack re-arms the cycle. Fault injection covers
//! transient faults, hard connection loss and scripted loss after N
//! completed layers. Every write is recorded with its clock instant so tests
//! can assert handshake ordering.

use crate::client::{ConnectOptions, FaultKind, PlcClient, PlcValue, TransportFault};
use crate::vars;
use core_clock::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

/// One recorded variable write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub at: Instant,
    pub name: String,
    pub value: PlcValue,
}

#[derive(Debug)]
struct SimShared {
    connected: bool,
    vars: HashMap<String, PlcValue>,
    writes: Vec<WriteRecord>,
    call_count: u64,
    // handshake script
    ready_delay: Duration,
    startup_delay: Duration,
    never_ready: bool,
    lay_requested_at: Option<Instant>,
    startup_requested_at: Option<Instant>,
    surfaces_requested_at: Option<Instant>,
    acks: u32,
    source_position: i32,
    sink_position: i32,
    // fault injection
    transient_remaining: u32,
    fail_all: Option<FaultKind>,
    fail_after_acks: Option<u32>,
    refuse_connect: Option<FaultKind>,
}

impl Default for SimShared {
    fn default() -> Self {
        Self {
            connected: false,
            vars: HashMap::new(),
            writes: Vec::new(),
            call_count: 0,
            ready_delay: Duration::from_millis(100),
            startup_delay: Duration::from_millis(100),
            never_ready: false,
            lay_requested_at: None,
            startup_requested_at: None,
            surfaces_requested_at: None,
            acks: 0,
            source_position: 0,
            sink_position: 0,
            transient_remaining: 0,
            fail_all: None,
            fail_after_acks: None,
            refuse_connect: None,
        }
    }
}

/// Cloneable handle; all clones share one PLC state. Box one clone into the
/// link and keep another for scripting and assertions.
#[derive(Clone)]
pub struct SimPlc {
    clock: Arc<dyn Clock>,
    shared: Arc<Mutex<SimShared>>,
}

impl SimPlc {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            shared: Arc::new(Mutex::new(SimShared::default())),
        }
    }

    // ---- scripting -------------------------------------------------------

    /// Delay between a `LaySurface`/`StartSurfaces` request and its done
    /// flag reading true.
    pub fn set_ready_delay(&self, delay: Duration) {
        self.shared.lock().unwrap().ready_delay = delay;
    }

    pub fn set_startup_delay(&self, delay: Duration) {
        self.shared.lock().unwrap().startup_delay = delay;
    }

    /// The recoater never reports `LaySurface_Done`; startup flags are
    /// unaffected.
    pub fn set_never_ready(&self, never: bool) {
        self.shared.lock().unwrap().never_ready = never;
    }

    /// Fail the next `n` calls with a transient fault.
    pub fn inject_transient_faults(&self, n: u32) {
        self.shared.lock().unwrap().transient_remaining = n;
    }

    /// Every subsequent call fails with `kind`.
    pub fn fail_everything(&self, kind: FaultKind) {
        self.shared.lock().unwrap().fail_all = Some(kind);
    }

    /// Hard-lose the connection after `n` completed recoat acks
    /// (`LaySurface = false` writes).
    pub fn fail_after_acks(&self, n: u32) {
        self.shared.lock().unwrap().fail_after_acks = Some(n);
    }

    pub fn refuse_connect(&self, kind: FaultKind) {
        self.shared.lock().unwrap().refuse_connect = Some(kind);
    }

    /// Clear all fault injection.
    pub fn heal(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.transient_remaining = 0;
        shared.fail_all = None;
        shared.fail_after_acks = None;
        shared.refuse_connect = None;
    }

    // ---- assertions ------------------------------------------------------

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.shared.lock().unwrap().writes.clone()
    }

    /// All writes of one boolean variable, in order.
    pub fn bool_writes(&self, name: &str) -> Vec<(Instant, bool)> {
        self.shared
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter_map(|w| match w.value {
                PlcValue::Bool(v) if w.name == name => Some((w.at, v)),
                _ => None,
            })
            .collect()
    }

    pub fn bool_var(&self, name: &str) -> Option<bool> {
        match self.shared.lock().unwrap().vars.get(name) {
            Some(PlcValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn int_var(&self, name: &str) -> Option<i32> {
        match self.shared.lock().unwrap().vars.get(name) {
            Some(PlcValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Calls that reached the client (including injected failures).
    pub fn call_count(&self) -> u64 {
        self.shared.lock().unwrap().call_count
    }

    // ---- internals -------------------------------------------------------

    fn gate(&self, shared: &mut SimShared) -> Result<(), TransportFault> {
        shared.call_count += 1;
        if !shared.connected {
            return Err(TransportFault::new(
                FaultKind::ConnectionLost,
                "session is not established",
            ));
        }
        if shared.transient_remaining > 0 {
            shared.transient_remaining -= 1;
            return Err(TransportFault::new(
                FaultKind::Transient,
                "injected transient fault",
            ));
        }
        if let Some(kind) = shared.fail_all {
            return Err(TransportFault::new(kind, "injected persistent fault"));
        }
        Ok(())
    }

    fn current_int(shared: &SimShared, name: &str) -> i32 {
        match shared.vars.get(name) {
            Some(PlcValue::Int(v)) => *v,
            _ => 0,
        }
    }
}

impl PlcClient for SimPlc {
    fn connect(&mut self, endpoint: &str, options: &ConnectOptions) -> Result<(), TransportFault> {
        let mut shared = self.shared.lock().unwrap();
        shared.call_count += 1;
        if let Some(kind) = shared.refuse_connect {
            return Err(TransportFault::new(kind, "injected connect refusal"));
        }
        if endpoint.is_empty() {
            return Err(TransportFault::new(FaultKind::Protocol, "empty endpoint"));
        }
        trace!(
            target: "link.sim",
            endpoint,
            namespace = options.namespace_uri.as_str(),
            "sim_connected"
        );
        shared.connected = true;
        Ok(())
    }

    fn read_int(&mut self, name: &str) -> Result<i32, TransportFault> {
        let mut shared = self.shared.lock().unwrap();
        self.gate(&mut shared)?;
        Ok(match name {
            vars::SOURCE_CYLINDER_POSITION => shared.source_position,
            vars::SINK_CYLINDER_POSITION => shared.sink_position,
            other => Self::current_int(&shared, other),
        })
    }

    fn read_bool(&mut self, name: &str) -> Result<bool, TransportFault> {
        let mut shared = self.shared.lock().unwrap();
        self.gate(&mut shared)?;
        let now = self.clock.now();
        let done = |requested: Option<Instant>, delay: Duration| {
            requested.is_some_and(|t| now >= t + delay)
        };
        Ok(match name {
            vars::LAY_SURFACE_DONE => {
                !shared.never_ready && done(shared.lay_requested_at, shared.ready_delay)
            }
            vars::START_UP_DONE => done(shared.startup_requested_at, shared.startup_delay),
            vars::MAKE_SURFACE_DONE => done(shared.surfaces_requested_at, shared.ready_delay),
            other => matches!(shared.vars.get(other), Some(PlcValue::Bool(true))),
        })
    }

    fn write_int(&mut self, name: &str, value: i32) -> Result<(), TransportFault> {
        let mut shared = self.shared.lock().unwrap();
        self.gate(&mut shared)?;
        let at = self.clock.now();
        shared.writes.push(WriteRecord {
            at,
            name: name.to_string(),
            value: PlcValue::Int(value),
        });
        shared.vars.insert(name.to_string(), PlcValue::Int(value));
        Ok(())
    }

    fn write_bool(&mut self, name: &str, value: bool) -> Result<(), TransportFault> {
        let mut shared = self.shared.lock().unwrap();
        self.gate(&mut shared)?;
        let at = self.clock.now();
        shared.writes.push(WriteRecord {
            at,
            name: name.to_string(),
            value: PlcValue::Bool(value),
        });
        shared.vars.insert(name.to_string(), PlcValue::Bool(value));
        match (name, value) {
            (vars::LAY_SURFACE, true) => {
                shared.lay_requested_at = Some(at);
                // The recoat consumes powder and lowers the platform.
                let step_source = Self::current_int(&shared, vars::STEP_SOURCE);
                let step_sink = Self::current_int(&shared, vars::STEP_SINK);
                shared.source_position += step_source;
                shared.sink_position += step_sink;
            }
            (vars::LAY_SURFACE, false) => {
                shared.lay_requested_at = None;
                shared.acks += 1;
                if shared.fail_after_acks == Some(shared.acks) {
                    shared.fail_all = Some(FaultKind::ConnectionLost);
                }
            }
            (vars::START_UP, true) => shared.startup_requested_at = Some(at),
            (vars::START_UP, false) => shared.startup_requested_at = None,
            (vars::START_SURFACES, true) => shared.surfaces_requested_at = Some(at),
            (vars::START_SURFACES, false) => shared.surfaces_requested_at = None,
            _ => {}
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.connected = false;
    }
}
