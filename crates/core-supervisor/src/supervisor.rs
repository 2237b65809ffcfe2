//! The supervisor thread.

use crate::command::OperatorCommand;
use crate::events::{FailureKind, JobEvent};
use crate::state::JobState;
use core_clock::Clock;
use core_config::Config;
use core_device::DeviceHandle;
use core_link::{ConnectOptions, LinkEvent, MachineLink, vars};
use core_pipeline::{
    LayerSource, MarcSource, MotionParams, PipelineEvent, PipelineOutcome, PipelineSpec,
    PipelineTimeouts, RunningPipeline, SyntheticSource, spawn as spawn_pipeline,
};
use core_scanner::ScannerSettings;
use core_slice::open_slice;
use core_styles::StyleTable;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// Everything the supervisor needs; assembled once at runtime bring-up.
pub struct SupervisorDeps {
    pub device: Arc<DeviceHandle>,
    pub link: Arc<MachineLink>,
    pub link_events: Receiver<LinkEvent>,
    pub clock: Arc<dyn Clock>,
    pub config: Config,
}

/// Owner-side handle: send commands, consume events, observe the state.
pub struct SupervisorHandle {
    commands: Sender<OperatorCommand>,
    events: Receiver<JobEvent>,
    state: Arc<Mutex<JobState>>,
    thread: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn start(&self, marc_path: impl Into<std::path::PathBuf>, style_table_path: impl Into<std::path::PathBuf>) {
        self.send(OperatorCommand::Start {
            marc_path: marc_path.into(),
            style_table_path: style_table_path.into(),
        });
    }

    pub fn start_test(&self, layer_thickness_mm: f32, layer_count: u32) {
        self.send(OperatorCommand::StartTest {
            layer_thickness_mm,
            layer_count,
        });
    }

    pub fn pause(&self) {
        self.send(OperatorCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(OperatorCommand::Resume);
    }

    pub fn stop(&self) {
        self.send(OperatorCommand::Stop);
    }

    pub fn emergency_stop(&self) {
        self.send(OperatorCommand::EmergencyStop);
    }

    pub fn events(&self) -> &Receiver<JobEvent> {
        &self.events
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().expect("supervisor state poisoned")
    }

    /// End the supervisor thread; stops any active job first.
    pub fn shutdown(mut self) {
        self.send(OperatorCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn send(&self, command: OperatorCommand) {
        if self.commands.send(command).is_err() {
            warn!(target: "supervisor", "command dropped, supervisor is gone");
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(OperatorCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub struct Supervisor;

impl Supervisor {
    pub fn spawn(deps: SupervisorDeps) -> SupervisorHandle {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let state = Arc::new(Mutex::new(JobState::Idle));
        let state_for_thread = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("job-supervisor".to_string())
            .spawn(move || {
                let mut inner = Inner {
                    deps,
                    commands: command_rx,
                    events: event_tx,
                    state: state_for_thread,
                    job: None,
                };
                if catch_unwind(AssertUnwindSafe(|| inner.run())).is_err() {
                    error!(target: "supervisor", "supervisor panicked");
                    inner.set_state(JobState::Failed);
                    let _ = inner.events.send(JobEvent::Failed {
                        kind: FailureKind::Internal,
                        detail: "supervisor panicked".to_string(),
                    });
                }
            })
            .expect("spawning the supervisor thread cannot fail at bring-up");
        SupervisorHandle {
            commands: command_tx,
            events: event_rx,
            state,
            thread: Some(thread),
        }
    }
}

struct ActiveJob {
    pipeline: RunningPipeline,
    events: Receiver<PipelineEvent>,
    total: u32,
}

/// Outcome of the startup sequence before the pipeline exists.
enum StartAbort {
    Fault(FailureKind, String),
    Stopped,
    Emergency,
    Shutdown,
}

struct Inner {
    deps: SupervisorDeps,
    commands: Receiver<OperatorCommand>,
    events: Sender<JobEvent>,
    state: Arc<Mutex<JobState>>,
    job: Option<ActiveJob>,
}

impl Inner {
    fn run(&mut self) {
        info!(target: "supervisor", "supervisor up");
        let tick = self.deps.config.file.timeouts.poll();
        loop {
            while let Ok(command) = self.commands.try_recv() {
                if !self.handle_command(command) {
                    self.teardown();
                    info!(target: "supervisor", "supervisor down");
                    return;
                }
            }
            self.forward_link_events();
            self.forward_pipeline_events();
            if self.job.as_ref().is_some_and(|j| j.pipeline.is_finished()) {
                self.finish_job();
            }
            self.deps.clock.sleep(tick);
        }
    }

    /// Returns false when the supervisor should exit.
    fn handle_command(&mut self, command: OperatorCommand) -> bool {
        let state = self.state();
        match command {
            OperatorCommand::Start {
                marc_path,
                style_table_path,
            } => {
                if !state.accepts_start() {
                    warn!(target: "supervisor", %state, "start ignored");
                    return true;
                }
                return self.begin(JobRequest::Slice {
                    marc_path,
                    style_table_path,
                });
            }
            OperatorCommand::StartTest {
                layer_thickness_mm,
                layer_count,
            } => {
                if !state.accepts_start() {
                    warn!(target: "supervisor", %state, "start_test ignored");
                    return true;
                }
                return self.begin(JobRequest::Synthetic {
                    layer_thickness_mm,
                    layer_count,
                });
            }
            OperatorCommand::Pause => {
                if state == JobState::Running
                    && let Some(job) = &self.job
                {
                    job.pipeline.set_paused(true);
                    self.set_state(JobState::Paused);
                    self.emit(JobEvent::Status("paused".to_string()));
                }
            }
            OperatorCommand::Resume => {
                if state == JobState::Paused
                    && let Some(job) = &self.job
                {
                    job.pipeline.set_paused(false);
                    self.set_state(JobState::Running);
                    self.emit(JobEvent::Status("resumed".to_string()));
                }
            }
            OperatorCommand::Stop => {
                if let Some(job) = &self.job {
                    self.set_state(JobState::Stopping);
                    job.pipeline.set_paused(false);
                    job.pipeline.request_stop();
                } else {
                    warn!(target: "supervisor", %state, "stop ignored, no active job");
                }
            }
            OperatorCommand::EmergencyStop => match &self.job {
                Some(job) => {
                    job.pipeline.set_paused(false);
                    job.pipeline.request_emergency();
                }
                None => {
                    self.set_state(JobState::EmergencyStopped);
                    self.emit(JobEvent::EmergencyStopped);
                }
            },
            OperatorCommand::Shutdown => return false,
        }
        true
    }

    /// Returns false when a shutdown arrived mid-start and the supervisor
    /// should exit.
    fn begin(&mut self, request: JobRequest) -> bool {
        self.set_state(JobState::Starting);
        self.emit(JobEvent::Status("starting".to_string()));
        match self.bring_up(request) {
            Ok(job) => {
                self.set_state(JobState::Running);
                self.job = Some(job);
            }
            Err(StartAbort::Fault(kind, detail)) => {
                warn!(target: "supervisor", %kind, detail, "start failed");
                self.set_state(JobState::Failed);
                self.emit(JobEvent::Failed { kind, detail });
            }
            Err(StartAbort::Stopped) => {
                self.set_state(JobState::Stopped);
                self.emit(JobEvent::Stopped);
            }
            Err(StartAbort::Emergency) => {
                self.set_state(JobState::EmergencyStopped);
                self.emit(JobEvent::EmergencyStopped);
            }
            Err(StartAbort::Shutdown) => {
                self.set_state(JobState::Stopped);
                self.emit(JobEvent::Stopped);
                return false;
            }
        }
        true
    }

    /// Load inputs, connect and handshake the PLC, spawn the pipeline.
    fn bring_up(&mut self, request: JobRequest) -> Result<ActiveJob, StartAbort> {
        let (source, styles) = self.load_inputs(request)?;

        let endpoint = self.deps.config.file.link.endpoint.clone();
        self.deps
            .link
            .connect(&endpoint, &ConnectOptions::default())
            .map_err(|e| StartAbort::Fault(FailureKind::Config, e.to_string()))?;

        self.machine_startup()?;
        self.emit(JobEvent::Status("machine ready".to_string()));

        let config = &self.deps.config.file;
        let scanner_settings = ScannerSettings {
            calibration: self.deps.config.calibration(),
            warmup_settle: config.scanner.warmup_settle(),
            warmup_timeout: config.scanner.warmup_timeout(),
            correction_table: self.load_correction()?,
            ..ScannerSettings::default()
        };
        let timeouts = PipelineTimeouts {
            prep: config.timeouts.prep(),
            exec: config.timeouts.exec(),
            shutdown: config.timeouts.shutdown(),
            poll: config.timeouts.poll(),
        };
        let motion = MotionParams {
            steps_per_mm_source: config.motion.steps_per_mm_source,
            steps_per_mm_sink: config.motion.steps_per_mm_sink,
        };
        let (pipeline, events) = spawn_pipeline(PipelineSpec {
            source,
            styles,
            device: Arc::clone(&self.deps.device),
            link: Arc::clone(&self.deps.link),
            clock: Arc::clone(&self.deps.clock),
            scanner_settings,
            timeouts,
            queue_capacity: config.pipeline.queue_capacity,
            motion,
        })
        .map_err(|fault| {
            StartAbort::Fault(FailureKind::from(&fault), fault.to_string())
        })?;
        let total = pipeline.total_layers().unwrap_or(0);
        Ok(ActiveJob {
            pipeline,
            events,
            total,
        })
    }

    fn load_inputs(
        &self,
        request: JobRequest,
    ) -> Result<(Box<dyn LayerSource>, Arc<StyleTable>), StartAbort> {
        match request {
            JobRequest::Slice {
                marc_path,
                style_table_path,
            } => {
                let styles = StyleTable::load_from(&style_table_path)
                    .map_err(|e| StartAbort::Fault(FailureKind::Config, e.to_string()))?;
                let (header, reader) = open_slice(&marc_path)
                    .map_err(|e| StartAbort::Fault(FailureKind::Config, e.to_string()))?;
                Ok((
                    Box::new(MarcSource::new(&header, reader)),
                    Arc::new(styles),
                ))
            }
            JobRequest::Synthetic {
                layer_thickness_mm,
                layer_count,
            } => Ok((
                Box::new(SyntheticSource::new(layer_thickness_mm, layer_count)),
                Arc::new(StyleTable::synthetic()),
            )),
        }
    }

    fn load_correction(&self) -> Result<Option<Vec<u8>>, StartAbort> {
        match &self.deps.config.file.scanner.correction_file {
            None => Ok(None),
            Some(path) => std::fs::read(path).map(Some).map_err(|e| {
                StartAbort::Fault(
                    FailureKind::Config,
                    format!("cannot read correction file {}: {e}", path.display()),
                )
            }),
        }
    }

    /// One-time PLC bring-up: `StartUp`/`StartUp_Done`, static motion
    /// parameters, then the initial surface via `StartSurfaces`.
    fn machine_startup(&mut self) -> Result<(), StartAbort> {
        let link = Arc::clone(&self.deps.link);
        let motion = self.deps.config.file.motion;

        self.link_write(|| link.write_bool(vars::START_UP, true))?;
        self.wait_plc_flag(vars::START_UP_DONE)?;
        self.link_write(|| link.write_bool(vars::START_UP, false))?;

        self.link_write(|| link.write_int(vars::Z_STACKS, motion.z_stacks))?;
        self.link_write(|| link.write_int(vars::DELTA_SOURCE, motion.delta_source))?;
        self.link_write(|| link.write_int(vars::DELTA_SINK, motion.delta_sink))?;

        self.link_write(|| link.write_bool(vars::START_SURFACES, true))?;
        self.wait_plc_flag(vars::MAKE_SURFACE_DONE)?;
        self.link_write(|| link.write_bool(vars::START_SURFACES, false))?;

        let source_position = self.read_position(vars::SOURCE_CYLINDER_POSITION)?;
        let sink_position = self.read_position(vars::SINK_CYLINDER_POSITION)?;
        info!(
            target: "supervisor",
            source_position,
            sink_position,
            "cylinders_at_start"
        );
        Ok(())
    }

    fn read_position(&self, name: &'static str) -> Result<i32, StartAbort> {
        self.deps
            .link
            .read_int(name)
            .map_err(|e| StartAbort::Fault(FailureKind::Disconnected, e.to_string()))
    }

    fn link_write(
        &self,
        f: impl FnOnce() -> Result<(), core_link::LinkError>,
    ) -> Result<(), StartAbort> {
        f().map_err(|e| match e {
            core_link::LinkError::Disconnected => {
                StartAbort::Fault(FailureKind::Disconnected, e.to_string())
            }
            other => StartAbort::Fault(FailureKind::Config, other.to_string()),
        })
    }

    /// Poll a PLC done-flag under the startup ceiling, aborting on operator
    /// stop/emergency commands received meanwhile.
    fn wait_plc_flag(&mut self, name: &'static str) -> Result<(), StartAbort> {
        let timeouts = self.deps.config.file.timeouts;
        let deadline = self.deps.clock.now() + timeouts.startup();
        loop {
            match self.commands.try_recv() {
                Ok(OperatorCommand::Stop) => return Err(StartAbort::Stopped),
                Ok(OperatorCommand::EmergencyStop) => return Err(StartAbort::Emergency),
                Ok(OperatorCommand::Shutdown) => return Err(StartAbort::Shutdown),
                Ok(other) => {
                    warn!(target: "supervisor", ?other, "command ignored during startup")
                }
                Err(_) => {}
            }
            match self.deps.link.read_bool(name) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    return Err(StartAbort::Fault(FailureKind::Disconnected, e.to_string()));
                }
            }
            if self.deps.clock.now() >= deadline {
                return Err(StartAbort::Fault(
                    FailureKind::Timeout(core_pipeline::TimeoutKind::Prep),
                    format!("{name} never reported ready"),
                ));
            }
            self.deps.clock.sleep(timeouts.poll());
        }
    }

    fn forward_link_events(&mut self) {
        while let Ok(event) = self.deps.link_events.try_recv() {
            match event {
                LinkEvent::ConnectionLost => {
                    warn!(target: "supervisor", "machine link lost");
                    self.emit(JobEvent::ConnectionLost);
                }
            }
        }
    }

    fn forward_pipeline_events(&mut self) {
        let Some(job) = &self.job else { return };
        let total = job.total;
        let mut forwarded = Vec::new();
        while let Ok(event) = job.events.try_recv() {
            forwarded.push(event);
        }
        for event in forwarded {
            match event {
                PipelineEvent::LayerCompleted { index } => {
                    self.emit(JobEvent::LayerCompleted { index });
                    self.emit(JobEvent::Progress {
                        current: index + 1,
                        total,
                    });
                }
            }
        }
    }

    /// The pipeline threads have exited; collect the outcome and settle the
    /// terminal state.
    fn finish_job(&mut self) {
        let Some(job) = self.job.take() else { return };
        // Drain any completions that raced the exit.
        let total = job.total;
        while let Ok(PipelineEvent::LayerCompleted { index }) = job.events.try_recv() {
            self.emit(JobEvent::LayerCompleted { index });
            self.emit(JobEvent::Progress {
                current: index + 1,
                total,
            });
        }
        // One more link-event sweep so ConnectionLost precedes the terminal
        // event in the stream the operator sees.
        self.forward_link_events();

        let outcome = job.pipeline.join();
        info!(target: "supervisor", outcome = ?outcome, "job finished");
        match outcome {
            PipelineOutcome::Completed => {
                self.set_state(JobState::Stopping);
                self.set_state(JobState::Stopped);
                self.emit(JobEvent::Finished);
            }
            PipelineOutcome::Stopped => {
                self.set_state(JobState::Stopped);
                self.emit(JobEvent::Stopped);
            }
            PipelineOutcome::EmergencyStopped => {
                self.set_state(JobState::EmergencyStopped);
                self.emit(JobEvent::EmergencyStopped);
            }
            PipelineOutcome::Failed(fault) => {
                self.set_state(JobState::Failed);
                self.emit(JobEvent::Failed {
                    kind: FailureKind::from(&fault),
                    detail: fault.to_string(),
                });
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(job) = &self.job {
            job.pipeline.set_paused(false);
            job.pipeline.request_stop();
        }
        if self.job.is_some() {
            self.finish_job();
        }
        self.deps.link.disconnect();
    }

    fn state(&self) -> JobState {
        *self.state.lock().expect("supervisor state poisoned")
    }

    fn set_state(&self, new: JobState) {
        let mut state = self.state.lock().expect("supervisor state poisoned");
        if *state != new {
            info!(target: "supervisor", from = %*state, to = %new, "state");
            *state = new;
        }
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }
}

enum JobRequest {
    Slice {
        marc_path: std::path::PathBuf,
        style_table_path: std::path::PathBuf,
    },
    Synthetic {
        layer_thickness_mm: f32,
        layer_count: u32,
    },
}
