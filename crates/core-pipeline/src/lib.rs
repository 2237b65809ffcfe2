//! The streaming engine: bounded producer/consumer plus the PLC handshake.
//!
//! Two OS threads per job. The producer reads and encodes layers into a
//! bounded FIFO (back-pressure bounds memory to `capacity × block size`);
//! the consumer owns the scanner — created inside the thread, never escaping
//! it — and executes one block per recoat cycle. Strict FIFO, strict layer
//! order, no reordering. Cancellation is cooperative via [`ControlFlags`];
//! emergency stop pre-empts with a laser-off.

use crossbeam_channel::{Receiver, bounded, unbounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

mod consumer;
mod control;
mod fault;
mod feed;
mod producer;
mod source;

pub use consumer::PipelineOutcome;
pub use control::{ControlFlags, PauseGate, ReadyGate};
pub use fault::{PipelineFault, TimeoutKind};
pub use feed::Feed;
pub use source::{LayerSource, MarcSource, SourceError, SyntheticSource};

use consumer::ConsumerCtx;
use core_clock::Clock;
use core_device::DeviceHandle;
use core_link::MachineLink;
use core_scanner::ScannerSettings;
use core_styles::StyleTable;
use producer::ProducerCtx;

/// Progress notifications emitted while a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    LayerCompleted { index: u32 },
}

/// Named ceilings and the shared poll interval.
#[derive(Debug, Clone, Copy)]
pub struct PipelineTimeouts {
    /// Ceiling on one surface-preparation cycle.
    pub prep: Duration,
    /// Ceiling on streaming plus executing one layer.
    pub exec: Duration,
    /// Ceiling on an orderly shutdown; overrun is reported, not enforced.
    pub shutdown: Duration,
    /// Poll interval for every suspension point.
    pub poll: Duration,
}

impl Default for PipelineTimeouts {
    fn default() -> Self {
        Self {
            prep: Duration::from_secs(60),
            exec: Duration::from_secs(5),
            shutdown: Duration::from_secs(10),
            poll: Duration::from_millis(5),
        }
    }
}

/// Platform motion scaling for the per-layer PLC writes.
#[derive(Debug, Clone, Copy)]
pub struct MotionParams {
    pub steps_per_mm_source: f32,
    pub steps_per_mm_sink: f32,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            steps_per_mm_source: 800.0,
            steps_per_mm_sink: 800.0,
        }
    }
}

/// Everything a job's streaming phase needs.
pub struct PipelineSpec {
    pub source: Box<dyn LayerSource>,
    pub styles: Arc<StyleTable>,
    pub device: Arc<DeviceHandle>,
    pub link: Arc<MachineLink>,
    pub clock: Arc<dyn Clock>,
    pub scanner_settings: ScannerSettings,
    pub timeouts: PipelineTimeouts,
    pub queue_capacity: usize,
    pub motion: MotionParams,
}

/// Handle to the two running worker threads of one job.
pub struct RunningPipeline {
    flags: Arc<ControlFlags>,
    ready: Arc<ReadyGate>,
    pause: Arc<PauseGate>,
    clock: Arc<dyn Clock>,
    timeouts: PipelineTimeouts,
    total_layers: Option<u32>,
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<PipelineOutcome>>,
}

/// Spawn producer and consumer for one job. Returns the pipeline handle and
/// the event stream.
pub fn spawn(
    spec: PipelineSpec,
) -> Result<(RunningPipeline, Receiver<PipelineEvent>), PipelineFault> {
    let PipelineSpec {
        source,
        styles,
        device,
        link,
        clock,
        scanner_settings,
        timeouts,
        queue_capacity,
        motion,
    } = spec;

    let flags = ControlFlags::new();
    let ready = ReadyGate::new();
    let pause = PauseGate::new();
    let (feed_tx, feed_rx) = bounded(queue_capacity.max(1));
    let (event_tx, event_rx) = unbounded();
    let total_layers = source.total_layers();

    let producer_ctx = ProducerCtx {
        source,
        styles: Arc::clone(&styles),
        calibration: scanner_settings.calibration,
        tx: feed_tx,
        flags: Arc::clone(&flags),
        clock: Arc::clone(&clock),
        poll: timeouts.poll,
    };
    let producer = std::thread::Builder::new()
        .name("layer-producer".to_string())
        .spawn(move || {
            let panic_tx = producer_ctx.tx.clone();
            if let Err(payload) =
                catch_unwind(AssertUnwindSafe(|| producer::run_producer(producer_ctx)))
            {
                error!(target: "pipeline.producer", "producer panicked");
                let _ = panic_tx.send(Feed::Failed(PipelineFault::Internal {
                    detail: panic_detail(payload),
                }));
            }
        })
        .map_err(|e| PipelineFault::Internal {
            detail: format!("cannot spawn producer thread: {e}"),
        })?;

    let consumer_ctx = ConsumerCtx {
        rx: feed_rx,
        styles,
        link,
        clock: Arc::clone(&clock),
        flags: Arc::clone(&flags),
        ready: Arc::clone(&ready),
        pause: Arc::clone(&pause),
        timeouts,
        motion,
        events: event_tx,
    };
    let consumer = std::thread::Builder::new()
        .name("layer-consumer".to_string())
        .spawn(move || {
            catch_unwind(AssertUnwindSafe(|| {
                consumer::run_consumer(consumer_ctx, device, scanner_settings)
            }))
            .unwrap_or_else(|payload| {
                // The scanner lives on this thread's stack; its drop already
                // ran during unwind, releasing laser and device.
                error!(target: "pipeline.consumer", "consumer panicked");
                PipelineOutcome::Failed(PipelineFault::Internal {
                    detail: panic_detail(payload),
                })
            })
        })
        .map_err(|e| {
            flags.request_stop();
            PipelineFault::Internal {
                detail: format!("cannot spawn consumer thread: {e}"),
            }
        })?;

    info!(
        target: "pipeline",
        capacity = queue_capacity.max(1),
        total_layers,
        "pipeline_started"
    );
    Ok((
        RunningPipeline {
            flags,
            ready,
            pause,
            clock,
            timeouts,
            total_layers,
            producer: Some(producer),
            consumer: Some(consumer),
        },
        event_rx,
    ))
}

fn panic_detail(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

impl RunningPipeline {
    /// Cooperative stop; workers exit at their next wait point.
    pub fn request_stop(&self) {
        self.flags.request_stop();
    }

    /// Pre-emptive abort; the consumer forces the laser off.
    pub fn request_emergency(&self) {
        self.flags.request_emergency();
    }

    /// Park/unpark the consumer between layers.
    pub fn set_paused(&self, paused: bool) {
        self.pause.set_paused(paused);
    }

    /// External "PLC is ready" notification (normally the consumer polls the
    /// link itself; the supervisor may also set this).
    pub fn notify_ready(&self) {
        self.ready.set();
    }

    pub fn total_layers(&self) -> Option<u32> {
        self.total_layers
    }

    /// Both workers have exited; `join` will not block.
    pub fn is_finished(&self) -> bool {
        self.producer.as_ref().is_none_or(|h| h.is_finished())
            && self.consumer.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Join producer first, then consumer. The shutdown ceiling bounds the
    /// *reported* wait: overrunning it logs a warning but joining continues,
    /// because every wait point observes the stop flag and the workers must
    /// eventually exit.
    pub fn join(mut self) -> PipelineOutcome {
        let deadline = self.clock.now() + self.timeouts.shutdown;
        let mut overrun_reported = false;
        loop {
            let producer_done = self.producer.as_ref().is_none_or(|h| h.is_finished());
            let consumer_done = self.consumer.as_ref().is_none_or(|h| h.is_finished());
            if producer_done && consumer_done {
                break;
            }
            if !overrun_reported && self.clock.now() >= deadline {
                warn!(
                    target: "pipeline",
                    ceiling_ms = self.timeouts.shutdown.as_millis() as u64,
                    "shutdown ceiling exceeded, still joining"
                );
                overrun_reported = true;
            }
            self.clock.sleep(self.timeouts.poll);
        }

        if let Some(producer) = self.producer.take() {
            if producer.join().is_err() {
                // Producer panics already surfaced through the feed.
                error!(target: "pipeline", "producer join reported a panic");
            }
        }
        match self.consumer.take() {
            Some(consumer) => consumer.join().unwrap_or_else(|_| {
                PipelineOutcome::Failed(PipelineFault::Internal {
                    detail: "consumer thread died".to_string(),
                })
            }),
            None => PipelineOutcome::Failed(PipelineFault::Internal {
                detail: "consumer already joined".to_string(),
            }),
        }
    }
}

impl Drop for RunningPipeline {
    fn drop(&mut self) {
        // Safety net for paths that never called `join`: ask the workers to
        // stop and wait for them so no thread outlives the job.
        if self.producer.is_some() || self.consumer.is_some() {
            self.flags.request_stop();
            if let Some(h) = self.producer.take() {
                let _ = h.join();
            }
            if let Some(h) = self.consumer.take() {
                let _ = h.join();
            }
        }
    }
}
