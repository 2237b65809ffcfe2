//! Consumer task: the sole owner of the scanner, and the site of the
//! per-layer PLC handshake.
//!
//! For each block: request the recoat, wait for the PLC ready signal, check
//! emergency, stream the commands and execute the list, wait for idle, then
//! — laser already off — ack the PLC strictly after idle, re-arm the gate
//! and reset the list. Every wait point observes the stop and emergency
//! flags; stop finishes the current layer, emergency kills the laser and
//! aborts immediately.

use crate::control::{ControlFlags, PauseGate, ReadyGate};
use crate::fault::{PipelineFault, TimeoutKind};
use crate::feed::Feed;
use crate::{MotionParams, PipelineEvent, PipelineTimeouts};
use core_clock::Clock;
use core_device::DeviceHandle;
use core_geometry::{Command, CommandBlock};
use core_link::{MachineLink, vars};
use core_scanner::{ScanError, Scanner, ScannerSettings};
use core_styles::StyleTable;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How the consumer (and therefore the job's streaming phase) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every layer executed; the source was exhausted.
    Completed,
    /// Cooperative stop between layers.
    Stopped,
    /// Pre-emptive abort; the laser was forced off.
    EmergencyStopped,
    Failed(PipelineFault),
}

pub(crate) struct ConsumerCtx {
    pub rx: Receiver<Feed>,
    pub styles: Arc<StyleTable>,
    pub link: Arc<MachineLink>,
    pub clock: Arc<dyn Clock>,
    pub flags: Arc<ControlFlags>,
    pub ready: Arc<ReadyGate>,
    pub pause: Arc<PauseGate>,
    pub timeouts: PipelineTimeouts,
    pub motion: MotionParams,
    pub events: Sender<PipelineEvent>,
}

/// Why one block's execution did not complete.
enum BlockAbort {
    Stopped,
    Emergency,
    Fault(PipelineFault),
}

impl From<LinkAbort> for BlockAbort {
    fn from(a: LinkAbort) -> Self {
        BlockAbort::Fault(a.0)
    }
}

/// Newtype so `?` on link calls converts into a fault abort.
struct LinkAbort(PipelineFault);

impl From<core_link::LinkError> for LinkAbort {
    fn from(e: core_link::LinkError) -> Self {
        LinkAbort(e.into())
    }
}

impl From<ScanError> for BlockAbort {
    fn from(e: ScanError) -> Self {
        BlockAbort::Fault(e.into())
    }
}

/// Thread body. Constructs the scanner, drains the queue, guarantees the
/// scanner is shut down (laser off, device released) on every exit path.
pub(crate) fn run_consumer(
    ctx: ConsumerCtx,
    device: Arc<DeviceHandle>,
    settings: ScannerSettings,
) -> PipelineOutcome {
    let mut scanner = Scanner::new(Arc::clone(&ctx.clock), settings);
    if let Err(e) = scanner.initialise(&device) {
        warn!(target: "pipeline.consumer", error = %e, "scanner initialise failed");
        return PipelineOutcome::Failed(e.into());
    }
    let outcome = consume(&mut scanner, &ctx);
    scanner.shutdown();
    info!(target: "pipeline.consumer", outcome = ?outcome, "consumer exit");
    outcome
}

fn consume(scanner: &mut Scanner, ctx: &ConsumerCtx) -> PipelineOutcome {
    loop {
        // Pause parks here, strictly between layers, on its own gate.
        while ctx.pause.is_paused() {
            if ctx.flags.emergency_requested() {
                return emergency_abort(scanner, ctx);
            }
            if ctx.flags.stop_requested() {
                return PipelineOutcome::Stopped;
            }
            ctx.clock.sleep(ctx.timeouts.poll);
        }
        if ctx.flags.emergency_requested() {
            return emergency_abort(scanner, ctx);
        }
        if ctx.flags.stop_requested() {
            return PipelineOutcome::Stopped;
        }

        let feed = match ctx.rx.try_recv() {
            Ok(feed) => feed,
            Err(TryRecvError::Empty) => {
                ctx.clock.sleep(ctx.timeouts.poll);
                continue;
            }
            Err(TryRecvError::Disconnected) => {
                // The producer must end the stream with a marker; a bare
                // disconnect means it died unexpectedly.
                return PipelineOutcome::Failed(PipelineFault::Internal {
                    detail: "layer stream closed without a terminal marker".to_string(),
                });
            }
        };

        match feed {
            Feed::Finished => return PipelineOutcome::Completed,
            Feed::Failed(fault) => return PipelineOutcome::Failed(fault),
            Feed::Block(block) => match execute_block(scanner, ctx, &block) {
                Ok(()) => {
                    let _ = ctx.events.send(PipelineEvent::LayerCompleted {
                        index: block.layer_index,
                    });
                }
                Err(BlockAbort::Stopped) => {
                    // The recoat may still be requested; withdraw it.
                    let _ = ctx.link.write_bool(vars::LAY_SURFACE, false);
                    ctx.ready.clear();
                    return PipelineOutcome::Stopped;
                }
                Err(BlockAbort::Emergency) => return emergency_abort(scanner, ctx),
                Err(BlockAbort::Fault(fault)) => {
                    safe_park(scanner);
                    return PipelineOutcome::Failed(fault);
                }
            },
        }
    }
}

/// The per-layer protocol.
fn execute_block(
    scanner: &mut Scanner,
    ctx: &ConsumerCtx,
    block: &CommandBlock,
) -> Result<(), BlockAbort> {
    let index = block.layer_index;
    debug!(target: "pipeline.consumer", layer = index, "layer_begin");

    // 1. Ask the PLC to recoat and position the platform for this layer.
    request_surface(ctx, block).map_err(BlockAbort::from)?;

    // 2. Wait for the ready signal, bounded by the preparation ceiling.
    let deadline = ctx.clock.now() + ctx.timeouts.prep;
    loop {
        if ctx.flags.emergency_requested() {
            return Err(BlockAbort::Emergency);
        }
        if ctx.flags.stop_requested() {
            return Err(BlockAbort::Stopped);
        }
        if ctx.ready.is_set() {
            break;
        }
        match ctx.link.read_bool(vars::LAY_SURFACE_DONE) {
            Ok(true) => {
                ctx.ready.set();
                break;
            }
            Ok(false) => {}
            Err(e) => return Err(BlockAbort::Fault(e.into())),
        }
        if ctx.clock.now() >= deadline {
            warn!(target: "pipeline.consumer", layer = index, "surface preparation timed out");
            return Err(BlockAbort::Fault(PipelineFault::Timeout {
                what: TimeoutKind::Prep,
            }));
        }
        ctx.clock.sleep(ctx.timeouts.poll);
    }

    // 3. Last pre-exposure emergency check: no laser fire past this point
    // unless the surface is ready and nobody pulled the stop.
    if ctx.flags.emergency_requested() {
        return Err(BlockAbort::Emergency);
    }

    // 4. Stream the commands and run the list. An empty block (a layer with
    // no geometry) still gets its recoat cycle but skips the scanner.
    if !block.is_empty() {
        let exec_deadline = ctx.clock.now() + ctx.timeouts.exec;
        for command in &block.commands {
            if ctx.clock.now() >= exec_deadline {
                return Err(BlockAbort::Fault(PipelineFault::Timeout {
                    what: TimeoutKind::Exec,
                }));
            }
            match *command {
                Command::SetStyle { style_id } => {
                    let style = ctx.styles.get(style_id).ok_or_else(|| {
                        BlockAbort::Fault(PipelineFault::Config {
                            detail: format!("layer {index} references unknown style {style_id}"),
                        })
                    })?;
                    scanner.set_style(style)?;
                }
                Command::Jump { to } => scanner.jump_to(to)?,
                Command::Mark { to } => scanner.mark_to(to)?,
            }
        }
        scanner.execute_list()?;

        // Poll to idle in short slices so emergency pre-empts a long layer.
        loop {
            if ctx.flags.emergency_requested() {
                return Err(BlockAbort::Emergency);
            }
            let now = ctx.clock.now();
            let slice_end = (now + ctx.timeouts.poll).min(exec_deadline);
            match scanner.wait_for_idle(slice_end) {
                Ok(()) => break,
                Err(ScanError::Timeout { .. }) if ctx.clock.now() < exec_deadline => continue,
                Err(ScanError::Timeout { .. }) => {
                    warn!(target: "pipeline.consumer", layer = index, "card stuck busy");
                    safe_park(scanner);
                    return Err(BlockAbort::Fault(PipelineFault::Timeout {
                        what: TimeoutKind::Idle,
                    }));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // 6-before-5: force the laser off before anything else happens. The list
    // itself ends laser-off; this is the independent second path.
    scanner.disable_laser()?;

    // 5. Ack strictly after idle: the PLC may now start the next cycle.
    ctx.link
        .write_bool(vars::LAY_SURFACE, false)
        .map_err(LinkAbort::from)?;
    ctx.ready.clear();

    // 6. Fresh list for the next layer.
    scanner.reset_list()?;

    debug!(target: "pipeline.consumer", layer = index, "layer_done");
    Ok(())
}

/// Step 1 writes: per-layer motion parameters, then the recoat request.
fn request_surface(ctx: &ConsumerCtx, block: &CommandBlock) -> Result<(), LinkAbort> {
    let steps_source =
        (block.layer_height * ctx.motion.steps_per_mm_source).round() as i32;
    let steps_sink = (block.layer_height * ctx.motion.steps_per_mm_sink).round() as i32;
    ctx.link
        .write_int(vars::LAY_STACKS, block.layer_index as i32)?;
    ctx.link.write_int(vars::STEP_SOURCE, steps_source)?;
    ctx.link.write_int(vars::STEP_SINK, steps_sink)?;
    ctx.link.write_bool(vars::LAY_SURFACE, true)?;
    Ok(())
}

/// Emergency path: laser off first, everything else best effort.
fn emergency_abort(scanner: &mut Scanner, ctx: &ConsumerCtx) -> PipelineOutcome {
    warn!(target: "pipeline.consumer", "emergency stop");
    let _ = scanner.disable_laser();
    let _ = scanner.reset_list();
    let _ = ctx.link.write_bool(vars::LAY_SURFACE, false);
    ctx.ready.clear();
    PipelineOutcome::EmergencyStopped
}

/// Best-effort quiesce before reporting a fault.
fn safe_park(scanner: &mut Scanner) {
    let _ = scanner.disable_laser();
    let _ = scanner.reset_list();
}
