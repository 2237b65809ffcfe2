//! Producer task: read layers, encode, push into the bounded queue.

use crate::control::ControlFlags;
use crate::fault::PipelineFault;
use crate::feed::Feed;
use crate::source::LayerSource;
use core_clock::Clock;
use core_geometry::encode;
use core_styles::StyleTable;
use core_units::Calibration;
use crossbeam_channel::{Sender, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) struct ProducerCtx {
    pub source: Box<dyn LayerSource>,
    pub styles: Arc<StyleTable>,
    pub calibration: Calibration,
    pub tx: Sender<Feed>,
    pub flags: Arc<ControlFlags>,
    pub clock: Arc<dyn Clock>,
    pub poll: Duration,
}

/// Thread body. Terminates the stream with exactly one `Finished` or
/// `Failed` marker unless stopped, in which case it exits silently — the
/// consumer observes the same flags.
pub(crate) fn run_producer(mut ctx: ProducerCtx) {
    let mut produced = 0u32;
    loop {
        if ctx.flags.stop_requested() {
            info!(target: "pipeline.producer", produced, "stopping on request");
            return;
        }
        match ctx.source.next_layer() {
            Ok(Some(layer)) => {
                let index = layer.index;
                match encode(&layer, &ctx.styles, &ctx.calibration) {
                    Ok(block) => {
                        debug!(
                            target: "pipeline.producer",
                            layer = index,
                            commands = block.commands.len(),
                            "block_encoded"
                        );
                        if !push(&mut ctx, Feed::Block(Box::new(block))) {
                            return;
                        }
                        produced += 1;
                    }
                    Err(e) => {
                        warn!(target: "pipeline.producer", layer = index, error = %e, "encode failed");
                        push(&mut ctx, Feed::Failed(e.into()));
                        return;
                    }
                }
            }
            Ok(None) => {
                info!(target: "pipeline.producer", produced, "source exhausted");
                push(&mut ctx, Feed::Finished);
                return;
            }
            Err(e) => {
                warn!(target: "pipeline.producer", error = %e, "source failed");
                push(
                    &mut ctx,
                    Feed::Failed(PipelineFault::Config {
                        detail: e.to_string(),
                    }),
                );
                return;
            }
        }
    }
}

/// Blocking push with back-pressure, honouring stop at every wait point.
/// Returns false when the push was abandoned.
fn push(ctx: &mut ProducerCtx, feed: Feed) -> bool {
    let mut feed = feed;
    loop {
        // Terminal markers still go out on stop so the consumer does not
        // wait for a block that will never come; only blocks are abandoned.
        if ctx.flags.stop_requested() && matches!(feed, Feed::Block(_)) {
            return false;
        }
        match ctx.tx.try_send(feed) {
            Ok(()) => return true,
            Err(TrySendError::Full(returned)) => {
                feed = returned;
                ctx.clock.sleep(ctx.poll);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(target: "pipeline.producer", "consumer gone, abandoning push");
                return false;
            }
        }
    }
}
