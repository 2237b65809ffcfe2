//! The bounded producer → consumer stream.

use crate::fault::PipelineFault;
use core_geometry::CommandBlock;

/// One queue element. Ownership of a block transfers producer → queue →
/// consumer; the stream ends with exactly one terminal marker.
#[derive(Debug)]
pub enum Feed {
    Block(Box<CommandBlock>),
    /// Source exhausted cleanly; all preceding blocks are valid.
    Finished,
    /// Producer-side fatal error; the job must fail.
    Failed(PipelineFault),
}
