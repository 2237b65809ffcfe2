//! Commands accepted from the operator surface.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    /// Build the job described by a slice file and a style table.
    Start {
        marc_path: PathBuf,
        style_table_path: PathBuf,
    },
    /// Run the synthetic laser-off test pattern.
    StartTest {
        layer_thickness_mm: f32,
        layer_count: u32,
    },
    /// Park the consumer between layers.
    Pause,
    Resume,
    /// Cooperative stop: finish the current layer, then end the job.
    Stop,
    /// Pre-emptive abort: laser off, no further geometry.
    EmergencyStop,
    /// End the supervisor thread itself (stops any active job first).
    Shutdown,
}
