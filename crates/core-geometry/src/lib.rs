//! Layer geometry model and the command blocks handed to the scanner worker.
//!
//! A [`Layer`] is what the slice stream produces: hatch runs, polylines and
//! polygons, each referencing a build style by id. A [`CommandBlock`] is what
//! the consumer executes: the flat, ordered list of style changes, jumps and
//! marks for exactly one layer. The transform between the two lives in
//! [`encoder`].

use core_units::{MmPoint, Point};

pub mod encoder;

pub use encoder::{EncodeError, encode};

/// Whether a segment moves with the laser off (`Jump`) or on (`Mark`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Jump,
    Mark,
}

/// One drawable element in millimetre space. Segments are the encoder's
/// flattened intermediate between layer geometry and device commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub from: MmPoint,
    pub to: MmPoint,
    pub style_id: u32,
}

/// A run of disjoint mark lines sharing one style, typically the infill of a
/// contiguous region.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HatchRun {
    pub style_id: u32,
    pub lines: Vec<HatchLine>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HatchLine {
    pub start: MmPoint,
    pub end: MmPoint,
}

/// Open vertex chain drawn as connected marks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Polyline {
    pub style_id: u32,
    pub vertices: Vec<MmPoint>,
}

/// Closed vertex chain; the encoder closes it back to the first vertex.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Polygon {
    pub style_id: u32,
    pub vertices: Vec<MmPoint>,
}

/// One horizontal slice of the build. Layers arrive in strictly ascending
/// index order starting at 0; geometry is drawn hatches first, then
/// polylines, then polygons.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Layer {
    pub index: u32,
    pub height: f32,
    pub hatches: Vec<HatchRun>,
    pub polylines: Vec<Polyline>,
    pub polygons: Vec<Polygon>,
}

impl Layer {
    pub fn is_empty(&self) -> bool {
        self.hatches.iter().all(|h| h.lines.is_empty())
            && self.polylines.iter().all(|p| p.vertices.is_empty())
            && self.polygons.iter().all(|p| p.vertices.is_empty())
    }

    /// Number of geometry records (not segments) in the layer.
    pub fn geometry_count(&self) -> usize {
        self.hatches.len() + self.polylines.len() + self.polygons.len()
    }
}

/// One device command inside a [`CommandBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Apply the named style's primitives before the next geometry command.
    SetStyle { style_id: u32 },
    /// Move to an absolute position with the laser off.
    Jump { to: Point },
    /// Move to an absolute position with the laser on.
    Mark { to: Point },
}

/// Violations of the block invariants, surfaced by [`CommandBlock::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockViolation {
    /// A non-empty block must begin with `SetStyle`.
    MissingLeadingStyle,
    /// A `Mark` appeared before any `Jump` established the pen position.
    MarkBeforeJump { at: usize },
    /// Two consecutive `SetStyle` commands carry the same id.
    RedundantStyle { at: usize, style_id: u32 },
}

/// The ordered command list for exactly one layer.
///
/// Ownership transfers producer → queue → consumer; nobody holds two
/// references to a block. `clamp_warnings` counts coordinates that fell
/// outside the card's field and were clamped during encoding (non-fatal).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandBlock {
    pub layer_index: u32,
    pub layer_height: f32,
    pub commands: Vec<Command>,
    pub clamp_warnings: u32,
}

impl CommandBlock {
    pub fn empty(layer_index: u32, layer_height: f32) -> Self {
        Self {
            layer_index,
            layer_height,
            commands: Vec::new(),
            clamp_warnings: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Check the block invariants. Encoding asserts this in debug builds;
    /// tests call it directly.
    pub fn validate(&self) -> Result<(), BlockViolation> {
        if self.commands.is_empty() {
            return Ok(());
        }
        if !matches!(self.commands[0], Command::SetStyle { .. }) {
            return Err(BlockViolation::MissingLeadingStyle);
        }
        let mut pen_established = false;
        let mut last_style: Option<u32> = None;
        for (at, command) in self.commands.iter().enumerate() {
            match *command {
                Command::SetStyle { style_id } => {
                    if last_style == Some(style_id) {
                        return Err(BlockViolation::RedundantStyle { at, style_id });
                    }
                    last_style = Some(style_id);
                }
                Command::Jump { .. } => {
                    pen_established = true;
                    last_style = None;
                }
                Command::Mark { .. } => {
                    if !pen_established {
                        return Err(BlockViolation::MarkBeforeJump { at });
                    }
                    last_style = None;
                }
            }
        }
        Ok(())
    }

    /// Styles referenced by the block, in first-use order.
    pub fn style_ids(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for command in &self.commands {
            if let Command::SetStyle { style_id } = *command
                && !out.contains(&style_id)
            {
                out.push(style_id);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: i32, y: i32) -> Point {
        Point::new(x, y)
    }

    #[test]
    fn empty_block_is_valid() {
        assert_eq!(CommandBlock::empty(0, 0.2).validate(), Ok(()));
    }

    #[test]
    fn leading_style_required() {
        let block = CommandBlock {
            layer_index: 0,
            layer_height: 0.2,
            commands: vec![Command::Jump { to: p(0, 0) }],
            clamp_warnings: 0,
        };
        assert_eq!(block.validate(), Err(BlockViolation::MissingLeadingStyle));
    }

    #[test]
    fn mark_requires_prior_jump() {
        let block = CommandBlock {
            layer_index: 0,
            layer_height: 0.2,
            commands: vec![
                Command::SetStyle { style_id: 1 },
                Command::Mark { to: p(5, 5) },
            ],
            clamp_warnings: 0,
        };
        assert_eq!(block.validate(), Err(BlockViolation::MarkBeforeJump { at: 1 }));
    }

    #[test]
    fn consecutive_identical_styles_rejected() {
        let block = CommandBlock {
            layer_index: 0,
            layer_height: 0.2,
            commands: vec![
                Command::SetStyle { style_id: 1 },
                Command::SetStyle { style_id: 1 },
            ],
            clamp_warnings: 0,
        };
        assert_eq!(
            block.validate(),
            Err(BlockViolation::RedundantStyle { at: 1, style_id: 1 })
        );
    }

    #[test]
    fn style_change_after_geometry_is_legal() {
        let block = CommandBlock {
            layer_index: 0,
            layer_height: 0.2,
            commands: vec![
                Command::SetStyle { style_id: 1 },
                Command::Jump { to: p(0, 0) },
                Command::Mark { to: p(10, 0) },
                Command::SetStyle { style_id: 2 },
                Command::Jump { to: p(0, 5) },
                Command::Mark { to: p(10, 5) },
            ],
            clamp_warnings: 0,
        };
        assert_eq!(block.validate(), Ok(()));
        assert_eq!(block.style_ids(), vec![1, 2]);
    }

    #[test]
    fn layer_emptiness_ignores_hollow_records() {
        let layer = Layer {
            index: 3,
            height: 0.06,
            hatches: vec![HatchRun {
                style_id: 1,
                lines: Vec::new(),
            }],
            ..Layer::default()
        };
        assert!(layer.is_empty());
        assert_eq!(layer.geometry_count(), 1);
    }
}
