//! Layer → command block encoding.
//!
//! Pure and deterministic: the same layer, style table and calibration always
//! produce the same block. Geometry is traversed in the physical drawing
//! order the machine expects (hatches, then polylines, then polygons);
//! `SetStyle` is emitted before the first geometry and on every style change,
//! never redundantly. Coordinates are converted to device units here and
//! nowhere else; out-of-field values clamp and count a warning on the block.

use crate::{Command, CommandBlock, Layer, Segment, SegmentKind};
use core_styles::StyleTable;
use core_units::Calibration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("layer {layer} references unknown build style {style_id}")]
    UnknownStyle { layer: u32, style_id: u32 },
}

struct BlockBuilder<'a> {
    block: CommandBlock,
    calibration: &'a Calibration,
    current_style: Option<u32>,
    pen_down: bool,
}

impl<'a> BlockBuilder<'a> {
    fn new(layer: &Layer, calibration: &'a Calibration) -> Self {
        Self {
            block: CommandBlock::empty(layer.index, layer.height),
            calibration,
            current_style: None,
            pen_down: false,
        }
    }

    fn push(&mut self, segment: &Segment) {
        if self.current_style != Some(segment.style_id) {
            self.block.commands.push(Command::SetStyle {
                style_id: segment.style_id,
            });
            self.current_style = Some(segment.style_id);
        }
        let to = self.convert(segment.to);
        match segment.kind {
            SegmentKind::Jump => {
                self.block.commands.push(Command::Jump { to });
                self.pen_down = true;
            }
            SegmentKind::Mark => {
                // A mark is only legal once a jump has established the pen
                // position; geometry traversal below guarantees this.
                debug_assert!(self.pen_down, "mark emitted before any jump");
                self.block.commands.push(Command::Mark { to });
            }
        }
    }

    fn convert(&mut self, p: core_units::MmPoint) -> core_units::Point {
        let (bits, clamped) = self.calibration.to_bits(p);
        if clamped {
            self.block.clamp_warnings += 1;
        }
        bits
    }

    fn finish(self) -> CommandBlock {
        debug_assert_eq!(self.block.validate(), Ok(()));
        self.block
    }
}

/// Flatten a layer's geometry into segments in drawing order. Degenerate
/// records (chains of fewer than two vertices) produce nothing.
pub fn segments(layer: &Layer) -> Vec<Segment> {
    let mut out = Vec::new();
    for hatch in &layer.hatches {
        for line in &hatch.lines {
            out.push(Segment {
                kind: SegmentKind::Jump,
                from: line.start,
                to: line.start,
                style_id: hatch.style_id,
            });
            out.push(Segment {
                kind: SegmentKind::Mark,
                from: line.start,
                to: line.end,
                style_id: hatch.style_id,
            });
        }
    }
    for polyline in &layer.polylines {
        chain(&mut out, &polyline.vertices, polyline.style_id, false);
    }
    for polygon in &layer.polygons {
        chain(&mut out, &polygon.vertices, polygon.style_id, true);
    }
    out
}

fn chain(out: &mut Vec<Segment>, vertices: &[core_units::MmPoint], style_id: u32, close: bool) {
    if vertices.len() < 2 {
        if !vertices.is_empty() {
            warn!(target: "encoder", style_id, "degenerate vertex chain skipped");
        }
        return;
    }
    out.push(Segment {
        kind: SegmentKind::Jump,
        from: vertices[0],
        to: vertices[0],
        style_id,
    });
    for pair in vertices.windows(2) {
        out.push(Segment {
            kind: SegmentKind::Mark,
            from: pair[0],
            to: pair[1],
            style_id,
        });
    }
    if close {
        out.push(Segment {
            kind: SegmentKind::Mark,
            from: vertices[vertices.len() - 1],
            to: vertices[0],
            style_id,
        });
    }
}

/// Encode one layer into the command block the consumer will execute.
///
/// Every referenced style id must exist in `styles`; the first missing id
/// aborts the encode. Styles are resolved again by the consumer when the
/// block executes, so only existence is checked here.
pub fn encode(
    layer: &Layer,
    styles: &StyleTable,
    calibration: &Calibration,
) -> Result<CommandBlock, EncodeError> {
    let mut builder = BlockBuilder::new(layer, calibration);
    for segment in segments(layer) {
        if !styles.contains(segment.style_id) {
            return Err(EncodeError::UnknownStyle {
                layer: layer.index,
                style_id: segment.style_id,
            });
        }
        builder.push(&segment);
    }
    let block = builder.finish();
    if block.clamp_warnings > 0 {
        warn!(
            target: "encoder",
            layer = layer.index,
            clamped = block.clamp_warnings,
            "coordinates outside the card field were clamped"
        );
    }
    Ok(block)
}
