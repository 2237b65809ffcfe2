//! Slice file writer, used by fixtures and offline tooling.

use crate::{
    GEOMETRY_HATCH, GEOMETRY_POLYGON, GEOMETRY_POLYLINE, MAGIC, SliceError, SliceHeader,
};
use core_geometry::Layer;
use core_units::{MmPoint, SLICE_UNITS_PER_MM};
use std::io::Write;

/// Serialises layers in the exact byte layout [`crate::SliceReader`] parses.
pub struct SliceWriter<W: Write> {
    sink: W,
}

impl<W: Write> SliceWriter<W> {
    /// Write the file header immediately and return the writer.
    pub fn new(mut sink: W, header: &SliceHeader) -> Result<Self, SliceError> {
        sink.write_all(&MAGIC)?;
        sink.write_all(&header.version.to_le_bytes())?;
        sink.write_all(&header.layer_count.to_le_bytes())?;
        sink.write_all(&header.reserved)?;
        Ok(Self { sink })
    }

    pub fn write_layer(&mut self, layer: &Layer) -> Result<(), SliceError> {
        self.sink.write_all(&layer.index.to_le_bytes())?;
        self.sink.write_all(&layer.height.to_bits().to_le_bytes())?;

        self.write_u32(layer.hatches.len() as u32)?;
        for hatch in &layer.hatches {
            let point_count = (hatch.lines.len() * 2) as u32;
            self.write_tag(GEOMETRY_HATCH, hatch.style_id, point_count)?;
            for line in &hatch.lines {
                self.write_point(line.start)?;
                self.write_point(line.end)?;
            }
        }

        self.write_u32(layer.polylines.len() as u32)?;
        for polyline in &layer.polylines {
            self.write_tag(
                GEOMETRY_POLYLINE,
                polyline.style_id,
                polyline.vertices.len() as u32,
            )?;
            for &vertex in &polyline.vertices {
                self.write_point(vertex)?;
            }
        }

        self.write_u32(layer.polygons.len() as u32)?;
        for polygon in &layer.polygons {
            self.write_tag(
                GEOMETRY_POLYGON,
                polygon.style_id,
                polygon.vertices.len() as u32,
            )?;
            for &vertex in &polygon.vertices {
                self.write_point(vertex)?;
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<W, SliceError> {
        self.sink.flush()?;
        Ok(self.sink)
    }

    fn write_tag(&mut self, kind: u32, style_id: u32, point_count: u32) -> Result<(), SliceError> {
        self.write_u32(kind)?;
        self.write_u32(style_id)?;
        self.write_u32(point_count)
    }

    fn write_point(&mut self, p: MmPoint) -> Result<(), SliceError> {
        let x = (p.x * SLICE_UNITS_PER_MM as f32).round() as i32;
        let y = (p.y * SLICE_UNITS_PER_MM as f32).round() as i32;
        self.sink.write_all(&x.to_le_bytes())?;
        self.sink.write_all(&y.to_le_bytes())?;
        Ok(())
    }

    fn write_u32(&mut self, v: u32) -> Result<(), SliceError> {
        self.sink.write_all(&v.to_le_bytes())?;
        Ok(())
    }
}
