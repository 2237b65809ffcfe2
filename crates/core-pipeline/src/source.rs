//! Layer sources: the real slice stream and the synthetic test pattern.

use core_geometry::{Layer, Polygon};
use core_slice::{SliceError, SliceHeader, SliceReader};
use core_units::MmPoint;
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Slice(#[from] SliceError),
    #[error("{0}")]
    Other(String),
}

/// A finite, non-restartable stream of layers in ascending index order. The
/// producer task is the only caller.
pub trait LayerSource: Send {
    fn next_layer(&mut self) -> Result<Option<Layer>, SourceError>;

    /// Total layer count when known up front, for progress reporting.
    fn total_layers(&self) -> Option<u32> {
        None
    }
}

/// Adapter over an open `.marc` stream.
pub struct MarcSource<R: Read + Send> {
    reader: SliceReader<R>,
    total: Option<u32>,
}

impl<R: Read + Send> MarcSource<R> {
    pub fn new(header: &SliceHeader, reader: SliceReader<R>) -> Self {
        let total = (header.layer_count > 0).then_some(header.layer_count);
        Self { reader, total }
    }
}

impl<R: Read + Send> LayerSource for MarcSource<R> {
    fn next_layer(&mut self) -> Result<Option<Layer>, SourceError> {
        Ok(self.reader.next_layer()?)
    }

    fn total_layers(&self) -> Option<u32> {
        self.total
    }
}

/// Test-mode source: `layer_count` copies of a 20 mm axis-aligned square at
/// the origin, stepped by `layer_thickness`, all referencing style 0 (the
/// laser-off safe style). Everything downstream behaves exactly as with a
/// real slice.
pub struct SyntheticSource {
    layer_thickness_mm: f32,
    layer_count: u32,
    next_index: u32,
}

impl SyntheticSource {
    /// Half edge length of the test square, millimetres.
    pub const HALF_EDGE_MM: f32 = 10.0;
    /// Style id referenced by every synthetic layer.
    pub const STYLE_ID: u32 = 0;

    pub fn new(layer_thickness_mm: f32, layer_count: u32) -> Self {
        Self {
            layer_thickness_mm,
            layer_count,
            next_index: 0,
        }
    }
}

impl LayerSource for SyntheticSource {
    fn next_layer(&mut self) -> Result<Option<Layer>, SourceError> {
        if self.next_index >= self.layer_count {
            return Ok(None);
        }
        let index = self.next_index;
        self.next_index += 1;
        let h = Self::HALF_EDGE_MM;
        Ok(Some(Layer {
            index,
            height: self.layer_thickness_mm * (index + 1) as f32,
            hatches: Vec::new(),
            polylines: Vec::new(),
            polygons: vec![Polygon {
                style_id: Self::STYLE_ID,
                vertices: vec![
                    MmPoint::new(-h, -h),
                    MmPoint::new(h, -h),
                    MmPoint::new(h, h),
                    MmPoint::new(-h, h),
                ],
            }],
        }))
    }

    fn total_layers(&self) -> Option<u32> {
        Some(self.layer_count)
    }
}
