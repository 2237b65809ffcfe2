//! Streaming slice reader.

use crate::{
    GEOMETRY_HATCH, GEOMETRY_POLYGON, GEOMETRY_POLYLINE, HEADER_RESERVED, MAGIC, MAX_RECORD_COUNT,
    SliceError, SliceHeader,
};
use core_geometry::{HatchLine, HatchRun, Layer, Polygon, Polyline};
use core_units::MmPoint;
use std::io::Read;
use tracing::trace;

/// Lazy layer stream over any byte source.
///
/// The sequence is finite and non-restartable: once a layer has been read it
/// is gone, and `next_layer` after the end keeps returning `Ok(None)`.
/// Layers must arrive in strictly ascending index order starting at 0.
pub struct SliceReader<R: Read> {
    source: R,
    header: SliceHeader,
    next_index: u32,
    finished: bool,
}

impl<R: Read> SliceReader<R> {
    /// Consume the header from `source`. Fails fast on a missing magic.
    pub fn new(mut source: R) -> Result<Self, SliceError> {
        let mut magic = [0u8; 4];
        source
            .read_exact(&mut magic)
            .map_err(|_| SliceError::BadMagic)?;
        if magic != MAGIC {
            return Err(SliceError::BadMagic);
        }
        let version = read_u32(&mut source, "header version")?;
        let layer_count = read_u32(&mut source, "header layer count")?;
        let mut reserved = [0u8; HEADER_RESERVED];
        source
            .read_exact(&mut reserved)
            .map_err(|_| SliceError::Truncated {
                what: "header reserved bytes",
            })?;
        Ok(Self {
            source,
            header: SliceHeader {
                version,
                layer_count,
                reserved,
            },
            next_index: 0,
            finished: false,
        })
    }

    pub fn header(&self) -> &SliceHeader {
        &self.header
    }

    /// Read the next layer record, or `Ok(None)` at a clean end of file.
    pub fn next_layer(&mut self) -> Result<Option<Layer>, SliceError> {
        if self.finished {
            return Ok(None);
        }
        let layer_number = match try_read_u32(&mut self.source)? {
            Some(n) => n,
            None => {
                self.finished = true;
                return Ok(None);
            }
        };
        if layer_number != self.next_index {
            self.finished = true;
            return Err(SliceError::LayerOutOfOrder {
                expected: self.next_index,
                found: layer_number,
            });
        }
        self.next_index += 1;

        let height = read_f32(&mut self.source, "layer height")?;
        let hatches = self.read_hatches()?;
        let polylines = self.read_chains(GEOMETRY_POLYLINE, "polyline")?;
        let polygons = self.read_chains(GEOMETRY_POLYGON, "polygon")?;
        trace!(
            target: "slice",
            layer = layer_number,
            hatches = hatches.len(),
            polylines = polylines.len(),
            polygons = polygons.len(),
            "layer_read"
        );
        Ok(Some(Layer {
            index: layer_number,
            height,
            hatches,
            polylines,
            polygons: polygons
                .into_iter()
                .map(|p| Polygon {
                    style_id: p.style_id,
                    vertices: p.vertices,
                })
                .collect(),
        }))
    }

    fn read_hatches(&mut self) -> Result<Vec<HatchRun>, SliceError> {
        let count = read_count(&mut self.source, "hatch")?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag = read_tag(&mut self.source)?;
            if tag.kind != GEOMETRY_HATCH {
                return Err(SliceError::GeometryKindMismatch {
                    expected: GEOMETRY_HATCH,
                    found: tag.kind,
                });
            }
            let mut lines = Vec::with_capacity((tag.point_count / 2) as usize);
            let mut pending: Option<MmPoint> = None;
            for _ in 0..tag.point_count {
                let p = read_point(&mut self.source)?;
                match pending.take() {
                    None => pending = Some(p),
                    Some(start) => lines.push(HatchLine { start, end: p }),
                }
            }
            // An odd point count is followed by one padding point on disk.
            if tag.point_count % 2 == 1 {
                let _ = read_point(&mut self.source)?;
            }
            out.push(HatchRun {
                style_id: tag.style_id,
                lines,
            });
        }
        Ok(out)
    }

    fn read_chains(&mut self, kind: u32, what: &'static str) -> Result<Vec<Polyline>, SliceError> {
        let count = read_count(&mut self.source, what)?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag = read_tag(&mut self.source)?;
            if tag.kind != kind {
                return Err(SliceError::GeometryKindMismatch {
                    expected: kind,
                    found: tag.kind,
                });
            }
            let mut vertices = Vec::with_capacity(tag.point_count as usize);
            for _ in 0..tag.point_count {
                vertices.push(read_point(&mut self.source)?);
            }
            out.push(Polyline {
                style_id: tag.style_id,
                vertices,
            });
        }
        Ok(out)
    }
}

impl<R: Read> Iterator for SliceReader<R> {
    type Item = Result<Layer, SliceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_layer().transpose()
    }
}

struct GeometryTag {
    kind: u32,
    style_id: u32,
    point_count: u32,
}

fn read_tag<R: Read>(source: &mut R) -> Result<GeometryTag, SliceError> {
    let kind = read_u32(source, "geometry type")?;
    let style_id = read_u32(source, "geometry category")?;
    let point_count = read_u32(source, "geometry point count")?;
    if point_count > MAX_RECORD_COUNT {
        return Err(SliceError::ImplausibleCount {
            what: "point",
            count: point_count,
        });
    }
    Ok(GeometryTag {
        kind,
        style_id,
        point_count,
    })
}

fn read_count<R: Read>(source: &mut R, what: &'static str) -> Result<u32, SliceError> {
    let count = read_u32(source, "geometry count")?;
    if count > MAX_RECORD_COUNT {
        return Err(SliceError::ImplausibleCount { what, count });
    }
    Ok(count)
}

fn read_point<R: Read>(source: &mut R) -> Result<MmPoint, SliceError> {
    let x = read_i32(source, "point x")?;
    let y = read_i32(source, "point y")?;
    Ok(MmPoint::from_slice_units(x, y))
}

fn read_u32<R: Read>(source: &mut R, what: &'static str) -> Result<u32, SliceError> {
    let mut buf = [0u8; 4];
    source
        .read_exact(&mut buf)
        .map_err(|_| SliceError::Truncated { what })?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32<R: Read>(source: &mut R, what: &'static str) -> Result<i32, SliceError> {
    read_u32(source, what).map(|v| v as i32)
}

fn read_f32<R: Read>(source: &mut R, what: &'static str) -> Result<f32, SliceError> {
    read_u32(source, what).map(f32::from_bits)
}

/// Distinguish clean EOF (no bytes) from mid-record truncation.
fn try_read_u32<R: Read>(source: &mut R) -> Result<Option<u32>, SliceError> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(SliceError::Truncated {
                    what: "layer number",
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SliceError::Io(e)),
        }
    }
    Ok(Some(u32::from_le_bytes(buf)))
}
