//! `.marc` slice file access.
//!
//! A slice file is the pre-computed toolpath for a whole build: a fixed
//! header followed by one record per layer, each holding tagged hatch,
//! polyline and polygon geometry in slice units (hundredths of a
//! millimetre). The reader produces a lazy, finite, non-restartable sequence
//! of [`core_geometry::Layer`] values in strictly ascending index order; the
//! writer exists for fixtures and tooling.
//!
//! All multi-byte fields are little-endian.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;
use tracing::info;

mod reader;
mod writer;

pub use reader::SliceReader;
pub use writer::SliceWriter;

/// File magic, the first four bytes of every slice file.
pub const MAGIC: [u8; 4] = *b"MARC";

/// Bytes of opaque, reserved header space following the counted fields.
pub const HEADER_RESERVED: usize = 20;

/// Geometry tag `type` values.
pub const GEOMETRY_HATCH: u32 = 1;
pub const GEOMETRY_POLYLINE: u32 = 2;
pub const GEOMETRY_POLYGON: u32 = 3;

/// Upper bound on any on-disk count field. Counts above this are treated as
/// corruption rather than allocated.
pub const MAX_RECORD_COUNT: u32 = 1_000_000;

#[derive(Debug, Error)]
pub enum SliceError {
    #[error("slice i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a slice file: bad magic")]
    BadMagic,
    #[error("slice file truncated while reading {what}")]
    Truncated { what: &'static str },
    #[error("layer {found} out of order, expected {expected}")]
    LayerOutOfOrder { expected: u32, found: u32 },
    #[error("geometry tag type {found} where {expected} was required")]
    GeometryKindMismatch { expected: u32, found: u32 },
    #[error("implausible {what} count {count}")]
    ImplausibleCount { what: &'static str, count: u32 },
}

/// Parsed slice header. Everything beyond the magic is carried verbatim;
/// `layer_count` feeds progress reporting and may be 0 when the slicer did
/// not know the total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceHeader {
    pub version: u32,
    pub layer_count: u32,
    pub reserved: [u8; HEADER_RESERVED],
}

impl SliceHeader {
    pub fn new(version: u32, layer_count: u32) -> Self {
        Self {
            version,
            layer_count,
            reserved: [0; HEADER_RESERVED],
        }
    }
}

/// Open a slice file, validate the magic and return the header plus a reader
/// positioned at the first layer record.
pub fn open_slice(path: &Path) -> Result<(SliceHeader, SliceReader<BufReader<File>>), SliceError> {
    let file = File::open(path)?;
    let mut reader = SliceReader::new(BufReader::new(file))?;
    let header = reader.header().clone();
    info!(
        target: "slice",
        path = %path.display(),
        version = header.version,
        layers = header.layer_count,
        "slice_opened"
    );
    Ok((header, reader))
}
