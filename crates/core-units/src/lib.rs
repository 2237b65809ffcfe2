//! Coordinate units shared by the slice reader, the geometry encoder and the
//! scanner driver.
//!
//! Three coordinate spaces exist in the system:
//! * **slice units** — signed integers stored in `.marc` files, hundredths of
//!   a millimetre,
//! * **millimetres** — the working space of layer geometry and build styles,
//! * **device units (bits)** — absolute galvo coordinates consumed by the
//!   scan card; the vendor field is signed 20-bit.
//!
//! Conversion into device units happens exactly once, in the encoder, through
//! an injected [`Calibration`]; out-of-range values are clamped rather than
//! rejected so a slightly oversized contour degrades instead of killing the
//! job.

use serde::Deserialize;

/// Slice files store coordinates as integers in hundredths of a millimetre.
pub const SLICE_UNITS_PER_MM: i32 = 100;

/// Largest magnitude representable in the vendor's signed 20-bit coordinate
/// field. Values are clamped to this before submission.
pub const MAX_COORD_BITS: i32 = 524_287;

/// Absolute 2D coordinate in scanner device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// 2D coordinate in millimetres, the space layer geometry lives in between
/// the slice reader and the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MmPoint {
    pub x: f32,
    pub y: f32,
}

impl MmPoint {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Convert a raw slice-file coordinate pair into millimetres.
    pub fn from_slice_units(x: i32, y: i32) -> Self {
        Self {
            x: x as f32 / SLICE_UNITS_PER_MM as f32,
            y: y as f32 / SLICE_UNITS_PER_MM as f32,
        }
    }
}

/// Field calibration mapping millimetres onto scan-card device units.
///
/// `max_bits` is normally [`MAX_COORD_BITS`] but is configurable so a card
/// with a reduced working field can be described without touching the
/// encoder.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub bits_per_mm: f32,
    pub max_bits: i32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            bits_per_mm: 1000.0,
            max_bits: MAX_COORD_BITS,
        }
    }
}

impl Calibration {
    pub const fn new(bits_per_mm: f32, max_bits: i32) -> Self {
        Self {
            bits_per_mm,
            max_bits,
        }
    }

    /// Convert one millimetre coordinate to device units, clamping into the
    /// card's addressable field. Returns the converted point and whether any
    /// axis was clamped.
    pub fn to_bits(&self, p: MmPoint) -> (Point, bool) {
        let (x, cx) = self.axis_to_bits(p.x);
        let (y, cy) = self.axis_to_bits(p.y);
        (Point::new(x, y), cx || cy)
    }

    /// Convert a speed in mm/s into the card's bits-per-millisecond unit.
    pub fn speed_to_bits_per_ms(&self, mm_per_s: f32) -> f64 {
        (mm_per_s as f64 * self.bits_per_mm as f64) / 1000.0
    }

    fn axis_to_bits(&self, mm: f32) -> (i32, bool) {
        let raw = (mm as f64 * self.bits_per_mm as f64).round();
        let limit = self.max_bits as f64;
        if raw > limit {
            (self.max_bits, true)
        } else if raw < -limit {
            (-self.max_bits, true)
        } else {
            (raw as i32, false)
        }
    }
}
