//! Build style table: the per-geometry laser parameter sets.
//!
//! The table is loaded once before streaming starts and is read-only
//! afterwards; producer and consumer both hold a shared view. Every geometry
//! in a slice references a style by id and a missing id is fatal for the job,
//! so the loader is strict: mandatory fields must be present and correctly
//! typed or loading fails.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StyleError {
    #[error("cannot read style table {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("style table is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate build style id {id}")]
    DuplicateId { id: u32 },
}

/// Optional beam wobble applied on top of a style's mark primitives.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Wobble {
    pub amplitude_mm: f32,
    pub frequency_hz: f32,
}

/// One named laser parameter set.
///
/// Field names mirror the on-disk table; all fields except `wobble` are
/// mandatory and a missing or wrong-typed field fails the load.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStyle {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub laser_id: u32,
    pub laser_mode: u8,
    pub laser_power: u16,
    pub laser_focus: f32,
    /// Mark speed in mm/s.
    #[serde(rename = "laserSpeed")]
    pub mark_speed_mm_s: f32,
    pub hatch_spacing: f32,
    pub layer_thickness: f32,
    pub point_distance: f32,
    pub point_delay: f32,
    pub point_exposure_time: f32,
    /// Jump speed in mm/s.
    #[serde(rename = "jumpSpeed")]
    pub jump_speed_mm_s: f32,
    pub jump_delay: f32,
    #[serde(default)]
    pub wobble: Option<Wobble>,
}

impl BuildStyle {
    /// Style used by the synthetic test producer: id 0 with the laser forced
    /// off, safe to execute on a live machine.
    pub fn safe_test_style() -> Self {
        Self {
            id: 0,
            name: "test-safe".to_string(),
            description: "synthetic test geometry, laser disabled".to_string(),
            laser_id: 0,
            laser_mode: 0,
            laser_power: 0,
            laser_focus: 0.0,
            mark_speed_mm_s: 500.0,
            hatch_spacing: 0.1,
            layer_thickness: 0.2,
            point_distance: 0.05,
            point_delay: 0.0,
            point_exposure_time: 0.0,
            jump_speed_mm_s: 2000.0,
            jump_delay: 0.0,
            wobble: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StyleFile {
    build_styles: Vec<BuildStyle>,
}

/// Immutable keyed view over the loaded styles.
#[derive(Debug, Clone, Default)]
pub struct StyleTable {
    styles: HashMap<u32, BuildStyle>,
}

impl StyleTable {
    /// Build a table from already-parsed styles. Duplicate ids are rejected.
    pub fn from_styles(styles: Vec<BuildStyle>) -> Result<Self, StyleError> {
        let mut map = HashMap::with_capacity(styles.len());
        for style in styles {
            let id = style.id;
            if map.insert(id, style).is_some() {
                return Err(StyleError::DuplicateId { id });
            }
        }
        if map.is_empty() {
            warn!(target: "styles", "style table is empty");
        }
        Ok(Self { styles: map })
    }

    pub fn from_json_str(json: &str) -> Result<Self, StyleError> {
        let file: StyleFile = serde_json::from_str(json)?;
        Self::from_styles(file.build_styles)
    }

    pub fn load_from(path: &Path) -> Result<Self, StyleError> {
        let content = fs::read_to_string(path).map_err(|source| StyleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let table = Self::from_json_str(&content)?;
        info!(
            target: "styles",
            path = %path.display(),
            count = table.len(),
            "style_table_loaded"
        );
        Ok(table)
    }

    /// Table containing only the synthetic test style.
    pub fn synthetic() -> Self {
        let mut styles = HashMap::new();
        let style = BuildStyle::safe_test_style();
        styles.insert(style.id, style);
        Self { styles }
    }

    pub fn get(&self, id: u32) -> Option<&BuildStyle> {
        self.styles.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.styles.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "buildStyles": [
            {
                "id": 1,
                "name": "bulk",
                "description": "hatch infill",
                "laserId": 1,
                "laserMode": 1,
                "laserPower": 200,
                "laserFocus": 0.0,
                "laserSpeed": 900.0,
                "hatchSpacing": 0.12,
                "layerThickness": 0.03,
                "pointDistance": 0.06,
                "pointDelay": 10.0,
                "pointExposureTime": 80.0,
                "jumpSpeed": 3000.0,
                "jumpDelay": 150.0
            },
            {
                "id": 2,
                "name": "contour",
                "description": "border pass",
                "laserId": 1,
                "laserMode": 0,
                "laserPower": 120,
                "laserFocus": -0.5,
                "laserSpeed": 400.0,
                "hatchSpacing": 0.1,
                "layerThickness": 0.03,
                "pointDistance": 0.04,
                "pointDelay": 10.0,
                "pointExposureTime": 60.0,
                "jumpSpeed": 3000.0,
                "jumpDelay": 150.0,
                "wobble": { "amplitudeMm": 0.05, "frequencyHz": 500.0 }
            }
        ]
    }"#;

    #[test]
    fn parses_valid_table() {
        let table = StyleTable::from_json_str(VALID).unwrap();
        assert_eq!(table.len(), 2);
        let bulk = table.get(1).unwrap();
        assert_eq!(bulk.laser_power, 200);
        assert_eq!(bulk.mark_speed_mm_s, 900.0);
        assert!(bulk.wobble.is_none());
        let contour = table.get(2).unwrap();
        let wobble = contour.wobble.unwrap();
        assert_eq!(wobble.frequency_hz, 500.0);
    }

    #[test]
    fn missing_mandatory_field_is_fatal() {
        // laserPower removed from an otherwise valid entry.
        let json = r#"{
            "buildStyles": [
                {
                    "id": 1,
                    "name": "bulk",
                    "description": "",
                    "laserId": 1,
                    "laserMode": 1,
                    "laserFocus": 0.0,
                    "laserSpeed": 900.0,
                    "hatchSpacing": 0.12,
                    "layerThickness": 0.03,
                    "pointDistance": 0.06,
                    "pointDelay": 10.0,
                    "pointExposureTime": 80.0,
                    "jumpSpeed": 3000.0,
                    "jumpDelay": 150.0
                }
            ]
        }"#;
        assert!(matches!(
            StyleTable::from_json_str(json),
            Err(StyleError::Parse(_))
        ));
    }

    #[test]
    fn wrong_typed_field_is_fatal() {
        let json = VALID.replace("\"laserPower\": 200", "\"laserPower\": \"high\"");
        assert!(matches!(
            StyleTable::from_json_str(&json),
            Err(StyleError::Parse(_))
        ));
    }

    #[test]
    fn duplicate_id_is_fatal() {
        let json = VALID.replace("\"id\": 2", "\"id\": 1");
        assert!(matches!(
            StyleTable::from_json_str(&json),
            Err(StyleError::DuplicateId { id: 1 })
        ));
    }

    #[test]
    fn load_from_missing_file_reports_path() {
        let err = StyleTable::load_from(Path::new("__missing_styles__.json")).unwrap_err();
        match err {
            StyleError::Io { path, .. } => assert!(path.contains("__missing_styles__")),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn load_from_disk_round_trip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), VALID).unwrap();
        let table = StyleTable::load_from(tmp.path()).unwrap();
        assert!(table.contains(1));
        assert!(table.contains(2));
        assert!(!table.contains(3));
    }

    #[test]
    fn synthetic_table_has_laser_off_style() {
        let table = StyleTable::synthetic();
        let style = table.get(0).unwrap();
        assert_eq!(style.laser_power, 0);
    }
}
