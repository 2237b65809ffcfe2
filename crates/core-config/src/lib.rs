//! Machine configuration loading and parsing.
//!
//! One TOML file describes everything operator-tunable about the runtime:
//! the PLC endpoint, every named timeout ceiling, pipeline queue capacity,
//! field calibration, scanner warm-up knobs and platform motion scaling.
//! Unknown fields are ignored so the file can grow without breaking older
//! binaries; a file that fails to parse is fatal — a machine must not start
//! on half-read settings.

use core_units::Calibration;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("config is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Raw file shape. Every section and field has a default so a partial file
/// (or none at all, in simulation) is usable.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub calibration: Calibration,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub motion: MotionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default = "LinkConfig::default_endpoint")]
    pub endpoint: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: Self::default_endpoint(),
        }
    }
}

impl LinkConfig {
    fn default_endpoint() -> String {
        "opc.tcp://127.0.0.1:4840".to_string()
    }
}

/// Named timeout ceilings, all in milliseconds.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct TimeoutConfig {
    /// Ceiling on one recoat/platform preparation cycle.
    #[serde(default = "TimeoutConfig::default_prep_ms")]
    pub prep_ms: u64,
    /// Ceiling on queueing plus executing one layer's list.
    #[serde(default = "TimeoutConfig::default_exec_ms")]
    pub exec_ms: u64,
    /// Ceiling on an orderly pipeline shutdown; overrunning it is a warning.
    #[serde(default = "TimeoutConfig::default_shutdown_ms")]
    pub shutdown_ms: u64,
    /// Ceiling on the one-time machine startup handshake.
    #[serde(default = "TimeoutConfig::default_startup_ms")]
    pub startup_ms: u64,
    /// Poll interval used by every suspension point.
    #[serde(default = "TimeoutConfig::default_poll_ms")]
    pub poll_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            prep_ms: Self::default_prep_ms(),
            exec_ms: Self::default_exec_ms(),
            shutdown_ms: Self::default_shutdown_ms(),
            startup_ms: Self::default_startup_ms(),
            poll_ms: Self::default_poll_ms(),
        }
    }
}

impl TimeoutConfig {
    const fn default_prep_ms() -> u64 {
        60_000
    }
    const fn default_exec_ms() -> u64 {
        5_000
    }
    const fn default_shutdown_ms() -> u64 {
        10_000
    }
    const fn default_startup_ms() -> u64 {
        60_000
    }
    const fn default_poll_ms() -> u64 {
        5
    }

    pub fn prep(&self) -> Duration {
        Duration::from_millis(self.prep_ms)
    }
    pub fn exec(&self) -> Duration {
        Duration::from_millis(self.exec_ms)
    }
    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PipelineConfig {
    /// Bounded queue capacity between producer and consumer. Bounds worst
    /// case memory to `queue_capacity × max block size`.
    #[serde(default = "PipelineConfig::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Self::default_queue_capacity(),
        }
    }
}

impl PipelineConfig {
    const fn default_queue_capacity() -> usize {
        4
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ScannerConfig {
    /// Optional correction table loaded into the card during initialise.
    #[serde(default)]
    pub correction_file: Option<PathBuf>,
    /// Settle delay after the warm-up cycle, milliseconds.
    #[serde(default = "ScannerConfig::default_warmup_settle_ms")]
    pub warmup_settle_ms: u64,
    /// Ceiling on the warm-up cycle itself, milliseconds.
    #[serde(default = "ScannerConfig::default_warmup_timeout_ms")]
    pub warmup_timeout_ms: u64,
}

impl ScannerConfig {
    const fn default_warmup_settle_ms() -> u64 {
        100
    }
    const fn default_warmup_timeout_ms() -> u64 {
        5_000
    }

    pub fn warmup_settle(&self) -> Duration {
        Duration::from_millis(self.warmup_settle_ms)
    }
    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }
}

/// Platform motion scaling written to the PLC.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct MotionConfig {
    /// Feed cylinder steps per millimetre of layer height.
    #[serde(default = "MotionConfig::default_steps_per_mm")]
    pub steps_per_mm_source: f32,
    /// Build cylinder steps per millimetre of layer height.
    #[serde(default = "MotionConfig::default_steps_per_mm")]
    pub steps_per_mm_sink: f32,
    #[serde(default)]
    pub z_stacks: i32,
    #[serde(default)]
    pub delta_source: i32,
    #[serde(default)]
    pub delta_sink: i32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            steps_per_mm_source: Self::default_steps_per_mm(),
            steps_per_mm_sink: Self::default_steps_per_mm(),
            z_stacks: 0,
            delta_source: 0,
            delta_sink: 0,
        }
    }
}

impl MotionConfig {
    const fn default_steps_per_mm() -> f32 {
        800.0
    }
}

/// Parsed machine configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub file: ConfigFile,
}

impl Config {
    pub fn calibration(&self) -> Calibration {
        self.file.calibration
    }
}

/// Load configuration from `path`, or from `marcslm.toml` in the working
/// directory when no path is given. A missing file yields defaults (useful
/// under simulation); a malformed file is fatal.
pub fn load_from(path: Option<PathBuf>) -> Result<Config, ConfigError> {
    let explicit = path.is_some();
    let path = path.unwrap_or_else(|| PathBuf::from("marcslm.toml"));
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let file: ConfigFile = toml::from_str(&content)?;
            info!(target: "config", path = %path.display(), "config_loaded");
            Ok(Config { file })
        }
        Err(source) if explicit => Err(ConfigError::Io {
            path: path.display().to_string(),
            source,
        }),
        Err(_) => {
            warn!(target: "config", path = %path.display(), "config missing, using defaults");
            Ok(Config::default())
        }
    }
}

/// Convenience for tests and simulation.
pub fn defaults() -> Config {
    Config::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_str(content: &str) -> Result<Config, ConfigError> {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), content).unwrap();
        load_from(Some(tmp.path().to_path_buf()))
    }

    #[test]
    fn defaults_match_spec_ceilings() {
        let cfg = defaults();
        assert_eq!(cfg.file.timeouts.prep(), Duration::from_secs(60));
        assert_eq!(cfg.file.timeouts.exec(), Duration::from_secs(5));
        assert_eq!(cfg.file.timeouts.shutdown(), Duration::from_secs(10));
        assert_eq!(cfg.file.pipeline.queue_capacity, 4);
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let cfg = load_str("[timeouts]\nprep_ms = 30000\n").unwrap();
        assert_eq!(cfg.file.timeouts.prep(), Duration::from_secs(30));
        assert_eq!(cfg.file.timeouts.exec_ms, 5_000);
        assert_eq!(cfg.file.pipeline.queue_capacity, 4);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let cfg = load_str("[link]\nendpoint = \"opc.tcp://plc:4840\"\nfuture_knob = 3\n").unwrap();
        assert_eq!(cfg.file.link.endpoint, "opc.tcp://plc:4840");
    }

    #[test]
    fn malformed_file_is_fatal() {
        assert!(matches!(
            load_str("[timeouts\nprep_ms = oops"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn explicit_missing_path_is_fatal() {
        let err = load_from(Some(PathBuf::from("__no_such_config__.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn missing_default_path_falls_back_to_defaults() {
        // No marcslm.toml in the test working directory.
        let cfg = load_from(None).unwrap();
        assert_eq!(cfg.file.timeouts.poll(), Duration::from_millis(5));
    }

    #[test]
    fn calibration_section_parses() {
        let cfg = load_str("[calibration]\nbits_per_mm = 2000.0\nmax_bits = 100000\n").unwrap();
        let cal = cfg.calibration();
        assert_eq!(cal.bits_per_mm, 2000.0);
        assert_eq!(cal.max_bits, 100_000);
    }

    #[test]
    fn poll_interval_never_zero() {
        let cfg = load_str("[timeouts]\npoll_ms = 0\n").unwrap();
        assert_eq!(cfg.file.timeouts.poll(), Duration::from_millis(1));
    }
}
