//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/flim.toml`)
//! 2. environment variables prefixed with `FLIM_` (nested keys split on `__`)
//!
//! Every section has defaults, so an empty file yields a usable configuration
//! apart from the helper executable paths.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! FLIM_APPLICATION__LOG_LEVEL=debug
//! FLIM_SCAN__WIDTH=16
//! FLIM_COUNTER__EXECUTABLE=/opt/flim/th260_helper
//! FLIM_SWEEP__STEPS=200
//! ```
//!
//! # Example
//!
//! ```no_run
//! use flim_daq::config::FlimConfig;
//!
//! let config = FlimConfig::load()?;
//! println!("Grid: {}x{}", config.scan.width, config.scan.height);
//! # Ok::<(), flim_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::instrument::monochromator::SettleStrategy;
use crate::instrument::photon_counter::CounterTimeouts;
use crate::instrument::{CounterInit, StageOpen};
use crate::scan::{ScanTask, SweepTask};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/flim.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlimConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Photon counter helper
    pub counter: CounterConfig,
    /// Stage helper
    pub stage: StageConfig,
    /// Monochromator command
    pub monochromator: MonochromatorConfig,
    /// Scan parameters
    pub scan: ScanConfig,
    /// Intensity detector helper used by sweeps
    pub detector: DetectorConfig,
    /// Wavelength sweep parameters
    pub sweep: SweepConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "FLIM DAQ".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Photon counter helper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Helper executable
    pub executable: PathBuf,
    /// Extra arguments for the helper
    pub args: Vec<String>,
    /// Binning code
    pub binning: u32,
    /// Histogram offset (ps)
    pub offset_ps: i32,
    /// Sync divider
    pub sync_div: u32,
    /// Sync channel offset (ps)
    pub sync_offset_ps: i32,
    /// Bound for the `OK` greeting
    pub handshake_timeout_ms: u64,
    /// Bound for plain commands
    pub command_timeout_ms: u64,
    /// Bound for `init` and `reset`
    pub init_timeout_ms: u64,
    /// Bound for the histogram payload line
    pub payload_timeout_ms: u64,
    /// Lower bound for an acquisition round trip
    pub acquire_floor_ms: u64,
    /// Added to the integration time to bound an acquisition round trip
    pub acquire_slack_ms: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        let init = CounterInit::default();
        Self {
            executable: PathBuf::from("helpers/th260_helper"),
            args: Vec::new(),
            binning: init.binning,
            offset_ps: init.offset_ps,
            sync_div: init.sync_div,
            sync_offset_ps: init.sync_offset_ps,
            handshake_timeout_ms: 10_000,
            command_timeout_ms: 10_000,
            init_timeout_ms: 20_000,
            payload_timeout_ms: 20_000,
            acquire_floor_ms: 10_000,
            acquire_slack_ms: 5_000,
        }
    }
}

impl CounterConfig {
    /// Parameters for the `init` command.
    pub fn init(&self) -> CounterInit {
        CounterInit {
            binning: self.binning,
            offset_ps: self.offset_ps,
            sync_div: self.sync_div,
            sync_offset_ps: self.sync_offset_ps,
        }
    }

    /// Read bounds for the counter client.
    pub fn timeouts(&self) -> CounterTimeouts {
        CounterTimeouts {
            command: Duration::from_millis(self.command_timeout_ms),
            init: Duration::from_millis(self.init_timeout_ms),
            payload: Duration::from_millis(self.payload_timeout_ms),
            acquire_floor: Duration::from_millis(self.acquire_floor_ms),
            acquire_slack: Duration::from_millis(self.acquire_slack_ms),
        }
    }

    /// Bound for the helper's greeting.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Stage helper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Helper executable
    pub executable: PathBuf,
    /// Extra arguments for the helper
    pub args: Vec<String>,
    /// X axis controller serial (helper default when unset)
    pub serial_x: Option<String>,
    /// Y axis controller serial (helper default when unset)
    pub serial_y: Option<String>,
    /// Maximum output voltage in tenths of a volt
    pub max_voltage_tenths: u32,
    /// Bound for the `OK` greeting
    pub handshake_timeout_ms: u64,
    /// Bound for every command
    pub command_timeout_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("helpers/stage_helper"),
            args: Vec::new(),
            serial_x: None,
            serial_y: None,
            max_voltage_tenths: StageOpen::default().max_voltage_tenths,
            handshake_timeout_ms: 10_000,
            command_timeout_ms: 10_000,
        }
    }
}

impl StageConfig {
    /// Parameters for the `open` command.
    pub fn open_params(&self) -> StageOpen {
        StageOpen {
            serial_x: self.serial_x.clone(),
            serial_y: self.serial_y.clone(),
            max_voltage_tenths: self.max_voltage_tenths,
        }
    }

    /// Bound for the helper's greeting.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Bound for every stage command.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Monochromator command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonochromatorConfig {
    /// Program invoked for every call
    pub program: PathBuf,
    /// Arguments placed before the command name
    pub args: Vec<String>,
    /// Bound for one call
    pub timeout_ms: u64,
    /// How to wait after a `goto`
    pub settle: SettleStrategy,
}

impl Default for MonochromatorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["controller/spectrograph_command.py".to_string()],
            timeout_ms: 45_000,
            settle: SettleStrategy::Fixed,
        }
    }
}

/// Scan parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Grid columns
    pub width: u32,
    /// Grid rows
    pub height: u32,
    /// Wavelengths visited at every pixel, in order
    pub wavelengths_nm: Vec<f64>,
    /// Integration time per step
    pub acquisition_ms: u32,
    /// Wait after each stage move
    pub stage_settle_ms: u64,
    /// Wait after each wavelength change (fixed settle strategy)
    pub mono_settle_ms: u64,
    /// Artifact directory, created if absent
    pub output_dir: PathBuf,
    /// Open the monochromator shutter for the duration of the scan
    pub open_shutter: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            width: 5,
            height: 5,
            wavelengths_nm: vec![500.0, 510.0, 520.0],
            acquisition_ms: 1000,
            stage_settle_ms: 100,
            mono_settle_ms: 800,
            output_dir: PathBuf::from("data/flim"),
            open_shutter: false,
        }
    }
}

impl ScanConfig {
    /// Scan task built from these parameters.
    pub fn task(&self) -> ScanTask {
        ScanTask {
            width: self.width,
            height: self.height,
            wavelengths_nm: self.wavelengths_nm.clone(),
            acquisition_ms: self.acquisition_ms,
            stage_settle: Duration::from_millis(self.stage_settle_ms),
            mono_settle: Duration::from_millis(self.mono_settle_ms),
            output_dir: self.output_dir.clone(),
            open_shutter: self.open_shutter,
        }
    }
}

/// Intensity detector helper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Helper executable
    pub executable: PathBuf,
    /// Extra arguments for the helper
    pub args: Vec<String>,
    /// Bound for the `OK` greeting
    pub handshake_timeout_ms: u64,
    /// Bound for `record`
    pub command_timeout_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("helpers/lockin_helper"),
            args: Vec::new(),
            handshake_timeout_ms: 10_000,
            command_timeout_ms: 10_000,
        }
    }
}

impl DetectorConfig {
    /// Bound for the helper's greeting.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Bound for every detector command.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Wavelength sweep parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// First wavelength
    pub start_nm: f64,
    /// Last wavelength
    pub end_nm: f64,
    /// Number of equal intervals; the sweep visits `steps + 1` wavelengths
    pub steps: u32,
    /// Wait at the start wavelength before opening the shutter
    pub initial_settle_ms: u64,
    /// Wait after each wavelength change (fixed settle strategy)
    pub step_delay_ms: u64,
    /// CSV file written when the sweep completes
    pub output_path: PathBuf,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start_nm: 500.0,
            end_nm: 600.0,
            steps: 100,
            initial_settle_ms: 5_000,
            step_delay_ms: 100,
            output_path: PathBuf::from("data/spectrum.csv"),
        }
    }
}

impl SweepConfig {
    /// Sweep task built from these parameters.
    pub fn task(&self) -> SweepTask {
        SweepTask {
            start_nm: self.start_nm,
            end_nm: self.end_nm,
            steps: self.steps,
            initial_settle: Duration::from_millis(self.initial_settle_ms),
            step_delay: Duration::from_millis(self.step_delay_ms),
            output_path: self.output_path.clone(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl FlimConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path, layered over defaults and under `FLIM_*`
    /// environment variables, then validate.
    ///
    /// A missing file is not an error: defaults and the environment still apply.
    ///
    /// # Errors
    /// `Config` if the sources cannot be parsed, `Configuration` if validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FLIM_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    /// `Configuration` with a descriptive message for the first failure.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.counter.executable.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "counter.executable must not be empty".to_string(),
            ));
        }
        if self.stage.executable.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "stage.executable must not be empty".to_string(),
            ));
        }
        if self.detector.executable.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "detector.executable must not be empty".to_string(),
            ));
        }
        if self.monochromator.program.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "monochromator.program must not be empty".to_string(),
            ));
        }

        if self.stage.serial_x.is_some() != self.stage.serial_y.is_some() {
            return Err(DaqError::Configuration(
                "stage.serial_x and stage.serial_y must be given together".to_string(),
            ));
        }

        if self.counter.sync_div == 0 {
            return Err(DaqError::Configuration(
                "counter.sync_div must be at least 1".to_string(),
            ));
        }

        let timeouts = [
            ("counter.handshake_timeout_ms", self.counter.handshake_timeout_ms),
            ("counter.command_timeout_ms", self.counter.command_timeout_ms),
            ("counter.init_timeout_ms", self.counter.init_timeout_ms),
            ("counter.payload_timeout_ms", self.counter.payload_timeout_ms),
            ("counter.acquire_floor_ms", self.counter.acquire_floor_ms),
            ("stage.handshake_timeout_ms", self.stage.handshake_timeout_ms),
            ("stage.command_timeout_ms", self.stage.command_timeout_ms),
            ("detector.handshake_timeout_ms", self.detector.handshake_timeout_ms),
            ("detector.command_timeout_ms", self.detector.command_timeout_ms),
            ("monochromator.timeout_ms", self.monochromator.timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(DaqError::Configuration(format!("{} must be positive", name)));
        }

        if let SettleStrategy::PollPosition {
            tolerance_nm,
            poll_interval_ms,
            timeout_ms,
        } = self.monochromator.settle
        {
            if !(tolerance_nm.is_finite() && tolerance_nm > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "Invalid settle tolerance_nm {}",
                    tolerance_nm
                )));
            }
            if poll_interval_ms == 0 || timeout_ms == 0 {
                return Err(DaqError::Configuration(
                    "settle poll_interval_ms and timeout_ms must be positive".to_string(),
                ));
            }
        }

        self.scan.task().validate()?;
        self.sweep.task().validate()
    }
}
