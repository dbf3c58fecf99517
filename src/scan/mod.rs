//! Raster-by-wavelength scans.
//!
//! A [`ScanTask`] describes a `width` x `height` grid visited row-major, with
//! the full wavelength list acquired at every pixel:
//!
//! ```text
//! for row in 0..height
//!   for col in 0..width
//!     move stage to (col, row), settle
//!     for wavelength in wavelengths
//!       goto wavelength, settle, acquire, persist
//! ```
//!
//! [`ScanOrchestrator`] owns the instrument sessions and runs tasks on a worker
//! task; [`ScanEvent`]s report progress to whoever holds the [`ScanHandle`].
//! The same orchestrator runs wavelength-only [`SweepTask`]s (see [`sweep`]).

pub mod orchestrator;
pub mod sweep;

pub use orchestrator::{ScanHandle, ScanOrchestrator, SweepHandle, TaskHandle};
pub use sweep::{SweepEvent, SweepPoint, SweepReport, SweepTask};

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Parameters of one scan. Not resumable: a new scan starts from pixel (0, 0).
#[derive(Debug, Clone, PartialEq)]
pub struct ScanTask {
    /// Grid columns
    pub width: u32,
    /// Grid rows
    pub height: u32,
    /// Wavelengths in visiting order
    pub wavelengths_nm: Vec<f64>,
    /// Integration time per step
    pub acquisition_ms: u32,
    /// Wait after each stage move
    pub stage_settle: Duration,
    /// Wait after each wavelength change
    pub mono_settle: Duration,
    /// Artifact directory, created if absent
    pub output_dir: PathBuf,
    /// Open the shutter for the duration of the scan
    pub open_shutter: bool,
}

impl ScanTask {
    /// Check grid, wavelengths and output directory.
    pub fn validate(&self) -> AppResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(DaqError::Configuration(format!(
                "Scan grid must be at least 1x1, got {}x{}",
                self.width, self.height
            )));
        }
        if self.wavelengths_nm.is_empty() {
            return Err(DaqError::Configuration(
                "Scan needs at least one wavelength".to_string(),
            ));
        }
        if let Some(bad) = self
            .wavelengths_nm
            .iter()
            .find(|wl| !wl.is_finite() || **wl < 0.0)
        {
            return Err(DaqError::Configuration(format!(
                "Invalid wavelength {} nm",
                bad
            )));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "Scan output directory must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of artifacts a complete scan produces.
    pub fn total_steps(&self) -> usize {
        self.width as usize * self.height as usize * self.wavelengths_nm.len()
    }

    /// Every step in execution order.
    pub fn steps(&self) -> impl Iterator<Item = ScanStep> + '_ {
        let per_pixel = self.wavelengths_nm.len();
        (0..self.height)
            .flat_map(move |row| (0..self.width).map(move |col| (row, col)))
            .enumerate()
            .flat_map(move |(pixel, (row, col))| {
                self.wavelengths_nm
                    .iter()
                    .enumerate()
                    .map(move |(i, &wavelength_nm)| ScanStep {
                        index: pixel * per_pixel + i,
                        row,
                        col,
                        wavelength_nm,
                    })
            })
    }
}

/// One (row, column, wavelength) combination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanStep {
    /// Position in execution order, from 0
    pub index: usize,
    /// Grid row
    pub row: u32,
    /// Grid column
    pub col: u32,
    /// Wavelength
    pub wavelength_nm: f64,
}

impl ScanStep {
    /// Whether this is the first wavelength of its pixel (a stage move precedes it).
    pub fn starts_pixel(&self, wavelengths: usize) -> bool {
        wavelengths == 0 || self.index % wavelengths == 0
    }
}

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// No scan running; sessions may or may not be open
    Idle,
    /// Sessions being established
    Connecting,
    /// Both sessions open and histogram geometry known
    Ready,
    /// A scan owns the instruments
    Scanning,
    /// All steps finished
    Completed,
    /// Stopped at a cancellation boundary
    Cancelled,
    /// Aborted by an error
    Failed,
}

impl ScanState {
    /// Whether this is an outcome of a scan.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Cancelled | ScanState::Failed
        )
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScanState::Idle => "idle",
            ScanState::Connecting => "connecting",
            ScanState::Ready => "ready",
            ScanState::Scanning => "scanning",
            ScanState::Completed => "completed",
            ScanState::Cancelled => "cancelled",
            ScanState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Progress reported while a scan runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// The scan passed validation and is about to move the stage.
    Started {
        /// Steps a complete scan performs
        total_steps: usize,
    },
    /// One artifact was written.
    StepCompleted {
        /// The step
        step: ScanStep,
        /// Where its artifact went
        path: PathBuf,
    },
    /// Every wavelength of a pixel was acquired.
    PixelCompleted {
        /// Grid row
        row: u32,
        /// Grid column
        col: u32,
        /// Grid columns
        width: u32,
        /// Grid rows
        height: u32,
    },
    /// Terminal outcome; always the last event.
    Finished {
        /// `Completed`, `Cancelled` or `Failed`
        state: ScanState,
        /// Artifacts written by this scan
        artifacts: usize,
    },
}

/// Result of a scan that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    /// `Completed` or `Cancelled`
    pub state: ScanState,
    /// Artifacts in the order they were written
    pub artifacts: Vec<PathBuf>,
    /// Steps a complete scan would have performed
    pub total_steps: usize,
}
