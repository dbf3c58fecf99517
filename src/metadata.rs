//! Scan manifest.
//!
//! Each scan leaves a `scan_manifest.json` next to its artifacts describing
//! what was requested and how the scan ended. It is written when the scan
//! starts (outcome `scanning`) and rewritten once it reaches a terminal state,
//! so an interrupted process still leaves a record of the attempt.

use crate::error::{AppResult, DaqError};
use crate::instrument::{CounterInit, HistogramGeometry};
use crate::scan::{ScanState, ScanTask};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the manifest inside the output directory.
pub const MANIFEST_FILE_NAME: &str = "scan_manifest.json";

/// Record of one scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanManifest {
    /// Version of the acquisition software.
    pub software_version: String,
    /// When the scan started.
    pub started_at: DateTime<Utc>,
    /// When the scan reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// `scanning`, then `completed`, `cancelled` or `failed`.
    pub outcome: ScanState,
    /// Error text of a failed scan.
    pub error: Option<String>,
    /// Grid columns
    pub width: u32,
    /// Grid rows
    pub height: u32,
    /// Wavelength list, in visiting order
    pub wavelengths_nm: Vec<f64>,
    /// Integration time per step
    pub acquisition_ms: u32,
    /// Stage settle time
    pub stage_settle_ms: u64,
    /// Monochromator settle time
    pub mono_settle_ms: u64,
    /// Whether the shutter was opened by the scan
    pub open_shutter: bool,
    /// Counter configuration in effect
    pub counter_init: Option<CounterInit>,
    /// Histogram geometry in effect
    pub geometry: Option<HistogramGeometry>,
    /// Steps the scan was asked to perform
    pub total_steps: usize,
    /// Artifact file names written so far
    pub artifacts: Vec<String>,
}

impl ScanManifest {
    /// Manifest for a scan that is about to start.
    pub fn begin(
        task: &ScanTask,
        counter_init: Option<CounterInit>,
        geometry: Option<HistogramGeometry>,
    ) -> Self {
        Self {
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: ScanState::Scanning,
            error: None,
            width: task.width,
            height: task.height,
            wavelengths_nm: task.wavelengths_nm.clone(),
            acquisition_ms: task.acquisition_ms,
            stage_settle_ms: task.stage_settle.as_millis() as u64,
            mono_settle_ms: task.mono_settle.as_millis() as u64,
            open_shutter: task.open_shutter,
            counter_init,
            geometry,
            total_steps: task.total_steps(),
            artifacts: Vec::new(),
        }
    }

    /// Record the terminal outcome.
    pub fn finish(&mut self, outcome: ScanState, error: Option<String>, artifacts: &[PathBuf]) {
        self.finished_at = Some(Utc::now());
        self.outcome = outcome;
        self.error = error;
        self.artifacts = artifacts
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
    }

    /// Write (or overwrite) the manifest in `dir`.
    pub fn write_to(&self, dir: &Path) -> AppResult<PathBuf> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DaqError::Storage(e.to_string()))?;
        fs::write(&path, json)?;
        Ok(path)
    }

    /// Read a manifest back from `dir`.
    pub fn read_from(dir: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(dir.join(MANIFEST_FILE_NAME))?;
        serde_json::from_str(&text).map_err(|e| DaqError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task(dir: &Path) -> ScanTask {
        ScanTask {
            width: 2,
            height: 1,
            wavelengths_nm: vec![500.0, 510.0],
            acquisition_ms: 100,
            stage_settle: Duration::from_millis(5),
            mono_settle: Duration::from_millis(7),
            output_dir: dir.to_path_buf(),
            open_shutter: false,
        }
    }

    #[test]
    fn test_manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = ScanManifest::begin(&task(dir.path()), Some(CounterInit::default()), None);
        assert_eq!(manifest.total_steps, 4);
        manifest.write_to(dir.path()).unwrap();

        manifest.finish(
            ScanState::Completed,
            None,
            &[dir.path().join("y000_x000_nm500.0.npz")],
        );
        manifest.write_to(dir.path()).unwrap();

        let back = ScanManifest::read_from(dir.path()).unwrap();
        assert_eq!(back.outcome, ScanState::Completed);
        assert_eq!(back.artifacts, vec!["y000_x000_nm500.0.npz"]);
        assert_eq!(back.mono_settle_ms, 7);
        assert!(back.finished_at.is_some());
    }
}
