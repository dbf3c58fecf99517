//! Wavelength sweeps
//!
//! A [`SweepTask`] steps the monochromator across `steps + 1` evenly spaced
//! wavelengths and reads one intensity per wavelength from an
//! [`IntensityDetector`]. The stage and the photon counter take no part.
//!
//! ```text
//! goto start, wait initial_settle, open shutter
//! for wavelength in start..=end
//!   goto wavelength, settle, record
//! close shutter
//! write Wavelength,Intensity CSV        (completed sweeps only)
//! ```
//!
//! Cancellation is checked before each wavelength and interrupts the initial
//! wait. A cancelled or failed sweep leaves no CSV behind.

use super::ScanState;
use crate::data::write_spectrum_csv;
use crate::error::{AppResult, DaqError};
use crate::instrument::monochromator::SettleStrategy;
use crate::instrument::{InstrumentFactory, IntensityDetector, Monochromator};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Parameters of one sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepTask {
    /// First wavelength
    pub start_nm: f64,
    /// Last wavelength
    pub end_nm: f64,
    /// Number of equal intervals between `start_nm` and `end_nm`
    pub steps: u32,
    /// Wait at `start_nm` before the shutter opens
    pub initial_settle: Duration,
    /// Wait after each wavelength change (fixed settle strategy)
    pub step_delay: Duration,
    /// CSV written on completion
    pub output_path: PathBuf,
}

impl SweepTask {
    /// Check the wavelength range and the output path.
    pub fn validate(&self) -> AppResult<()> {
        for (name, nm) in [("start", self.start_nm), ("end", self.end_nm)] {
            if !nm.is_finite() || nm < 0.0 {
                return Err(DaqError::Configuration(format!(
                    "Invalid sweep {} wavelength {} nm",
                    name, nm
                )));
            }
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "Sweep output path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of wavelengths a complete sweep visits.
    pub fn total_points(&self) -> usize {
        self.steps as usize + 1
    }

    /// The visited wavelengths, `start_nm` and `end_nm` included.
    ///
    /// Descending ranges are swept downwards; zero steps visits `start_nm` only.
    pub fn wavelengths(&self) -> Vec<f64> {
        if self.steps == 0 {
            return vec![self.start_nm];
        }
        let span = self.end_nm - self.start_nm;
        let steps = f64::from(self.steps);
        (0..=self.steps)
            .map(|i| {
                if i == self.steps {
                    self.end_nm
                } else {
                    self.start_nm + span * f64::from(i) / steps
                }
            })
            .collect()
    }
}

/// One recorded wavelength.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    /// Position in the sweep, from 0
    pub index: usize,
    /// Monochromator wavelength
    pub wavelength_nm: f64,
    /// Detector reading
    pub intensity: f64,
}

/// Progress reported while a sweep runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepEvent {
    /// The detector is connected and the monochromator is heading for the start.
    Started {
        /// Points a complete sweep records
        total_points: usize,
    },
    /// One intensity was recorded.
    PointRecorded(SweepPoint),
    /// Terminal outcome; always the last event.
    Finished {
        /// `Completed`, `Cancelled` or `Failed`
        state: ScanState,
        /// Points recorded before the sweep ended
        points: usize,
    },
}

/// Result of a sweep that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    /// `Completed` or `Cancelled`
    pub state: ScanState,
    /// Recorded points in sweep order
    pub points: Vec<SweepPoint>,
    /// The CSV, present only for completed sweeps
    pub output: Option<PathBuf>,
}

fn point_error(index: usize, wavelength_nm: Option<f64>, source: DaqError) -> DaqError {
    DaqError::SweepStep {
        index,
        wavelength_nm,
        source: Box::new(source),
    }
}

pub(super) struct SweepWorker {
    pub(super) task: SweepTask,
    pub(super) factory: Arc<dyn InstrumentFactory>,
    pub(super) monochromator: Arc<dyn Monochromator>,
    pub(super) settle: SettleStrategy,
    pub(super) events: mpsc::UnboundedSender<SweepEvent>,
    pub(super) cancel: CancellationToken,
    pub(super) state: Arc<watch::Sender<ScanState>>,
    pub(super) scanning: Arc<AtomicBool>,
}

impl SweepWorker {
    fn emit(&self, event: SweepEvent) {
        let _ = self.events.send(event);
    }

    pub(super) async fn run(self) -> AppResult<SweepReport> {
        let mut points = Vec::with_capacity(self.task.total_points());
        let mut shutter_open = false;

        let mut result = self.execute(&mut points, &mut shutter_open).await;

        if shutter_open {
            if let Err(e) = self.monochromator.close_shutter().await {
                warn!("Closing shutter after sweep failed: {}", e);
            }
        }

        let mut output = None;
        if matches!(result, Ok(ScanState::Completed)) {
            match self.save(&points).await {
                Ok(()) => output = Some(self.task.output_path.clone()),
                Err(e) => result = Err(e),
            }
        }

        let outcome = match &result {
            Ok(state) => *state,
            Err(_) => ScanState::Failed,
        };
        match &result {
            Ok(_) => info!("Sweep {} with {} points", outcome, points.len()),
            Err(e) => error!("{}", e),
        }

        self.scanning.store(false, Ordering::SeqCst);
        self.state.send_replace(outcome);
        self.state.send_replace(ScanState::Idle);
        self.emit(SweepEvent::Finished {
            state: outcome,
            points: points.len(),
        });

        result.map(|state| SweepReport {
            state,
            points,
            output,
        })
    }

    async fn execute(
        &self,
        points: &mut Vec<SweepPoint>,
        shutter_open: &mut bool,
    ) -> AppResult<ScanState> {
        let mut detector = self.factory.start_detector().await?;
        let result = self.sweep(detector.as_mut(), points, shutter_open).await;
        if let Err(e) = detector.close().await {
            warn!("Detector close failed: {}", e);
        }
        result
    }

    async fn sweep(
        &self,
        detector: &mut dyn IntensityDetector,
        points: &mut Vec<SweepPoint>,
        shutter_open: &mut bool,
    ) -> AppResult<ScanState> {
        let task = &self.task;
        self.emit(SweepEvent::Started {
            total_points: task.total_points(),
        });
        if self.cancel.is_cancelled() {
            return Ok(ScanState::Cancelled);
        }

        self.monochromator
            .goto(task.start_nm)
            .await
            .map_err(|e| point_error(0, None, e))?;
        tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("Sweep cancelled while settling at {:.1} nm", task.start_nm);
                return Ok(ScanState::Cancelled);
            }
            _ = sleep(task.initial_settle) => {}
        }
        self.monochromator
            .open_shutter()
            .await
            .map_err(|e| point_error(0, None, e))?;
        *shutter_open = true;

        for (index, wavelength_nm) in task.wavelengths().into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Sweep cancelled before {:.1} nm", wavelength_nm);
                return Ok(ScanState::Cancelled);
            }
            let intensity = self
                .record_point(detector, wavelength_nm)
                .await
                .map_err(|e| point_error(index, Some(wavelength_nm), e))?;
            let point = SweepPoint {
                index,
                wavelength_nm,
                intensity,
            };
            points.push(point);
            self.emit(SweepEvent::PointRecorded(point));
        }

        Ok(ScanState::Completed)
    }

    async fn record_point(
        &self,
        detector: &mut dyn IntensityDetector,
        wavelength_nm: f64,
    ) -> AppResult<f64> {
        self.monochromator.goto(wavelength_nm).await?;
        self.settle
            .settle(self.monochromator.as_ref(), wavelength_nm, self.task.step_delay)
            .await?;
        detector.record().await
    }

    async fn save(&self, points: &[SweepPoint]) -> AppResult<()> {
        let samples: Vec<(f64, f64)> = points
            .iter()
            .map(|p| (p.wavelength_nm, p.intensity))
            .collect();
        let path = self.task.output_path.clone();
        tokio::task::spawn_blocking(move || write_spectrum_csv(&path, &samples))
            .await
            .map_err(|e| DaqError::Storage(format!("spectrum writer task failed: {}", e)))?
    }
}
