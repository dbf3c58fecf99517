//! Instrument protocols
//!
//! Three instruments take part in a scan, each behind its own trait so the
//! orchestrator never sees a wire format:
//!
//! - [`PhotonCounter`]: time-correlated photon counting unit producing one
//!   histogram per channel for every timed acquisition.
//! - [`Stage`]: two-axis piezo stage addressed by discrete grid indices.
//! - [`Monochromator`]: wavelength selector with a shutter, driven by a
//!   short-lived command per call.
//!
//! Wavelength sweeps use the monochromator with an [`IntensityDetector`]
//! instead of the counter and stage.
//!
//! The counter, stage and detector clients are generic over [`LineTransport`](crate::transport::LineTransport),
//! so the same protocol code runs against a helper process or a scripted mock.

pub mod detector;
pub mod factory;
pub mod mock;
pub mod monochromator;
pub mod photon_counter;
pub mod stage;

pub use detector::DetectorClient;
pub use factory::{InstrumentFactory, ProcessInstrumentFactory};
pub use monochromator::CommandMonochromator;
pub use photon_counter::CounterClient;
pub use stage::StageClient;

use crate::error::AppResult;
use async_trait::async_trait;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Histogram geometry reported by the counter after initialization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramGeometry {
    /// Bin width in picoseconds
    pub resolution_ps: f64,
    /// Number of input channels
    pub channels: usize,
    /// Bins per channel histogram
    pub bins: usize,
}

/// Photon-arrival histograms from one acquisition, shape `[channels, bins]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    counts: Array2<u32>,
}

impl Histogram {
    /// Wrap a `[channels, bins]` array of counts.
    pub fn new(counts: Array2<u32>) -> Self {
        Self { counts }
    }

    /// Number of channel rows.
    pub fn channels(&self) -> usize {
        self.counts.nrows()
    }

    /// Number of bins per channel.
    pub fn bins(&self) -> usize {
        self.counts.ncols()
    }

    /// The raw counts.
    pub fn counts(&self) -> &Array2<u32> {
        &self.counts
    }

    /// Consume into the raw counts.
    pub fn into_counts(self) -> Array2<u32> {
        self.counts
    }

    /// Total photons per channel.
    pub fn channel_totals(&self) -> Vec<u64> {
        self.counts
            .rows()
            .into_iter()
            .map(|row| row.iter().map(|&c| u64::from(c)).sum())
            .collect()
    }
}

/// One-time counter configuration sent with `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterInit {
    /// Binning code (bin width = base resolution * 2^binning)
    pub binning: u32,
    /// Histogram offset in picoseconds
    pub offset_ps: i32,
    /// Sync input divider
    pub sync_div: u32,
    /// Sync channel offset in picoseconds
    pub sync_offset_ps: i32,
}

impl Default for CounterInit {
    fn default() -> Self {
        Self {
            binning: 1,
            offset_ps: 0,
            sync_div: 1,
            sync_offset_ps: 25_000,
        }
    }
}

/// Parameters for opening the stage axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOpen {
    /// Serial number of the X axis controller; the helper's default when absent
    pub serial_x: Option<String>,
    /// Serial number of the Y axis controller; the helper's default when absent
    pub serial_y: Option<String>,
    /// Maximum output voltage in tenths of a volt
    pub max_voltage_tenths: u32,
}

impl Default for StageOpen {
    fn default() -> Self {
        Self {
            serial_x: None,
            serial_y: None,
            max_voltage_tenths: 750,
        }
    }
}

/// Per-axis connectivity reported by the stage helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisStatus {
    /// X controller reachable
    pub axis_x_connected: bool,
    /// Y controller reachable
    pub axis_y_connected: bool,
}

/// Time-correlated photon counting unit.
#[async_trait]
pub trait PhotonCounter: Send {
    /// Configure the device. Must succeed before any other operation.
    async fn initialize(&mut self, init: &CounterInit) -> AppResult<()>;

    /// Re-initialize with the device defaults.
    async fn reset(&mut self) -> AppResult<()>;

    /// Query resolution and histogram geometry.
    async fn describe(&mut self) -> AppResult<HistogramGeometry>;

    /// Integrate for `acquisition_ms` and return one histogram per channel.
    async fn acquire(&mut self, acquisition_ms: u32) -> AppResult<Histogram>;

    /// End the session.
    async fn close(&mut self) -> AppResult<()>;
}

/// Two-axis stage addressed by grid index.
#[async_trait]
pub trait Stage: Send {
    /// Open and enable both axes.
    async fn open(&mut self, params: &StageOpen) -> AppResult<()>;

    /// Move to grid position (`ix`, `iy`) of a `width` x `height` grid.
    ///
    /// Mapping indices to output voltages is the helper's business.
    async fn move_to_index(&mut self, ix: u32, iy: u32, width: u32, height: u32)
        -> AppResult<()>;

    /// Write raw DAC codes to both axes, bypassing index mapping.
    async fn set_dac(&mut self, vx_code: i16, vy_code: i16) -> AppResult<()>;

    /// Per-axis connectivity.
    async fn status(&mut self) -> AppResult<AxisStatus>;

    /// Disable the outputs. Best effort: failures are logged, never returned.
    async fn disable(&mut self);

    /// Disable, then end the session, even if disabling failed.
    async fn close(&mut self) -> AppResult<()>;
}

/// Wavelength selector with a shutter.
#[async_trait]
pub trait Monochromator: Send + Sync {
    /// Drive to `wavelength_nm`.
    async fn goto(&self, wavelength_nm: f64) -> AppResult<()>;

    /// Current wavelength in nanometres.
    async fn position(&self) -> AppResult<f64>;

    /// Open the output shutter.
    async fn open_shutter(&self) -> AppResult<()>;

    /// Close the output shutter.
    async fn close_shutter(&self) -> AppResult<()>;
}

/// Single-value detector read once per sweep point.
#[async_trait]
pub trait IntensityDetector: Send {
    /// Read the current intensity.
    async fn record(&mut self) -> AppResult<f64>;

    /// End the session.
    async fn close(&mut self) -> AppResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_histogram_shape_and_totals() {
        let hist = Histogram::new(array![[0u32, 1, 2, 3], [4, 5, 6, 7]]);
        assert_eq!(hist.channels(), 2);
        assert_eq!(hist.bins(), 4);
        assert_eq!(hist.channel_totals(), vec![6, 22]);
    }

    #[test]
    fn test_defaults_match_helper_defaults() {
        let init = CounterInit::default();
        assert_eq!(init.binning, 1);
        assert_eq!(init.sync_offset_ps, 25_000);
        assert_eq!(StageOpen::default().max_voltage_tenths, 750);
    }
}
