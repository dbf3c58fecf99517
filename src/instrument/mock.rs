//! Simulated instruments
//!
//! Stand-ins for the helper processes, used by `flim-daq scan --mock`,
//! `flim-daq sweep --mock` and by the orchestrator tests. All mocks can share
//! one [`InstrumentLog`], which records every call in the order the
//! instruments saw it:
//!
//! ```text
//! stage open 750
//! mono goto 500.0
//! counter acquire 1000
//! ```
//!
//! Timing uses `tokio::time::sleep`, never a blocking sleep.

use super::{
    AxisStatus, CounterInit, Histogram, HistogramGeometry, InstrumentFactory, IntensityDetector,
    Monochromator, PhotonCounter, Stage, StageOpen,
};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use ndarray::Array2;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Ordered record of calls made on the mocks.
#[derive(Debug, Clone, Default)]
pub struct InstrumentLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl InstrumentLog {
    fn record(&self, entry: String) {
        debug!("mock: {}", entry);
        lock(&self.entries).push(entry);
    }

    /// All entries so far.
    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Number of entries starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

/// Synthetic fluorescence decay: a single exponential per channel.
pub fn synthetic_decay(geometry: &HistogramGeometry, peak: f64) -> Array2<u32> {
    let tau = (geometry.bins as f64 / 8.0).max(1.0);
    Array2::from_shape_fn((geometry.channels, geometry.bins), |(ch, bin)| {
        let scale = 1.0 / (ch as f64 + 1.0);
        (peak * scale * (-(bin as f64) / tau).exp()).round() as u32
    })
}

/// Synthetic emission line: a Gaussian of unit height at 550 nm, 20 nm wide.
pub fn synthetic_spectrum(wavelength_nm: f64) -> f64 {
    let x = (wavelength_nm - 550.0) / 20.0;
    (-0.5 * x * x).exp()
}

fn hangup(name: &str) -> DaqError {
    DaqError::Closed(name.to_string())
}

// =============================================================================
// MockCounter
// =============================================================================

/// Simulated photon counter.
#[derive(Debug)]
pub struct MockCounter {
    geometry: HistogramGeometry,
    log: InstrumentLog,
    initialized: bool,
    acquisitions: usize,
    fail_at_acquisition: Option<usize>,
    hangup_at_acquisition: Option<usize>,
    hung_up: bool,
    gate: Option<Arc<Semaphore>>,
    simulate_integration: bool,
}

impl MockCounter {
    /// Counter producing `geometry`-shaped histograms.
    pub fn new(geometry: HistogramGeometry, log: InstrumentLog) -> Self {
        Self {
            geometry,
            log,
            initialized: false,
            acquisitions: 0,
            fail_at_acquisition: None,
            hangup_at_acquisition: None,
            hung_up: false,
            gate: None,
            simulate_integration: false,
        }
    }

    fn ensure_alive(&self) -> AppResult<()> {
        if self.hung_up {
            Err(hangup("mock counter"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PhotonCounter for MockCounter {
    async fn initialize(&mut self, init: &CounterInit) -> AppResult<()> {
        self.log.record(format!(
            "counter init {} {} {} {}",
            init.binning, init.offset_ps, init.sync_div, init.sync_offset_ps
        ));
        self.initialized = true;
        Ok(())
    }

    async fn reset(&mut self) -> AppResult<()> {
        self.ensure_alive()?;
        self.log.record("counter reset".to_string());
        self.initialized = true;
        Ok(())
    }

    async fn describe(&mut self) -> AppResult<HistogramGeometry> {
        self.ensure_alive()?;
        if !self.initialized {
            return Err(DaqError::NotConnected("Photon counter (not initialized)"));
        }
        self.log.record("counter info".to_string());
        Ok(self.geometry)
    }

    async fn acquire(&mut self, acquisition_ms: u32) -> AppResult<Histogram> {
        self.ensure_alive()?;
        if !self.initialized {
            return Err(DaqError::NotConnected("Photon counter (not initialized)"));
        }
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| DaqError::Closed("mock counter".to_string()))?
                .forget();
        }
        self.acquisitions += 1;
        self.log.record(format!("counter acquire {}", acquisition_ms));

        if self.hangup_at_acquisition == Some(self.acquisitions) {
            self.hung_up = true;
            return Err(hangup("mock counter"));
        }
        if self.fail_at_acquisition == Some(self.acquisitions) {
            return Err(DaqError::Rejected(
                "ERR StartMeas -1 (simulated)".to_string(),
            ));
        }
        if self.simulate_integration {
            sleep(Duration::from_millis(u64::from(acquisition_ms))).await;
        }
        let peak = 1_000.0 + self.acquisitions as f64;
        Ok(Histogram::new(synthetic_decay(&self.geometry, peak)))
    }

    async fn close(&mut self) -> AppResult<()> {
        self.log.record("counter close".to_string());
        self.initialized = false;
        Ok(())
    }
}

// =============================================================================
// MockStage
// =============================================================================

/// Simulated two-axis stage.
#[derive(Debug)]
pub struct MockStage {
    log: InstrumentLog,
    opened: bool,
    fail_open: bool,
    moves: usize,
    hangup_at_move: Option<usize>,
    hung_up: bool,
}

impl MockStage {
    /// Stage recording into `log`.
    pub fn new(log: InstrumentLog) -> Self {
        Self {
            log,
            opened: false,
            fail_open: false,
            moves: 0,
            hangup_at_move: None,
            hung_up: false,
        }
    }

    fn ensure_alive(&self) -> AppResult<()> {
        if self.hung_up {
            Err(hangup("mock stage"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Stage for MockStage {
    async fn open(&mut self, params: &StageOpen) -> AppResult<()> {
        self.log
            .record(format!("stage open {}", params.max_voltage_tenths));
        if self.fail_open {
            return Err(DaqError::Rejected("ERR open_x (simulated)".to_string()));
        }
        self.opened = true;
        Ok(())
    }

    async fn move_to_index(&mut self, ix: u32, iy: u32, width: u32, height: u32) -> AppResult<()> {
        self.ensure_alive()?;
        if !self.opened {
            return Err(DaqError::NotConnected("Stage (axes not opened)"));
        }
        self.moves += 1;
        if self.hangup_at_move == Some(self.moves) {
            self.hung_up = true;
            return Err(hangup("mock stage"));
        }
        self.log
            .record(format!("stage move_ix {} {} {} {}", ix, iy, width, height));
        Ok(())
    }

    async fn set_dac(&mut self, vx_code: i16, vy_code: i16) -> AppResult<()> {
        self.ensure_alive()?;
        self.log.record(format!("stage setdac {} {}", vx_code, vy_code));
        Ok(())
    }

    async fn status(&mut self) -> AppResult<AxisStatus> {
        self.ensure_alive()?;
        self.log.record("stage status".to_string());
        Ok(AxisStatus {
            axis_x_connected: self.opened,
            axis_y_connected: self.opened,
        })
    }

    async fn disable(&mut self) {
        self.log.record("stage disable".to_string());
        self.opened = false;
    }

    async fn close(&mut self) -> AppResult<()> {
        self.disable().await;
        self.log.record("stage close".to_string());
        Ok(())
    }
}

// =============================================================================
// MockMonochromator
// =============================================================================

#[derive(Debug, Default)]
struct MonoState {
    position_nm: f64,
    target_nm: f64,
    lag_remaining: usize,
    position_queries: usize,
    shutter_open: bool,
}

/// Simulated monochromator.
///
/// With a lag of `n`, the first `n` `position()` queries after a `goto` still
/// report the previous wavelength.
#[derive(Debug, Default)]
pub struct MockMonochromator {
    state: Mutex<MonoState>,
    lag: usize,
    fail_goto_nm: Option<f64>,
    log: InstrumentLog,
}

impl MockMonochromator {
    /// Monochromator at 0 nm with its shutter closed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record into a shared log.
    pub fn with_log(mut self, log: InstrumentLog) -> Self {
        self.log = log;
        self
    }

    /// Delay reaching the target by `queries` position reads.
    pub fn with_lag(mut self, queries: usize) -> Self {
        self.lag = queries;
        self
    }

    /// Make `goto(wavelength_nm)` fail.
    pub fn failing_goto(mut self, wavelength_nm: f64) -> Self {
        self.fail_goto_nm = Some(wavelength_nm);
        self
    }

    /// Number of `position()` calls so far.
    pub fn position_queries(&self) -> usize {
        lock(&self.state).position_queries
    }

    /// Whether the shutter is currently open.
    pub fn shutter_open(&self) -> bool {
        lock(&self.state).shutter_open
    }

    /// Wavelength of the last successful `goto`.
    pub fn target_nm(&self) -> f64 {
        lock(&self.state).target_nm
    }
}

#[async_trait]
impl Monochromator for MockMonochromator {
    async fn goto(&self, wavelength_nm: f64) -> AppResult<()> {
        self.log.record(format!("mono goto {:.1}", wavelength_nm));
        if self.fail_goto_nm == Some(wavelength_nm) {
            return Err(DaqError::Monochromator {
                command: "goto".to_string(),
                message: "grating drive fault (simulated)".to_string(),
            });
        }
        let mut state = lock(&self.state);
        state.target_nm = wavelength_nm;
        if self.lag == 0 {
            state.position_nm = wavelength_nm;
        }
        state.lag_remaining = self.lag;
        Ok(())
    }

    async fn position(&self) -> AppResult<f64> {
        let mut state = lock(&self.state);
        state.position_queries += 1;
        if state.lag_remaining > 0 {
            state.lag_remaining -= 1;
        } else {
            state.position_nm = state.target_nm;
        }
        Ok(state.position_nm)
    }

    async fn open_shutter(&self) -> AppResult<()> {
        self.log.record("mono open_shutter".to_string());
        lock(&self.state).shutter_open = true;
        Ok(())
    }

    async fn close_shutter(&self) -> AppResult<()> {
        self.log.record("mono close_shutter".to_string());
        lock(&self.state).shutter_open = false;
        Ok(())
    }
}

// =============================================================================
// MockDetector
// =============================================================================

/// Simulated intensity detector reading [`synthetic_spectrum`] at the
/// monochromator's current wavelength.
#[derive(Debug)]
pub struct MockDetector {
    log: InstrumentLog,
    monochromator: Arc<MockMonochromator>,
    records: usize,
    fail_at_record: Option<usize>,
    gate: Option<Arc<Semaphore>>,
}

impl MockDetector {
    /// Detector looking through `monochromator`.
    pub fn new(monochromator: Arc<MockMonochromator>, log: InstrumentLog) -> Self {
        Self {
            log,
            monochromator,
            records: 0,
            fail_at_record: None,
            gate: None,
        }
    }
}

#[async_trait]
impl IntensityDetector for MockDetector {
    async fn record(&mut self) -> AppResult<f64> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| hangup("mock detector"))?
                .forget();
        }
        self.records += 1;
        self.log.record("detector record".to_string());
        if self.fail_at_record == Some(self.records) {
            return Err(DaqError::Rejected("ERR overload (simulated)".to_string()));
        }
        Ok(synthetic_spectrum(self.monochromator.target_nm()))
    }

    async fn close(&mut self) -> AppResult<()> {
        self.log.record("detector close".to_string());
        Ok(())
    }
}

// =============================================================================
// MockInstrumentFactory
// =============================================================================

/// Builds mock sessions that all record into one [`InstrumentLog`].
#[derive(Debug)]
pub struct MockInstrumentFactory {
    geometry: HistogramGeometry,
    log: InstrumentLog,
    monochromator: Arc<MockMonochromator>,
    fail_counter_start: bool,
    fail_stage_start: bool,
    fail_stage_open: bool,
    fail_at_acquisition: Option<usize>,
    counter_hangup: Mutex<Option<usize>>,
    stage_hangup: Mutex<Option<usize>>,
    fail_detector_start: bool,
    fail_at_record: Option<usize>,
    acquire_gate: Option<Arc<Semaphore>>,
    simulate_integration: bool,
}

impl Default for MockInstrumentFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockInstrumentFactory {
    /// Two channels of 256 bins at 25 ps.
    pub fn new() -> Self {
        let log = InstrumentLog::default();
        Self {
            geometry: HistogramGeometry {
                resolution_ps: 25.0,
                channels: 2,
                bins: 256,
            },
            monochromator: Arc::new(MockMonochromator::new().with_log(log.clone())),
            log,
            fail_counter_start: false,
            fail_stage_start: false,
            fail_stage_open: false,
            fail_at_acquisition: None,
            counter_hangup: Mutex::new(None),
            stage_hangup: Mutex::new(None),
            fail_detector_start: false,
            fail_at_record: None,
            acquire_gate: None,
            simulate_integration: false,
        }
    }

    /// Override the histogram geometry.
    pub fn with_geometry(mut self, geometry: HistogramGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Replace the monochromator (its own log is replaced by the shared one).
    pub fn with_monochromator(mut self, mono: MockMonochromator) -> Self {
        self.monochromator = Arc::new(mono.with_log(self.log.clone()));
        self
    }

    /// The counter helper fails to launch.
    pub fn failing_counter_start(mut self) -> Self {
        self.fail_counter_start = true;
        self
    }

    /// The stage helper fails to launch.
    pub fn failing_stage_start(mut self) -> Self {
        self.fail_stage_start = true;
        self
    }

    /// The stage rejects `open`.
    pub fn failing_stage_open(mut self) -> Self {
        self.fail_stage_open = true;
        self
    }

    /// The `n`th acquisition (1-based) is rejected.
    pub fn failing_acquisition(mut self, n: usize) -> Self {
        self.fail_at_acquisition = Some(n);
        self
    }

    /// The next counter started hangs up at its `n`th acquisition (1-based)
    /// and reports `Closed` from then on. Counters started later are healthy.
    pub fn hanging_up_counter_at(self, n: usize) -> Self {
        *lock(&self.counter_hangup) = Some(n);
        self
    }

    /// The next stage started hangs up at its `n`th move (1-based) and reports
    /// `Closed` from then on. Stages started later are healthy.
    pub fn hanging_up_stage_at(self, n: usize) -> Self {
        *lock(&self.stage_hangup) = Some(n);
        self
    }

    /// The detector helper fails to launch.
    pub fn failing_detector_start(mut self) -> Self {
        self.fail_detector_start = true;
        self
    }

    /// The `n`th detector reading (1-based) is rejected.
    pub fn failing_record(mut self, n: usize) -> Self {
        self.fail_at_record = Some(n);
        self
    }

    /// Each acquisition and detector reading first takes a permit from `gate`.
    pub fn with_acquire_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.acquire_gate = Some(gate);
        self
    }

    /// Acquisitions sleep for their integration time.
    pub fn simulating_integration(mut self) -> Self {
        self.simulate_integration = true;
        self
    }

    /// Shared call log.
    pub fn log(&self) -> InstrumentLog {
        self.log.clone()
    }

    /// The monochromator handed to the orchestrator.
    pub fn monochromator_handle(&self) -> Arc<MockMonochromator> {
        self.monochromator.clone()
    }
}

#[async_trait]
impl InstrumentFactory for MockInstrumentFactory {
    async fn start_counter(&self) -> AppResult<Box<dyn PhotonCounter>> {
        if self.fail_counter_start {
            return Err(DaqError::SpawnFailed {
                program: "mock-counter".to_string(),
                reason: "simulated launch failure".to_string(),
            });
        }
        let mut counter = MockCounter::new(self.geometry, self.log.clone());
        counter.fail_at_acquisition = self.fail_at_acquisition;
        counter.hangup_at_acquisition = lock(&self.counter_hangup).take();
        counter.gate = self.acquire_gate.clone();
        counter.simulate_integration = self.simulate_integration;
        Ok(Box::new(counter))
    }

    async fn start_stage(&self) -> AppResult<Box<dyn Stage>> {
        if self.fail_stage_start {
            return Err(DaqError::SpawnFailed {
                program: "mock-stage".to_string(),
                reason: "simulated launch failure".to_string(),
            });
        }
        let mut stage = MockStage::new(self.log.clone());
        stage.fail_open = self.fail_stage_open;
        stage.hangup_at_move = lock(&self.stage_hangup).take();
        Ok(Box::new(stage))
    }

    async fn start_detector(&self) -> AppResult<Box<dyn IntensityDetector>> {
        if self.fail_detector_start {
            return Err(DaqError::SpawnFailed {
                program: "mock-detector".to_string(),
                reason: "simulated launch failure".to_string(),
            });
        }
        let mut detector = MockDetector::new(self.monochromator.clone(), self.log.clone());
        detector.fail_at_record = self.fail_at_record;
        detector.gate = self.acquire_gate.clone();
        Ok(Box::new(detector))
    }

    fn monochromator(&self) -> Arc<dyn Monochromator> {
        self.monochromator.clone()
    }
}
