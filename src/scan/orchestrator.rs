//! Scan orchestrator
//!
//! Owns the counter and stage sessions and sequences them with the
//! monochromator. A scan or sweep runs on its own tokio task; the controlling
//! side keeps a [`TaskHandle`] for progress events and cooperative cancellation.
//!
//! # State machine
//!
//! ```text
//! Idle -> Connecting -> Ready -> Scanning -> {Completed | Cancelled | Failed} -> Idle
//! ```
//!
//! Terminal states are published and then immediately replaced by `Idle`.
//! Sessions stay open after every outcome, including failures, except a
//! session whose helper hung up (`Closed`): it is closed and dropped so the
//! next [`ScanOrchestrator::connect`] starts a fresh one.
//!
//! # Cancellation
//!
//! Checked before each stage move and before each wavelength. An acquisition
//! in flight is never interrupted; the step it belongs to is completed and
//! persisted, and the scan stops at the next boundary.

use super::sweep::{SweepEvent, SweepReport, SweepTask, SweepWorker};
use super::{ScanEvent, ScanReport, ScanState, ScanStep, ScanTask};
use crate::config::FlimConfig;
use crate::data::{Artifact, ArtifactWriter, NpzArtifactWriter};
use crate::error::{AppResult, DaqError};
use crate::instrument::monochromator::SettleStrategy;
use crate::instrument::{
    AxisStatus, CounterInit, HistogramGeometry, InstrumentFactory, Monochromator, PhotonCounter,
    Stage, StageOpen,
};
use crate::metadata::ScanManifest;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    Counter,
    Stage,
}

/// Open sessions. Locked by the scan worker for the whole scan.
#[derive(Default)]
struct Instruments {
    counter: Option<Box<dyn PhotonCounter>>,
    stage: Option<Box<dyn Stage>>,
    geometry: Option<HistogramGeometry>,
}

impl Instruments {
    /// Close and forget a session whose helper is gone.
    async fn discard(&mut self, session: Session) {
        match session {
            Session::Counter => {
                self.geometry = None;
                if let Some(mut counter) = self.counter.take() {
                    warn!("Photon counter helper is gone; dropping the session");
                    if let Err(e) = counter.close().await {
                        debug!("Closing dead photon counter session: {}", e);
                    }
                }
            }
            Session::Stage => {
                if let Some(mut stage) = self.stage.take() {
                    warn!("Stage helper is gone; dropping the session");
                    if let Err(e) = stage.close().await {
                        debug!("Closing dead stage session: {}", e);
                    }
                }
            }
        }
    }

    /// Pass `result` through, discarding `session` first if it reports a dead helper.
    async fn check<T>(&mut self, session: Session, result: AppResult<T>) -> AppResult<T> {
        if let Err(e) = &result {
            if e.is_session_dead() {
                self.discard(session).await;
            }
        }
        result
    }
}

/// Controller for the counter, the stage and the monochromator.
pub struct ScanOrchestrator {
    factory: Arc<dyn InstrumentFactory>,
    monochromator: Arc<dyn Monochromator>,
    writer: Arc<dyn ArtifactWriter>,
    counter_init: CounterInit,
    stage_open: StageOpen,
    settle: SettleStrategy,
    instruments: Arc<Mutex<Instruments>>,
    state: Arc<watch::Sender<ScanState>>,
    scanning: Arc<AtomicBool>,
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("state", &*self.state.borrow())
            .field("counter_init", &self.counter_init)
            .field("stage_open", &self.stage_open)
            .field("settle", &self.settle)
            .finish()
    }
}

impl ScanOrchestrator {
    /// Orchestrator with default instrument parameters and the NPZ writer.
    pub fn new(factory: Arc<dyn InstrumentFactory>) -> Self {
        let (state, _) = watch::channel(ScanState::Idle);
        Self {
            monochromator: factory.monochromator(),
            factory,
            writer: Arc::new(NpzArtifactWriter),
            counter_init: CounterInit::default(),
            stage_open: StageOpen::default(),
            settle: SettleStrategy::Fixed,
            instruments: Arc::new(Mutex::new(Instruments::default())),
            state: Arc::new(state),
            scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Orchestrator using the counter, stage and monochromator sections of `config`.
    pub fn from_config(config: &FlimConfig, factory: Arc<dyn InstrumentFactory>) -> Self {
        Self::new(factory)
            .with_counter_init(config.counter.init())
            .with_stage_open(config.stage.open_params())
            .with_settle_strategy(config.monochromator.settle.clone())
    }

    /// Counter parameters sent on connect.
    pub fn with_counter_init(mut self, init: CounterInit) -> Self {
        self.counter_init = init;
        self
    }

    /// Stage parameters sent on connect.
    pub fn with_stage_open(mut self, params: StageOpen) -> Self {
        self.stage_open = params;
        self
    }

    /// How scans wait after a wavelength change.
    pub fn with_settle_strategy(mut self, settle: SettleStrategy) -> Self {
        self.settle = settle;
        self
    }

    /// Replace the artifact writer.
    pub fn with_writer(mut self, writer: Arc<dyn ArtifactWriter>) -> Self {
        self.writer = writer;
        self
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    /// Whether a scan or sweep is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn ensure_not_scanning(&self) -> AppResult<()> {
        if self.is_scanning() {
            Err(DaqError::ScanActive)
        } else {
            Ok(())
        }
    }

    /// Histogram geometry from the last connect.
    pub async fn geometry(&self) -> Option<HistogramGeometry> {
        self.instruments.lock().await.geometry
    }

    /// Open whichever sessions are not open yet.
    ///
    /// The counter (start, initialize, describe) and the stage (start, open) are
    /// attempted independently; a session that succeeds is kept even if the
    /// other fails, so a retry only redoes the missing one.
    ///
    /// # Errors
    /// The first error encountered; the state is then `Idle`.
    pub async fn connect(&self) -> AppResult<HistogramGeometry> {
        self.ensure_not_scanning()?;
        let mut instruments = self.instruments.lock().await;
        self.state.send_replace(ScanState::Connecting);

        let mut first_error = None;

        if instruments.counter.is_none() || instruments.geometry.is_none() {
            if let Some(mut stale) = instruments.counter.take() {
                let _ = stale.close().await;
            }
            match self.open_counter().await {
                Ok((counter, geometry)) => {
                    info!(
                        "Photon counter ready: {} channels x {} bins at {} ps",
                        geometry.channels, geometry.bins, geometry.resolution_ps
                    );
                    instruments.counter = Some(counter);
                    instruments.geometry = Some(geometry);
                }
                Err(e) => {
                    error!("Photon counter connect failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if instruments.stage.is_none() {
            match self.open_stage().await {
                Ok(stage) => {
                    info!("Stage ready");
                    instruments.stage = Some(stage);
                }
                Err(e) => {
                    error!("Stage connect failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match (first_error, instruments.geometry) {
            (None, Some(geometry)) => {
                self.state.send_replace(ScanState::Ready);
                Ok(geometry)
            }
            (Some(e), _) => {
                self.state.send_replace(ScanState::Idle);
                Err(e)
            }
            (None, None) => {
                self.state.send_replace(ScanState::Idle);
                Err(DaqError::NotConnected("Photon counter"))
            }
        }
    }

    async fn open_counter(&self) -> AppResult<(Box<dyn PhotonCounter>, HistogramGeometry)> {
        let mut counter = self.factory.start_counter().await?;
        let setup = async {
            counter.initialize(&self.counter_init).await?;
            counter.describe().await
        }
        .await;
        match setup {
            Ok(geometry) => Ok((counter, geometry)),
            Err(e) => {
                if let Err(close) = counter.close().await {
                    warn!("Closing photon counter after failed setup: {}", close);
                }
                Err(e)
            }
        }
    }

    async fn open_stage(&self) -> AppResult<Box<dyn Stage>> {
        let mut stage = self.factory.start_stage().await?;
        match stage.open(&self.stage_open).await {
            Ok(()) => Ok(stage),
            Err(e) => {
                if let Err(close) = stage.close().await {
                    warn!("Closing stage after failed open: {}", close);
                }
                Err(e)
            }
        }
    }

    /// Close both sessions (the stage is disabled first).
    ///
    /// # Errors
    /// `ScanActive` during a scan; otherwise the first close error. Both sessions
    /// are dropped either way.
    pub async fn disconnect(&self) -> AppResult<()> {
        self.ensure_not_scanning()?;
        let mut instruments = self.instruments.lock().await;
        let mut result = Ok(());

        if let Some(mut stage) = instruments.stage.take() {
            if let Err(e) = stage.close().await {
                warn!("Stage close failed: {}", e);
                result = Err(e);
            }
        }
        if let Some(mut counter) = instruments.counter.take() {
            if let Err(e) = counter.close().await {
                warn!("Photon counter close failed: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        instruments.geometry = None;
        self.state.send_replace(ScanState::Idle);
        info!("Instruments disconnected");
        result
    }

    /// Per-axis connectivity of the stage.
    pub async fn stage_status(&self) -> AppResult<AxisStatus> {
        self.ensure_not_scanning()?;
        let mut instruments = self.instruments.lock().await;
        let stage = instruments
            .stage
            .as_deref_mut()
            .ok_or(DaqError::NotConnected("Stage"))?;
        let result = stage.status().await;
        instruments.check(Session::Stage, result).await
    }

    /// Reset the counter to its defaults and refresh the geometry.
    pub async fn reset_counter(&self) -> AppResult<HistogramGeometry> {
        self.ensure_not_scanning()?;
        let mut instruments = self.instruments.lock().await;
        let counter = instruments
            .counter
            .as_deref_mut()
            .ok_or(DaqError::NotConnected("Photon counter"))?;
        let result = async move {
            counter.reset().await?;
            counter.describe().await
        }
        .await;
        let geometry = instruments.check(Session::Counter, result).await?;
        instruments.geometry = Some(geometry);
        Ok(geometry)
    }

    /// Direct access to the monochromator outside a scan.
    pub fn monochromator(&self) -> AppResult<Arc<dyn Monochromator>> {
        self.ensure_not_scanning()?;
        Ok(self.monochromator.clone())
    }

    /// Start `task` with a fresh cancellation token.
    pub async fn start_scan(&self, task: ScanTask) -> AppResult<ScanHandle> {
        self.start_scan_with_cancel(task, CancellationToken::new())
            .await
    }

    /// Start `task`, stopping at the next boundary once `cancel` fires.
    ///
    /// # Errors
    /// `Configuration` for an invalid task, `ScanActive` if a scan is running,
    /// `NotConnected` unless both sessions are open.
    pub async fn start_scan_with_cancel(
        &self,
        task: ScanTask,
        cancel: CancellationToken,
    ) -> AppResult<ScanHandle> {
        task.validate()?;
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DaqError::ScanActive);
        }

        let instruments = self.instruments.clone().lock_owned().await;
        let missing = if instruments.counter.is_none() || instruments.geometry.is_none() {
            Some("Photon counter")
        } else if instruments.stage.is_none() {
            Some("Stage")
        } else {
            None
        };
        if let Some(name) = missing {
            drop(instruments);
            self.scanning.store(false, Ordering::SeqCst);
            return Err(DaqError::NotConnected(name));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = ScanWorker {
            task,
            monochromator: self.monochromator.clone(),
            writer: self.writer.clone(),
            settle: self.settle.clone(),
            counter_init: self.counter_init,
            events: events_tx,
            cancel: cancel.clone(),
            state: self.state.clone(),
            scanning: self.scanning.clone(),
        };

        self.state.send_replace(ScanState::Scanning);
        info!(
            "Scan started: {}x{} grid, {} wavelengths, {} ms per step",
            worker.task.width,
            worker.task.height,
            worker.task.wavelengths_nm.len(),
            worker.task.acquisition_ms
        );
        let join = tokio::spawn(worker.run(instruments));

        Ok(TaskHandle {
            events: events_rx,
            cancel,
            join,
        })
    }

    /// Run `task` to its end, discarding progress events.
    pub async fn run_scan(&self, task: ScanTask) -> AppResult<ScanReport> {
        self.start_scan(task).await?.wait().await
    }

    /// Start a wavelength sweep with a fresh cancellation token.
    pub async fn start_sweep(&self, task: SweepTask) -> AppResult<SweepHandle> {
        self.start_sweep_with_cancel(task, CancellationToken::new())
            .await
    }

    /// Start a wavelength sweep, stopping at the next wavelength once `cancel` fires.
    ///
    /// A sweep needs neither the counter nor the stage; it starts its own
    /// detector session and closes it when done.
    ///
    /// # Errors
    /// `Configuration` for an invalid task, `ScanActive` if a scan or sweep is running.
    pub async fn start_sweep_with_cancel(
        &self,
        task: SweepTask,
        cancel: CancellationToken,
    ) -> AppResult<SweepHandle> {
        task.validate()?;
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DaqError::ScanActive);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let worker = SweepWorker {
            task,
            factory: self.factory.clone(),
            monochromator: self.monochromator.clone(),
            settle: self.settle.clone(),
            events: events_tx,
            cancel: cancel.clone(),
            state: self.state.clone(),
            scanning: self.scanning.clone(),
        };

        self.state.send_replace(ScanState::Scanning);
        info!(
            "Sweep started: {:.1} to {:.1} nm in {} points",
            worker.task.start_nm,
            worker.task.end_nm,
            worker.task.total_points()
        );
        let join = tokio::spawn(worker.run());

        Ok(TaskHandle {
            events: events_rx,
            cancel,
            join,
        })
    }

    /// Run a sweep to its end, discarding progress events.
    pub async fn run_sweep(&self, task: SweepTask) -> AppResult<SweepReport> {
        self.start_sweep(task).await?.wait().await
    }
}

/// Controlling side of a running scan or sweep.
#[derive(Debug)]
pub struct TaskHandle<E, R> {
    events: mpsc::UnboundedReceiver<E>,
    cancel: CancellationToken,
    join: JoinHandle<AppResult<R>>,
}

/// Handle to a running scan.
pub type ScanHandle = TaskHandle<ScanEvent, ScanReport>;

/// Handle to a running sweep.
pub type SweepHandle = TaskHandle<SweepEvent, SweepReport>;

impl<E, R> TaskHandle<E, R> {
    /// Request a stop at the next boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The task's cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next progress event; `None` once the task has finished and all events were read.
    pub async fn next_event(&mut self) -> Option<E> {
        self.events.recv().await
    }

    /// Wait for the task to end.
    ///
    /// # Errors
    /// The task's error (a `ScanStep` or `SweepStep` for failures inside the loop).
    pub async fn wait(self) -> AppResult<R> {
        self.join
            .await
            .map_err(|e| DaqError::Io(std::io::Error::other(format!("scan worker: {}", e))))?
    }
}

struct ScanWorker {
    task: ScanTask,
    monochromator: Arc<dyn Monochromator>,
    writer: Arc<dyn ArtifactWriter>,
    settle: SettleStrategy,
    counter_init: CounterInit,
    events: mpsc::UnboundedSender<ScanEvent>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ScanState>>,
    scanning: Arc<AtomicBool>,
}

/// Bookkeeping the worker keeps whatever way the scan ends.
#[derive(Debug, Default)]
struct Progress {
    artifacts: Vec<PathBuf>,
    shutter_open: bool,
    dead_session: Option<Session>,
}

impl Progress {
    fn note(&mut self, session: Session, err: &DaqError) {
        if err.is_session_dead() {
            self.dead_session = Some(session);
        }
    }
}

fn step_error(row: u32, col: u32, wavelength_nm: Option<f64>, source: DaqError) -> DaqError {
    DaqError::ScanStep {
        row,
        col,
        wavelength_nm,
        source: Box::new(source),
    }
}

impl ScanWorker {
    fn emit(&self, event: ScanEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    async fn run(self, mut instruments: OwnedMutexGuard<Instruments>) -> AppResult<ScanReport> {
        let mut manifest = ScanManifest::begin(
            &self.task,
            Some(self.counter_init),
            instruments.geometry,
        );
        let mut progress = Progress::default();

        let result = self
            .execute(&mut instruments, &mut manifest, &mut progress)
            .await;

        if progress.shutter_open {
            if let Err(e) = self.monochromator.close_shutter().await {
                warn!("Closing shutter after scan failed: {}", e);
            }
        }
        if let Some(session) = progress.dead_session {
            instruments.discard(session).await;
        }
        let artifacts = progress.artifacts;

        let (outcome, message) = match &result {
            Ok(state) => (*state, None),
            Err(e) => (ScanState::Failed, Some(e.to_string())),
        };
        match &result {
            Ok(_) => info!("Scan {} with {} artifacts", outcome, artifacts.len()),
            Err(e) => error!("{}", e),
        }
        manifest.finish(outcome, message, &artifacts);
        if self.task.output_dir.is_dir() {
            if let Err(e) = write_manifest(&manifest, &self.task.output_dir).await {
                warn!("Failed to write scan manifest: {}", e);
            }
        }

        drop(instruments);
        self.scanning.store(false, Ordering::SeqCst);
        self.state.send_replace(outcome);
        self.state.send_replace(ScanState::Idle);
        self.emit(ScanEvent::Finished {
            state: outcome,
            artifacts: artifacts.len(),
        });

        result.map(|state| ScanReport {
            state,
            total_steps: self.task.total_steps(),
            artifacts,
        })
    }

    async fn execute(
        &self,
        instruments: &mut Instruments,
        manifest: &mut ScanManifest,
        progress: &mut Progress,
    ) -> AppResult<ScanState> {
        let task = &self.task;
        tokio::fs::create_dir_all(&task.output_dir).await?;
        write_manifest(manifest, &task.output_dir).await?;

        let resolution_ps = instruments
            .geometry
            .map(|g| g.resolution_ps)
            .ok_or(DaqError::NotConnected("Photon counter"))?;
        let counter = instruments
            .counter
            .as_deref_mut()
            .ok_or(DaqError::NotConnected("Photon counter"))?;
        let stage = instruments
            .stage
            .as_deref_mut()
            .ok_or(DaqError::NotConnected("Stage"))?;

        self.emit(ScanEvent::Started {
            total_steps: task.total_steps(),
        });

        if task.open_shutter && !self.cancel.is_cancelled() {
            self.monochromator
                .open_shutter()
                .await
                .map_err(|e| step_error(0, 0, None, e))?;
            progress.shutter_open = true;
        }

        let per_pixel = task.wavelengths_nm.len();
        for step in task.steps() {
            let ScanStep {
                row,
                col,
                wavelength_nm,
                ..
            } = step;

            if step.starts_pixel(per_pixel) {
                if self.cancel.is_cancelled() {
                    info!("Scan cancelled before pixel ({}, {})", row, col);
                    return Ok(ScanState::Cancelled);
                }
                if let Err(e) = stage
                    .move_to_index(col, row, task.width, task.height)
                    .await
                {
                    progress.note(Session::Stage, &e);
                    return Err(step_error(row, col, None, e));
                }
                sleep(task.stage_settle).await;
            }

            if self.cancel.is_cancelled() {
                info!("Scan cancelled before {:.1} nm at ({}, {})", wavelength_nm, row, col);
                return Ok(ScanState::Cancelled);
            }

            let path = self
                .acquire_step(counter, &step, resolution_ps, progress)
                .await
                .map_err(|e| step_error(row, col, Some(wavelength_nm), e))?;
            progress.artifacts.push(path.clone());
            self.emit(ScanEvent::StepCompleted { step, path });

            if (step.index + 1) % per_pixel == 0 {
                self.emit(ScanEvent::PixelCompleted {
                    row,
                    col,
                    width: task.width,
                    height: task.height,
                });
            }
        }

        Ok(ScanState::Completed)
    }

    async fn acquire_step(
        &self,
        counter: &mut dyn PhotonCounter,
        step: &ScanStep,
        resolution_ps: f64,
        progress: &mut Progress,
    ) -> AppResult<PathBuf> {
        let task = &self.task;
        self.monochromator.goto(step.wavelength_nm).await?;
        self.settle
            .settle(self.monochromator.as_ref(), step.wavelength_nm, task.mono_settle)
            .await?;

        let histogram = counter
            .acquire(task.acquisition_ms)
            .await
            .inspect_err(|e| progress.note(Session::Counter, e))?;
        let artifact = Artifact {
            row: step.row,
            col: step.col,
            wavelength_nm: step.wavelength_nm,
            acquisition_ms: task.acquisition_ms,
            resolution_ps,
            counts: histogram.into_counts(),
        };

        let writer = self.writer.clone();
        let dir = task.output_dir.clone();
        tokio::task::spawn_blocking(move || writer.write(&dir, &artifact))
            .await
            .map_err(|e| DaqError::Storage(format!("artifact writer task failed: {}", e)))?
    }
}

async fn write_manifest(manifest: &ScanManifest, dir: &Path) -> AppResult<PathBuf> {
    let manifest = manifest.clone();
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || manifest.write_to(&dir))
        .await
        .map_err(|e| DaqError::Storage(format!("manifest writer task failed: {}", e)))?
}
