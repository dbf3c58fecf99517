//! Session construction
//!
//! A factory only *starts* sessions: the helper is launched and its handshake
//! checked. Initializing them (`init`, `open`) is the orchestrator's job, so the
//! same sequencing runs against real helpers and mocks.

use super::{
    CommandMonochromator, CounterClient, DetectorClient, IntensityDetector, Monochromator,
    PhotonCounter, Stage, StageClient,
};
use crate::config::FlimConfig;
use crate::error::AppResult;
use crate::transport::ProcessTransport;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Starts instrument sessions.
#[async_trait]
pub trait InstrumentFactory: Send + Sync {
    /// Launch the counter helper; the session is not yet initialized.
    async fn start_counter(&self) -> AppResult<Box<dyn PhotonCounter>>;

    /// Launch the stage helper; the axes are not yet open.
    async fn start_stage(&self) -> AppResult<Box<dyn Stage>>;

    /// Launch the intensity detector helper used by sweeps.
    async fn start_detector(&self) -> AppResult<Box<dyn IntensityDetector>>;

    /// The monochromator collaborator.
    fn monochromator(&self) -> Arc<dyn Monochromator>;
}

/// Factory for the real helper executables named in the configuration.
#[derive(Debug, Clone)]
pub struct ProcessInstrumentFactory {
    config: FlimConfig,
    monochromator: Arc<CommandMonochromator>,
}

impl ProcessInstrumentFactory {
    /// Factory using `config`'s counter, stage, detector and monochromator sections.
    pub fn new(config: FlimConfig) -> Self {
        let mono = &config.monochromator;
        let monochromator = Arc::new(
            CommandMonochromator::new(mono.program.clone(), mono.args.clone())
                .with_timeout(Duration::from_millis(mono.timeout_ms)),
        );
        Self {
            config,
            monochromator,
        }
    }
}

#[async_trait]
impl InstrumentFactory for ProcessInstrumentFactory {
    async fn start_counter(&self) -> AppResult<Box<dyn PhotonCounter>> {
        let counter = &self.config.counter;
        let transport = ProcessTransport::start_with_timeout(
            &counter.executable,
            &counter.args,
            counter.handshake_timeout(),
        )
        .await?;
        Ok(Box::new(CounterClient::with_timeouts(
            transport,
            counter.timeouts(),
        )))
    }

    async fn start_stage(&self) -> AppResult<Box<dyn Stage>> {
        let stage = &self.config.stage;
        let transport = ProcessTransport::start_with_timeout(
            &stage.executable,
            &stage.args,
            stage.handshake_timeout(),
        )
        .await?;
        Ok(Box::new(StageClient::with_timeout(
            transport,
            stage.command_timeout(),
        )))
    }

    async fn start_detector(&self) -> AppResult<Box<dyn IntensityDetector>> {
        let detector = &self.config.detector;
        let transport = ProcessTransport::start_with_timeout(
            &detector.executable,
            &detector.args,
            detector.handshake_timeout(),
        )
        .await?;
        Ok(Box::new(DetectorClient::with_timeout(
            transport,
            detector.command_timeout(),
        )))
    }

    fn monochromator(&self) -> Arc<dyn Monochromator> {
        self.monochromator.clone()
    }
}
