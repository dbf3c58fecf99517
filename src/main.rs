//! flim-daq command-line interface
//!
//! ```text
//! flim-daq scan [--mock] [--output <dir>]
//! flim-daq sweep [--mock] [--start <nm>] [--end <nm>] [--steps <n>] [--output <csv>]
//! flim-daq status
//! flim-daq counter-info
//! flim-daq mono goto <nm> | position | shutter <open|close>
//! flim-daq check-config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flim_daq::config::{FlimConfig, DEFAULT_CONFIG_PATH};
use flim_daq::instrument::mock::MockInstrumentFactory;
use flim_daq::instrument::{
    CommandMonochromator, InstrumentFactory, Monochromator, ProcessInstrumentFactory,
};
use flim_daq::scan::{ScanEvent, ScanOrchestrator, SweepEvent, SweepTask};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flim-daq", version)]
#[command(about = "Stage x wavelength photon-counting scans", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect the instruments and run the configured scan (Ctrl-C stops it)
    Scan {
        /// Use simulated instruments
        #[arg(long)]
        mock: bool,

        /// Override the output directory
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Sweep the monochromator and record a detector spectrum (Ctrl-C stops it)
    Sweep {
        /// Use simulated instruments
        #[arg(long)]
        mock: bool,

        /// Override the first wavelength (nm)
        #[arg(long)]
        start: Option<f64>,

        /// Override the last wavelength (nm)
        #[arg(long)]
        end: Option<f64>,

        /// Override the number of intervals
        #[arg(long)]
        steps: Option<u32>,

        /// Override the CSV path
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Connect the stage and report axis connectivity
    Status,
    /// Connect the photon counter and report its histogram geometry
    CounterInfo,
    /// Drive the monochromator directly
    Mono {
        #[command(subcommand)]
        action: MonoAction,
    },
    /// Load, validate and print the effective configuration
    CheckConfig,
}

#[derive(Subcommand)]
enum MonoAction {
    /// Move to a wavelength in nanometres
    Goto { wavelength_nm: f64 },
    /// Print the current wavelength
    Position,
    /// Open or close the shutter
    Shutter {
        #[arg(value_enum)]
        state: ShutterState,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum ShutterState {
    Open,
    Close,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FlimConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Scan { mock, output } => run_scan(config, mock, output).await,
        Command::Sweep {
            mock,
            start,
            end,
            steps,
            output,
        } => {
            let mut sweep = config.sweep.clone();
            sweep.start_nm = start.unwrap_or(sweep.start_nm);
            sweep.end_nm = end.unwrap_or(sweep.end_nm);
            sweep.steps = steps.unwrap_or(sweep.steps);
            if let Some(path) = output {
                sweep.output_path = path;
            }
            run_sweep(&config, sweep.task(), mock).await
        }
        Command::Status => stage_status(&config).await,
        Command::CounterInfo => counter_info(&config).await,
        Command::Mono { action } => mono(&config, action).await,
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_scan(config: FlimConfig, mock: bool, output: Option<PathBuf>) -> Result<()> {
    let factory: Arc<dyn InstrumentFactory> = if mock {
        info!("Using simulated instruments");
        Arc::new(MockInstrumentFactory::new().simulating_integration())
    } else {
        Arc::new(ProcessInstrumentFactory::new(config.clone()))
    };
    let orchestrator = ScanOrchestrator::from_config(&config, factory);

    let geometry = orchestrator
        .connect()
        .await
        .context("Failed to connect instruments")?;
    println!(
        "Counter: {} channels x {} bins, {} ps/bin",
        geometry.channels, geometry.bins, geometry.resolution_ps
    );

    let mut task = config.scan.task();
    if let Some(dir) = output {
        task.output_dir = dir;
    }
    let output_dir = task.output_dir.clone();

    let mut handle = orchestrator.start_scan(task).await?;
    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next step boundary");
            token.cancel();
        }
    });

    let mut total = 0;
    while let Some(event) = handle.next_event().await {
        match event {
            ScanEvent::Started { total_steps } => {
                total = total_steps;
                println!("Scanning {} steps into {}", total_steps, output_dir.display());
            }
            ScanEvent::StepCompleted { step, .. } => {
                println!(
                    "[{}/{}] row {} col {} {:.1} nm",
                    step.index + 1,
                    total,
                    step.row,
                    step.col,
                    step.wavelength_nm
                );
            }
            ScanEvent::PixelCompleted { .. } => {}
            ScanEvent::Finished { state, artifacts } => {
                println!("Scan {}: {} artifacts", state, artifacts);
            }
        }
    }

    let report = handle.wait().await;
    if let Err(e) = orchestrator.disconnect().await {
        warn!("Disconnect: {}", e);
    }
    let report = report.context("Scan failed")?;
    info!(
        "{} of {} steps written to {}",
        report.artifacts.len(),
        report.total_steps,
        output_dir.display()
    );
    Ok(())
}

async fn run_sweep(config: &FlimConfig, task: SweepTask, mock: bool) -> Result<()> {
    let factory: Arc<dyn InstrumentFactory> = if mock {
        info!("Using simulated instruments");
        Arc::new(MockInstrumentFactory::new())
    } else {
        Arc::new(ProcessInstrumentFactory::new(config.clone()))
    };
    let orchestrator = ScanOrchestrator::from_config(config, factory);

    let mut handle = orchestrator.start_sweep(task).await?;
    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping before the next wavelength");
            token.cancel();
        }
    });

    let mut total = 0;
    while let Some(event) = handle.next_event().await {
        match event {
            SweepEvent::Started { total_points } => {
                total = total_points;
                println!("Sweeping {} wavelengths", total_points);
            }
            SweepEvent::PointRecorded(point) => {
                println!(
                    "[{}/{}] {:.2} nm: {}",
                    point.index + 1,
                    total,
                    point.wavelength_nm,
                    point.intensity
                );
            }
            SweepEvent::Finished { state, points } => {
                println!("Sweep {}: {} points", state, points);
            }
        }
    }

    let report = handle.wait().await.context("Sweep failed")?;
    match report.output {
        Some(path) => info!("Spectrum written to {}", path.display()),
        None => info!("Sweep {}; no spectrum written", report.state),
    }
    Ok(())
}

async fn stage_status(config: &FlimConfig) -> Result<()> {
    let factory = ProcessInstrumentFactory::new(config.clone());
    let mut stage = factory.start_stage().await?;
    let status = async {
        stage.open(&config.stage.open_params()).await?;
        stage.status().await
    }
    .await;
    stage.close().await?;
    let status = status.context("Stage status query failed")?;
    println!(
        "X axis: {}\nY axis: {}",
        if status.axis_x_connected { "connected" } else { "disconnected" },
        if status.axis_y_connected { "connected" } else { "disconnected" }
    );
    Ok(())
}

async fn counter_info(config: &FlimConfig) -> Result<()> {
    let factory = ProcessInstrumentFactory::new(config.clone());
    let mut counter = factory.start_counter().await?;
    let geometry = async {
        counter.initialize(&config.counter.init()).await?;
        counter.describe().await
    }
    .await;
    counter.close().await?;
    let geometry = geometry.context("Photon counter query failed")?;
    println!(
        "Resolution: {} ps\nChannels: {}\nBins: {}",
        geometry.resolution_ps, geometry.channels, geometry.bins
    );
    Ok(())
}

async fn mono(config: &FlimConfig, action: MonoAction) -> Result<()> {
    let mono = CommandMonochromator::new(
        config.monochromator.program.clone(),
        config.monochromator.args.clone(),
    )
    .with_timeout(Duration::from_millis(config.monochromator.timeout_ms));

    match action {
        MonoAction::Goto { wavelength_nm } => {
            mono.goto(wavelength_nm).await?;
            println!("{:.1}", mono.position().await?);
        }
        MonoAction::Position => println!("{}", mono.position().await?),
        MonoAction::Shutter { state } => match state {
            ShutterState::Open => mono.open_shutter().await?,
            ShutterState::Close => mono.close_shutter().await?,
        },
    }
    Ok(())
}
