//! Scan orchestrator driven by simulated instruments.

use flim_daq::instrument::mock::{MockInstrumentFactory, MockMonochromator};
use flim_daq::instrument::monochromator::SettleStrategy;
use flim_daq::metadata::ScanManifest;
use flim_daq::scan::{ScanEvent, ScanOrchestrator, ScanState, ScanTask};
use flim_daq::DaqError;
use ndarray::Array2;
use ndarray_npy::NpzReader;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

fn task(dir: &Path, width: u32, height: u32, wavelengths: &[f64]) -> ScanTask {
    ScanTask {
        width,
        height,
        wavelengths_nm: wavelengths.to_vec(),
        acquisition_ms: 5,
        stage_settle: Duration::from_millis(1),
        mono_settle: Duration::from_millis(1),
        output_dir: dir.to_path_buf(),
        open_shutter: false,
    }
}

fn npz_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".npz"))
        .collect();
    names.sort();
    names
}

async fn connected(factory: MockInstrumentFactory) -> ScanOrchestrator {
    let orchestrator = ScanOrchestrator::new(Arc::new(factory));
    orchestrator.connect().await.expect("mock connect");
    orchestrator
}

#[tokio::test]
async fn test_two_by_two_grid_two_wavelengths() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockInstrumentFactory::new();
    let log = factory.log();
    let orchestrator = connected(factory).await;

    let report = orchestrator
        .run_scan(task(dir.path(), 2, 2, &[500.0, 510.0]))
        .await
        .unwrap();

    assert_eq!(report.state, ScanState::Completed);
    assert_eq!(report.artifacts.len(), 8);
    assert_eq!(report.total_steps, 8);
    assert_eq!(log.count("stage move_ix"), 4);
    assert_eq!(log.count("counter acquire"), 8);
    assert_eq!(log.count("mono goto"), 8);
    assert_eq!(
        npz_files(dir.path()),
        vec![
            "y000_x000_nm500.0.npz",
            "y000_x000_nm510.0.npz",
            "y000_x001_nm500.0.npz",
            "y000_x001_nm510.0.npz",
            "y001_x000_nm500.0.npz",
            "y001_x000_nm510.0.npz",
            "y001_x001_nm500.0.npz",
            "y001_x001_nm510.0.npz",
        ]
    );
    assert_eq!(orchestrator.state(), ScanState::Idle);
}

#[tokio::test]
async fn test_commands_follow_physical_order() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockInstrumentFactory::new();
    let log = factory.log();
    let orchestrator = connected(factory).await;

    orchestrator
        .run_scan(task(dir.path(), 2, 1, &[500.0, 510.0]))
        .await
        .unwrap();

    let scan_calls: Vec<String> = log
        .entries()
        .into_iter()
        .skip_while(|e| !e.starts_with("stage move_ix"))
        .collect();
    assert_eq!(
        scan_calls,
        vec![
            "stage move_ix 0 0 2 1",
            "mono goto 500.0",
            "counter acquire 5",
            "mono goto 510.0",
            "counter acquire 5",
            "stage move_ix 1 0 2 1",
            "mono goto 500.0",
            "counter acquire 5",
            "mono goto 510.0",
            "counter acquire 5",
        ]
    );
}

#[tokio::test]
async fn test_artifact_contents() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = connected(MockInstrumentFactory::new()).await;
    orchestrator
        .run_scan(task(dir.path(), 1, 1, &[505.5]))
        .await
        .unwrap();

    let path = dir.path().join("y000_x000_nm505.5.npz");
    let mut npz = NpzReader::new(File::open(path).unwrap()).unwrap();
    let names = npz.names().unwrap();
    let counts_name = names
        .iter()
        .find(|n| n.starts_with("counts"))
        .cloned()
        .unwrap();
    let counts: Array2<u32> = npz.by_name(&counts_name).unwrap();
    assert_eq!(counts.dim(), (2, 256));
    assert!(names.iter().any(|n| n.starts_with("res_ps")));
    assert!(names.iter().any(|n| n.starts_with("pixel")));
}

#[tokio::test]
async fn test_progress_events() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = connected(MockInstrumentFactory::new()).await;
    let mut handle = orchestrator
        .start_scan(task(dir.path(), 2, 1, &[500.0, 510.0]))
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    handle.wait().await.unwrap();

    assert_eq!(events.first(), Some(&ScanEvent::Started { total_steps: 4 }));
    assert_eq!(
        events.last(),
        Some(&ScanEvent::Finished {
            state: ScanState::Completed,
            artifacts: 4
        })
    );
    let steps = events
        .iter()
        .filter(|e| matches!(e, ScanEvent::StepCompleted { .. }))
        .count();
    let pixels: Vec<(u32, u32)> = events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::PixelCompleted { row, col, .. } => Some((*row, *col)),
            _ => None,
        })
        .collect();
    assert_eq!(steps, 4);
    assert_eq!(pixels, vec![(0, 0), (0, 1)]);
}

#[tokio::test]
async fn test_cancelled_before_start_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockInstrumentFactory::new();
    let log = factory.log();
    let orchestrator = connected(factory).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = orchestrator
        .start_scan_with_cancel(task(dir.path(), 2, 2, &[500.0]), cancel)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.state, ScanState::Cancelled);
    assert!(report.artifacts.is_empty());
    assert!(npz_files(dir.path()).is_empty());
    assert_eq!(log.count("stage move_ix"), 0);
    assert_eq!(orchestrator.state(), ScanState::Idle);
}

#[tokio::test]
async fn test_cancel_mid_scan_stops_at_next_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Semaphore::new(3));
    let factory = MockInstrumentFactory::new().with_acquire_gate(gate.clone());
    let log = factory.log();
    let orchestrator = connected(factory).await;

    let mut handle = orchestrator
        .start_scan(task(dir.path(), 2, 2, &[500.0, 510.0]))
        .await
        .unwrap();

    // Three acquisitions pass; the fourth waits on the gate.
    let mut completed = 0;
    while completed < 3 {
        if let Some(ScanEvent::StepCompleted { .. }) = handle.next_event().await {
            completed += 1;
        }
    }
    handle.cancel();
    gate.add_permits(10);

    let report = handle.wait().await.unwrap();
    assert_eq!(report.state, ScanState::Cancelled);
    // The in-flight acquisition finishes and is kept; nothing after it runs.
    assert_eq!(report.artifacts.len(), 4);
    assert_eq!(npz_files(dir.path()).len(), 4);
    assert_eq!(log.count("counter acquire"), 4);
    assert_eq!(log.count("stage move_ix"), 2);
}

#[tokio::test]
async fn test_failure_reports_step_and_keeps_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockInstrumentFactory::new().failing_acquisition(3);
    let log = factory.log();
    let orchestrator = connected(factory).await;

    let mut handle = orchestrator
        .start_scan(task(dir.path(), 2, 1, &[500.0, 510.0]))
        .await
        .unwrap();
    let mut finished = None;
    while let Some(event) = handle.next_event().await {
        if let ScanEvent::Finished { state, .. } = event {
            finished = Some(state);
        }
    }
    let err = handle.wait().await.unwrap_err();

    match &err {
        DaqError::ScanStep {
            row,
            col,
            wavelength_nm,
            ..
        } => {
            assert_eq!((*row, *col), (0, 1));
            assert_eq!(*wavelength_nm, Some(500.0));
        }
        other => panic!("expected ScanStep, got {:?}", other),
    }
    assert!(matches!(err.root(), DaqError::Rejected(_)));
    assert!(err.to_string().contains("ERR StartMeas"));
    assert_eq!(finished, Some(ScanState::Failed));

    // Earlier artifacts survive; sessions stay open.
    assert_eq!(npz_files(dir.path()).len(), 2);
    assert_eq!(orchestrator.state(), ScanState::Idle);
    assert!(orchestrator.stage_status().await.is_ok());
    assert_eq!(log.count("stage disable"), 0);

    let manifest = ScanManifest::read_from(dir.path()).unwrap();
    assert_eq!(manifest.outcome, ScanState::Failed);
    assert!(manifest.error.unwrap().contains("row 0, column 1"));
}

#[tokio::test]
async fn test_monochromator_failure_aborts_before_acquisition() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockInstrumentFactory::new()
        .with_monochromator(MockMonochromator::new().failing_goto(510.0));
    let log = factory.log();
    let orchestrator = connected(factory).await;

    let err = orchestrator
        .run_scan(task(dir.path(), 1, 1, &[500.0, 510.0, 520.0]))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), DaqError::Monochromator { .. }));
    assert_eq!(log.count("counter acquire"), 1);
    assert_eq!(npz_files(dir.path()), vec!["y000_x000_nm500.0.npz"]);
}

#[tokio::test]
async fn test_second_scan_and_controller_calls_rejected_while_scanning() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let factory = MockInstrumentFactory::new().with_acquire_gate(gate.clone());
    let orchestrator = connected(factory).await;

    let handle = orchestrator
        .start_scan(task(dir.path(), 1, 1, &[500.0]))
        .await
        .unwrap();
    assert_eq!(orchestrator.state(), ScanState::Scanning);
    assert!(orchestrator.is_scanning());

    assert!(matches!(
        orchestrator.start_scan(task(dir.path(), 1, 1, &[500.0])).await,
        Err(DaqError::ScanActive)
    ));
    assert!(matches!(
        orchestrator.disconnect().await,
        Err(DaqError::ScanActive)
    ));
    assert!(matches!(
        orchestrator.stage_status().await,
        Err(DaqError::ScanActive)
    ));
    assert!(matches!(
        orchestrator.monochromator(),
        Err(DaqError::ScanActive)
    ));

    gate.add_permits(1);
    handle.wait().await.unwrap();

    // A new scan may start once the first is over.
    gate.add_permits(1);
    let report = orchestrator
        .run_scan(task(dir.path(), 1, 1, &[510.0]))
        .await
        .unwrap();
    assert_eq!(report.state, ScanState::Completed);
}

#[tokio::test]
async fn test_connect_keeps_the_session_that_succeeded() {
    let factory = Arc::new(MockInstrumentFactory::new().failing_stage_open());
    let log = factory.log();
    let orchestrator = ScanOrchestrator::new(factory);

    assert!(matches!(
        orchestrator.connect().await,
        Err(DaqError::Rejected(_))
    ));
    assert_eq!(orchestrator.state(), ScanState::Idle);
    assert!(orchestrator.geometry().await.is_some());
    // The stage that failed to open was still disabled and closed.
    assert_eq!(log.count("stage close"), 1);

    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        orchestrator.start_scan(task(dir.path(), 1, 1, &[500.0])).await,
        Err(DaqError::NotConnected("Stage"))
    ));
}

#[tokio::test]
async fn test_counter_launch_failure_leaves_stage_open() {
    let factory = Arc::new(MockInstrumentFactory::new().failing_counter_start());
    let orchestrator = ScanOrchestrator::new(factory);
    assert!(matches!(
        orchestrator.connect().await,
        Err(DaqError::SpawnFailed { .. })
    ));
    assert!(orchestrator.stage_status().await.unwrap().axis_x_connected);
    assert!(orchestrator.geometry().await.is_none());
}

#[tokio::test]
async fn test_disconnect_disables_stage_and_returns_to_idle() {
    let factory = MockInstrumentFactory::new();
    let log = factory.log();
    let orchestrator = connected(factory).await;
    assert_eq!(orchestrator.state(), ScanState::Ready);

    orchestrator.disconnect().await.unwrap();
    let entries = log.entries();
    let disable = entries.iter().position(|e| e == "stage disable").unwrap();
    let close = entries.iter().position(|e| e == "stage close").unwrap();
    assert!(disable < close);
    assert_eq!(log.count("counter close"), 1);
    assert_eq!(orchestrator.state(), ScanState::Idle);
    assert!(matches!(
        orchestrator.stage_status().await,
        Err(DaqError::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_shutter_opened_and_closed_around_scan() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockInstrumentFactory::new().failing_acquisition(1);
    let log = factory.log();
    let mono = factory.monochromator_handle();
    let orchestrator = connected(factory).await;

    let mut scan = task(dir.path(), 1, 1, &[500.0]);
    scan.open_shutter = true;
    assert!(orchestrator.run_scan(scan).await.is_err());

    assert_eq!(log.count("mono open_shutter"), 1);
    assert_eq!(log.count("mono close_shutter"), 1);
    assert!(!mono.shutter_open());
}

#[tokio::test]
async fn test_poll_settle_strategy_queries_position() {
    let dir = tempfile::tempdir().unwrap();
    let factory =
        MockInstrumentFactory::new().with_monochromator(MockMonochromator::new().with_lag(1));
    let mono = factory.monochromator_handle();
    let orchestrator = ScanOrchestrator::new(Arc::new(factory)).with_settle_strategy(
        SettleStrategy::PollPosition {
            tolerance_nm: 0.05,
            poll_interval_ms: 1,
            timeout_ms: 1_000,
        },
    );
    orchestrator.connect().await.unwrap();

    let report = orchestrator
        .run_scan(task(dir.path(), 1, 1, &[500.0, 510.0]))
        .await
        .unwrap();
    assert_eq!(report.artifacts.len(), 2);
    assert_eq!(mono.position_queries(), 4);
}

#[tokio::test]
async fn test_output_directory_is_created_and_manifest_written() {
    let root = tempfile::tempdir().unwrap();
    let out: PathBuf = root.path().join("nested").join("scan-1");
    let orchestrator = connected(MockInstrumentFactory::new()).await;

    orchestrator
        .run_scan(task(&out, 1, 2, &[500.0]))
        .await
        .unwrap();

    assert_eq!(npz_files(&out).len(), 2);
    let manifest = ScanManifest::read_from(&out).unwrap();
    assert_eq!(manifest.outcome, ScanState::Completed);
    assert_eq!(manifest.artifacts.len(), 2);
    assert_eq!(manifest.geometry.map(|g| g.bins), Some(256));
}

#[tokio::test]
async fn test_counter_hangup_drops_session_and_connect_respawns_it() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockInstrumentFactory::new().hanging_up_counter_at(2);
    let log = factory.log();
    let orchestrator = connected(factory).await;

    let err = orchestrator
        .run_scan(task(dir.path(), 2, 1, &[500.0]))
        .await
        .unwrap_err();
    assert!(err.root().is_session_dead());
    assert!(matches!(
        err,
        DaqError::ScanStep {
            row: 0,
            col: 1,
            wavelength_nm: Some(_),
            ..
        }
    ));

    // Only the dead counter is closed; the stage stays usable.
    assert_eq!(log.count("counter close"), 1);
    assert_eq!(log.count("stage disable"), 0);
    assert!(orchestrator.geometry().await.is_none());
    assert!(orchestrator.stage_status().await.is_ok());
    assert!(matches!(
        orchestrator.start_scan(task(dir.path(), 1, 1, &[500.0])).await,
        Err(DaqError::NotConnected("Photon counter"))
    ));

    orchestrator.connect().await.unwrap();
    assert_eq!(log.count("counter init"), 2);
    assert_eq!(log.count("stage open"), 1);
    assert_eq!(orchestrator.state(), ScanState::Ready);

    let report = orchestrator
        .run_scan(task(dir.path(), 2, 1, &[510.0]))
        .await
        .unwrap();
    assert_eq!(report.state, ScanState::Completed);
    assert_eq!(report.artifacts.len(), 2);
}

#[tokio::test]
async fn test_stage_hangup_disables_and_drops_stage_only() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockInstrumentFactory::new().hanging_up_stage_at(2);
    let log = factory.log();
    let orchestrator = connected(factory).await;

    let err = orchestrator
        .run_scan(task(dir.path(), 2, 1, &[500.0]))
        .await
        .unwrap_err();
    match &err {
        DaqError::ScanStep {
            row,
            col,
            wavelength_nm,
            ..
        } => {
            assert_eq!((*row, *col), (0, 1));
            assert_eq!(*wavelength_nm, None);
        }
        other => panic!("expected ScanStep, got {:?}", other),
    }
    assert_eq!(
        err.to_string(),
        "Scan failed at row 0, column 1: mock stage closed"
    );

    assert_eq!(log.count("stage disable"), 1);
    assert_eq!(log.count("stage close"), 1);
    assert_eq!(log.count("counter close"), 0);
    assert!(orchestrator.geometry().await.is_some());
    assert!(matches!(
        orchestrator.stage_status().await,
        Err(DaqError::NotConnected("Stage"))
    ));

    orchestrator.connect().await.unwrap();
    assert_eq!(log.count("stage open"), 2);
    assert_eq!(log.count("counter init"), 1);
    let report = orchestrator
        .run_scan(task(dir.path(), 2, 1, &[510.0]))
        .await
        .unwrap();
    assert_eq!(report.state, ScanState::Completed);
}

#[tokio::test]
async fn test_rejected_step_keeps_both_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockInstrumentFactory::new().failing_acquisition(1);
    let log = factory.log();
    let orchestrator = connected(factory).await;

    assert!(orchestrator
        .run_scan(task(dir.path(), 1, 1, &[500.0]))
        .await
        .is_err());
    assert_eq!(log.count("counter close"), 0);
    assert_eq!(log.count("stage close"), 0);
    assert!(orchestrator.geometry().await.is_some());

    orchestrator.connect().await.unwrap();
    assert_eq!(log.count("counter init"), 1);
    assert_eq!(log.count("stage open"), 1);
}
