//! Wavelength sweeps driven by simulated instruments.

use flim_daq::instrument::mock::{synthetic_spectrum, MockInstrumentFactory};
use flim_daq::scan::{ScanOrchestrator, ScanState, ScanTask, SweepEvent, SweepTask};
use flim_daq::DaqError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

fn sweep(path: &Path, start_nm: f64, end_nm: f64, steps: u32) -> SweepTask {
    SweepTask {
        start_nm,
        end_nm,
        steps,
        initial_settle: Duration::from_millis(1),
        step_delay: Duration::from_millis(1),
        output_path: path.to_path_buf(),
    }
}

fn read_spectrum(path: &Path) -> Vec<(f64, f64)> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    assert_eq!(
        reader.headers().unwrap(),
        &csv::StringRecord::from(vec!["Wavelength", "Intensity"])
    );
    reader
        .deserialize()
        .collect::<Result<Vec<(f64, f64)>, _>>()
        .unwrap()
}

#[tokio::test]
async fn test_completed_sweep_writes_spectrum() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("spectra").join("line.csv");
    let factory = MockInstrumentFactory::new();
    let log = factory.log();
    let mono = factory.monochromator_handle();
    let orchestrator = ScanOrchestrator::new(Arc::new(factory));

    let report = orchestrator
        .run_sweep(sweep(&csv_path, 540.0, 560.0, 4))
        .await
        .unwrap();

    assert_eq!(report.state, ScanState::Completed);
    assert_eq!(report.output, Some(csv_path.clone()));
    let wavelengths: Vec<f64> = report.points.iter().map(|p| p.wavelength_nm).collect();
    assert_eq!(wavelengths, vec![540.0, 545.0, 550.0, 555.0, 560.0]);
    assert!((report.points[2].intensity - 1.0).abs() < 1e-12);

    let rows = read_spectrum(&csv_path);
    let expected: Vec<(f64, f64)> = wavelengths
        .iter()
        .map(|&wl| (wl, synthetic_spectrum(wl)))
        .collect();
    assert_eq!(rows, expected);

    assert_eq!(
        log.entries(),
        vec![
            "mono goto 540.0",
            "mono open_shutter",
            "mono goto 540.0",
            "detector record",
            "mono goto 545.0",
            "detector record",
            "mono goto 550.0",
            "detector record",
            "mono goto 555.0",
            "detector record",
            "mono goto 560.0",
            "detector record",
            "detector close",
            "mono close_shutter",
        ]
    );
    assert!(!mono.shutter_open());
    assert_eq!(orchestrator.state(), ScanState::Idle);
    assert!(!orchestrator.is_scanning());
}

#[tokio::test]
async fn test_cancel_mid_sweep_closes_shutter_and_skips_csv() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("spectrum.csv");
    let gate = Arc::new(Semaphore::new(1));
    let factory = MockInstrumentFactory::new().with_acquire_gate(gate.clone());
    let log = factory.log();
    let orchestrator = ScanOrchestrator::new(Arc::new(factory));

    let mut handle = orchestrator
        .start_sweep(sweep(&csv_path, 500.0, 600.0, 10))
        .await
        .unwrap();
    let mut recorded = 0;
    let mut finished = None;
    while let Some(event) = handle.next_event().await {
        match event {
            SweepEvent::PointRecorded(_) => {
                recorded += 1;
                if recorded == 1 {
                    handle.cancel();
                    gate.add_permits(1);
                }
            }
            SweepEvent::Finished { state, points } => finished = Some((state, points)),
            SweepEvent::Started { total_points } => assert_eq!(total_points, 11),
        }
    }
    let report = handle.wait().await.unwrap();

    // The reading in flight when the stop arrived still completes.
    assert_eq!(report.state, ScanState::Cancelled);
    assert_eq!(report.points.len(), 2);
    assert_eq!(report.output, None);
    assert_eq!(finished, Some((ScanState::Cancelled, 2)));
    assert!(!csv_path.exists());
    assert_eq!(log.count("mono open_shutter"), 1);
    assert_eq!(log.count("mono close_shutter"), 1);
    assert_eq!(log.count("detector close"), 1);
    assert_eq!(orchestrator.state(), ScanState::Idle);
}

#[tokio::test]
async fn test_cancel_during_initial_settle() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("spectrum.csv");
    let factory = MockInstrumentFactory::new();
    let log = factory.log();
    let orchestrator = ScanOrchestrator::new(Arc::new(factory));

    let mut task = sweep(&csv_path, 500.0, 510.0, 1);
    task.initial_settle = Duration::from_secs(60);
    let cancel = CancellationToken::new();
    let handle = orchestrator
        .start_sweep_with_cancel(task, cancel.clone())
        .await
        .unwrap();
    cancel.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancel interrupts the initial wait")
        .unwrap();
    assert_eq!(report.state, ScanState::Cancelled);
    assert!(report.points.is_empty());
    assert_eq!(log.count("mono open_shutter"), 0);
    assert_eq!(log.count("detector record"), 0);
    assert!(!csv_path.exists());
}

#[tokio::test]
async fn test_detector_failure_reports_point_and_wavelength() {
    let dir = tempfile::tempdir().unwrap();
    let csv_path = dir.path().join("spectrum.csv");
    let factory = MockInstrumentFactory::new().failing_record(3);
    let log = factory.log();
    let mono = factory.monochromator_handle();
    let orchestrator = ScanOrchestrator::new(Arc::new(factory));

    let err = orchestrator
        .run_sweep(sweep(&csv_path, 540.0, 560.0, 4))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DaqError::SweepStep {
            index: 2,
            wavelength_nm: Some(wl),
            ..
        } if wl == 550.0
    ));
    assert!(matches!(err.root(), DaqError::Rejected(_)));
    assert!(!csv_path.exists());
    assert!(!mono.shutter_open());
    assert_eq!(log.count("detector close"), 1);
    assert_eq!(orchestrator.state(), ScanState::Idle);
}

#[tokio::test]
async fn test_detector_launch_failure_leaves_monochromator_alone() {
    let dir = tempfile::tempdir().unwrap();
    let factory = MockInstrumentFactory::new().failing_detector_start();
    let log = factory.log();
    let orchestrator = ScanOrchestrator::new(Arc::new(factory));

    let err = orchestrator
        .run_sweep(sweep(&dir.path().join("s.csv"), 500.0, 510.0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::SpawnFailed { .. }));
    assert_eq!(log.count("mono"), 0);
    assert!(!orchestrator.is_scanning());
}

#[tokio::test]
async fn test_invalid_sweep_rejected_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = ScanOrchestrator::new(Arc::new(MockInstrumentFactory::new()));
    let err = orchestrator
        .start_sweep(sweep(&dir.path().join("s.csv"), f64::NAN, 510.0, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Configuration(_)));
    assert!(!orchestrator.is_scanning());
}

#[tokio::test]
async fn test_sweep_and_scan_exclude_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let factory = MockInstrumentFactory::new().with_acquire_gate(gate.clone());
    let orchestrator = ScanOrchestrator::new(Arc::new(factory));
    orchestrator.connect().await.unwrap();

    let handle = orchestrator
        .start_sweep(sweep(&dir.path().join("s.csv"), 500.0, 510.0, 1))
        .await
        .unwrap();
    assert_eq!(orchestrator.state(), ScanState::Scanning);

    let scan = ScanTask {
        width: 1,
        height: 1,
        wavelengths_nm: vec![500.0],
        acquisition_ms: 1,
        stage_settle: Duration::ZERO,
        mono_settle: Duration::ZERO,
        output_dir: PathBuf::from(dir.path()),
        open_shutter: false,
    };
    assert!(matches!(
        orchestrator.start_scan(scan.clone()).await,
        Err(DaqError::ScanActive)
    ));
    assert!(matches!(
        orchestrator
            .start_sweep(sweep(&dir.path().join("t.csv"), 500.0, 510.0, 1))
            .await,
        Err(DaqError::ScanActive)
    ));
    assert!(matches!(
        orchestrator.connect().await,
        Err(DaqError::ScanActive)
    ));

    gate.add_permits(2);
    assert_eq!(handle.wait().await.unwrap().state, ScanState::Completed);

    gate.add_permits(1);
    let report = orchestrator.run_scan(scan).await.unwrap();
    assert_eq!(report.state, ScanState::Completed);
}
