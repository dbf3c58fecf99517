//! Per-step artifact writers.
//!
//! Every scan step is persisted as its own file so a failed or cancelled scan
//! keeps everything acquired before it. Files are written under a `.part` name
//! and renamed once complete; a file carrying the final name is always whole.
//!
//! The NPZ layout (one array per entry):
//!
//! | entry           | dtype | shape          |
//! |-----------------|-------|----------------|
//! | `counts`        | u32   | `[ch, bins]`   |
//! | `res_ps`        | f64   | scalar         |
//! | `tacq_ms`       | i64   | scalar         |
//! | `wavelength_nm` | f64   | scalar         |
//! | `pixel`         | i64   | `[row, col]`   |
//!
//! Wavelength sweeps produce a single spectrum instead, written as a two-column
//! CSV (`Wavelength,Intensity`) by [`write_spectrum_csv`].

use crate::error::{AppResult, DaqError};
use ndarray::{arr0, arr1, Array2};
use ndarray_npy::NpzWriter;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One scan step's data, ready to persist.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Grid row
    pub row: u32,
    /// Grid column
    pub col: u32,
    /// Monochromator wavelength
    pub wavelength_nm: f64,
    /// Integration time
    pub acquisition_ms: u32,
    /// Histogram bin width
    pub resolution_ps: f64,
    /// `[channels, bins]` photon counts
    pub counts: Array2<u32>,
}

/// File name for a step: `y{row:03}_x{col:03}_nm{wavelength:.1}.npz`.
pub fn artifact_file_name(row: u32, col: u32, wavelength_nm: f64) -> String {
    format!("y{:03}_x{:03}_nm{:.1}.npz", row, col, wavelength_nm)
}

/// Persists artifacts. Called from a blocking context.
pub trait ArtifactWriter: Send + Sync {
    /// Write `artifact` into `dir` and return the final path.
    fn write(&self, dir: &Path, artifact: &Artifact) -> AppResult<PathBuf>;
}

/// Compressed NumPy `.npz` writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NpzArtifactWriter;

impl NpzArtifactWriter {
    fn write_npz(path: &Path, artifact: &Artifact) -> AppResult<()> {
        let storage = |e: ndarray_npy::WriteNpzError| {
            DaqError::Storage(format!("failed to write {}: {}", path.display(), e))
        };

        let file = File::create(path)?;
        let mut npz = NpzWriter::new_compressed(file);
        npz.add_array("counts", &artifact.counts).map_err(storage)?;
        npz.add_array("res_ps", &arr0(artifact.resolution_ps))
            .map_err(storage)?;
        npz.add_array("tacq_ms", &arr0(i64::from(artifact.acquisition_ms)))
            .map_err(storage)?;
        npz.add_array("wavelength_nm", &arr0(artifact.wavelength_nm))
            .map_err(storage)?;
        npz.add_array(
            "pixel",
            &arr1(&[i64::from(artifact.row), i64::from(artifact.col)]),
        )
        .map_err(storage)?;
        let file = npz.finish().map_err(storage)?;
        file.sync_all()?;
        Ok(())
    }
}

impl ArtifactWriter for NpzArtifactWriter {
    fn write(&self, dir: &Path, artifact: &Artifact) -> AppResult<PathBuf> {
        let name = artifact_file_name(artifact.row, artifact.col, artifact.wavelength_nm);
        let path = dir.join(&name);
        let partial = dir.join(format!("{}.part", name));

        if let Err(e) = Self::write_npz(&partial, artifact) {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
        fs::rename(&partial, &path)?;

        debug!("Saved {}", path.display());
        Ok(path)
    }
}

/// Write `(wavelength_nm, intensity)` rows to `path` as CSV.
///
/// The parent directory is created if needed. Rows go to a `.part` file that
/// is renamed over `path` once flushed.
pub fn write_spectrum_csv(path: &Path, samples: &[(f64, f64)]) -> AppResult<()> {
    let storage =
        |e: csv::Error| DaqError::Storage(format!("failed to write {}: {}", path.display(), e));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let write = || -> AppResult<()> {
        let file = File::create(&partial)?;
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(["Wavelength", "Intensity"])
            .map_err(storage)?;
        for (wavelength_nm, intensity) in samples {
            writer
                .write_record([wavelength_nm.to_string(), intensity.to_string()])
                .map_err(storage)?;
        }
        writer.flush()?;
        Ok(())
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::rename(&partial, path)?;

    debug!("Saved spectrum with {} points to {}", samples.len(), path.display());
    Ok(())
}
