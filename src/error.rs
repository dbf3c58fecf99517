//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a single taxonomy for everything that
//! can go wrong between the operator and the instrument helper processes.
//!
//! ## Error Hierarchy
//!
//! - **Transport** (`SpawnFailed`, `NotReady`, `Timeout`, `Closed`, `Rejected`): raised by
//!   the line transport while talking to a helper process. These propagate unchanged
//!   through the instrument clients up to the scan orchestrator.
//! - **Protocol** (`Protocol`, `SizeMismatch`): the helper answered `OK` but the
//!   response did not carry what the client needs. `SizeMismatch` is a data-integrity
//!   fault and is never papered over by truncating or padding.
//! - **Collaborators** (`Monochromator`): the per-call monochromator command exited
//!   with a non-zero status.
//! - **Orchestration** (`NotConnected`, `ScanActive`, `ScanStep`, `SweepStep`): misuse
//!   of the orchestrator, or a scan or sweep that aborted at a specific step.
//! - **Ambient** (`Config`, `Configuration`, `Io`, `Storage`).

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by transports, instrument clients and the scan orchestrator.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The helper executable could not be launched, or exited before its handshake.
    #[error("Failed to spawn '{program}': {reason}")]
    SpawnFailed {
        /// Program that was launched
        program: String,
        /// Underlying cause
        reason: String,
    },

    /// The first line from the helper did not start with `OK`.
    #[error("'{program}' not ready: {greeting}")]
    NotReady {
        /// Program that was launched
        program: String,
        /// The line the helper emitted instead of the handshake
        greeting: String,
    },

    /// No response line arrived within the bound.
    #[error("No response from {target} within {timeout:?}")]
    Timeout {
        /// Instrument or collaborator that failed to answer
        target: String,
        /// The bound that expired
        timeout: Duration,
    },

    /// The helper process closed its output stream; the session is dead.
    #[error("{0} closed")]
    Closed(String),

    /// The helper answered with a non-`OK` status line (carried verbatim).
    #[error("{0}")]
    Rejected(String),

    /// A response was missing expected metadata or was malformed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A binary payload disagreed with its declared shape.
    #[error("Payload size mismatch: expected {expected} {unit}, got {actual}")]
    SizeMismatch {
        /// Unit of the counts below ("elements" or "bytes")
        unit: &'static str,
        /// Declared size
        expected: usize,
        /// Size actually received
        actual: usize,
    },

    /// The monochromator command exited with a non-zero status.
    #[error("Monochromator command '{command}' failed: {message}")]
    Monochromator {
        /// Command name passed to the collaborator
        command: String,
        /// Diagnostic output of the collaborator
        message: String,
    },

    /// The configuration sources could not be read or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A configuration value or scan task is out of range.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An artifact or manifest could not be written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An operation needed an instrument session that is not open.
    #[error("{0} is not connected")]
    NotConnected(&'static str),

    /// The operation is not allowed while a scan owns the instruments.
    #[error("A scan is already running")]
    ScanActive,

    /// A scan aborted at the given step.
    #[error(
        "Scan failed at row {row}, column {col}{}: {source}",
        wavelength_clause(.wavelength_nm)
    )]
    ScanStep {
        /// Grid row of the failing step
        row: u32,
        /// Grid column of the failing step
        col: u32,
        /// Wavelength of the failing step; `None` when the failure preceded the wavelength loop
        wavelength_nm: Option<f64>,
        /// The triggering error
        #[source]
        source: Box<DaqError>,
    },

    /// A spectral sweep aborted at the given point.
    #[error("Sweep failed at point {index}{}: {source}", wavelength_clause(.wavelength_nm))]
    SweepStep {
        /// Position of the failing point, from 0
        index: usize,
        /// Wavelength of the failing point; `None` for the initial positioning
        wavelength_nm: Option<f64>,
        /// The triggering error
        #[source]
        source: Box<DaqError>,
    },
}

fn wavelength_clause(wavelength_nm: &Option<f64>) -> String {
    match wavelength_nm {
        Some(nm) => format!(", {:.1} nm", nm),
        None => String::new(),
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Whether the error means the helper process is gone and the session must be dropped.
    pub fn is_session_dead(&self) -> bool {
        matches!(self, DaqError::Closed(_))
    }

    /// Unwraps a [`DaqError::ScanStep`] or [`DaqError::SweepStep`] to the error that triggered it.
    pub fn root(&self) -> &DaqError {
        match self {
            DaqError::ScanStep { source, .. } | DaqError::SweepStep { source, .. } => source.root(),
            other => other,
        }
    }
}
