//! Core library for the flim_daq application.
//!
//! Drives a fluorescence-lifetime imaging acquisition: an XY piezo stage, a
//! monochromator and a time-correlated photon counter are stepped in lockstep,
//! and one histogram artifact is written per (pixel, wavelength) step.
//!
//! The stage and the counter are vendor helper executables spoken to over a
//! line protocol on their standard streams ([`transport`]); the monochromator
//! is a per-call command. [`scan::ScanOrchestrator`] sequences all three.

pub mod config;
pub mod data;
pub mod error;
pub mod instrument;
pub mod metadata;
pub mod scan;
pub mod transport;

pub use error::{AppResult, DaqError};
