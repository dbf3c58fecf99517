//! Artifact persistence.

pub mod storage;

pub use storage::{
    artifact_file_name, write_spectrum_csv, Artifact, ArtifactWriter, NpzArtifactWriter,
};
