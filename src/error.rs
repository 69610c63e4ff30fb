use std::path::PathBuf;

use thiserror::Error;

/// Failures of the merge itself, as opposed to plain I/O or codec errors
/// (those travel as `anyhow` context chains).
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("no input files ending in {suffix:?} found in {}", dir.display())]
    NoInputs { dir: PathBuf, suffix: String },

    #[error(
        "image size mismatch: {} is {}x{}, expected {}x{}",
        path.display(), found.0, found.1, expected.0, expected.1
    )]
    DimensionMismatch {
        path: PathBuf,
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("unsupported sample type in {}: {kind}", path.display())]
    UnsupportedSamples { path: PathBuf, kind: String },

    #[error(
        "{} has {len} samples, not a whole number of bands for {width}x{height}",
        path.display()
    )]
    SampleCount {
        path: PathBuf,
        len: usize,
        width: u32,
        height: u32,
    },
}
