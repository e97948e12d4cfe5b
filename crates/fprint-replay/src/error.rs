//! Error types for the replay harness.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::capability::{EngineVersion, TraceFlavor};
use crate::image_cmp::PixelFormat;

/// Exit status meaning "this environment cannot run this test".
pub const SKIP_EXIT_CODE: u8 = 77;

/// Exit status of a failed run.
pub const FAILURE_EXIT_CODE: u8 = 1;

/// Result type alias for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Result type alias for image comparison.
pub type ImageResult<T> = Result<T, ImageError>;

/// Image decoding and comparison failures.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("cannot read image {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot decode PNG {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: png::DecodingError,
    },

    #[error("unsupported image {path}: {reason}")]
    Unsupported { path: PathBuf, reason: String },

    #[error("pixel buffer holds {actual} values for a {width}x{height} image")]
    PixelCount { width: u32, height: u32, actual: usize },

    #[error("image format mismatch: {left} vs {right}")]
    FormatMismatch { left: PixelFormat, right: PixelFormat },

    #[error(
        "image geometry mismatch: {left_width}x{left_height} stride {left_stride} vs \
         {right_width}x{right_height} stride {right_stride}"
    )]
    DimensionMismatch {
        left_width: u32,
        left_height: u32,
        left_stride: usize,
        right_width: u32,
        right_height: u32,
        right_stride: usize,
    },

    #[error("pixel mismatch at ({x}, {y}): {left:#04x} != {right:#04x}")]
    PixelMismatch { x: u32, y: u32, left: u8, right: u8 },
}

/// Errors that end a harness run, as a failure or as a skip.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The replay engine is not installed.
    #[error("replay engine {engine} not found, install umockdev")]
    EngineUnavailable { engine: String },

    /// The engine is too old for the trace flavor of a mode.
    #[error("umockdev {found} cannot replay {flavor} traces, {required} or newer required")]
    CapabilityInsufficient {
        flavor: TraceFlavor,
        required: EngineVersion,
        found: EngineVersion,
    },

    #[error("cannot parse replay engine version from {output:?}")]
    UnparseableVersion { output: String },

    #[error("malformed fixture {path}: {reason}")]
    MalformedFixture { path: PathBuf, reason: String },

    #[error(transparent)]
    Image(#[from] ImageError),

    /// A child exited non-zero (other than the skip code) or was killed.
    #[error("{what} failed: {status}")]
    ChildFailed {
        what: String,
        status: String,
        code: Option<i32>,
    },

    /// A child exited with the skip code.
    #[error("{what} requested a skip")]
    ChildSkipped { what: String },

    #[error("expected output {path} was not produced")]
    MissingOutput { path: PathBuf },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl HarnessError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        HarnessError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        HarnessError::MalformedFixture {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for the outcomes that mean "cannot run here" rather than "broken".
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            HarnessError::EngineUnavailable { .. }
                | HarnessError::CapabilityInsufficient { .. }
                | HarnessError::ChildSkipped { .. }
        )
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        if self.is_skip() {
            SKIP_EXIT_CODE
        } else {
            FAILURE_EXIT_CODE
        }
    }
}
