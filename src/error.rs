use thiserror::Error;

use crate::control_loop::LoopState;

/// Calibration failures. Recovered locally by collecting more samples.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Insufficient calibration samples: got {got}, need {needed}")]
    InsufficientSamples { got: usize, needed: usize },

    #[error("Degenerate calibration geometry: sample points are coincident or collinear")]
    DegenerateGeometry,

    #[error("SVD of the cross-covariance matrix failed")]
    SvdFailed,
}

/// Pose source failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("Pose source timed out")]
    Timeout,

    #[error("Pose source disconnected")]
    Disconnected,

    #[error("Non-monotonic pose timestamp: {got} after {last}")]
    NonMonotonic { last: f64, got: f64 },

    #[error("Pose sample rejected: {0}")]
    Rejected(String),
}

/// Robot backend failures (hardware driver or simulator).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend dispatch timed out")]
    Timeout,

    #[error("Backend fault: {0}")]
    Fault(String),

    #[error("Backend disconnected")]
    Disconnected,
}

/// Configuration load/validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level teleop error type
#[derive(Error, Debug)]
pub enum TeleopError {
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid state transition: {action} while {state:?}")]
    InvalidTransition { state: LoopState, action: &'static str },

    #[error("Joint state dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid joint limits: {0}")]
    InvalidLimits(String),

    #[error("Resume refused: {0}")]
    ResumeRefused(String),
}

pub type TeleopResult<T> = Result<T, TeleopError>;
