//! Error types for the analysis engine.
//!
//! Score and capture-device failures are returned to the caller. Failures
//! that happen while analysing a single note or measure are absorbed by the
//! classifier and the scheduler and show up as data (`wrong` notes or
//! `failed` measures) instead.

use thiserror::Error;

/// The score document could not be turned into a [`crate::Score`].
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("unsupported document root <{0}>, expected <score-partwise>")]
    UnsupportedRoot(String),

    #[error("document ended inside <{0}>")]
    Truncated(String),

    #[error("note in measure {measure} is missing its pitch {field}")]
    MissingPitch { measure: u32, field: &'static str },

    #[error("score contains no measures")]
    NoMeasures,
}

/// Recording could not be started or stopped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("no audio input device available")]
    NoDevice,

    #[error("audio input permission denied")]
    PermissionDenied,

    #[error("audio stream failed: {0}")]
    Stream(String),

    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("no recording in progress")]
    NotRecording,

    #[error("failed to seal recording: {0}")]
    Seal(String),
}

/// A time range could not be extracted from captured audio.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("range {start_secs:.3}s..{end_secs:.3}s not available ({available_secs:.3}s captured)")]
    OutOfRange {
        start_secs: f64,
        end_secs: f64,
        available_secs: f64,
    },

    #[error("audio decode failed: {0}")]
    Decode(String),
}

/// The pitch estimator could not run on the given input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassificationError {
    #[error("invalid sample rate {0}")]
    InvalidSampleRate(f32),

    #[error("analysis window too short ({0} samples)")]
    WindowTooShort(usize),
}

/// Why a measure-level analysis task did not produce feedback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error("analysis timed out after {0} ms")]
    Timeout(u64),

    #[error("analysis task aborted: {0}")]
    Aborted(String),
}

/// Stopping a recording did not produce a report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("final analysis failed: {0}")]
    Analysis(#[from] AnalysisError),
}

/// Engine configuration could not be loaded.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration value `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}
