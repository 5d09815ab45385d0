// deeptrust/src/error.rs
//
// Error taxonomy.
//
//   AdapterFailure  - closed set of reasons a detector can fail. Never escapes
//                     the dispatch layer; recorded in DetectorStatus::Failed.
//   PipelineError   - request-level, fatal. Only InvalidMedia, PipelineTimeout
//                     and Cancelled reach the caller.
//   ConfigError     - config file load / validation / hot reload.
//
// "All detectors unavailable" is NOT an error: it surfaces as an
// Indeterminate verdict with an IndeterminateReason.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a detector produced no score.
#[derive(Debug, Clone, Copy, Error, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AdapterFailure {
    /// The detector needs a subject (face) and none was located.
    #[error("no subject found")]
    NoSubjectFound,
    /// Input is outside what the model accepts (too small, wrong layout).
    #[error("unsupported input")]
    UnsupportedInput,
    /// Anything else: model error, panic, out-of-range output.
    #[error("internal detector error")]
    InternalError,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid media: {0}")]
    InvalidMedia(String),

    #[error("pipeline deadline of {0} ms exceeded")]
    PipelineTimeout(u64),

    #[error("analysis cancelled by caller")]
    Cancelled,
}

impl PipelineError {
    /// Stable machine-readable code for sinks and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMedia(_)    => "invalid_media",
            Self::PipelineTimeout(_) => "pipeline_timeout",
            Self::Cancelled          => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path:   PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
