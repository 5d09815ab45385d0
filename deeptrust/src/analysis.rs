// deeptrust/src/analysis.rs
//
// Shared domain types flowing through the pipeline:
//   DetectorName → DetectorResult (per adapter) → AnalysisResult (per request)
//
// Everything here is plain data. Detector outcomes are a closed tagged enum
// (DetectorStatus) so fusion and synthesis are pure functions over results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AdapterFailure;
use crate::media::{MediaFormat, MediaMetadata};

// ── Detector identity ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DetectorName {
    MesoNet,    // texture CNN
    Xception,   // gradient CNN
    Frequency,  // FFT / DCT spectrum
    Biological, // face symmetry + eye region
}

impl DetectorName {
    /// Configuration order. Dispatch output follows this order.
    pub const ALL: [DetectorName; 4] = [
        DetectorName::MesoNet,
        DetectorName::Xception,
        DetectorName::Frequency,
        DetectorName::Biological,
    ];
}

impl std::fmt::Display for DetectorName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MesoNet    => write!(f, "mesonet"),
            Self::Xception   => write!(f, "xception"),
            Self::Frequency  => write!(f, "frequency"),
            Self::Biological => write!(f, "biological"),
        }
    }
}

impl std::str::FromStr for DetectorName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mesonet" | "texture"      => Ok(Self::MesoNet),
            "xception" | "gradient"    => Ok(Self::Xception),
            "frequency"                => Ok(Self::Frequency),
            "biological" | "bio"       => Ok(Self::Biological),
            other => Err(format!("unknown detector: {}", other)),
        }
    }
}

// ── Saliency grid ─────────────────────────────────────────────────────────────

/// Row-major grid of values in [0,1].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaliencyMap {
    pub rows:   usize,
    pub cols:   usize,
    pub values: Vec<f64>,
}

impl SaliencyMap {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self { rows, cols, values: vec![0.0; rows * cols] }
    }

    pub fn from_fn(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let mut values = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                values.push(f(r, c).clamp(0.0, 1.0));
            }
        }
        Self { rows, cols, values }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.cols + col]
    }

    pub fn max(&self) -> f64 {
        self.values.iter().cloned().fold(0.0, f64::max)
    }

    /// Nearest-cell resample to `rows`×`cols`.
    pub fn resampled(&self, rows: usize, cols: usize) -> Self {
        if rows == self.rows && cols == self.cols {
            return self.clone();
        }
        Self::from_fn(rows, cols, |r, c| {
            let sr = (r * self.rows / rows).min(self.rows.saturating_sub(1));
            let sc = (c * self.cols / cols).min(self.cols.saturating_sub(1));
            self.get(sr, sc)
        })
    }
}

// ── Per-detector result ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum DetectorStatus {
    Success,
    Failed(AdapterFailure),
    TimedOut,
    Skipped,
}

impl DetectorStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for DetectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success         => write!(f, "success"),
            Self::Failed(reason)  => write!(f, "failed({})", reason),
            Self::TimedOut        => write!(f, "timed_out"),
            Self::Skipped         => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorResult {
    pub name:       DetectorName,
    pub score:      Option<f64>, // Some iff status == Success
    pub status:     DetectorStatus,
    pub elapsed_ms: u64,
    /// Spatial attribution, when the detector localizes its signal.
    #[serde(skip)]
    pub attribution: Option<SaliencyMap>,
}

impl DetectorResult {
    pub fn success(name: DetectorName, score: f64, attribution: Option<SaliencyMap>, elapsed_ms: u64) -> Self {
        Self { name, score: Some(score), status: DetectorStatus::Success, elapsed_ms, attribution }
    }

    pub fn failed(name: DetectorName, reason: AdapterFailure, elapsed_ms: u64) -> Self {
        Self { name, score: None, status: DetectorStatus::Failed(reason), elapsed_ms, attribution: None }
    }

    pub fn timed_out(name: DetectorName, elapsed_ms: u64) -> Self {
        Self { name, score: None, status: DetectorStatus::TimedOut, elapsed_ms, attribution: None }
    }

    pub fn skipped(name: DetectorName) -> Self {
        Self { name, score: None, status: DetectorStatus::Skipped, elapsed_ms: 0, attribution: None }
    }

    /// Score, only when the detector succeeded.
    pub fn available_score(&self) -> Option<f64> {
        if self.status.is_success() { self.score } else { None }
    }
}

// ── Verdict + explainability ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Authentic,
    Deepfake,
    Indeterminate,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authentic     => write!(f, "AUTHENTIC"),
            Self::Deepfake      => write!(f, "DEEPFAKE"),
            Self::Indeterminate => write!(f, "INDETERMINATE"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        if score > 0.7 {
            Self::High
        } else if score > 0.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low    => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High   => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub label:    String,
    pub severity: Severity,
    pub detector: DetectorName,
    pub score:    f64,
}

/// Where the saliency grid came from. A prior is never localization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SaliencySource {
    Attributed,
    RadialPrior,
    Omitted,
}

/// Dominant cause when no detector produced a score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndeterminateReason {
    NoFaceDetected,
    UnsupportedInput,
    DetectorError,
    DetectorTimeout,
    NoDetectorsEnabled,
}

impl IndeterminateReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoFaceDetected     => "no_face_detected",
            Self::UnsupportedInput   => "unsupported_input",
            Self::DetectorError      => "detector_error",
            Self::DetectorTimeout    => "detector_timeout",
            Self::NoDetectorsEnabled => "no_detectors_enabled",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::NoFaceDetected =>
                "No face detected in the submitted media; biometric and facial models could not run.",
            Self::UnsupportedInput =>
                "The submitted media is not supported by the detection models.",
            Self::DetectorError =>
                "All detection models failed on this media.",
            Self::DetectorTimeout =>
                "All detection models timed out on this media.",
            Self::NoDetectorsEnabled =>
                "No detection models are enabled in the current configuration.",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Voting {
    pub fake_votes:       u32,
    pub real_votes:       u32,
    pub individual_votes: BTreeMap<DetectorName, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSummary {
    pub width:       u32,
    pub height:      u32,
    pub format:      MediaFormat,
    pub frames:      usize,
    pub duration_ms: Option<u64>,
    pub source:      Option<String>,
    pub fingerprint: String,
}

impl MediaSummary {
    pub fn new(md: &MediaMetadata, frames: usize, fingerprint: String) -> Self {
        Self {
            width:       md.width,
            height:      md.height,
            format:      md.format,
            frames,
            duration_ms: md.duration_ms,
            source:      md.source.clone(),
            fingerprint,
        }
    }
}

// ── Final result ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub request_id:           Uuid,
    pub verdict:              Verdict,
    /// Fused score over successful detectors; None when none succeeded.
    pub confidence:           Option<f64>,
    pub per_model:            Vec<DetectorResult>,
    pub effective_weights:    BTreeMap<DetectorName, f64>,
    pub voting:               Voting,
    pub artifacts:            Vec<Artifact>,
    pub saliency:             Option<SaliencyMap>,
    pub saliency_source:      SaliencySource,
    pub processing_time_ms:   u64,
    pub degraded:             bool,
    pub indeterminate_reason: Option<IndeterminateReason>,
    pub media:                MediaSummary,
    pub completed_at:         DateTime<Utc>,
}

impl AnalysisResult {
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
