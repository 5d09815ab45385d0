// deeptrust/src/engine/fusion.rs
//
// Weighted score fusion over the detectors that actually produced a score.
//
// Default configured weights (sum = 1.00):
//   MesoNet     0.30  - texture
//   Xception    0.35  - gradient structure (highest precision)
//   Frequency   0.20  - FFT / DCT spectrum
//   Biological  0.15  - face symmetry + eye region (often unavailable)
//
// Weights are renormalized over the available subset, so a missing detector
// redistributes its share proportionally instead of dragging the score to 0.
// The weighted sum is anchored at the lowest available score:
//
//   confidence = min + Σ w_i · (s_i − min)
//
// which equals Σ w_i · s_i whenever Σ w_i = 1, but returns exactly s when
// every score is s (no float drift across the threshold).
//
// A pure function of (results, weights): no state, no I/O.

use std::collections::BTreeMap;

use crate::analysis::{DetectorName, DetectorResult, DetectorStatus, IndeterminateReason, Verdict, Voting};
use crate::config::EnsembleWeights;
use crate::error::AdapterFailure;

/// Individual detectors vote fake above this score.
const VOTE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct FusionOutcome {
    pub verdict:              Verdict,
    pub confidence:           Option<f64>,
    pub degraded:             bool,
    /// Renormalized weights actually applied; empty when Indeterminate.
    pub effective_weights:    BTreeMap<DetectorName, f64>,
    pub voting:               Voting,
    pub indeterminate_reason: Option<IndeterminateReason>,
}

pub struct FusionEngine {
    threshold: f64,
}

impl FusionEngine {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn fuse(&self, results: &[DetectorResult], weights: &EnsembleWeights) -> FusionOutcome {
        let available: Vec<(DetectorName, f64)> = results
            .iter()
            .filter_map(|r| r.available_score().map(|s| (r.name, s)))
            .collect();
        let degraded = available.len() < results.len();

        if available.is_empty() {
            return FusionOutcome {
                verdict:              Verdict::Indeterminate,
                confidence:           None,
                degraded:             true,
                effective_weights:    BTreeMap::new(),
                voting:               Voting::default(),
                indeterminate_reason: Some(dominant_reason(results)),
            };
        }

        let effective = renormalize(&available, weights);

        let floor = available.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
        let confidence = available
            .iter()
            .map(|(name, s)| effective[name] * (s - floor))
            .fold(floor, |acc, v| acc + v)
            .clamp(0.0, 1.0);

        let verdict = if confidence >= self.threshold { Verdict::Deepfake } else { Verdict::Authentic };

        FusionOutcome {
            verdict,
            confidence: Some(confidence),
            degraded,
            effective_weights: effective,
            voting: vote(&available),
            indeterminate_reason: None,
        }
    }
}

/// Configured weights scaled to sum to 1 over `available`. A zero total
/// (every available detector configured at 0) falls back to uniform.
fn renormalize(available: &[(DetectorName, f64)], weights: &EnsembleWeights) -> BTreeMap<DetectorName, f64> {
    let total: f64 = available.iter().map(|(name, _)| weights.get(*name)).sum();
    if total <= 0.0 {
        let w = 1.0 / available.len() as f64;
        return available.iter().map(|(name, _)| (*name, w)).collect();
    }
    available
        .iter()
        .map(|(name, _)| (*name, weights.get(*name) / total))
        .collect()
}

fn vote(available: &[(DetectorName, f64)]) -> Voting {
    let mut voting = Voting::default();
    for (name, score) in available {
        let fake = *score > VOTE_THRESHOLD;
        if fake { voting.fake_votes += 1 } else { voting.real_votes += 1 }
        voting.individual_votes.insert(*name, fake);
    }
    voting
}

/// Most frequent failure cause. Ties go to the more specific reason, in the
/// order the candidates are listed.
fn dominant_reason(results: &[DetectorResult]) -> IndeterminateReason {
    const PRIORITY: [IndeterminateReason; 4] = [
        IndeterminateReason::NoFaceDetected,
        IndeterminateReason::UnsupportedInput,
        IndeterminateReason::DetectorError,
        IndeterminateReason::DetectorTimeout,
    ];
    let mut counts = [0usize; 4];
    for r in results {
        let slot = match r.status {
            DetectorStatus::Failed(AdapterFailure::NoSubjectFound)   => 0,
            DetectorStatus::Failed(AdapterFailure::UnsupportedInput) => 1,
            DetectorStatus::Failed(AdapterFailure::InternalError)    => 2,
            DetectorStatus::TimedOut                                 => 3,
            DetectorStatus::Success | DetectorStatus::Skipped        => continue,
        };
        counts[slot] += 1;
    }

    let mut best = None;
    for (i, &n) in counts.iter().enumerate() {
        if n > 0 && best.map_or(true, |(_, m)| n > m) {
            best = Some((i, n));
        }
    }
    best.map_or(IndeterminateReason::NoDetectorsEnabled, |(i, _)| PRIORITY[i])
}
