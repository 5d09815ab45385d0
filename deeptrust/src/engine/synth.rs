// deeptrust/src/engine/synth.rs
//
// Artifact & saliency synthesis.
//
// Artifacts come straight from the per-model results (not from the fused
// score): one per available detector, with a configured label and a severity
// tier from that detector's own score.
//
// Saliency is a fixed-resolution grid:
//   attributed    - mean of detector attributions, resampled
//   radial_prior  - confidence · exp(−r² / (2·0.35²)), r from the centre
//   omitted       - no grid
// The source always travels with the grid.

use std::collections::BTreeMap;

use crate::analysis::{Artifact, DetectorName, DetectorResult, SaliencyMap, SaliencySource, Severity};
use crate::config::{SaliencyConfig, SaliencyFallback};

const PRIOR_SIGMA: f64 = 0.35;

#[derive(Debug, Clone)]
pub struct Synthesis {
    pub artifacts: Vec<Artifact>,
    pub saliency:  Option<SaliencyMap>,
    pub source:    SaliencySource,
}

pub struct Synthesizer {
    labels:   BTreeMap<DetectorName, String>,
    saliency: SaliencyConfig,
}

impl Synthesizer {
    pub fn new(labels: BTreeMap<DetectorName, String>, saliency: SaliencyConfig) -> Self {
        Self { labels, saliency }
    }

    pub fn synthesize(&self, results: &[DetectorResult], confidence: Option<f64>) -> Synthesis {
        let artifacts = self.artifacts(results);
        let (saliency, source) = self.saliency(results, confidence);
        Synthesis { artifacts, saliency, source }
    }

    pub fn artifacts(&self, results: &[DetectorResult]) -> Vec<Artifact> {
        results
            .iter()
            .filter_map(|r| {
                let score = r.available_score()?;
                let label = self
                    .labels
                    .get(&r.name)
                    .cloned()
                    .unwrap_or_else(|| format!("{} anomaly", r.name));
                Some(Artifact { label, severity: Severity::from_score(score), detector: r.name, score })
            })
            .collect()
    }

    fn saliency(&self, results: &[DetectorResult], confidence: Option<f64>) -> (Option<SaliencyMap>, SaliencySource) {
        let n = self.saliency.resolution;
        let maps: Vec<SaliencyMap> = results
            .iter()
            .filter(|r| r.status.is_success())
            .filter_map(|r| r.attribution.as_ref())
            .map(|m| m.resampled(n, n))
            .collect();

        if !maps.is_empty() {
            let k = maps.len() as f64;
            let mean = SaliencyMap::from_fn(n, n, |r, c| maps.iter().map(|m| m.get(r, c)).sum::<f64>() / k);
            return (Some(mean), SaliencySource::Attributed);
        }

        match self.saliency.fallback {
            SaliencyFallback::RadialPrior => (Some(radial_prior(n, confidence)), SaliencySource::RadialPrior),
            SaliencyFallback::Omit        => (None, SaliencySource::Omitted),
        }
    }
}

/// Centre-weighted Gaussian over the unit square, scaled by confidence.
/// Absent confidence gives an all-zero grid.
pub fn radial_prior(resolution: usize, confidence: Option<f64>) -> SaliencyMap {
    let Some(conf) = confidence else {
        return SaliencyMap::zeros(resolution, resolution);
    };
    let n = resolution as f64;
    SaliencyMap::from_fn(resolution, resolution, |r, c| {
        let y = (r as f64 + 0.5) / n - 0.5;
        let x = (c as f64 + 0.5) / n - 0.5;
        conf * (-(x * x + y * y) / (2.0 * PRIOR_SIGMA * PRIOR_SIGMA)).exp()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_artifact_labels;
    use crate::error::AdapterFailure;

    fn synth(fallback: SaliencyFallback) -> Synthesizer {
        Synthesizer::new(default_artifact_labels(), SaliencyConfig { resolution: 32, fallback })
    }

    #[test]
    fn one_artifact_per_available_detector() {
        let results = vec![
            DetectorResult::success(DetectorName::MesoNet, 0.9, None, 1),
            DetectorResult::success(DetectorName::Xception, 0.6, None, 1),
            DetectorResult::failed(DetectorName::Frequency, AdapterFailure::InternalError, 1),
            DetectorResult::success(DetectorName::Biological, 0.2, None, 1),
        ];
        let arts = synth(SaliencyFallback::RadialPrior).artifacts(&results);
        assert_eq!(arts.len(), 3);
        assert_eq!(arts[0].severity, Severity::High);
        assert_eq!(arts[1].severity, Severity::Medium);
        assert_eq!(arts[2].severity, Severity::Low);
        assert_eq!(arts[2].detector, DetectorName::Biological);
        assert_eq!(arts[0].label, default_artifact_labels()[&DetectorName::MesoNet]);
    }

    #[test]
    fn attributions_are_averaged_and_resampled() {
        let a = SaliencyMap::from_fn(4, 4, |_, _| 1.0);
        let b = SaliencyMap::zeros(8, 8);
        let results = vec![
            DetectorResult::success(DetectorName::MesoNet, 0.9, Some(a), 1),
            DetectorResult::success(DetectorName::Biological, 0.9, Some(b), 1),
        ];
        let out = synth(SaliencyFallback::Omit).synthesize(&results, Some(0.9));
        assert_eq!(out.source, SaliencySource::Attributed);
        let map = out.saliency.unwrap();
        assert_eq!((map.rows, map.cols), (32, 32));
        assert!(map.values.iter().all(|v| (v - 0.5).abs() < 1e-12));
    }

    #[test]
    fn radial_prior_peaks_at_centre_and_scales_with_confidence() {
        let results = vec![DetectorResult::success(DetectorName::MesoNet, 0.8, None, 1)];
        let out = synth(SaliencyFallback::RadialPrior).synthesize(&results, Some(0.8));
        assert_eq!(out.source, SaliencySource::RadialPrior);
        let map = out.saliency.unwrap();
        assert!(map.get(16, 16) > map.get(0, 0));
        assert!(map.max() <= 0.8);
        assert!(map.max() > 0.79);

        let none = radial_prior(32, None);
        assert_eq!(none.max(), 0.0);
    }

    #[test]
    fn omit_fallback_produces_no_grid() {
        let results = vec![DetectorResult::success(DetectorName::MesoNet, 0.8, None, 1)];
        let out = synth(SaliencyFallback::Omit).synthesize(&results, Some(0.8));
        assert_eq!(out.source, SaliencySource::Omitted);
        assert!(out.saliency.is_none());
    }
}
