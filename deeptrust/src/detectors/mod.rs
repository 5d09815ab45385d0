// deeptrust/src/detectors/mod.rs
//
// Detector adapters - one per ensemble slot, all behind the same trait.
//
// An adapter turns a MediaItem into a score in [0,1] (higher = more likely
// synthetic) or a closed-taxonomy AdapterFailure. Timeouts, cancellation and
// panic capture are NOT the adapter's job: the dispatch coordinator wraps every
// `score` call in all three. Adapters hold only read-only parameters built at
// startup and are shared across requests via Arc.
//
// The four built-in adapters are lightweight statistical stand-ins for the
// production CNNs; they keep the same input/output contract.

pub mod biological;
pub mod frequency;
pub mod mesonet;
pub mod xception;

use std::sync::Arc;

use async_trait::async_trait;

use crate::analysis::{DetectorName, SaliencyMap};
use crate::error::AdapterFailure;
use crate::media::{Frame, MediaItem};

/// What a successful adapter call yields.
#[derive(Debug, Clone)]
pub struct DetectorOutput {
    pub score:       f64,
    pub attribution: Option<SaliencyMap>,
}

impl DetectorOutput {
    pub fn score(score: f64) -> Self {
        Self { score, attribution: None }
    }
}

#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> DetectorName;

    async fn score(&self, item: &MediaItem) -> Result<DetectorOutput, AdapterFailure>;

    /// Parameters loaded and usable.
    fn ready(&self) -> bool {
        true
    }
}

/// Built-in adapters in configuration order.
pub fn default_detectors(max_frames: usize) -> Vec<Arc<dyn Detector>> {
    vec![
        Arc::new(mesonet::MesoNet::new(max_frames)),
        Arc::new(xception::Xception::new(max_frames)),
        Arc::new(frequency::FrequencyAnalyzer::new(max_frames)),
        Arc::new(biological::BiologicalAnalyzer::new(max_frames)),
    ]
}

/// Run a per-frame scorer on the blocking pool and average over sampled frames.
pub(crate) async fn mean_over_frames<F>(
    item:       &MediaItem,
    max_frames: usize,
    score_one:  F,
) -> Result<DetectorOutput, AdapterFailure>
where
    F: Fn(&Frame) -> Result<f64, AdapterFailure> + Send + 'static,
{
    let item = item.clone();
    tokio::task::spawn_blocking(move || {
        let frames = item.sampled_frames(max_frames);
        if frames.is_empty() {
            return Err(AdapterFailure::UnsupportedInput);
        }
        let mut sum = 0.0;
        for frame in &frames {
            sum += score_one(frame)?;
        }
        Ok(DetectorOutput::score(round4(sum / frames.len() as f64)))
    })
    .await
    .map_err(|_| AdapterFailure::InternalError)?
}

pub(crate) fn round4(v: f64) -> f64 {
    (v * 10000.0).round() / 10000.0
}

pub(crate) fn mean_var(values: &[f32]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n    = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var  = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean, var)
}

// ── Scripted detectors for tests ──────────────────────────────────────────────
