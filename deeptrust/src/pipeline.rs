// deeptrust/src/pipeline.rs
//
// Pipeline controller - the only entry point and the only assembler of
// AnalysisResult.
//
// Per-request lifecycle:
//
//   Received ─ validate ─▶ Dispatching ─▶ Fusing ─▶ Synthesizing ─▶ Complete
//       └── InvalidMedia ──▶ Failed
//
// Dispatching is bounded by the request deadline (PipelineTimeout) and by the
// caller's CancellationToken (Cancelled). Adapter failures never fail the
// request: they surface as a degraded or Indeterminate verdict.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisResult, DetectorName, DetectorResult, MediaSummary};
use crate::config::{PipelineConfig, WeightStore};
use crate::detectors::{default_detectors, Detector};
use crate::engine::dispatch::DispatchCoordinator;
use crate::engine::fusion::FusionEngine;
use crate::engine::synth::Synthesizer;
use crate::error::PipelineError;
use crate::media::MediaItem;
use crate::metrics::PipelineMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Received,
    Dispatching,
    Fusing,
    Synthesizing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Some enabled detector is missing or not ready; verdicts will be degraded.
    Degraded,
    /// No enabled detector is ready; every verdict would be Indeterminate.
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorHealth {
    pub loaded:  bool,
    pub ready:   bool,
    pub weight:  f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status:    HealthStatus,
    pub detectors: BTreeMap<DetectorName, DetectorHealth>,
}

pub struct Pipeline {
    coordinator: DispatchCoordinator,
    weights:     Arc<WeightStore>,
    fusion:      FusionEngine,
    synth:       Synthesizer,
    config:      PipelineConfig,
    metrics:     Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, detectors: Vec<Arc<dyn Detector>>) -> Self {
        Self {
            coordinator: DispatchCoordinator::new(detectors),
            weights:     Arc::new(WeightStore::new(config.weights.clone())),
            fusion:      FusionEngine::new(config.deepfake_threshold),
            synth:       Synthesizer::new(config.artifact_labels.clone(), config.saliency.clone()),
            metrics:     PipelineMetrics::new(),
            config,
        }
    }

    /// Pipeline over the four built-in detectors.
    pub fn with_default_detectors(config: PipelineConfig) -> Self {
        let detectors = default_detectors(config.max_frames);
        Self::new(config, detectors)
    }

    pub fn weights(&self) -> &Arc<WeightStore> {
        &self.weights
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn analyze(&self, item: &MediaItem) -> Result<AnalysisResult, PipelineError> {
        self.analyze_with_cancel(item, &CancellationToken::new()).await
    }

    /// Like `analyze`, but `cancel` aborts every outstanding detector of this
    /// request and yields `PipelineError::Cancelled`.
    pub async fn analyze_with_cancel(
        &self,
        item:   &MediaItem,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, PipelineError> {
        self.metrics.record_request();
        let outcome = self.run(item, cancel).await;
        match &outcome {
            Ok(result) => self.metrics.record_result(result),
            Err(e)     => self.metrics.record_error(e),
        }
        outcome
    }

    async fn run(&self, item: &MediaItem, cancel: &CancellationToken) -> Result<AnalysisResult, PipelineError> {
        let started    = Instant::now();
        let request_id = Uuid::new_v4();
        let fingerprint = item.fingerprint();
        transition(request_id, Stage::Received);

        if let Err(e) = item.validate() {
            transition(request_id, Stage::Failed);
            warn!("INVALID_MEDIA request={} fp={} error={}", request_id, fingerprint, e);
            return Err(e);
        }

        // One snapshot for the whole request: skip decisions and fusion agree.
        let weights = self.weights.snapshot();

        transition(request_id, Stage::Dispatching);
        let deadline = self.config.request_deadline();
        let dispatch = self.coordinator.dispatch(item, &weights, self.config.adapter_timeout(), cancel);
        let per_model = match tokio::time::timeout(deadline, dispatch).await {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => {
                transition(request_id, Stage::Failed);
                info!("REQUEST_CANCELLED request={}", request_id);
                return Err(e);
            }
            Err(_) => {
                transition(request_id, Stage::Failed);
                warn!("PIPELINE_TIMEOUT request={} deadline_ms={}", request_id, self.config.request_deadline_ms);
                return Err(PipelineError::PipelineTimeout(self.config.request_deadline_ms));
            }
        };

        transition(request_id, Stage::Fusing);
        let fused = self.fusion.fuse(&per_model, &weights);

        transition(request_id, Stage::Synthesizing);
        let synthesis = self.synth.synthesize(&per_model, fused.confidence);

        let result = AnalysisResult {
            request_id,
            verdict:              fused.verdict,
            confidence:           fused.confidence,
            per_model,
            effective_weights:    fused.effective_weights,
            voting:               fused.voting,
            artifacts:            synthesis.artifacts,
            saliency:             synthesis.saliency,
            saliency_source:      synthesis.source,
            processing_time_ms:   started.elapsed().as_millis() as u64,
            degraded:             fused.degraded,
            indeterminate_reason: fused.indeterminate_reason,
            media:                MediaSummary::new(item.metadata(), item.frames().len(), fingerprint),
            completed_at:         Utc::now(),
        };
        transition(request_id, Stage::Complete);

        info!(
            "VERDICT request={} fp={} verdict={} confidence={} degraded={} ms={}",
            request_id,
            result.media.fingerprint,
            result.verdict,
            result.confidence.map(|c| format!("{:.4}", c)).unwrap_or_else(|| "none".into()),
            result.degraded,
            result.processing_time_ms
        );
        Ok(result)
    }

    /// Single-model prediction, with the same validation, timeout and panic
    /// capture as a full analysis. Runs regardless of the detector's weight.
    pub async fn invoke_single(&self, name: DetectorName, item: &MediaItem) -> Result<DetectorResult, PipelineError> {
        item.validate()?;
        let cancel = CancellationToken::new();
        self.coordinator
            .invoke_one(name, item, self.config.adapter_timeout(), &cancel)
            .await
    }

    pub fn health(&self) -> HealthReport {
        let weights = self.weights.snapshot();
        let detectors: BTreeMap<DetectorName, DetectorHealth> = DetectorName::ALL
            .into_iter()
            .map(|name| {
                let det = self.coordinator.find(name);
                let health = DetectorHealth {
                    loaded: det.is_some(),
                    ready:  det.map(|d| d.ready()).unwrap_or(false),
                    weight: weights.get(name),
                };
                (name, health)
            })
            .collect();

        let enabled: Vec<&DetectorHealth> = detectors.values().filter(|h| h.weight > 0.0).collect();
        let ready = enabled.iter().filter(|h| h.ready).count();
        let status = if ready == 0 {
            HealthStatus::Unhealthy
        } else if ready < enabled.len() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport { status, detectors }
    }
}

fn transition(request_id: Uuid, stage: Stage) {
    debug!("request={} stage={:?}", request_id, stage);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::analysis::{DetectorStatus, SaliencySource, Verdict};
    use crate::config::EnsembleWeights;
    use crate::detectors::testing::{ensemble, sample_item, Script};
    use crate::error::AdapterFailure;
    use crate::media::Frame;

    fn pipeline(scripts: [Script; 4]) -> Pipeline {
        Pipeline::new(PipelineConfig::default(), ensemble(scripts))
    }

    #[tokio::test]
    async fn full_ensemble_verdict() {
        let p = pipeline([Script::Score(0.9), Script::Score(0.8), Script::Score(0.3), Script::Score(0.6)]);
        let r = p.analyze(&sample_item()).await.unwrap();
        assert_eq!(r.verdict, Verdict::Deepfake);
        assert!((r.confidence.unwrap() - 0.70).abs() < 1e-9);
        assert!(!r.degraded);
        assert_eq!(r.per_model.len(), 4);
        assert_eq!(r.artifacts.len(), 4);
        assert_eq!(r.saliency_source, SaliencySource::RadialPrior);
        assert_eq!(p.metrics().deepfake.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn one_failure_is_degraded_not_fatal() {
        let p = pipeline([
            Script::Score(0.9),
            Script::Score(0.8),
            Script::Fail(AdapterFailure::NoSubjectFound),
            Script::Score(0.6),
        ]);
        let r = p.analyze(&sample_item()).await.unwrap();
        assert!((r.confidence.unwrap() - 0.80).abs() < 1e-9);
        assert_eq!(r.verdict, Verdict::Deepfake);
        assert!(r.degraded);
        assert_eq!(r.per_model[2].status, DetectorStatus::Failed(AdapterFailure::NoSubjectFound));
        assert_eq!(r.artifacts.len(), 3);
    }

    #[tokio::test]
    async fn no_subject_anywhere_is_indeterminate() {
        let p = pipeline([
            Script::Fail(AdapterFailure::NoSubjectFound),
            Script::Fail(AdapterFailure::NoSubjectFound),
            Script::Fail(AdapterFailure::NoSubjectFound),
            Script::Fail(AdapterFailure::NoSubjectFound),
        ]);
        let r = p.analyze(&sample_item()).await.unwrap();
        assert_eq!(r.verdict, Verdict::Indeterminate);
        assert_eq!(r.confidence, None);
        assert!(r.degraded);
        assert_eq!(r.indeterminate_reason.unwrap().code(), "no_face_detected");
        assert!(r.artifacts.is_empty());
        assert_eq!(r.saliency.unwrap().max(), 0.0);
    }

    #[tokio::test]
    async fn invalid_media_fails_before_dispatch() {
        let p = pipeline([Script::Score(0.5), Script::Score(0.5), Script::Score(0.5), Script::Score(0.5)]);
        let bad = MediaItem::image(Frame::new(4, 4, vec![0; 7]));
        let err = p.analyze(&bad).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidMedia(_)));
        assert_eq!(p.metrics().error_count("invalid_media"), 1);
    }

    #[tokio::test]
    async fn request_deadline_yields_pipeline_timeout() {
        let config = PipelineConfig { adapter_timeout_ms: 10_000, request_deadline_ms: 50, ..Default::default() };
        let p = Pipeline::new(
            config,
            ensemble([
                Script::Slow(Duration::from_secs(10), 0.5),
                Script::Score(0.5),
                Script::Score(0.5),
                Script::Score(0.5),
            ]),
        );
        let started = Instant::now();
        let err = p.analyze(&sample_item()).await.unwrap_err();
        assert!(matches!(err, PipelineError::PipelineTimeout(50)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancelled_request_returns_cancelled() {
        let p = pipeline([
            Script::Slow(Duration::from_secs(10), 0.5),
            Script::Score(0.5),
            Script::Score(0.5),
            Script::Score(0.5),
        ]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = p.analyze_with_cancel(&sample_item(), &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn in_flight_request_keeps_its_weight_snapshot() {
        let p = Arc::new(pipeline([
            Script::Slow(Duration::from_millis(100), 0.9),
            Script::Slow(Duration::from_millis(100), 0.1),
            Script::Slow(Duration::from_millis(100), 0.1),
            Script::Slow(Duration::from_millis(100), 0.1),
        ]));
        let runner = Arc::clone(&p);
        let handle = tokio::spawn(async move { runner.analyze(&sample_item()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        p.weights().replace(EnsembleWeights::new([(DetectorName::MesoNet, 1.0)])).unwrap();

        let r = handle.await.unwrap().unwrap();
        assert_eq!(r.effective_weights.len(), 4);
        assert!((r.effective_weights[&DetectorName::Xception] - 0.35).abs() < 1e-12);

        let next = p.analyze(&sample_item()).await.unwrap();
        assert_eq!(next.per_model[1].status, DetectorStatus::Skipped);
        assert_eq!(next.confidence, Some(0.9));
    }

    #[tokio::test]
    async fn invoke_single_validates_and_runs_one_detector() {
        let p = pipeline([Script::Score(0.1), Script::Score(0.2), Script::Score(0.3), Script::Score(0.4)]);
        let r = p.invoke_single(DetectorName::Frequency, &sample_item()).await.unwrap();
        assert_eq!(r.score, Some(0.3));
        let bad = MediaItem::video(Vec::new(), 0);
        assert!(p.invoke_single(DetectorName::Frequency, &bad).await.is_err());
    }

    #[test]
    fn health_reflects_enabled_detectors() {
        let p = pipeline([Script::Score(0.1), Script::Score(0.2), Script::Score(0.3), Script::Score(0.4)]);
        let h = p.health();
        assert_eq!(h.status, HealthStatus::Healthy);
        assert_eq!(h.detectors.len(), 4);

        let partial = Pipeline::new(PipelineConfig::default(), ensemble([
            Script::Score(0.1), Script::Score(0.2), Script::Score(0.3), Script::Score(0.4),
        ]).into_iter().take(2).collect());
        let h = partial.health();
        assert_eq!(h.status, HealthStatus::Degraded);
        assert!(!h.detectors[&DetectorName::Biological].loaded);
    }

    #[tokio::test]
    async fn built_in_detectors_on_a_synthetic_face() {
        let p = Pipeline::with_default_detectors(PipelineConfig::default());
        let face = Frame::from_fn(96, 96, |x, y| {
            if (24..72).contains(&x) && (24..72).contains(&y) { [200, 150, 120] } else { [60, 90, 160] }
        });
        let r = p.analyze(&MediaItem::image(face)).await.unwrap();
        assert_eq!(r.per_model.len(), 4);
        assert!(r.per_model.iter().all(|m| m.status.is_success()));
        assert_ne!(r.verdict, Verdict::Indeterminate);
        assert_eq!(r.saliency_source, SaliencySource::Attributed);

        let wall = Frame::from_fn(96, 96, |_, _| [60, 90, 160]);
        let r = p.analyze(&MediaItem::image(wall)).await.unwrap();
        assert!(r.degraded);
        assert_eq!(r.per_model[3].status, DetectorStatus::Failed(AdapterFailure::NoSubjectFound));
    }
}
