// deeptrust/src/engine/dispatch.rs
//
// Dispatch coordinator - fans one MediaItem out to every enabled detector.
//
// One tokio task per detector. Each task gets its own child CancellationToken
// and its own timeout, so an expiry or crash in one slot never touches the
// others. The coordinator then awaits every JoinHandle in configuration order:
// a join barrier, not a race. Output always has one DetectorResult per
// configured detector, in configuration order.
//
// Cancellation tree for one request:
//
//   caller token
//     └─ request scope (cancelled on drop via DropGuard)
//          ├─ mesonet task token
//          ├─ xception task token
//          └─ ...
//
// Blocking work already handed to spawn_blocking runs to completion after a
// timeout; only its result is discarded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::{DetectorName, DetectorResult};
use crate::config::EnsembleWeights;
use crate::detectors::Detector;
use crate::error::{AdapterFailure, PipelineError};
use crate::media::MediaItem;

enum Slot {
    Skipped(DetectorName),
    Running(DetectorName, JoinHandle<Option<DetectorResult>>),
}

pub struct DispatchCoordinator {
    detectors: Vec<Arc<dyn Detector>>,
}

impl DispatchCoordinator {
    pub fn new(detectors: Vec<Arc<dyn Detector>>) -> Self {
        Self { detectors }
    }

    pub fn find(&self, name: DetectorName) -> Option<&Arc<dyn Detector>> {
        self.detectors.iter().find(|d| d.name() == name)
    }

    /// Run every enabled detector concurrently and collect one result per
    /// configured detector. Zero-weight detectors are recorded as Skipped.
    ///
    /// Only `Cancelled` is returned as an error; adapter failures, timeouts
    /// and panics are absorbed into the results.
    pub async fn dispatch(
        &self,
        item:    &MediaItem,
        weights: &EnsembleWeights,
        timeout: Duration,
        cancel:  &CancellationToken,
    ) -> Result<Vec<DetectorResult>, PipelineError> {
        let scope  = cancel.child_token();
        let _guard = scope.clone().drop_guard();
        let start  = Instant::now();

        let slots: Vec<Slot> = self
            .detectors
            .iter()
            .map(|det| {
                let name = det.name();
                if !weights.is_enabled(name) {
                    return Slot::Skipped(name);
                }
                let det   = Arc::clone(det);
                let item  = item.clone();
                let token = scope.child_token();
                Slot::Running(name, tokio::spawn(invoke(det, item, timeout, token)))
            })
            .collect();

        let mut results   = Vec::with_capacity(slots.len());
        let mut cancelled = false;
        for slot in slots {
            match slot {
                Slot::Skipped(name) => results.push(DetectorResult::skipped(name)),
                Slot::Running(name, handle) => match handle.await {
                    Ok(Some(r)) => results.push(r),
                    Ok(None)    => cancelled = true,
                    Err(e) => {
                        warn!("DETECTOR_PANIC detector={} error={}", name, e);
                        results.push(DetectorResult::failed(
                            name,
                            AdapterFailure::InternalError,
                            start.elapsed().as_millis() as u64,
                        ));
                    }
                },
            }
        }

        if cancelled || cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        debug!(
            "dispatch complete detectors={} elapsed_ms={}",
            results.len(),
            start.elapsed().as_millis()
        );
        Ok(results)
    }

    /// Run one detector on its own, with the same timeout and panic capture
    /// as a full dispatch. Unknown detectors come back Skipped.
    pub async fn invoke_one(
        &self,
        name:    DetectorName,
        item:    &MediaItem,
        timeout: Duration,
        cancel:  &CancellationToken,
    ) -> Result<DetectorResult, PipelineError> {
        let Some(det) = self.find(name) else {
            return Ok(DetectorResult::skipped(name));
        };
        let token  = cancel.child_token();
        let _guard = token.clone().drop_guard();
        let start  = Instant::now();
        let handle = tokio::spawn(invoke(Arc::clone(det), item.clone(), timeout, token));
        match handle.await {
            Ok(Some(r)) => Ok(r),
            Ok(None)    => Err(PipelineError::Cancelled),
            Err(e) => {
                warn!("DETECTOR_PANIC detector={} error={}", name, e);
                Ok(DetectorResult::failed(name, AdapterFailure::InternalError, start.elapsed().as_millis() as u64))
            }
        }
    }
}

/// One adapter invocation: never outlives `timeout`, returns None only when
/// cancelled.
async fn invoke(
    detector: Arc<dyn Detector>,
    item:     MediaItem,
    timeout:  Duration,
    token:    CancellationToken,
) -> Option<DetectorResult> {
    let name  = detector.name();
    let start = Instant::now();

    if !detector.ready() {
        warn!("DETECTOR_NOT_READY detector={}", name);
        return Some(DetectorResult::failed(name, AdapterFailure::InternalError, 0));
    }

    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => return None,
        r = tokio::time::timeout(timeout, detector.score(&item)) => r,
    };
    let elapsed = start.elapsed().as_millis() as u64;

    let result = match outcome {
        Err(_) => {
            warn!("DETECTOR_TIMEOUT detector={} timeout_ms={}", name, timeout.as_millis());
            DetectorResult::timed_out(name, elapsed)
        }
        Ok(Err(AdapterFailure::NoSubjectFound)) => {
            info!("DETECTOR_NO_SUBJECT detector={} elapsed_ms={}", name, elapsed);
            DetectorResult::failed(name, AdapterFailure::NoSubjectFound, elapsed)
        }
        Ok(Err(reason)) => {
            warn!("DETECTOR_FAILED detector={} reason={} elapsed_ms={}", name, reason, elapsed);
            DetectorResult::failed(name, reason, elapsed)
        }
        // NaN fails `contains` too.
        Ok(Ok(out)) if !(0.0..=1.0).contains(&out.score) => {
            warn!("DETECTOR_OUT_OF_RANGE detector={} score={}", name, out.score);
            DetectorResult::failed(name, AdapterFailure::InternalError, elapsed)
        }
        Ok(Ok(out)) => {
            debug!("detector={} score={:.4} elapsed_ms={}", name, out.score, elapsed);
            DetectorResult::success(name, out.score, out.attribution, elapsed)
        }
    };
    Some(result)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::analysis::DetectorStatus;
    use crate::detectors::testing::{ensemble, sample_item, Script, ScriptedDetector};

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn coordinator(scripts: [Script; 4]) -> DispatchCoordinator {
        DispatchCoordinator::new(ensemble(scripts))
    }

    #[tokio::test]
    async fn results_follow_configuration_order() {
        let c = coordinator([
            Script::Slow(Duration::from_millis(40), 0.1),
            Script::Score(0.2),
            Script::Slow(Duration::from_millis(10), 0.3),
            Script::Score(0.4),
        ]);
        let results = c
            .dispatch(&sample_item(), &EnsembleWeights::default(), TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        let names: Vec<DetectorName> = results.iter().map(|r| r.name).collect();
        assert_eq!(names, DetectorName::ALL.to_vec());
        let scores: Vec<Option<f64>> = results.iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![Some(0.1), Some(0.2), Some(0.3), Some(0.4)]);
    }

    #[tokio::test]
    async fn slow_detector_is_bounded_by_its_timeout() {
        let c = coordinator([
            Script::Slow(Duration::from_secs(5), 0.9),
            Script::Score(0.2),
            Script::Score(0.3),
            Script::Score(0.4),
        ]);
        let started = Instant::now();
        let results = c
            .dispatch(&sample_item(), &EnsembleWeights::default(), Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(results[0].status, DetectorStatus::TimedOut);
        assert!(results[1..].iter().all(|r| r.status.is_success()));
    }

    #[tokio::test]
    async fn failures_and_panics_are_absorbed() {
        let c = coordinator([
            Script::Panic,
            Script::Fail(AdapterFailure::UnsupportedInput),
            Script::Score(f64::NAN),
            Script::Score(1.7),
        ]);
        let results = c
            .dispatch(&sample_item(), &EnsembleWeights::default(), TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results[0].status, DetectorStatus::Failed(AdapterFailure::InternalError));
        assert_eq!(results[1].status, DetectorStatus::Failed(AdapterFailure::UnsupportedInput));
        assert_eq!(results[2].status, DetectorStatus::Failed(AdapterFailure::InternalError));
        assert_eq!(results[3].status, DetectorStatus::Failed(AdapterFailure::InternalError));
        assert!(results.iter().all(|r| r.score.is_none()));
    }

    #[tokio::test]
    async fn zero_weight_detectors_are_not_invoked() {
        let bio = ScriptedDetector::new(DetectorName::Biological, Script::Score(0.5));
        let mut detectors = ensemble([Script::Score(0.1), Script::Score(0.2), Script::Score(0.3), Script::Score(0.0)]);
        detectors[3] = bio.clone() as Arc<dyn Detector>;
        let c = DispatchCoordinator::new(detectors);
        let weights = EnsembleWeights::new([
            (DetectorName::MesoNet, 0.5),
            (DetectorName::Xception, 0.5),
            (DetectorName::Frequency, 0.5),
        ]);
        let results = c
            .dispatch(&sample_item(), &weights, TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results[3].status, DetectorStatus::Skipped);
        assert_eq!(bio.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn caller_cancellation_reaches_every_task() {
        let flag = Arc::new(AtomicBool::new(false));
        let c = coordinator([
            Script::Hang(Arc::clone(&flag)),
            Script::Score(0.2),
            Script::Score(0.3),
            Script::Score(0.4),
        ]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = c
            .dispatch(&sample_item(), &EnsembleWeights::default(), Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropping_the_request_cancels_outstanding_tasks() {
        let flag = Arc::new(AtomicBool::new(false));
        let c = coordinator([
            Script::Hang(Arc::clone(&flag)),
            Script::Score(0.2),
            Script::Score(0.3),
            Script::Score(0.4),
        ]);
        let weights = EnsembleWeights::default();
        let cancel = CancellationToken::new();
        let item = sample_item();
        let fut = c.dispatch(&item, &weights, Duration::from_secs(30), &cancel);
        assert!(tokio::time::timeout(Duration::from_millis(30), fut).await.is_err());

        for _ in 0..100 {
            if flag.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(flag.load(Ordering::SeqCst));
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn invoke_one_runs_a_single_detector() {
        let c = coordinator([Script::Score(0.1), Script::Score(0.25), Script::Panic, Script::Score(0.4)]);
        let token = CancellationToken::new();
        let r = c.invoke_one(DetectorName::Xception, &sample_item(), TIMEOUT, &token).await.unwrap();
        assert_eq!(r.score, Some(0.25));
        let r = c.invoke_one(DetectorName::Frequency, &sample_item(), TIMEOUT, &token).await.unwrap();
        assert_eq!(r.status, DetectorStatus::Failed(AdapterFailure::InternalError));
    }
}
