// deeptrust/src/metrics.rs
//
// In-process pipeline metrics, rendered in Prometheus text format.
//
//   deeptrust_requests_total                     Counter   - analyses started
//   deeptrust_verdicts_total{verdict}            Counter   - completed analyses by verdict
//   deeptrust_request_errors_total{code}         Counter   - InvalidMedia / PipelineTimeout / Cancelled
//   deeptrust_degraded_total                     Counter   - verdicts with ≥1 unavailable detector
//   deeptrust_detector_status_total{detector,status} Counter - per-adapter outcomes
//   deeptrust_detector_mean_score{detector}      Gauge     - mean successful score
//   deeptrust_confidence_bucket{le}              Counter   - fused confidence, 0.1-wide buckets
//   deeptrust_processing_ms_bucket{le}           Counter   - end-to-end latency
//
// Endpoint: GET /metrics on --metrics-port (off by default).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::info;

use crate::analysis::{AnalysisResult, DetectorName, DetectorStatus, Verdict};
use crate::error::PipelineError;

const LATENCY_BOUNDS_MS: [u64; 8] = [50, 100, 250, 500, 1_000, 2_000, 5_000, 10_000];

#[derive(Default)]
pub struct PipelineMetrics {
    pub requests:      AtomicU64,
    pub authentic:     AtomicU64,
    pub deepfake:      AtomicU64,
    pub indeterminate: AtomicU64,
    pub degraded:      AtomicU64,
    errors:            DashMap<&'static str, u64>,
    /// (detector, status label) → count
    detector_status:   DashMap<(DetectorName, &'static str), u64>,
    /// detector → (score sum, successes)
    detector_scores:   DashMap<DetectorName, (f64, u64)>,
    confidence_buckets: [AtomicU64; 10],
    /// Last slot is +Inf.
    latency_buckets:   [AtomicU64; 9],
}

fn status_label(status: &DetectorStatus) -> &'static str {
    match status {
        DetectorStatus::Success   => "success",
        DetectorStatus::Failed(_) => "failed",
        DetectorStatus::TimedOut  => "timed_out",
        DetectorStatus::Skipped   => "skipped",
    }
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: &PipelineError) {
        *self.errors.entry(err.code()).or_insert(0) += 1;
    }

    pub fn record_result(&self, result: &AnalysisResult) {
        match result.verdict {
            Verdict::Authentic     => self.authentic.fetch_add(1, Ordering::Relaxed),
            Verdict::Deepfake      => self.deepfake.fetch_add(1, Ordering::Relaxed),
            Verdict::Indeterminate => self.indeterminate.fetch_add(1, Ordering::Relaxed),
        };
        if result.degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
        for r in &result.per_model {
            *self.detector_status.entry((r.name, status_label(&r.status))).or_insert(0) += 1;
            if let Some(s) = r.available_score() {
                let mut e = self.detector_scores.entry(r.name).or_insert((0.0, 0));
                e.0 += s;
                e.1 += 1;
            }
        }
        if let Some(c) = result.confidence {
            let bucket = ((c / 0.1) as usize).min(9);
            self.confidence_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        }
        let slot = LATENCY_BOUNDS_MS
            .iter()
            .position(|&b| result.processing_time_ms <= b)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.latency_buckets[slot].fetch_add(1, Ordering::Relaxed);
    }

    pub fn detector_status_count(&self, name: DetectorName, status: &DetectorStatus) -> u64 {
        self.detector_status.get(&(name, status_label(status))).map(|v| *v).unwrap_or(0)
    }

    pub fn error_count(&self, code: &str) -> u64 {
        self.errors.get(code).map(|v| *v).unwrap_or(0)
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn prometheus_text(&self) -> String {
        let mut out = String::with_capacity(4096);

        macro_rules! header {
            ($name:expr, $help:expr, $kind:expr) => {
                out.push_str(&format!("# HELP {} {}\n# TYPE {} {}\n", $name, $help, $name, $kind));
            };
        }

        header!("deeptrust_requests_total", "Analyses started", "counter");
        out.push_str(&format!("deeptrust_requests_total {}\n", self.requests.load(Ordering::Relaxed)));

        header!("deeptrust_verdicts_total", "Completed analyses by verdict", "counter");
        for (label, v) in [
            ("authentic", &self.authentic),
            ("deepfake", &self.deepfake),
            ("indeterminate", &self.indeterminate),
        ] {
            out.push_str(&format!(
                "deeptrust_verdicts_total{{verdict=\"{}\"}} {}\n",
                label,
                v.load(Ordering::Relaxed)
            ));
        }

        header!("deeptrust_degraded_total", "Verdicts reached with at least one detector unavailable", "counter");
        out.push_str(&format!("deeptrust_degraded_total {}\n", self.degraded.load(Ordering::Relaxed)));

        header!("deeptrust_request_errors_total", "Fatal request errors by code", "counter");
        for e in self.errors.iter() {
            out.push_str(&format!("deeptrust_request_errors_total{{code=\"{}\"}} {}\n", e.key(), e.value()));
        }

        header!("deeptrust_detector_status_total", "Per-detector invocation outcomes", "counter");
        let mut statuses: Vec<_> = self.detector_status.iter().map(|e| (*e.key(), *e.value())).collect();
        statuses.sort();
        for ((name, status), n) in statuses {
            out.push_str(&format!(
                "deeptrust_detector_status_total{{detector=\"{}\",status=\"{}\"}} {}\n",
                name, status, n
            ));
        }

        header!("deeptrust_detector_mean_score", "Mean successful score per detector", "gauge");
        for name in DetectorName::ALL {
            if let Some(e) = self.detector_scores.get(&name) {
                let (sum, n) = *e;
                let mean = if n > 0 { sum / n as f64 } else { 0.0 };
                out.push_str(&format!("deeptrust_detector_mean_score{{detector=\"{}\"}} {:.4}\n", name, mean));
            }
        }

        header!("deeptrust_confidence_bucket", "Fused confidence distribution (0.1-wide buckets)", "counter");
        for (i, bucket) in self.confidence_buckets.iter().enumerate() {
            out.push_str(&format!(
                "deeptrust_confidence_bucket{{le=\"{:.1}\"}} {}\n",
                (i + 1) as f64 * 0.1,
                bucket.load(Ordering::Relaxed)
            ));
        }

        header!("deeptrust_processing_ms_bucket", "End-to-end processing time", "counter");
        for (i, bucket) in self.latency_buckets.iter().enumerate() {
            let le = LATENCY_BOUNDS_MS.get(i).map(|b| b.to_string()).unwrap_or_else(|| "+Inf".into());
            out.push_str(&format!(
                "deeptrust_processing_ms_bucket{{le=\"{}\"}} {}\n",
                le,
                bucket.load(Ordering::Relaxed)
            ));
        }

        out
    }
}

// ── HTTP /metrics endpoint ─────────────────────────────────────────────────────

pub struct MetricsServer {
    pub metrics: Arc<PipelineMetrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<PipelineMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("/metrics endpoint listening on {}", self.addr);

        loop {
            let (mut stream, _) = listener.accept().await?;
            let metrics = Arc::clone(&self.metrics);

            tokio::spawn(async move {
                let body = metrics.prometheus_text();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(), body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterFailure;

    #[test]
    fn error_counts_by_code() {
        let m = PipelineMetrics::new();
        m.record_error(&PipelineError::Cancelled);
        m.record_error(&PipelineError::Cancelled);
        m.record_error(&PipelineError::PipelineTimeout(5000));
        assert_eq!(m.error_count("cancelled"), 2);
        assert_eq!(m.error_count("pipeline_timeout"), 1);
        assert_eq!(m.error_count("invalid_media"), 0);
        let text = m.prometheus_text();
        assert!(text.contains("deeptrust_request_errors_total{code=\"cancelled\"} 2"));
    }

    #[test]
    fn status_labels_collapse_failure_reasons() {
        assert_eq!(status_label(&DetectorStatus::Failed(AdapterFailure::NoSubjectFound)), "failed");
        assert_eq!(status_label(&DetectorStatus::Failed(AdapterFailure::InternalError)), "failed");
        assert_eq!(status_label(&DetectorStatus::TimedOut), "timed_out");
    }

    #[test]
    fn results_update_verdict_status_and_buckets() {
        use std::collections::BTreeMap;

        use chrono::Utc;
        use uuid::Uuid;

        use crate::analysis::{DetectorResult, MediaSummary, SaliencySource, Voting};
        use crate::media::{MediaFormat, MediaMetadata};

        let md = MediaMetadata { width: 4, height: 4, format: MediaFormat::Image, duration_ms: None, source: None };
        let result = AnalysisResult {
            request_id:           Uuid::new_v4(),
            verdict:              Verdict::Deepfake,
            confidence:           Some(0.85),
            per_model:            vec![
                DetectorResult::success(DetectorName::MesoNet, 0.8, None, 3),
                DetectorResult::success(DetectorName::Xception, 0.9, None, 4),
                DetectorResult::failed(DetectorName::Biological, AdapterFailure::NoSubjectFound, 1),
            ],
            effective_weights:    BTreeMap::new(),
            voting:               Voting::default(),
            artifacts:            Vec::new(),
            saliency:             None,
            saliency_source:      SaliencySource::Omitted,
            processing_time_ms:   120,
            degraded:             true,
            indeterminate_reason: None,
            media:                MediaSummary::new(&md, 1, "00".into()),
            completed_at:         Utc::now(),
        };

        let m = PipelineMetrics::new();
        m.record_request();
        m.record_result(&result);

        assert_eq!(m.deepfake.load(Ordering::Relaxed), 1);
        assert_eq!(m.degraded.load(Ordering::Relaxed), 1);
        assert_eq!(m.detector_status_count(DetectorName::MesoNet, &DetectorStatus::Success), 1);
        assert_eq!(
            m.detector_status_count(DetectorName::Biological, &DetectorStatus::Failed(AdapterFailure::InternalError)),
            1
        );
        assert_eq!(m.detector_status_count(DetectorName::Frequency, &DetectorStatus::Success), 0);

        let text = m.prometheus_text();
        assert!(text.contains("deeptrust_confidence_bucket{le=\"0.9\"} 1"));
        assert!(text.contains("deeptrust_processing_ms_bucket{le=\"250\"} 1"));
        assert!(text.contains("deeptrust_detector_mean_score{detector=\"mesonet\"} 0.8000"));
    }

    #[test]
    fn empty_registry_renders_every_family() {
        let text = PipelineMetrics::new().prometheus_text();
        for family in [
            "deeptrust_requests_total 0",
            "deeptrust_verdicts_total{verdict=\"deepfake\"} 0",
            "deeptrust_confidence_bucket{le=\"1.0\"} 0",
            "deeptrust_processing_ms_bucket{le=\"+Inf\"} 0",
        ] {
            assert!(text.contains(family), "missing {}", family);
        }
    }
}
