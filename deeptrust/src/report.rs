// deeptrust/src/report.rs
//
// Result transport - the JSON body the API gateway hands back to clients.
//
//   {
//     "is_deepfake":      bool,
//     "ensemble_score":   f64 | null,       fused confidence
//     "confidence_score": f64,              |ensemble − 0.5|·2, certainty of the call
//     "model_scores":     { "<detector>": f64 },          successful detectors only
//     "ensemble_weights": { "<detector>": f64 },          effective (renormalized)
//     "voting":           { fake_votes, real_votes, individual_votes },
//     "artifacts":        [ { label, severity, detector, score } ],
//     "gradcam_image":    "data:image/png;base64,..." | null,
//     "processing_time":  f64 seconds,
//     "degraded":         bool,
//     "error"?:           "no_face_detected" | ...,       Indeterminate only
//     "message"?:         human-readable,                  Indeterminate only
//   }

use std::collections::BTreeMap;
use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, GrayImage, ImageFormat};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::{AnalysisResult, Artifact, DetectorName, SaliencyMap, SaliencySource, Verdict, Voting};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub request_id:       Uuid,
    pub is_deepfake:      bool,
    pub ensemble_score:   Option<f64>,
    pub confidence_score: f64,
    pub model_scores:     BTreeMap<DetectorName, f64>,
    pub ensemble_weights: BTreeMap<DetectorName, f64>,
    pub voting:           Voting,
    pub artifacts:        Vec<Artifact>,
    pub gradcam_image:    Option<String>,
    pub gradcam_source:   SaliencySource,
    pub processing_time:  f64,
    pub degraded:         bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error:            Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message:          Option<String>,
}

impl From<&AnalysisResult> for ApiResponse {
    fn from(r: &AnalysisResult) -> Self {
        let model_scores = r
            .per_model
            .iter()
            .filter_map(|m| m.available_score().map(|s| (m.name, s)))
            .collect();
        let confidence_score = r.confidence.map(|c| ((c - 0.5).abs() * 2.0).min(1.0)).unwrap_or(0.0);
        let (error, message) = match (r.verdict, r.indeterminate_reason) {
            (Verdict::Indeterminate, Some(reason)) => (Some(reason.code().to_string()), Some(reason.message().to_string())),
            _ => (None, None),
        };

        Self {
            request_id:       r.request_id,
            is_deepfake:      r.verdict == Verdict::Deepfake,
            ensemble_score:   r.confidence,
            confidence_score,
            model_scores,
            ensemble_weights: r.effective_weights.clone(),
            voting:           r.voting.clone(),
            artifacts:        r.artifacts.clone(),
            gradcam_image:    r.saliency.as_ref().and_then(saliency_data_url),
            gradcam_source:   r.saliency_source,
            processing_time:  r.processing_time_ms as f64 / 1000.0,
            degraded:         r.degraded,
            error,
            message,
        }
    }
}

impl ApiResponse {
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Grayscale PNG of the grid (1 px per cell), as a data URL.
pub fn saliency_data_url(map: &SaliencyMap) -> Option<String> {
    let pixels: Vec<u8> = map.values.iter().map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8).collect();
    let img = GrayImage::from_raw(map.cols as u32, map.rows as u32, pixels)?;
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img).write_to(&mut buf, ImageFormat::Png).ok()?;
    Some(format!("data:image/png;base64,{}", STANDARD.encode(buf.into_inner())))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::analysis::{DetectorResult, IndeterminateReason, MediaSummary};
    use crate::error::AdapterFailure;
    use crate::media::{MediaFormat, MediaMetadata};

    fn result(verdict: Verdict, confidence: Option<f64>) -> AnalysisResult {
        let md = MediaMetadata { width: 4, height: 4, format: MediaFormat::Image, duration_ms: None, source: None };
        AnalysisResult {
            request_id:           Uuid::new_v4(),
            verdict,
            confidence,
            per_model:            vec![
                DetectorResult::success(DetectorName::MesoNet, 0.9, None, 3),
                DetectorResult::failed(DetectorName::Biological, AdapterFailure::NoSubjectFound, 1),
            ],
            effective_weights:    BTreeMap::from([(DetectorName::MesoNet, 1.0)]),
            voting:               Voting::default(),
            artifacts:            Vec::new(),
            saliency:             Some(SaliencyMap::from_fn(4, 4, |r, _| r as f64 / 3.0)),
            saliency_source:      SaliencySource::RadialPrior,
            processing_time_ms:   1_250,
            degraded:             true,
            indeterminate_reason: None,
            media:                MediaSummary::new(&md, 1, "00".into()),
            completed_at:         Utc::now(),
        }
    }

    #[test]
    fn verdict_maps_to_transport_fields() {
        let resp = ApiResponse::from(&result(Verdict::Deepfake, Some(0.9)));
        assert!(resp.is_deepfake);
        assert!((resp.confidence_score - 0.8).abs() < 1e-12);
        assert_eq!(resp.model_scores.len(), 1);
        assert_eq!(resp.model_scores[&DetectorName::MesoNet], 0.9);
        assert_eq!(resp.processing_time, 1.25);

        let json: serde_json::Value = serde_json::from_str(&resp.to_jsonl()).unwrap();
        assert!(json.get("error").is_none());
        assert!(json.get("message").is_none());
        assert_eq!(json["ensemble_weights"]["mesonet"], 1.0);
        assert!(json["gradcam_image"].as_str().unwrap().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn indeterminate_carries_error_code() {
        let mut r = result(Verdict::Indeterminate, None);
        r.indeterminate_reason = Some(IndeterminateReason::NoFaceDetected);
        r.saliency = None;
        r.saliency_source = SaliencySource::Omitted;
        let json: serde_json::Value = serde_json::to_value(ApiResponse::from(&r)).unwrap();
        assert_eq!(json["is_deepfake"], false);
        assert!(json["ensemble_score"].is_null());
        assert!(json["gradcam_image"].is_null());
        assert_eq!(json["error"], "no_face_detected");
        assert!(json["message"].as_str().unwrap().contains("face"));
    }

    #[test]
    fn png_decodes_back_to_grid_size() {
        let map = SaliencyMap::from_fn(8, 6, |r, c| (r * c) as f64 / 35.0);
        let url = saliency_data_url(&map).unwrap();
        let bytes = STANDARD.decode(url.trim_start_matches("data:image/png;base64,")).unwrap();
        let img = image::load_from_memory_with_format(&bytes, ImageFormat::Png).unwrap();
        assert_eq!((img.width(), img.height()), (6, 8));
    }
}
