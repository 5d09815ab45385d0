// deeptrust/src/eval/mod.rs
//
// Labeled dataset evaluation.
//
//   1. Load a JSONL dataset of labeled media files
//   2. Run the full pipeline on every item, in order
//   3. Compute global and per-detector precision / recall / F1 / FPR
//   4. Report Indeterminate verdicts and fatal errors separately; they are
//      not folded into the confusion matrix
//
// Dataset format (one JSON object per line, paths relative to the dataset):
//   { "path": "fakes/0001.png", "is_fake": true }
//
// Run:
//   deeptrust --mode eval --path dataset.jsonl

pub mod report;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

use crate::analysis::{AnalysisResult, DetectorName, Verdict};
use crate::media::load_image;
use crate::pipeline::Pipeline;

/// A detector counts as voting fake above this score.
const DETECTOR_VOTE: f64 = 0.5;

#[derive(Debug, Clone, Deserialize)]
pub struct LabeledItem {
    pub path:    PathBuf,
    pub is_fake: bool,
}

// ── Confusion counters ────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Confusion {
    pub tp:  u64,
    pub fp:  u64,
    pub tn:  u64,
    pub fn_: u64,
}

impl Confusion {
    pub fn record(&mut self, predicted_fake: bool, is_fake: bool) {
        match (predicted_fake, is_fake) {
            (true,  true)  => self.tp  += 1,
            (true,  false) => self.fp  += 1,
            (false, true)  => self.fn_ += 1,
            (false, false) => self.tn  += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.tp + self.fp + self.tn + self.fn_
    }

    pub fn precision(&self) -> f64 {
        let denom = self.tp + self.fp;
        if denom == 0 { 1.0 } else { self.tp as f64 / denom as f64 }
    }

    pub fn recall(&self) -> f64 {
        let denom = self.tp + self.fn_;
        if denom == 0 { 0.0 } else { self.tp as f64 / denom as f64 }
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }

    pub fn fpr(&self) -> f64 {
        let denom = self.fp + self.tn;
        if denom == 0 { 0.0 } else { self.fp as f64 / denom as f64 }
    }

    pub fn accuracy(&self) -> f64 {
        let n = self.total();
        if n == 0 { 0.0 } else { (self.tp + self.tn) as f64 / n as f64 }
    }
}

// ── Aggregate result ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct EvalResult {
    pub n_items:       usize,
    pub n_positive:    usize,
    pub n_negative:    usize,
    pub threshold:     f64,
    pub global:        Confusion,
    pub per_detector:  BTreeMap<DetectorName, Confusion>,
    pub indeterminate: usize,
    pub degraded:      usize,
    /// Load / validation / timeout failures, by error code.
    pub errors:        BTreeMap<String, usize>,
    /// (confidence, is_fake) for every item with a confidence.
    pub scored:        Vec<(f64, bool)>,
}

impl EvalResult {
    fn new(threshold: f64) -> Self {
        Self { threshold, ..Default::default() }
    }

    /// Fold one completed analysis into the counters.
    pub fn record(&mut self, result: &AnalysisResult, is_fake: bool) {
        if result.degraded {
            self.degraded += 1;
        }
        for m in &result.per_model {
            if let Some(s) = m.available_score() {
                self.per_detector.entry(m.name).or_default().record(s > DETECTOR_VOTE, is_fake);
            }
        }
        match (result.verdict, result.confidence) {
            (Verdict::Indeterminate, _) | (_, None) => self.indeterminate += 1,
            (verdict, Some(c)) => {
                self.global.record(verdict == Verdict::Deepfake, is_fake);
                self.scored.push((c, is_fake));
            }
        }
    }

    pub fn record_error(&mut self, code: &str) {
        *self.errors.entry(code.to_string()).or_default() += 1;
    }
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

pub struct Evaluator<'a> {
    pipeline: &'a Pipeline,
}

impl<'a> Evaluator<'a> {
    pub fn new(pipeline: &'a Pipeline) -> Self {
        Self { pipeline }
    }

    pub async fn run_dataset(&self, path: &Path) -> Result<EvalResult> {
        let content = tokio::fs::read_to_string(path).await?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut items: Vec<LabeledItem> = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() { continue; }
            match serde_json::from_str::<LabeledItem>(line) {
                Ok(mut item) => {
                    if item.path.is_relative() {
                        item.path = base.join(&item.path);
                    }
                    items.push(item);
                }
                Err(e) => warn!("Eval dataset parse error: {}", e),
            }
        }

        info!("Loaded {} labeled items from {}", items.len(), path.display());
        Ok(self.evaluate(&items).await)
    }

    pub async fn evaluate(&self, items: &[LabeledItem]) -> EvalResult {
        let mut out = EvalResult::new(self.pipeline.config().deepfake_threshold);
        out.n_items    = items.len();
        out.n_positive = items.iter().filter(|i| i.is_fake).count();
        out.n_negative = out.n_items - out.n_positive;

        for item in items {
            let media = match load_image(&item.path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("EVAL_SKIP path={} error={}", item.path.display(), e);
                    out.record_error(e.code());
                    continue;
                }
            };
            match self.pipeline.analyze(&media).await {
                Ok(result) => out.record(&result, item.is_fake),
                Err(e) => out.record_error(e.code()),
            }
        }
        out
    }
}
