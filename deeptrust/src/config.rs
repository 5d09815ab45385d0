// deeptrust/src/config.rs
//
// Pipeline configuration + hot-reloadable ensemble weights.
//
// Config file (JSON, every field optional):
//   {
//     "weights":             { "mesonet": 0.30, "xception": 0.35, "frequency": 0.20, "biological": 0.15 },
//     "deepfake_threshold":  0.5,
//     "adapter_timeout_ms":  2000,
//     "request_deadline_ms": 5000,
//     "max_frames":          8,
//     "saliency":            { "resolution": 32, "fallback": "radial_prior" },
//     "artifact_labels":     { "mesonet": "...", ... }
//   }
//
// Only `weights` is hot-reloaded. Each request takes one Arc snapshot from the
// WeightStore at dispatch time and uses it for skip decisions and fusion, so a
// reload landing mid-request never mixes two weight sets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::analysis::DetectorName;
use crate::error::ConfigError;

// ── Ensemble weights ──────────────────────────────────────────────────────────

/// Configured (not renormalized) weight per detector. Missing entries are 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnsembleWeights(BTreeMap<DetectorName, f64>);

impl EnsembleWeights {
    pub fn new(weights: impl IntoIterator<Item = (DetectorName, f64)>) -> Self {
        Self(weights.into_iter().collect())
    }

    pub fn get(&self, name: DetectorName) -> f64 {
        self.0.get(&name).copied().unwrap_or(0.0)
    }

    /// A zero-weight detector can never move the fused score, so it is not run.
    pub fn is_enabled(&self, name: DetectorName) -> bool {
        self.get(name) > 0.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (DetectorName, f64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, w) in self.iter() {
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::Invalid(format!("weight for {} must be finite and >= 0, got {}", name, w)));
            }
        }
        if !self.iter().any(|(_, w)| w > 0.0) {
            return Err(ConfigError::Invalid("at least one detector weight must be positive".into()));
        }
        Ok(())
    }
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self::new([
            (DetectorName::MesoNet,    0.30),
            (DetectorName::Xception,   0.35),
            (DetectorName::Frequency,  0.20),
            (DetectorName::Biological, 0.15),
        ])
    }
}

// ── Saliency ──────────────────────────────────────────────────────────────────

/// What to show when no detector localizes its signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaliencyFallback {
    /// Centre-weighted Gaussian scaled by confidence. Approximation only.
    RadialPrior,
    /// No saliency grid at all.
    Omit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaliencyConfig {
    pub resolution: usize,
    pub fallback:   SaliencyFallback,
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self { resolution: 32, fallback: SaliencyFallback::RadialPrior }
    }
}

// ── Pipeline config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub weights:             EnsembleWeights,
    pub deepfake_threshold:  f64,
    pub adapter_timeout_ms:  u64,
    pub request_deadline_ms: u64,
    pub max_frames:          usize,
    pub saliency:            SaliencyConfig,
    pub artifact_labels:     BTreeMap<DetectorName, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            weights:             EnsembleWeights::default(),
            deepfake_threshold:  0.5,
            adapter_timeout_ms:  2_000,
            request_deadline_ms: 5_000,
            max_frames:          8,
            saliency:            SaliencyConfig::default(),
            artifact_labels:     default_artifact_labels(),
        }
    }
}

pub fn default_artifact_labels() -> BTreeMap<DetectorName, String> {
    [
        (DetectorName::MesoNet,    "Texture smoothing inconsistent with camera capture"),
        (DetectorName::Xception,   "Irregular edge gradient structure"),
        (DetectorName::Frequency,  "High-frequency spectral artifacts"),
        (DetectorName::Biological, "Unnatural facial symmetry and eye texture"),
    ]
    .into_iter()
    .map(|(k, v)| (k, v.to_string()))
    .collect()
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let mut cfg: Self = serde_json::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        // Labels are per-detector; a partial map keeps defaults for the rest.
        for (name, label) in default_artifact_labels() {
            cfg.artifact_labels.entry(name).or_insert(label);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;
        if !(0.0..=1.0).contains(&self.deepfake_threshold) {
            return Err(ConfigError::Invalid(format!(
                "deepfake_threshold must be in [0,1], got {}", self.deepfake_threshold
            )));
        }
        if self.adapter_timeout_ms == 0 || self.request_deadline_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.max_frames == 0 {
            return Err(ConfigError::Invalid("max_frames must be >= 1".into()));
        }
        if self.saliency.resolution == 0 || self.saliency.resolution > 512 {
            return Err(ConfigError::Invalid(format!(
                "saliency.resolution must be in 1..=512, got {}", self.saliency.resolution
            )));
        }
        if self.request_deadline_ms < self.adapter_timeout_ms {
            warn!(
                "request_deadline_ms={} < adapter_timeout_ms={} - slow detectors will surface as pipeline timeouts",
                self.request_deadline_ms, self.adapter_timeout_ms
            );
        }
        Ok(())
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }
}

// ── Weight store ──────────────────────────────────────────────────────────────

pub struct WeightStore {
    current: RwLock<Arc<EnsembleWeights>>,
}

impl WeightStore {
    pub fn new(weights: EnsembleWeights) -> Self {
        Self { current: RwLock::new(Arc::new(weights)) }
    }

    /// Immutable snapshot for one request.
    pub fn snapshot(&self) -> Arc<EnsembleWeights> {
        Arc::clone(&self.current.read())
    }

    pub fn replace(&self, weights: EnsembleWeights) -> Result<(), ConfigError> {
        weights.validate()?;
        *self.current.write() = Arc::new(weights);
        Ok(())
    }

    /// Re-read `path` and swap in its weights. On any error the previous
    /// weights stay active.
    pub fn reload_from(&self, path: &Path) -> Result<(), ConfigError> {
        let cfg = PipelineConfig::load(path)?;
        self.replace(cfg.weights)
    }

    /// Poll `path` every `interval`; reload when its mtime changes.
    pub async fn watch(self: Arc<Self>, path: PathBuf, interval: Duration) {
        let mut last = modified(&path).await;
        info!("Watching {} for weight changes every {:?}", path.display(), interval);
        loop {
            tokio::time::sleep(interval).await;
            let now = modified(&path).await;
            if now.is_none() || now == last {
                continue;
            }
            last = now;
            let store = Arc::clone(&self);
            let file = path.clone();
            match tokio::task::spawn_blocking(move || store.reload_from(&file)).await {
                Ok(Ok(())) => info!("WEIGHTS_RELOADED path={} weights={:?}", path.display(), self.snapshot()),
                Ok(Err(e)) => warn!("Weight reload rejected, keeping previous weights: {}", e),
                Err(e) => warn!("Weight reload task failed: {}", e),
            }
        }
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid_and_sum_to_one() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        let sum: f64 = cfg.weights.iter().map(|(_, w)| w).sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn negative_or_all_zero_weights_rejected() {
        let neg = EnsembleWeights::new([(DetectorName::MesoNet, -0.1), (DetectorName::Xception, 1.0)]);
        assert!(neg.validate().is_err());
        let zero = EnsembleWeights::new([(DetectorName::MesoNet, 0.0)]);
        assert!(zero.validate().is_err());
        let nan = EnsembleWeights::new([(DetectorName::MesoNet, f64::NAN)]);
        assert!(nan.validate().is_err());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{ "deepfake_threshold": 0.6, "artifact_labels": {{ "frequency": "spectral" }} }}"#).unwrap();
        let cfg = PipelineConfig::load(f.path()).unwrap();
        assert_eq!(cfg.deepfake_threshold, 0.6);
        assert_eq!(cfg.weights, EnsembleWeights::default());
        assert_eq!(cfg.artifact_labels[&DetectorName::Frequency], "spectral");
        assert_eq!(cfg.artifact_labels.len(), 4);
        assert_eq!(cfg.saliency.fallback, SaliencyFallback::RadialPrior);
    }

    #[test]
    fn bad_threshold_is_invalid() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{ "deepfake_threshold": 1.5 }}"#).unwrap();
        assert!(matches!(PipelineConfig::load(f.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn snapshot_is_unaffected_by_later_replace() {
        let store = WeightStore::new(EnsembleWeights::default());
        let before = store.snapshot();
        store
            .replace(EnsembleWeights::new([(DetectorName::Frequency, 1.0)]))
            .unwrap();
        let after = store.snapshot();
        assert_eq!(before.get(DetectorName::MesoNet), 0.30);
        assert_eq!(after.get(DetectorName::MesoNet), 0.0);
        assert_eq!(after.get(DetectorName::Frequency), 1.0);
    }

    #[test]
    fn failed_reload_keeps_previous_weights() {
        let store = WeightStore::new(EnsembleWeights::default());
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{ "weights": {{ "mesonet": -1.0 }} }}"#).unwrap();
        assert!(store.reload_from(f.path()).is_err());
        assert_eq!(*store.snapshot(), EnsembleWeights::default());

        let mut g = tempfile::NamedTempFile::new().unwrap();
        write!(g, r#"{{ "weights": {{ "mesonet": 1.0, "xception": 1.0 }} }}"#).unwrap();
        store.reload_from(g.path()).unwrap();
        assert_eq!(store.snapshot().get(DetectorName::Xception), 1.0);
        assert!(!store.snapshot().is_enabled(DetectorName::Biological));
    }

    #[tokio::test]
    async fn watch_swaps_weights_when_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deeptrust.json");
        std::fs::write(&path, r#"{ "weights": { "mesonet": 1.0 } }"#).unwrap();

        let store = Arc::new(WeightStore::new(EnsembleWeights::default()));
        let task = tokio::spawn(Arc::clone(&store).watch(path.clone(), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        std::fs::write(&path, r#"{ "weights": { "frequency": 1.0 } }"#).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        for _ in 0..200 {
            if store.snapshot().is_enabled(DetectorName::Frequency)
                && !store.snapshot().is_enabled(DetectorName::MesoNet)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
        assert_eq!(store.snapshot().get(DetectorName::Frequency), 1.0);
        assert_eq!(store.snapshot().get(DetectorName::MesoNet), 0.0);
    }
}
