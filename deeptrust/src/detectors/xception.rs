// deeptrust/src/detectors/xception.rs
//
// Xception slot - gradient-structure analysis via a HOG descriptor.
//
// Descriptor: 128×128 grayscale, 9 unsigned orientation bins, 8×8-pixel
// cells, 2×2-cell blocks L2-normalized with stride 1. Natural images land
// near a feature variance of ~0.02; distance from that is the anomaly.
//   score = min(|var(features) − 0.02|·20, 1)

use async_trait::async_trait;

use super::{mean_over_frames, mean_var, Detector, DetectorOutput};
use crate::analysis::DetectorName;
use crate::error::AdapterFailure;
use crate::media::{Frame, MediaItem};

const SIZE:     usize = 128;
const CELL:     usize = 8;
const BINS:     usize = 9;
const MIN_SIDE: u32   = 16;
const NATURAL_VARIANCE: f64 = 0.02;

pub struct Xception {
    max_frames: usize,
}

impl Xception {
    pub fn new(max_frames: usize) -> Self {
        Self { max_frames }
    }
}

#[async_trait]
impl Detector for Xception {
    fn name(&self) -> DetectorName {
        DetectorName::Xception
    }

    async fn score(&self, item: &MediaItem) -> Result<DetectorOutput, AdapterFailure> {
        mean_over_frames(item, self.max_frames, gradient_score).await
    }
}

pub fn gradient_score(frame: &Frame) -> Result<f64, AdapterFailure> {
    if frame.width < MIN_SIDE || frame.height < MIN_SIDE {
        return Err(AdapterFailure::UnsupportedInput);
    }
    let features = hog(&frame.luma_resized(SIZE, SIZE));
    let (_, variance) = mean_var(&features);
    Ok(((variance - NATURAL_VARIANCE).abs() * 20.0).min(1.0))
}

/// HOG descriptor of a SIZE×SIZE plane.
fn hog(g: &[f32]) -> Vec<f32> {
    let cells = SIZE / CELL;
    let mut hist = vec![[0.0f32; BINS]; cells * cells];

    for y in 0..SIZE {
        for x in 0..SIZE {
            let at = |xx: usize, yy: usize| g[yy * SIZE + xx];
            let gx = if x == 0 || x + 1 == SIZE { 0.0 } else { at(x + 1, y) - at(x - 1, y) };
            let gy = if y == 0 || y + 1 == SIZE { 0.0 } else { at(x, y + 1) - at(x, y - 1) };
            let mag = (gx * gx + gy * gy).sqrt();
            if mag == 0.0 {
                continue;
            }
            let mut angle = gy.atan2(gx).to_degrees();
            if angle < 0.0 { angle += 180.0; }
            let bin = ((angle / (180.0 / BINS as f32)) as usize).min(BINS - 1);
            hist[(y / CELL) * cells + x / CELL][bin] += mag;
        }
    }

    let blocks = cells - 1;
    let mut features = Vec::with_capacity(blocks * blocks * 4 * BINS);
    for by in 0..blocks {
        for bx in 0..blocks {
            let start = features.len();
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                features.extend_from_slice(&hist[(by + dy) * cells + bx + dx]);
            }
            let norm = (features[start..].iter().map(|v| v * v).sum::<f32>() + 1e-6).sqrt();
            for v in &mut features[start..] {
                *v /= norm;
            }
        }
    }
    features
}
