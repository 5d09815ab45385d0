// deeptrust/src/detectors/mesonet.rs
//
// MesoNet slot - mesoscopic texture analysis.
//
// Generated faces tend to be over-smoothed: low luminance variance and weak
// local edges at the 256×256 working resolution.
//   texture = 1 − min(var·10, 1)
//   edge    = 1 − min((mean|Δy| + mean|Δx|)·5, 1)
//   score   = 0.6·texture + 0.4·edge

use async_trait::async_trait;

use super::{mean_over_frames, mean_var, Detector, DetectorOutput};
use crate::analysis::DetectorName;
use crate::error::AdapterFailure;
use crate::media::{Frame, MediaItem};

const SIZE: usize = 256;

pub struct MesoNet {
    max_frames: usize,
}

impl MesoNet {
    pub fn new(max_frames: usize) -> Self {
        Self { max_frames }
    }
}

#[async_trait]
impl Detector for MesoNet {
    fn name(&self) -> DetectorName {
        DetectorName::MesoNet
    }

    async fn score(&self, item: &MediaItem) -> Result<DetectorOutput, AdapterFailure> {
        mean_over_frames(item, self.max_frames, texture_score).await
    }
}

pub fn texture_score(frame: &Frame) -> Result<f64, AdapterFailure> {
    let g = frame.luma_resized(SIZE, SIZE);
    let (_, variance) = mean_var(&g);

    let mut dy = 0.0f64;
    let mut dx = 0.0f64;
    for y in 0..SIZE {
        for x in 0..SIZE {
            let v = g[y * SIZE + x];
            if y + 1 < SIZE { dy += (g[(y + 1) * SIZE + x] - v).abs() as f64; }
            if x + 1 < SIZE { dx += (g[y * SIZE + x + 1] - v).abs() as f64; }
        }
    }
    let pairs = ((SIZE - 1) * SIZE) as f64;
    let edge_strength = dy / pairs + dx / pairs;

    let texture = 1.0 - (variance * 10.0).min(1.0);
    let edge    = 1.0 - (edge_strength * 5.0).min(1.0);
    Ok(texture * 0.6 + edge * 0.4)
}
