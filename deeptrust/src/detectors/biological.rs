// deeptrust/src/detectors/biological.rs
//
// Biological slot - facial symmetry + eye-region texture.
//
// Needs a subject. A YCbCr skin-tone locator finds the face box on a
// downsampled frame (long side ≤ 128 px); frames without one are skipped and
// if no sampled frame has a subject the adapter fails with NoSubjectFound.
//
//   symmetry = 1 / (1 + mse(left half, mirrored right half) / 1000)
//   eye      = 1 / (1 + var(eye band) / 100)          eye band = 20–50% of box height
//   score    = 0.6·symmetry + 0.4·eye
//
// Real faces are never perfectly symmetric and have textured eyes, so high
// values are suspicious. Values are on the 0–255 luma scale.
//
// This is the only built-in adapter with spatial attribution: the subject box
// painted at the frame's score.

use async_trait::async_trait;

use super::{mean_var, round4, Detector, DetectorOutput};
use crate::analysis::{DetectorName, SaliencyMap};
use crate::error::AdapterFailure;
use crate::media::{Frame, MediaItem};

const WORK_SIDE:        u32   = 128;
const MIN_SKIN_FRACTION: f64  = 0.03;
const MIN_BOX_SIDE:     usize = 8;
const ATTRIBUTION_SIDE: usize = 32;

pub struct BiologicalAnalyzer {
    max_frames: usize,
}

impl BiologicalAnalyzer {
    pub fn new(max_frames: usize) -> Self {
        Self { max_frames }
    }
}

#[async_trait]
impl Detector for BiologicalAnalyzer {
    fn name(&self) -> DetectorName {
        DetectorName::Biological
    }

    async fn score(&self, item: &MediaItem) -> Result<DetectorOutput, AdapterFailure> {
        let item = item.clone();
        let max_frames = self.max_frames;
        tokio::task::spawn_blocking(move || {
            let mut scores = Vec::new();
            let mut attribution = None;
            for frame in item.sampled_frames(max_frames) {
                if let Some(fs) = analyze_frame(frame) {
                    if attribution.is_none() {
                        attribution = Some(fs.attribution());
                    }
                    scores.push(fs.score);
                }
            }
            if scores.is_empty() {
                return Err(AdapterFailure::NoSubjectFound);
            }
            let score = scores.iter().sum::<f64>() / scores.len() as f64;
            Ok(DetectorOutput { score: round4(score), attribution })
        })
        .await
        .map_err(|_| AdapterFailure::InternalError)?
    }
}

// ── Subject location ──────────────────────────────────────────────────────────

/// Half-open box in working-plane coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubjectBox {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
}

impl SubjectBox {
    pub fn width(&self) -> usize { self.x1 - self.x0 }
    pub fn height(&self) -> usize { self.y1 - self.y0 }
}

/// Downsampled luma plane (0–255) the box refers to.
struct WorkPlane {
    w:    usize,
    h:    usize,
    luma: Vec<f32>,
    rgb:  Vec<[u8; 3]>,
}

impl WorkPlane {
    fn from_frame(frame: &Frame) -> Self {
        let scale = (frame.width.max(frame.height) as f64 / WORK_SIDE as f64).max(1.0);
        let w = ((frame.width as f64 / scale) as usize).max(1);
        let h = ((frame.height as f64 / scale) as usize).max(1);
        let mut rgb = Vec::with_capacity(w * h);
        for y in 0..h {
            let sy = ((y as f64 * scale) as u32).min(frame.height - 1);
            for x in 0..w {
                let sx = ((x as f64 * scale) as u32).min(frame.width - 1);
                rgb.push(frame.rgb(sx, sy));
            }
        }
        let luma = rgb
            .iter()
            .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
            .collect();
        Self { w, h, luma, rgb }
    }
}

fn is_skin([r, g, b]: [u8; 3]) -> bool {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y  = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b;
    y > 40.0 && (77.0..=127.0).contains(&cb) && (133.0..=173.0).contains(&cr)
}

/// Robust (5th–95th percentile) bounding box of skin pixels.
fn locate_subject(plane: &WorkPlane) -> Option<SubjectBox> {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for (i, px) in plane.rgb.iter().enumerate() {
        if is_skin(*px) {
            xs.push(i % plane.w);
            ys.push(i / plane.w);
        }
    }
    if (xs.len() as f64) < MIN_SKIN_FRACTION * (plane.w * plane.h) as f64 {
        return None;
    }
    xs.sort_unstable();
    ys.sort_unstable();
    let n = xs.len();
    let lo = n * 5 / 100;
    let hi = (n * 95 / 100).min(n - 1);
    let b = SubjectBox { x0: xs[lo], y0: ys[lo], x1: xs[hi] + 1, y1: ys[hi] + 1 };
    (b.width() >= MIN_BOX_SIDE && b.height() >= MIN_BOX_SIDE).then_some(b)
}

// ── Per-frame scoring ─────────────────────────────────────────────────────────

struct FrameScore {
    score:  f64,
    subject: SubjectBox,
    plane_w: usize,
    plane_h: usize,
}

impl FrameScore {
    fn attribution(&self) -> SaliencyMap {
        let (w, h, b, s) = (self.plane_w, self.plane_h, self.subject, self.score);
        SaliencyMap::from_fn(ATTRIBUTION_SIDE, ATTRIBUTION_SIDE, |r, c| {
            let y = r * h / ATTRIBUTION_SIDE;
            let x = c * w / ATTRIBUTION_SIDE;
            if (b.x0..b.x1).contains(&x) && (b.y0..b.y1).contains(&y) { s } else { 0.0 }
        })
    }
}

fn analyze_frame(frame: &Frame) -> Option<FrameScore> {
    let plane = WorkPlane::from_frame(frame);
    let subject = locate_subject(&plane)?;
    let symmetry = symmetry_score(&plane, subject);
    let eye = eye_score(&plane, subject);
    Some(FrameScore {
        score: symmetry * 0.6 + eye * 0.4,
        subject,
        plane_w: plane.w,
        plane_h: plane.h,
    })
}

fn symmetry_score(plane: &WorkPlane, b: SubjectBox) -> f64 {
    let half = b.width() / 2;
    let mut sum = 0.0f64;
    for y in b.y0..b.y1 {
        for i in 0..half {
            let left  = plane.luma[y * plane.w + b.x0 + i] as f64;
            let right = plane.luma[y * plane.w + b.x1 - 1 - i] as f64;
            sum += (left - right).powi(2);
        }
    }
    let mse = sum / (half * b.height()).max(1) as f64;
    1.0 / (1.0 + mse / 1000.0)
}

fn eye_score(plane: &WorkPlane, b: SubjectBox) -> f64 {
    let top    = b.y0 + b.height() / 5;
    let bottom = (b.y0 + b.height() / 2).max(top + 1);
    let band: Vec<f32> = (top..bottom)
        .flat_map(|y| (b.x0..b.x1).map(move |x| (y, x)))
        .map(|(y, x)| plane.luma[y * plane.w + x])
        .collect();
    let (_, var) = mean_var(&band);
    1.0 / (1.0 + var / 100.0)
}
