// deeptrust/src/detectors/frequency.rs
//
// Frequency slot - spectral artifacts from upsampling / GAN decoders.
//
//   FFT: ratio of mean magnitude outside the central 20% band of the shifted
//        spectrum to the mean magnitude overall.  fft = min(ratio·2, 1)
//   DCT: coefficient of variation over the high-frequency quadrant.
//        dct = min(cv/10, 1)
//   score = 0.6·fft + 0.4·dct
//
// FFT/DCT plans are built once and shared; planning is the expensive part.

use std::sync::Arc;

use async_trait::async_trait;
use rustdct::{Dct2, DctPlanner};
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::{mean_over_frames, Detector, DetectorOutput};
use crate::analysis::DetectorName;
use crate::error::AdapterFailure;
use crate::media::{Frame, MediaItem};

const SIZE:     usize = 128;
const MIN_SIDE: u32   = 16;

#[derive(Clone)]
struct Plans {
    fft: Arc<dyn Fft<f32>>,
    dct: Arc<dyn rustdct::TransformType2And3<f32>>,
}

impl Plans {
    fn new() -> Self {
        Self {
            fft: FftPlanner::<f32>::new().plan_fft_forward(SIZE),
            dct: DctPlanner::<f32>::new().plan_dct2(SIZE),
        }
    }
}

pub struct FrequencyAnalyzer {
    max_frames: usize,
    plans:      Plans,
}

impl FrequencyAnalyzer {
    pub fn new(max_frames: usize) -> Self {
        Self { max_frames, plans: Plans::new() }
    }
}

#[async_trait]
impl Detector for FrequencyAnalyzer {
    fn name(&self) -> DetectorName {
        DetectorName::Frequency
    }

    async fn score(&self, item: &MediaItem) -> Result<DetectorOutput, AdapterFailure> {
        let plans = self.plans.clone();
        mean_over_frames(item, self.max_frames, move |f| spectral_score(f, &plans)).await
    }
}

fn spectral_score(frame: &Frame, plans: &Plans) -> Result<f64, AdapterFailure> {
    if frame.width < MIN_SIDE || frame.height < MIN_SIDE {
        return Err(AdapterFailure::UnsupportedInput);
    }
    let g = frame.luma_resized(SIZE, SIZE);
    let fft = fft_anomaly(&g, plans.fft.as_ref());
    let dct = dct_anomaly(&g, plans.dct.as_ref());
    Ok(fft * 0.6 + dct * 0.4)
}

fn fft_anomaly(g: &[f32], fft: &dyn Fft<f32>) -> f64 {
    let mut buf: Vec<Complex<f32>> = g.iter().map(|&v| Complex::new(v, 0.0)).collect();

    for row in buf.chunks_exact_mut(SIZE) {
        fft.process(row);
    }
    let mut col = vec![Complex::new(0.0f32, 0.0); SIZE];
    for x in 0..SIZE {
        for y in 0..SIZE { col[y] = buf[y * SIZE + x]; }
        fft.process(&mut col);
        for y in 0..SIZE { buf[y * SIZE + x] = col[y]; }
    }

    // Central low-frequency band in shifted coordinates.
    let lo = (SIZE as f64 * 0.4) as usize;
    let hi = (SIZE as f64 * 0.6) as usize;
    let shifted = |i: usize| (i + SIZE / 2) % SIZE;

    let mut total = 0.0f64;
    let mut high  = 0.0f64;
    let mut n_high = 0usize;
    for y in 0..SIZE {
        for x in 0..SIZE {
            let mag = buf[y * SIZE + x].norm() as f64;
            total += mag;
            let (sy, sx) = (shifted(y), shifted(x));
            let central = (lo..hi).contains(&sy) && (lo..hi).contains(&sx);
            if !central {
                high += mag;
                n_high += 1;
            }
        }
    }
    let total_mean = total / (SIZE * SIZE) as f64;
    let high_mean  = high / n_high.max(1) as f64;
    (high_mean / (total_mean + 1e-10) * 2.0).min(1.0)
}

fn dct_anomaly(g: &[f32], dct: &dyn rustdct::TransformType2And3<f32>) -> f64 {
    let mut buf = g.to_vec();
    for row in buf.chunks_exact_mut(SIZE) {
        dct.process_dct2(row);
    }
    let mut col = vec![0.0f32; SIZE];
    for x in 0..SIZE {
        for y in 0..SIZE { col[y] = buf[y * SIZE + x]; }
        dct.process_dct2(&mut col);
        for y in 0..SIZE { buf[y * SIZE + x] = col[y]; }
    }

    let half = SIZE / 2;
    let quadrant: Vec<f64> = (half..SIZE)
        .flat_map(|y| (half..SIZE).map(move |x| (y, x)))
        .map(|(y, x)| buf[y * SIZE + x].abs() as f64)
        .collect();
    let n    = quadrant.len() as f64;
    let mean = quadrant.iter().sum::<f64>() / n;
    // Below this the quadrant is rounding noise and its cv means nothing.
    if mean <= buf[0].abs() as f64 * 1e-5 {
        return 0.0;
    }
    let std  = (quadrant.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    let cv   = std / (mean + 1e-10);
    (cv / 10.0).min(1.0)
}
