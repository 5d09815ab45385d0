// deeptrust/src/media.rs
//
// Decoded media handed to the pipeline by the ingestion collaborator.
//
// A MediaItem is one still image or a set of sampled video frames, each an
// RGB8 buffer. Frames live behind an Arc so every detector task can hold the
// same item without copying pixels. The pipeline never mutates an item.
//
// Validation here is structural only (frame count, dimensions, buffer
// length). Pixel content is assumed to have been decoded correctly upstream.

use std::path::Path;
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One decoded RGB8 frame, row-major, 3 bytes per pixel.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width:  u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self { width, height, pixels }
    }

    /// Build a frame from a per-pixel function. Mostly useful for synthetic input.
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> [u8; 3]) -> Self {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&f(x, y));
            }
        }
        Self { width, height, pixels }
    }

    pub fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * self.width + x) * 3) as usize;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    /// Luma in [0,1] resized to `w`×`h`. Upscaling repeats pixels; downscaling
    /// averages them with a triangle filter.
    pub fn luma_resized(&self, w: usize, h: usize) -> Vec<f32> {
        let Some(rgb) = RgbImage::from_raw(self.width, self.height, self.pixels.clone()) else {
            return vec![0.0; w * h];
        };
        let luma = DynamicImage::ImageRgb8(rgb).to_luma32f();
        let (w, h) = (w as u32, h as u32);
        if luma.dimensions() == (w, h) {
            return luma.into_raw();
        }
        let filter = if w >= self.width && h >= self.height {
            FilterType::Nearest
        } else {
            FilterType::Triangle
        };
        imageops::resize(&luma, w, h, filter).into_raw()
    }
}

// ── Metadata ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaFormat {
    Image,
    Video,
}

impl std::fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub width:       u32,
    pub height:      u32,
    pub format:      MediaFormat,
    pub duration_ms: Option<u64>, // video only
    pub source:      Option<String>,
}

// ── MediaItem ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MediaItem {
    frames:   Arc<[Frame]>,
    metadata: MediaMetadata,
}

impl MediaItem {
    pub fn image(frame: Frame) -> Self {
        let metadata = MediaMetadata {
            width:       frame.width,
            height:      frame.height,
            format:      MediaFormat::Image,
            duration_ms: None,
            source:      None,
        };
        Self { frames: Arc::from(vec![frame]), metadata }
    }

    pub fn video(frames: Vec<Frame>, duration_ms: u64) -> Self {
        let (width, height) = frames.first().map(|f| (f.width, f.height)).unwrap_or((0, 0));
        let metadata = MediaMetadata {
            width,
            height,
            format:      MediaFormat::Video,
            duration_ms: Some(duration_ms),
            source:      None,
        };
        Self { frames: Arc::from(frames), metadata }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }

    pub fn metadata(&self) -> &MediaMetadata {
        &self.metadata
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Up to `max` frames, evenly spaced, always including the first.
    pub fn sampled_frames(&self, max: usize) -> Vec<&Frame> {
        let n = self.frames.len();
        if max == 0 || n == 0 {
            return Vec::new();
        }
        if n <= max {
            return self.frames.iter().collect();
        }
        (0..max).map(|i| &self.frames[i * n / max]).collect()
    }

    /// Structural check. Anything failing here is undecodable as far as
    /// detectors are concerned.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let md = &self.metadata;
        if self.frames.is_empty() {
            return Err(PipelineError::InvalidMedia("no frames".into()));
        }
        if md.width == 0 || md.height == 0 {
            return Err(PipelineError::InvalidMedia(format!(
                "zero dimension {}x{}", md.width, md.height
            )));
        }
        if md.format == MediaFormat::Image && self.frames.len() != 1 {
            return Err(PipelineError::InvalidMedia(format!(
                "image with {} frames", self.frames.len()
            )));
        }
        for (i, f) in self.frames.iter().enumerate() {
            if f.width != md.width || f.height != md.height {
                return Err(PipelineError::InvalidMedia(format!(
                    "frame {} is {}x{}, expected {}x{}",
                    i, f.width, f.height, md.width, md.height
                )));
            }
            let expected = f.width as usize * f.height as usize * 3;
            if f.pixels.len() != expected {
                return Err(PipelineError::InvalidMedia(format!(
                    "frame {} has {} bytes, expected {}", i, f.pixels.len(), expected
                )));
            }
        }
        Ok(())
    }

    /// SHA256[:8] over the first frame - used to correlate log lines.
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.metadata.width.to_le_bytes());
        h.update(self.metadata.height.to_le_bytes());
        if let Some(f) = self.frames.first() {
            h.update(&f.pixels);
        }
        hex::encode(&h.finalize()[..8])
    }
}

// ── Ingestion (CLI host only) ─────────────────────────────────────────────────

/// Decode an image file into a MediaItem. Decode failures map to InvalidMedia.
pub fn load_image(path: &Path) -> Result<MediaItem, PipelineError> {
    let img = image::open(path)
        .map_err(|e| PipelineError::InvalidMedia(format!("{}: {}", path.display(), e)))?
        .to_rgb8();
    let (w, h) = img.dimensions();
    let frame = Frame::new(w, h, img.into_raw());
    Ok(MediaItem::image(frame).with_source(path.display().to_string()))
}
