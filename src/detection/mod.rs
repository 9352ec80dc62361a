//! Detection Engine — blue-light signal analysis with baseline calibration
//! and debounced waiting decisions.
//!
//! Converts a stream of frame samples into
//! `(intensity, confidence, waiting, changed)`:
//!
//! - Per-pixel "blue dominance" scored over a stride-sampled subset
//! - Running mean of the first 30 samples frozen as the **baseline**
//! - **Hysteresis**: a state flip requires 3 consecutive agreeing samples;
//!   a single dissenting sample resets the counter
//! - Confidence blends reading consistency (0.7) with distance from
//!   baseline (0.3)
//!
//! One engine instance per device, driven synchronously from a single
//! task — overlapping analysis would corrupt the hysteresis counters, so
//! the engine is deliberately `&mut self` throughout.

pub mod throttle;

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::defaults::{
    CALIBRATION_SAMPLES, CONFIDENCE_CONSISTENCY_WEIGHT, CONFIDENCE_SIGNIFICANCE_WEIGHT,
    CONFIDENCE_STD_SCALE, CONFIDENCE_WINDOW, HYSTERESIS_SAMPLES, PIXEL_STRIDE,
    READING_HISTORY_SIZE,
};
use crate::types::Sensitivity;

// ============================================================================
// Frame Samples
// ============================================================================

/// Pull-based accessor for one decoded video frame.
///
/// The camera layer (out of scope) supplies these; the engine only reads
/// RGBA pixels through this seam.
pub trait FrameSample {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    /// RGBA channel values at (x, y), or `None` when out of bounds.
    fn rgba(&self, x: usize, y: usize) -> Option<[u8; 4]>;
}

/// Owned RGBA frame buffer — the reference [`FrameSample`] implementation.
#[derive(Debug, Clone)]
pub struct RgbaFrame {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl RgbaFrame {
    /// Wrap a raw RGBA byte buffer.
    ///
    /// Fails when the buffer length does not match `width * height * 4` —
    /// an unsupported format is an error result, never a panic, so the
    /// sampling loop can log it and keep running.
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self, DetectionError> {
        if width == 0 || height == 0 {
            return Err(DetectionError::EmptyFrame { width, height });
        }
        let expected = width * height * 4;
        if data.len() != expected {
            return Err(DetectionError::UnsupportedFormat {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Build a uniform single-color frame (test/simulation helper).
    pub fn solid(width: usize, height: usize, rgb: [u8; 3]) -> Result<Self, DetectionError> {
        let mut data = Vec::with_capacity(width * height * 4);
        for _ in 0..width * height {
            data.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
        }
        Self::new(width, height, data)
    }
}

impl FrameSample for RgbaFrame {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn rgba(&self, x: usize, y: usize) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y * self.width + x) * 4;
        Some([
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ])
    }
}

// ============================================================================
// Errors & Results
// ============================================================================

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("frame has zero dimension ({width}x{height})")]
    EmptyFrame { width: usize, height: usize },

    #[error("unsupported sample format: expected {expected} bytes, got {actual}")]
    UnsupportedFormat { expected: usize, actual: usize },

    #[error("frame yielded no sampleable pixels")]
    NoPixels,
}

/// Engine phase reported alongside every analysis result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionPhase {
    /// Baseline still accumulating; `waiting` is forced false.
    Calibrating {
        /// Fraction of the calibration window completed, in [0, 1]
        progress: f64,
    },
    /// Baseline frozen; waiting decisions are live.
    Active,
}

impl DetectionPhase {
    pub fn is_calibrating(&self) -> bool {
        matches!(self, DetectionPhase::Calibrating { .. })
    }
}

/// Result of analyzing one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Mean blue-dominance score over the sampled pixels, in [0, 1]
    pub raw_intensity: f64,
    /// `raw * sensitivity.multiplier`
    pub amplified_intensity: f64,
    /// `clamp(amplified − baseline, 0, 1)`; 0 while calibrating
    pub normalized_intensity: f64,
    /// Debounced waiting decision
    pub waiting: bool,
    /// True only on the sample that flipped `waiting`
    pub changed: bool,
    /// Blended consistency/significance confidence, in [0, 1]
    pub confidence: f64,
    pub phase: DetectionPhase,
}

// ============================================================================
// Detection Engine
// ============================================================================

/// Per-device signal-detection state machine.
///
/// Sensitivity lives behind an [`ArcSwap`] so a settings change from the
/// UI/config task is picked up on the next sample without locking the
/// analysis path.
pub struct DetectionEngine {
    sensitivity: Arc<ArcSwap<Sensitivity>>,
    /// Last `READING_HISTORY_SIZE` raw readings (for confidence)
    readings: VecDeque<f64>,
    baseline_sum: f64,
    baseline_count: usize,
    baseline: f64,
    calibrated: bool,
    waiting: bool,
    /// Consecutive samples agreeing on a flip away from the current state
    agree_count: u32,
}

impl DetectionEngine {
    /// Create an engine sharing the given sensitivity handle.
    pub fn new(sensitivity: Arc<ArcSwap<Sensitivity>>) -> Self {
        Self {
            sensitivity,
            readings: VecDeque::with_capacity(READING_HISTORY_SIZE),
            baseline_sum: 0.0,
            baseline_count: 0,
            baseline: 0.0,
            calibrated: false,
            waiting: false,
            agree_count: 0,
        }
    }

    /// Convenience constructor owning its own sensitivity.
    pub fn with_sensitivity(sensitivity: Sensitivity) -> Self {
        Self::new(Arc::new(ArcSwap::from_pointee(sensitivity)))
    }

    /// Whether the calibration window has completed.
    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Frozen baseline intensity (0.0 until calibrated).
    pub fn baseline(&self) -> f64 {
        self.baseline
    }

    /// Current debounced waiting state.
    pub fn waiting(&self) -> bool {
        self.waiting
    }

    /// Clear all history and return to the uncalibrated state.
    pub fn reset(&mut self) {
        self.readings.clear();
        self.baseline_sum = 0.0;
        self.baseline_count = 0;
        self.baseline = 0.0;
        self.calibrated = false;
        self.waiting = false;
        self.agree_count = 0;
        debug!("Detection engine reset — recalibration required");
    }

    /// Analyze one frame sample.
    ///
    /// Runs synchronously, once per sample. A malformed frame is returned
    /// as a typed error so the caller's loop can skip it and continue.
    pub fn analyze(&mut self, frame: &dyn FrameSample) -> Result<Detection, DetectionError> {
        let raw = self.score_frame(frame)?;

        if self.readings.len() >= READING_HISTORY_SIZE {
            self.readings.pop_front();
        }
        self.readings.push_back(raw);

        let sensitivity = self.sensitivity.load();
        let amplified = raw * sensitivity.multiplier;

        if !self.calibrated {
            self.baseline_sum += raw;
            self.baseline_count += 1;
            if self.baseline_count >= CALIBRATION_SAMPLES {
                self.baseline = self.baseline_sum / self.baseline_count as f64;
                self.calibrated = true;
                info!(
                    baseline = self.baseline,
                    samples = self.baseline_count,
                    "Calibration complete — baseline frozen"
                );
            }
            let progress = self.baseline_count as f64 / CALIBRATION_SAMPLES as f64;
            return Ok(Detection {
                raw_intensity: raw,
                amplified_intensity: amplified,
                normalized_intensity: 0.0,
                waiting: false,
                changed: false,
                confidence: 0.0,
                phase: if self.calibrated {
                    DetectionPhase::Active
                } else {
                    DetectionPhase::Calibrating {
                        progress: progress.min(1.0),
                    }
                },
            });
        }

        let normalized = (amplified - self.baseline).clamp(0.0, 1.0);
        let changed = self.apply_hysteresis(amplified >= sensitivity.threshold);
        let confidence = self.confidence(amplified);

        Ok(Detection {
            raw_intensity: raw,
            amplified_intensity: amplified,
            normalized_intensity: normalized,
            waiting: self.waiting,
            changed,
            confidence,
            phase: DetectionPhase::Active,
        })
    }

    /// Mean blue-dominance score over a stride-sampled pixel subset.
    ///
    /// Per pixel: `brightness * clamp(blue − avg(red, green), 0, 1)` with
    /// channels normalized to [0, 1] and `brightness = (r + g + b) / 3`.
    fn score_frame(&self, frame: &dyn FrameSample) -> Result<f64, DetectionError> {
        let (w, h) = (frame.width(), frame.height());
        if w == 0 || h == 0 {
            return Err(DetectionError::EmptyFrame {
                width: w,
                height: h,
            });
        }

        let mut sum = 0.0;
        let mut count = 0usize;
        for y in (0..h).step_by(PIXEL_STRIDE) {
            for x in (0..w).step_by(PIXEL_STRIDE) {
                let Some([r, g, b, _a]) = frame.rgba(x, y) else {
                    continue;
                };
                let (r, g, b) = (r as f64 / 255.0, g as f64 / 255.0, b as f64 / 255.0);
                let dominance = (b - (r + g) / 2.0).clamp(0.0, 1.0);
                let brightness = (r + g + b) / 3.0;
                sum += brightness * dominance;
                count += 1;
            }
        }

        if count == 0 {
            return Err(DetectionError::NoPixels);
        }
        Ok(sum / count as f64)
    }

    /// Debounce a proposed waiting state.
    ///
    /// Returns true only on the sample that actually flips the state.
    fn apply_hysteresis(&mut self, desired: bool) -> bool {
        if desired == self.waiting {
            self.agree_count = 0;
            return false;
        }
        self.agree_count += 1;
        if self.agree_count >= HYSTERESIS_SAMPLES {
            self.waiting = desired;
            self.agree_count = 0;
            debug!(waiting = self.waiting, "Waiting state flipped");
            return true;
        }
        false
    }

    /// Blend reading consistency with distance-from-baseline significance.
    fn confidence(&self, amplified: f64) -> f64 {
        let consistency = if self.readings.len() >= CONFIDENCE_WINDOW {
            let window: Vec<f64> = self
                .readings
                .iter()
                .rev()
                .take(CONFIDENCE_WINDOW)
                .copied()
                .collect();
            let mean = window.iter().sum::<f64>() / window.len() as f64;
            let variance =
                window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window.len() as f64;
            (1.0 - variance.sqrt() * CONFIDENCE_STD_SCALE).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let significance = (amplified - self.baseline).abs().clamp(0.0, 1.0);
        (CONFIDENCE_CONSISTENCY_WEIGHT * consistency
            + CONFIDENCE_SIGNIFICANCE_WEIGHT * significance)
            .clamp(0.0, 1.0)
    }
}
