// src/signal.rs
//
// Frame → FeatureVector reduction.
//
// Motion is the mean absolute BT.601 luma difference between consecutive
// frames, normalised to [0, 1]. A collision seen by a dash camera rarely moves
// the whole picture evenly, so the busiest block of a coarse grid is weighed in
// as well. Impact comes from the accelerometer: deviation of |a| from 1 g.
//
// A bad frame never stops the stream. It yields motion 0 with the
// low-confidence flag set, and the detector leaves it out of its window.

use crate::config::ExtractionConfig;
use crate::error::CrashGuardError;
use crate::types::{FeatureVector, Frame, FrameImage};
use std::time::Instant;
use tracing::debug;

pub struct SignalExtractor {
    config: ExtractionConfig,
}

impl SignalExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    /// Deterministic for a given config: the same pair of frames always gives
    /// the same magnitudes (only `extraction_latency_us` varies).
    pub fn extract(&self, frame: &Frame, previous: Option<&Frame>) -> FeatureVector {
        let started = Instant::now();

        let mut low_confidence = false;
        let motion_magnitude = match check_pair(frame, previous) {
            Ok(Some(prev)) => self.motion_between(&prev.image, &frame.image),
            Ok(None) => 0.0,
            Err(e) => {
                debug!("{}", e);
                low_confidence = true;
                0.0
            }
        };

        let impact_magnitude = match frame.inertial {
            Some(sample) if sample.is_finite() => {
                Some((sample.accel_magnitude() / self.config.gravity - 1.0).abs())
            }
            Some(_) => {
                debug!(
                    "{}",
                    CrashGuardError::ExtractionDegraded {
                        sequence: frame.sequence,
                        reason: "non-finite inertial sample".to_string(),
                    }
                );
                low_confidence = true;
                None
            }
            None => None,
        };

        FeatureVector {
            sequence: frame.sequence,
            captured_at: frame.captured_at,
            motion_magnitude: if low_confidence { 0.0 } else { motion_magnitude },
            impact_magnitude,
            extraction_latency_us: started.elapsed().as_micros() as u64,
            low_confidence,
        }
    }

    fn motion_between(&self, prev: &FrameImage, curr: &FrameImage) -> f32 {
        let (w, h) = (curr.width, curr.height);
        let grid = self.config.grid.min(w).min(h).max(1);
        let block_w = w / grid;
        let block_h = h / grid;

        let mut block_sums = vec![0u64; grid * grid];
        let mut block_counts = vec![0u64; grid * grid];
        let mut total: u64 = 0;

        for y in 0..h {
            let by = (y / block_h).min(grid - 1);
            for x in 0..w {
                let bx = (x / block_w).min(grid - 1);
                let idx = (y * w + x) * 3;
                let a = luma(&prev.rgb[idx..idx + 3]);
                let b = luma(&curr.rgb[idx..idx + 3]);
                let diff = (a as i32 - b as i32).unsigned_abs() as u64;
                total += diff;
                block_sums[by * grid + bx] += diff;
                block_counts[by * grid + bx] += 1;
            }
        }

        let global = total as f32 / (w * h) as f32 / 255.0;
        let peak_block = block_sums
            .iter()
            .zip(&block_counts)
            .filter(|(_, n)| **n > 0)
            .map(|(&s, &n)| s as f32 / n as f32 / 255.0)
            .fold(0.0f32, f32::max);

        global.max(peak_block * self.config.peak_block_weight).clamp(0.0, 1.0)
    }
}

/// ITU-R BT.601 luma.
#[inline]
fn luma(px: &[u8]) -> u8 {
    (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32) as u8
}

/// The previous frame is usable only if both buffers are intact and the
/// resolution did not change.
fn check_pair<'a>(
    frame: &Frame,
    previous: Option<&'a Frame>,
) -> Result<Option<&'a Frame>, CrashGuardError> {
    let degraded = |reason: &str| CrashGuardError::ExtractionDegraded {
        sequence: frame.sequence,
        reason: reason.to_string(),
    };

    if !frame.image.is_well_formed() {
        return Err(degraded("malformed image buffer"));
    }
    match previous {
        None => Ok(None),
        Some(prev) if !prev.image.is_well_formed() => Ok(None),
        Some(prev)
            if prev.image.width != frame.image.width || prev.image.height != frame.image.height =>
        {
            Err(degraded("resolution changed between frames"))
        }
        Some(prev) => Ok(Some(prev)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InertialSample;

    fn frame(sequence: u64, image: FrameImage) -> Frame {
        Frame {
            sequence,
            captured_at: sequence * 33_000,
            image,
            inertial: None,
        }
    }

    fn extractor() -> SignalExtractor {
        SignalExtractor::new(ExtractionConfig::default())
    }

    #[test]
    fn identical_frames_have_no_motion() {
        let a = frame(1, FrameImage::filled(16, 16, 90));
        let b = frame(2, FrameImage::filled(16, 16, 90));
        let fv = extractor().extract(&b, Some(&a));
        assert_eq!(fv.motion_magnitude, 0.0);
        assert!(!fv.low_confidence);
        assert_eq!(fv.sequence, 2);
    }

    #[test]
    fn full_frame_change_is_large_motion() {
        let a = frame(1, FrameImage::filled(16, 16, 0));
        let b = frame(2, FrameImage::filled(16, 16, 255));
        let fv = extractor().extract(&b, Some(&a));
        assert!(fv.motion_magnitude > 0.95, "got {}", fv.motion_magnitude);
    }

    #[test]
    fn localised_change_counts_through_peak_block() {
        let a = frame(1, FrameImage::filled(16, 16, 0));
        let mut image = FrameImage::filled(16, 16, 0);
        // Light up the top-left 4x4 block only.
        for y in 0..4 {
            for x in 0..4 {
                let idx = (y * 16 + x) * 3;
                image.rgb[idx..idx + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        let b = frame(2, image);
        let fv = extractor().extract(&b, Some(&a));
        let global = 16.0 / 256.0;
        assert!(fv.motion_magnitude > global * 2.0, "got {}", fv.motion_magnitude);
    }

    #[test]
    fn first_frame_is_quiet_but_confident() {
        let fv = extractor().extract(&frame(1, FrameImage::filled(8, 8, 10)), None);
        assert_eq!(fv.motion_magnitude, 0.0);
        assert!(!fv.low_confidence);
    }

    #[test]
    fn corrupt_frame_is_low_confidence_not_an_error() {
        let a = frame(1, FrameImage::filled(8, 8, 10));
        let b = frame(2, FrameImage::new(8, 8, vec![1, 2, 3]));
        let fv = extractor().extract(&b, Some(&a));
        assert!(fv.low_confidence);
        assert_eq!(fv.motion_magnitude, 0.0);

        let resized = frame(3, FrameImage::filled(4, 4, 200));
        assert!(extractor().extract(&resized, Some(&a)).low_confidence);
    }

    #[test]
    fn impact_is_deviation_from_one_g() {
        let mut f = frame(1, FrameImage::filled(4, 4, 0));
        f.inertial = Some(InertialSample::new([0.0, 0.0, 9.80665]));
        let fv = extractor().extract(&f, None);
        assert!(fv.impact_magnitude.unwrap() < 1e-4);

        f.inertial = Some(InertialSample::new([0.0, -39.2266, 9.80665]));
        let fv = extractor().extract(&f, None);
        assert!((fv.impact_magnitude.unwrap() - 3.123).abs() < 0.01);

        f.inertial = Some(InertialSample::new([f32::NAN, 0.0, 0.0]));
        let fv = extractor().extract(&f, None);
        assert!(fv.low_confidence);
        assert_eq!(fv.impact_magnitude, None);
    }
}
