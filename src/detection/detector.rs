// src/detection/detector.rs
//
// Windowed incident scorer.
//
// Two signals are combined:
//   - motion magnitude, mapped linearly from `motion_floor` to
//     `motion_full_scale`;
//   - a spike test: a value more than K× the rolling median of the trailing
//     window. A sudden deceleration shows up as an accelerometer spike; a
//     sudden visual jolt as a motion spike.
// Sustained (non-spiking) motion is down-weighted, so a camera panning across a
// busy street does not look like a collision.

use crate::config::DetectionConfig;
use crate::types::{Classification, FeatureVector};
use std::collections::VecDeque;

/// Pluggable per-frame scorer. The only state an implementation may carry
/// across calls is its own bounded window.
pub trait Detector: Send {
    fn classify(&mut self, features: &FeatureVector) -> Classification;

    /// Forget the window (e.g. after the source comes back from an outage).
    fn reset(&mut self);
}

pub struct WindowedDetector {
    config: DetectionConfig,
    window: VecDeque<FeatureVector>,
}

impl WindowedDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            config,
        }
    }

    /// Score of `features` against the current window, in [0, 1].
    pub fn score(&self, features: &FeatureVector) -> f32 {
        let c = &self.config;

        let motion = features.motion_magnitude;
        let motion_score =
            ((motion - c.motion_floor) / (c.motion_full_scale - c.motion_floor)).clamp(0.0, 1.0);
        let motion_median = median(self.window.iter().map(|f| f.motion_magnitude));
        let motion_component = if self.is_spike(motion, motion_median) {
            motion_score
        } else {
            motion_score * c.steady_motion_weight
        };

        let impact_component = match features.impact_magnitude {
            Some(g) => {
                let impact_score = (g / c.impact_full_scale_g).clamp(0.0, 1.0);
                let impact_median = median(self.window.iter().filter_map(|f| f.impact_magnitude));
                if g >= c.min_spike_impact_g && self.is_spike(g, impact_median) {
                    impact_score
                } else {
                    impact_score * 0.5
                }
            }
            None => 0.0,
        };

        motion_component.max(impact_component).clamp(0.0, 1.0)
    }

    /// With no baseline yet, a value is judged on its own.
    fn is_spike(&self, value: f32, median: Option<f32>) -> bool {
        match median {
            None => true,
            Some(m) => value > self.config.spike_factor * m,
        }
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}

impl Detector for WindowedDetector {
    fn classify(&mut self, features: &FeatureVector) -> Classification {
        let (t1, t2) = (
            self.config.suspicious_threshold,
            self.config.impact_threshold,
        );

        // Low-confidence frames are scored as quiet and kept out of the window.
        if features.low_confidence {
            return Classification::new(features.sequence, features.captured_at, 0.0, t1, t2);
        }

        let score = self.score(features);

        if self.window.len() >= self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(*features);

        Classification::new(features.sequence, features.captured_at, score, t1, t2)
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}

/// Median of the values (upper median for even counts), None when empty.
fn median(values: impl Iterator<Item = f32>) -> Option<f32> {
    let mut v: Vec<f32> = values.filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some(v[v.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Label;

    fn fv(sequence: u64, motion: f32, impact: Option<f32>) -> FeatureVector {
        FeatureVector {
            sequence,
            captured_at: sequence * 33_333,
            motion_magnitude: motion,
            impact_magnitude: impact,
            extraction_latency_us: 0,
            low_confidence: false,
        }
    }

    fn detector() -> WindowedDetector {
        WindowedDetector::new(DetectionConfig::default())
    }

    #[test]
    fn quiet_stream_is_normal() {
        let mut d = detector();
        for i in 0..30 {
            let c = d.classify(&fv(i, 0.01, Some(0.02)));
            assert_eq!(c.label, Label::Normal);
            assert_eq!(c.sequence, i);
        }
    }

    #[test]
    fn window_never_exceeds_configured_size() {
        let mut d = detector();
        for i in 0..100 {
            d.classify(&fv(i, 0.05, None));
        }
        assert_eq!(d.window_len(), 15);
    }

    #[test]
    fn deceleration_spike_is_impact() {
        let mut d = detector();
        for i in 0..15 {
            d.classify(&fv(i, 0.01, Some(0.05)));
        }
        let c = d.classify(&fv(15, 0.05, Some(4.5)));
        assert_eq!(c.label, Label::Impact);
        assert!(c.score >= 0.99);
    }

    #[test]
    fn sustained_high_impact_stops_spiking() {
        let mut d = detector();
        for i in 0..15 {
            d.classify(&fv(i, 0.0, Some(2.0)));
        }
        // 2 g against a 2 g median is not a spike: half weight only.
        let c = d.classify(&fv(15, 0.0, Some(2.0)));
        assert!((c.score - 0.25).abs() < 1e-6);
        assert_eq!(c.label, Label::Normal);
    }

    #[test]
    fn sudden_visual_jolt_scores_above_steady_motion() {
        let mut steady = detector();
        for i in 0..15 {
            steady.classify(&fv(i, 0.25, None));
        }
        let panning = steady.classify(&fv(15, 0.25, None));

        let mut calm = detector();
        for i in 0..15 {
            calm.classify(&fv(i, 0.01, None));
        }
        let jolt = calm.classify(&fv(15, 0.25, None));

        assert!(jolt.score > panning.score);
        assert_eq!(jolt.label, Label::Impact);
        assert_eq!(panning.label, Label::Suspicious);
    }

    #[test]
    fn low_confidence_frames_skip_the_window() {
        let mut d = detector();
        let mut bad = fv(1, 0.9, Some(9.0));
        bad.low_confidence = true;
        let c = d.classify(&bad);
        assert_eq!(c.label, Label::Normal);
        assert_eq!(c.score, 0.0);
        assert_eq!(d.window_len(), 0);
    }

    #[test]
    fn median_picks_middle_value() {
        assert_eq!(median([3.0, 1.0, 2.0].into_iter()), Some(2.0));
        assert_eq!(median(std::iter::empty()), None);
    }
}
