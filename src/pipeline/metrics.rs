// src/pipeline/metrics.rs
//
// Session counters. Shared by the capture thread, the detection worker and
// the dispatch tasks; read into a `MetricsSummary` for every snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub frames_captured: Arc<AtomicU64>,
    pub frames_dropped: Arc<AtomicU64>,
    pub frames_processed: Arc<AtomicU64>,
    pub low_confidence_frames: Arc<AtomicU64>,
    pub incidents_opened: Arc<AtomicU64>,
    pub incidents_confirmed: Arc<AtomicU64>,
    pub incidents_cancelled: Arc<AtomicU64>,
    pub incidents_acknowledged: Arc<AtomicU64>,
    pub incidents_expired: Arc<AtomicU64>,
    pub dispatch_attempts: Arc<AtomicU64>,
    pub dispatch_failures: Arc<AtomicU64>,
    pub extraction_time_us: Arc<AtomicU64>,
    pub detection_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames_captured: Arc::new(AtomicU64::new(0)),
            frames_dropped: Arc::new(AtomicU64::new(0)),
            frames_processed: Arc::new(AtomicU64::new(0)),
            low_confidence_frames: Arc::new(AtomicU64::new(0)),
            incidents_opened: Arc::new(AtomicU64::new(0)),
            incidents_confirmed: Arc::new(AtomicU64::new(0)),
            incidents_cancelled: Arc::new(AtomicU64::new(0)),
            incidents_acknowledged: Arc::new(AtomicU64::new(0)),
            incidents_expired: Arc::new(AtomicU64::new(0)),
            dispatch_attempts: Arc::new(AtomicU64::new(0)),
            dispatch_failures: Arc::new(AtomicU64::new(0)),
            extraction_time_us: Arc::new(AtomicU64::new(0)),
            detection_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    /// Processing rate over the whole session.
    pub fn fps(&self) -> f64 {
        let frames = self.frames_processed.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            low_confidence_frames: self.low_confidence_frames.load(Ordering::Relaxed),
            fps: self.fps(),
            incidents_opened: self.incidents_opened.load(Ordering::Relaxed),
            incidents_confirmed: self.incidents_confirmed.load(Ordering::Relaxed),
            incidents_cancelled: self.incidents_cancelled.load(Ordering::Relaxed),
            incidents_acknowledged: self.incidents_acknowledged.load(Ordering::Relaxed),
            incidents_expired: self.incidents_expired.load(Ordering::Relaxed),
            dispatch_attempts: self.dispatch_attempts.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            last_extraction_us: self.extraction_time_us.load(Ordering::Relaxed),
            last_detection_us: self.detection_time_us.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct MetricsSummary {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub low_confidence_frames: u64,
    pub fps: f64,
    pub incidents_opened: u64,
    pub incidents_confirmed: u64,
    pub incidents_cancelled: u64,
    pub incidents_acknowledged: u64,
    pub incidents_expired: u64,
    pub dispatch_attempts: u64,
    pub dispatch_failures: u64,
    pub last_extraction_us: u64,
    pub last_detection_us: u64,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = PipelineMetrics::new();
        let capture_side = metrics.clone();
        capture_side.inc(&capture_side.frames_captured);
        capture_side.inc(&capture_side.frames_dropped);
        metrics.inc(&metrics.frames_captured);

        let s = metrics.summary();
        assert_eq!(s.frames_captured, 2);
        assert_eq!(s.frames_dropped, 1);
        assert_eq!(s.frames_processed, 0);
    }
}
