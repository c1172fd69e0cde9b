// src/config.rs
//
// YAML configuration. Every section and field is optional; anything left out
// falls back to the defaults below. `validate()` is the only gate between a
// config file and a running session.

use crate::error::{CrashGuardError, Result as CgResult};
use crate::geo::{GeoPoint, Landmark};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub extraction: ExtractionConfig,
    pub detection: DetectionConfig,
    pub incident: IncidentConfig,
    pub dispatch: DispatchConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Synthetic,
    Replay,
    Camera,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Pacing for replayed and synthetic streams. 0 disables pacing.
    pub target_fps: u32,
    /// Frames buffered between capture and detection before dropping.
    pub queue_capacity: usize,
    pub replay_dir: String,
    pub camera_index: i32,
    /// Read from a video file instead of a camera index when set.
    pub video_path: Option<String>,
    pub synthetic: SyntheticConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Synthetic,
            target_fps: 30,
            queue_capacity: 8,
            replay_dir: "recordings".to_string(),
            camera_index: 0,
            video_path: None,
            synthetic: SyntheticConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub width: usize,
    pub height: usize,
    /// Stream length. `None` runs until the session stops.
    pub frames: Option<u64>,
    /// Inject a simulated collision starting at this frame.
    pub crash_at_frame: Option<u64>,
    pub crash_frames: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            frames: None,
            crash_at_frame: None,
            crash_frames: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// The frame is split into `grid × grid` blocks for localised motion.
    pub grid: usize,
    /// Weight of the busiest block relative to the global mean.
    pub peak_block_weight: f32,
    /// Standard gravity in m/s², subtracted from accelerometer magnitude.
    pub gravity: f32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            grid: 4,
            peak_block_weight: 0.5,
            gravity: 9.80665,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// t1: scores at or above are suspicious.
    pub suspicious_threshold: f32,
    /// t2: scores at or above are impacts.
    pub impact_threshold: f32,
    /// Trailing window length in frames.
    pub window_size: usize,
    /// K in "value > K × rolling median".
    pub spike_factor: f32,
    pub motion_floor: f32,
    pub motion_full_scale: f32,
    /// Multiplier for motion that does not spike above the window median.
    pub steady_motion_weight: f32,
    pub impact_full_scale_g: f32,
    /// Impact readings below this never count as spikes.
    pub min_spike_impact_g: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            suspicious_threshold: 0.3,
            impact_threshold: 0.7,
            window_size: 15, // ~0.5s @ 30fps
            spike_factor: 3.0,
            motion_floor: 0.02,
            motion_full_scale: 0.30,
            steady_motion_weight: 0.6,
            impact_full_scale_g: 4.0,
            min_spike_impact_g: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    /// N consecutive non-normal classifications required to leave Watching.
    pub debounce_count: u32,
    pub debounce_window_ms: u64,
    pub confirm_window_ms: u64,
    /// Accumulated score that confirms without an explicit impact label.
    pub confirm_severity: f32,
    pub ack_timeout_ms: u64,
    pub escalation_cap: u32,
    /// Quiet period after an acknowledged or expired incident.
    pub cooldown_ms: u64,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            debounce_count: 3,
            debounce_window_ms: 2_000,
            confirm_window_ms: 3_000,
            confirm_severity: 2.0,
            ack_timeout_ms: 60_000,
            escalation_cap: 3,
            cooldown_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub position: Option<GeoPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Priority order unless `order_by_distance` is set.
    pub endpoints: Vec<EndpointConfig>,
    pub attempt_timeout_ms: u64,
    pub max_attempts_per_endpoint: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub order_by_distance: bool,
    pub landmarks: Vec<Landmark>,
    pub attach_snapshot: bool,
    pub snapshot_quality: u8,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            attempt_timeout_ms: 10_000,
            max_attempts_per_endpoint: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            order_by_distance: false,
            landmarks: Vec::new(),
            attach_snapshot: true,
            snapshot_quality: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub driver_id: String,
    pub vehicle_id: String,
    pub location: Option<GeoPoint>,
    /// Upper bound on waiting for the capture thread at stop.
    pub join_timeout_ms: u64,
    /// State machine tick when no frame arrives.
    pub tick_interval_ms: u64,
    pub event_buffer: usize,
    pub archive_path: Option<String>,
    pub snapshot_dir: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            driver_id: "DRV-01".to_string(),
            vehicle_id: "Unit-01".to_string(),
            location: None,
            join_timeout_ms: 2_000,
            tick_interval_ms: 50,
            event_buffer: 64,
            archive_path: None,
            snapshot_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "crashguard=info".to_string(),
        }
    }
}

// ============================================================================
// LOADING & VALIDATION
// ============================================================================

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
        Self::from_yaml(&contents).with_context(|| format!("Failed to parse {}", path))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Rejects thresholds and policies the pipeline cannot run with.
    /// Endpoint presence is checked at session start, where programmatic
    /// endpoints are also known.
    pub fn validate(&self) -> CgResult<()> {
        let d = &self.detection;
        let t1 = d.suspicious_threshold;
        let t2 = d.impact_threshold;
        if !(t1.is_finite() && t2.is_finite()) || t1 <= 0.0 || t1 >= t2 || t2 > 1.0 {
            return Err(CrashGuardError::config(format!(
                "thresholds must satisfy 0 < t1 < t2 <= 1 (t1={}, t2={})",
                t1, t2
            )));
        }
        if d.window_size == 0 {
            return Err(CrashGuardError::config("detection.window_size must be >= 1"));
        }
        if !(d.spike_factor > 1.0) {
            return Err(CrashGuardError::config("detection.spike_factor must be > 1"));
        }
        if !(d.motion_floor >= 0.0 && d.motion_full_scale > d.motion_floor) {
            return Err(CrashGuardError::config(
                "detection.motion_full_scale must exceed motion_floor",
            ));
        }
        if !(d.impact_full_scale_g > 0.0) || !(0.0..=1.0).contains(&d.steady_motion_weight) {
            return Err(CrashGuardError::config(
                "detection impact scale must be positive and steady_motion_weight in [0, 1]",
            ));
        }

        let e = &self.extraction;
        if e.grid == 0 || !(e.gravity > 0.0) || !(0.0..=1.0).contains(&e.peak_block_weight) {
            return Err(CrashGuardError::config(
                "extraction.grid must be >= 1, gravity positive, peak_block_weight in [0, 1]",
            ));
        }

        let i = &self.incident;
        if i.debounce_count == 0 {
            return Err(CrashGuardError::config("incident.debounce_count must be >= 1"));
        }
        if i.debounce_window_ms == 0 || i.confirm_window_ms == 0 || i.ack_timeout_ms == 0 {
            return Err(CrashGuardError::config(
                "incident windows and ack_timeout_ms must be positive",
            ));
        }
        if !(i.confirm_severity > 0.0) {
            return Err(CrashGuardError::config("incident.confirm_severity must be positive"));
        }

        let p = &self.dispatch;
        if p.max_attempts_per_endpoint == 0 || p.attempt_timeout_ms == 0 {
            return Err(CrashGuardError::config(
                "dispatch.max_attempts_per_endpoint and attempt_timeout_ms must be positive",
            ));
        }
        if p.backoff_max_ms < p.backoff_base_ms {
            return Err(CrashGuardError::config(
                "dispatch.backoff_max_ms must be >= backoff_base_ms",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for endpoint in &p.endpoints {
            if endpoint.id.trim().is_empty() || !seen.insert(endpoint.id.as_str()) {
                return Err(CrashGuardError::config(format!(
                    "endpoint ids must be unique and non-empty ({:?})",
                    endpoint.id
                )));
            }
            if !(endpoint.url.starts_with("http://") || endpoint.url.starts_with("https://")) {
                return Err(CrashGuardError::config(format!(
                    "endpoint {} has a non-http url",
                    endpoint.id
                )));
            }
            if endpoint.position.map_or(false, |p| !p.is_valid()) {
                return Err(CrashGuardError::config(format!(
                    "endpoint {} has an invalid position",
                    endpoint.id
                )));
            }
        }

        let s = &self.source;
        if s.queue_capacity == 0 {
            return Err(CrashGuardError::config("source.queue_capacity must be >= 1"));
        }
        if s.kind == SourceKind::Synthetic && (s.synthetic.width == 0 || s.synthetic.height == 0)
        {
            return Err(CrashGuardError::config("synthetic frame size must be non-zero"));
        }

        let sess = &self.session;
        if sess.tick_interval_ms == 0 || sess.event_buffer == 0 {
            return Err(CrashGuardError::config(
                "session.tick_interval_ms and event_buffer must be positive",
            ));
        }
        if sess.location.map_or(false, |p| !p.is_valid()) {
            return Err(CrashGuardError::config("session.location is out of range"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.detection.window_size, 15);
        assert_eq!(config.incident.debounce_count, 3);
        assert_eq!(config.dispatch.max_attempts_per_endpoint, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let yaml = r#"
detection:
  suspicious_threshold: 0.25
incident:
  debounce_count: 5
dispatch:
  endpoints:
    - id: Unit-02
      url: http://10.0.0.2:5000/alert
      position: { latitude: 10.5167, longitude: 76.2167 }
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.detection.suspicious_threshold, 0.25);
        assert_eq!(config.detection.impact_threshold, 0.7);
        assert_eq!(config.incident.debounce_count, 5);
        assert_eq!(config.dispatch.endpoints.len(), 1);
        assert!(config.dispatch.endpoints[0].position.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut config = Config::default();
        config.detection.suspicious_threshold = 0.8;
        config.detection.impact_threshold = 0.7;
        assert!(matches!(
            config.validate(),
            Err(CrashGuardError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn duplicate_endpoint_ids_are_rejected() {
        let mut config = Config::default();
        let endpoint = EndpointConfig {
            id: "a".to_string(),
            url: "http://localhost/alert".to_string(),
            position: None,
        };
        config.dispatch.endpoints = vec![endpoint.clone(), endpoint];
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_debounce_is_rejected() {
        let mut config = Config::default();
        config.incident.debounce_count = 0;
        assert!(config.validate().is_err());
    }
}
