// src/types.rs
//
// Entities that flow through the pipeline. Frames are produced by the frame
// source and consumed by value; everything downstream is derived and small.

use crate::clock::Micros;
use crate::geo::GeoPoint;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTIFIERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-session incident number. Strictly increasing, starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncidentId(pub u64);

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "INC-{:04}", self.0)
    }
}

pub type EndpointId = String;

// ============================================================================
// FRAMES
// ============================================================================

/// Packed RGB8 image, row-major, 3 bytes per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameImage {
    pub width: usize,
    pub height: usize,
    pub rgb: Vec<u8>,
}

impl FrameImage {
    pub fn new(width: usize, height: usize, rgb: Vec<u8>) -> Self {
        Self { width, height, rgb }
    }

    /// Uniform grey image, mostly for synthetic sources.
    pub fn filled(width: usize, height: usize, level: u8) -> Self {
        Self::new(width, height, vec![level; width * height * 3])
    }

    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.rgb.len() == self.width * self.height * 3
    }
}

/// Accelerometer (m/s²) and optional gyroscope (rad/s) reading taken with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InertialSample {
    pub accel: [f32; 3],
    pub gyro: Option<[f32; 3]>,
}

impl InertialSample {
    pub fn new(accel: [f32; 3]) -> Self {
        Self { accel, gyro: None }
    }

    pub fn accel_magnitude(&self) -> f32 {
        self.accel.iter().map(|a| a * a).sum::<f32>().sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.accel.iter().all(|a| a.is_finite())
            && self
                .gyro
                .map_or(true, |g| g.iter().all(|v| v.is_finite()))
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic, unique per session.
    pub sequence: u64,
    /// Capture time on the session clock. Non-decreasing.
    pub captured_at: Micros,
    pub image: FrameImage,
    pub inertial: Option<InertialSample>,
}

// ============================================================================
// FEATURES & CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureVector {
    pub sequence: u64,
    pub captured_at: Micros,
    /// Normalised inter-frame luma change in [0, 1].
    pub motion_magnitude: f32,
    /// Deviation from 1 g, in g. Present only when the frame carried an inertial sample.
    pub impact_magnitude: Option<f32>,
    pub extraction_latency_us: u64,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Normal,
    Suspicious,
    Impact,
}

impl Label {
    /// `score < t1` normal, `t1 <= score < t2` suspicious, `score >= t2` impact.
    pub fn from_score(score: f32, t1: f32, t2: f32) -> Self {
        if score >= t2 {
            Label::Impact
        } else if score >= t1 {
            Label::Suspicious
        } else {
            Label::Normal
        }
    }

    pub fn is_alerting(&self) -> bool {
        !matches!(self, Label::Normal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Normal => "normal",
            Label::Suspicious => "suspicious",
            Label::Impact => "impact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub sequence: u64,
    pub captured_at: Micros,
    pub score: f32,
    pub label: Label,
}

impl Classification {
    pub fn new(sequence: u64, captured_at: Micros, score: f32, t1: f32, t2: f32) -> Self {
        let score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            sequence,
            captured_at,
            score,
            label: Label::from_score(score, t1, t2),
        }
    }
}

// ============================================================================
// INCIDENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Pending,
    Confirmed,
    Dispatched,
    Acknowledged,
    Expired,
    Cancelled,
}

impl IncidentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IncidentStatus::Acknowledged | IncidentStatus::Expired | IncidentStatus::Cancelled
        )
    }

    /// Forward-only lifecycle: pending → confirmed → dispatched → acknowledged,
    /// with cancelled only before confirmation and expired only after it.
    pub fn can_advance_to(&self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Dispatched)
                | (Confirmed, Expired)
                | (Dispatched, Acknowledged)
                | (Dispatched, Expired)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Pending => "pending",
            IncidentStatus::Confirmed => "confirmed",
            IncidentStatus::Dispatched => "dispatched",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Expired => "expired",
            IncidentStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub opening_sequence: u64,
    pub confirming_sequence: Option<u64>,
    /// Peak classification score seen while the incident was open.
    pub severity: f32,
    pub status: IncidentStatus,
    pub opened_at: Micros,
    pub confirmed_at: Option<Micros>,
    pub closed_at: Option<Micros>,
    pub location: Option<GeoPoint>,
    pub acknowledged_by: Option<EndpointId>,
    pub escalations: u32,
}

impl Incident {
    pub fn open(id: IncidentId, opening: &Classification) -> Self {
        Self {
            id,
            opening_sequence: opening.sequence,
            confirming_sequence: None,
            severity: opening.score,
            status: IncidentStatus::Pending,
            opened_at: opening.captured_at,
            confirmed_at: None,
            closed_at: None,
            location: None,
            acknowledged_by: None,
            escalations: 0,
        }
    }

    /// Applies a forward transition. Returns false (and changes nothing) for
    /// anything the lifecycle does not allow.
    pub fn advance(&mut self, next: IncidentStatus, at: Micros) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        if next == IncidentStatus::Confirmed {
            self.confirmed_at = Some(at);
        }
        if next.is_terminal() {
            self.closed_at = Some(at);
        }
        true
    }
}

// ============================================================================
// DISPATCH LOG
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Acked,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub incident_id: IncidentId,
    pub endpoint_id: EndpointId,
    /// 1-based, monotonic per incident across all endpoints.
    pub attempt: u32,
    pub sent_at: Micros,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_is_threshold_function_of_score() {
        assert_eq!(Label::from_score(0.29, 0.3, 0.7), Label::Normal);
        assert_eq!(Label::from_score(0.3, 0.3, 0.7), Label::Suspicious);
        assert_eq!(Label::from_score(0.69, 0.3, 0.7), Label::Suspicious);
        assert_eq!(Label::from_score(0.7, 0.3, 0.7), Label::Impact);
    }

    #[test]
    fn classification_clamps_bad_scores() {
        let c = Classification::new(1, 0, f32::NAN, 0.3, 0.7);
        assert_eq!(c.score, 0.0);
        assert_eq!(c.label, Label::Normal);
        let c = Classification::new(1, 0, 3.0, 0.3, 0.7);
        assert_eq!(c.score, 1.0);
        assert_eq!(c.label, Label::Impact);
    }

    #[test]
    fn incident_never_moves_backwards() {
        let opening = Classification::new(4, 100, 0.5, 0.3, 0.7);
        let mut incident = Incident::open(IncidentId(1), &opening);

        assert!(!incident.advance(IncidentStatus::Dispatched, 200));
        assert!(incident.advance(IncidentStatus::Confirmed, 200));
        assert!(!incident.advance(IncidentStatus::Cancelled, 250));
        assert!(!incident.advance(IncidentStatus::Pending, 250));
        assert!(incident.advance(IncidentStatus::Dispatched, 300));
        assert!(incident.advance(IncidentStatus::Acknowledged, 400));
        assert!(!incident.advance(IncidentStatus::Expired, 500));

        assert_eq!(incident.confirmed_at, Some(200));
        assert_eq!(incident.closed_at, Some(400));
        assert!(incident.status.is_terminal());
    }

    #[test]
    fn malformed_image_is_detected() {
        assert!(FrameImage::filled(4, 2, 10).is_well_formed());
        assert!(!FrameImage::new(4, 2, vec![0; 5]).is_well_formed());
        assert!(!FrameImage::new(0, 2, vec![]).is_well_formed());
    }
}
