// src/dispatch/alert.rs
//
// Wire format of an emergency alert and of the optional receipt an endpoint
// returns for it.

use crate::clock::Micros;
use crate::geo::{describe_location, GeoPoint, Landmark};
use crate::snapshot::Snapshot;
use crate::types::{Incident, IncidentId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchAlert {
    pub alert_id: String,
    pub session_id: SessionId,
    pub incident_id: IncidentId,
    pub driver_id: String,
    pub vehicle_id: String,
    pub severity: f32,
    pub location: Option<GeoPoint>,
    /// "Near <landmark>", raw coordinates, or "unknown location".
    pub address: String,
    pub timestamp: DateTime<Utc>,
    pub confirmed_at_us: Micros,
    /// Set per delivery; 1-based across the whole incident.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_jpeg_base64: Option<String>,
}

/// Who the alert is about.
#[derive(Debug, Clone)]
pub struct AlertOrigin {
    pub session_id: SessionId,
    pub driver_id: String,
    pub vehicle_id: String,
}

impl DispatchAlert {
    pub fn for_incident(
        origin: &AlertOrigin,
        incident: &Incident,
        landmarks: &[Landmark],
        snapshot: Option<&Snapshot>,
    ) -> Self {
        let address = match &incident.location {
            Some(point) => describe_location(point, landmarks),
            None => "unknown location".to_string(),
        };

        Self {
            alert_id: uuid::Uuid::new_v4().to_string(),
            session_id: origin.session_id.clone(),
            incident_id: incident.id,
            driver_id: origin.driver_id.clone(),
            vehicle_id: origin.vehicle_id.clone(),
            severity: incident.severity,
            location: incident.location,
            address,
            timestamp: Utc::now(),
            confirmed_at_us: incident.confirmed_at.unwrap_or(incident.opened_at),
            attempt: 0,
            snapshot_jpeg_base64: snapshot.map(Snapshot::to_base64),
        }
    }
}

/// Body an endpoint may return with a 2xx. Anything else counts as
/// "delivered, not yet acknowledged".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl DeliveryReceipt {
    pub fn delivered() -> Self {
        Self::default()
    }

    pub fn acknowledged() -> Self {
        Self {
            acknowledged: true,
            message: None,
        }
    }

    /// Lenient parse of a response body.
    pub fn from_body(body: &str) -> Self {
        if body.trim().is_empty() {
            return Self::delivered();
        }
        serde_json::from_str(body).unwrap_or_default()
    }
}
