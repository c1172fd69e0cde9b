// src/geo.rs
//
// Great-circle helpers for nearest-unit dispatch ordering and the
// human-readable address attached to alerts.

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Landmarks closer than this are used verbatim as the alert address.
const LANDMARK_RADIUS_KM: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Haversine distance in kilometres.
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let p1 = self.latitude.to_radians();
        let p2 = other.latitude.to_radians();
        let dp = (other.latitude - self.latitude).to_radians();
        let dl = (other.longitude - self.longitude).to_radians();

        let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
        EARTH_RADIUS_KM * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub name: String,
    pub position: GeoPoint,
}

/// "Near <landmark>" when a configured landmark is within 5 km, otherwise the
/// raw coordinates.
pub fn describe_location(point: &GeoPoint, landmarks: &[Landmark]) -> String {
    let nearest = landmarks
        .iter()
        .map(|l| (l, point.distance_km(&l.position)))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    match nearest {
        Some((landmark, dist)) if dist < LANDMARK_RADIUS_KM => format!("Near {}", landmark.name),
        _ => format!("{:.4}, {:.4}", point.latitude, point.longitude),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_matches_known_distance() {
        // Thrissur to Ernakulam, roughly 66 km as the crow flies.
        let thrissur = GeoPoint::new(10.5276, 76.2144);
        let ernakulam = GeoPoint::new(9.9312, 76.2673);
        let d = thrissur.distance_km(&ernakulam);
        assert!((d - 66.5).abs() < 2.0, "got {d}");
        assert!(thrissur.distance_km(&thrissur) < 1e-9);
    }

    #[test]
    fn address_uses_close_landmark_only() {
        let landmarks = vec![Landmark {
            name: "Medical College".to_string(),
            position: GeoPoint::new(10.5276, 76.2144),
        }];
        let near = GeoPoint::new(10.53, 76.22);
        assert_eq!(describe_location(&near, &landmarks), "Near Medical College");

        let far = GeoPoint::new(9.0, 76.0);
        assert_eq!(describe_location(&far, &landmarks), "9.0000, 76.0000");
        assert_eq!(describe_location(&far, &[]), "9.0000, 76.0000");
    }

    #[test]
    fn rejects_out_of_range_points() {
        assert!(GeoPoint::new(10.0, 76.0).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }
}
