//! Geographic points.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Parse `{lat, lon}`, `{latitude, longitude}` or `[lat, lon]`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => {
                let lat = map.get("lat").or_else(|| map.get("latitude"))?.as_f64()?;
                let lon = map
                    .get("lon")
                    .or_else(|| map.get("lng"))
                    .or_else(|| map.get("longitude"))?
                    .as_f64()?;
                Some(Self::new(lat, lon))
            }
            Value::Array(items) if items.len() >= 2 => {
                Some(Self::new(items[0].as_f64()?, items[1].as_f64()?))
            }
            _ => None,
        }
    }

    /// Euclidean distance in raw coordinate space.
    pub fn planar_distance(&self, other: &GeoPoint) -> f64 {
        ((self.lat - other.lat).powi(2) + (self.lon - other.lon).powi(2)).sqrt()
    }

    /// Great-circle distance in meters.
    pub fn haversine_m(&self, other: &GeoPoint) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }

    /// Arithmetic centroid; `None` for an empty slice.
    pub fn centroid(points: &[GeoPoint]) -> Option<GeoPoint> {
        if points.is_empty() {
            return None;
        }
        let n = points.len() as f64;
        let (lat, lon) = points
            .iter()
            .fold((0.0, 0.0), |(lat, lon), p| (lat + p.lat, lon + p.lon));
        Some(GeoPoint::new(lat / n, lon / n))
    }
}
