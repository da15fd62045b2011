//! Location records as they arrive from the stream and live in the cache.
//!
//! A record is keyed by its vehicle id only. Coordinates may be missing or
//! garbage for a while (GPS warm-up, tunnels, bad firmware emitting `(0,0)`),
//! so every consumer goes through [`is_valid_coordinate`] before trusting them.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coordinates closer than this (in degrees) to `(0,0)` are sentinel bad data.
pub const ZERO_EPSILON_DEG: f64 = 1e-6;

/// A geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Same predicate as [`is_valid_coordinate`].
    pub fn is_valid(&self) -> bool {
        is_valid_coordinate(Some(self.lat), Some(self.lng))
    }

    /// Planar distance in degrees.
    pub fn distance_deg(&self, other: &LatLng) -> f64 {
        (other.lat - self.lat).hypot(other.lng - self.lng)
    }

    /// Linear interpolation; `t = 0` is `self`, `t = 1` is `other`.
    pub fn lerp(&self, other: &LatLng, t: f64) -> LatLng {
        LatLng {
            lat: self.lat + (other.lat - self.lat) * t,
            lng: self.lng + (other.lng - self.lng) * t,
        }
    }
}

/// Returns true iff both coordinates are present, finite and not `(0,0)`.
pub fn is_valid_coordinate(lat: Option<f64>, lng: Option<f64>) -> bool {
    match (lat, lng) {
        (Some(lat), Some(lng)) => {
            lat.is_finite()
                && lng.is_finite()
                && !(lat.abs() < ZERO_EPSILON_DEG && lng.abs() < ZERO_EPSILON_DEG)
        }
        _ => false,
    }
}

/// Last-known location of one vehicle.
///
/// Only `vehicle_id`, the coordinates, `last_updated` and the velocity
/// components are interpreted; the descriptive fields are carried through
/// untouched for the UI.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    pub vehicle_id: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,

    #[serde(default)]
    pub license_plate_number: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub vehicle_type_name: Option<String>,
    #[serde(default)]
    pub vehicle_assignment_id: Option<String>,
    #[serde(default)]
    pub tracking_code: Option<String>,
    #[serde(default)]
    pub order_detail_status: Option<String>,
    #[serde(default)]
    pub driver1_name: Option<String>,
    #[serde(default)]
    pub driver1_phone: Option<String>,
    #[serde(default)]
    pub driver2_name: Option<String>,
    #[serde(default)]
    pub driver2_phone: Option<String>,

    /// ISO-8601, with or without offset
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub bearing: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    /// Degrees of latitude per second
    #[serde(default)]
    pub velocity_lat: Option<f64>,
    /// Degrees of longitude per second
    #[serde(default)]
    pub velocity_lng: Option<f64>,
}

impl LocationRecord {
    /// Creates an empty record for a vehicle.
    pub fn new(vehicle_id: impl Into<String>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            ..Default::default()
        }
    }

    /// Builder: sets the coordinates.
    pub fn at(mut self, lat: f64, lng: f64) -> Self {
        self.latitude = Some(lat);
        self.longitude = Some(lng);
        self
    }

    /// Builder: sets `lastUpdated`.
    pub fn updated_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.last_updated = Some(timestamp.to_rfc3339());
        self
    }

    /// Builder: sets the velocity hint.
    pub fn moving(mut self, velocity_lat: f64, velocity_lng: f64) -> Self {
        self.velocity_lat = Some(velocity_lat);
        self.velocity_lng = Some(velocity_lng);
        self
    }

    pub fn is_valid(&self) -> bool {
        is_valid_coordinate(self.latitude, self.longitude)
    }

    /// Returns the position if it passes the validity predicate.
    pub fn position(&self) -> Option<LatLng> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) if self.is_valid() => Some(LatLng { lat, lng }),
            _ => None,
        }
    }

    /// Parsed `lastUpdated`; `None` when absent or unparseable.
    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated.as_deref().and_then(parse_timestamp)
    }

    /// Speed hint in degrees/second, if the record carries a usable one.
    ///
    /// A missing component counts as zero; a non-finite one discards the hint.
    pub fn velocity_magnitude(&self) -> Option<f64> {
        if self.velocity_lat.is_none() && self.velocity_lng.is_none() {
            return None;
        }
        let v_lat = self.velocity_lat.unwrap_or(0.0);
        let v_lng = self.velocity_lng.unwrap_or(0.0);
        let magnitude = v_lat.hypot(v_lng);
        magnitude.is_finite().then_some(magnitude)
    }
}

/// Parses RFC 3339, falling back to an offset-less local date-time read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Inbound payload could not be decoded.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed location payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Many(Vec<LocationRecord>),
    One(LocationRecord),
}

/// Decodes a stream frame: either one record object or an array of them.
///
/// Records with a blank `vehicleId` carry no identity and are skipped.
pub fn parse_batch(payload: &[u8]) -> Result<Vec<LocationRecord>, ParseError> {
    let records = match serde_json::from_slice::<Payload>(payload)? {
        Payload::Many(records) => records,
        Payload::One(record) => vec![record],
    };

    let total = records.len();
    let records: Vec<LocationRecord> = records
        .into_iter()
        .filter(|r| !r.vehicle_id.trim().is_empty())
        .collect();
    if records.len() < total {
        tracing::debug!(skipped = total - records.len(), "Dropped records without vehicleId");
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_validity_predicate() {
        assert!(is_valid_coordinate(Some(10.0), Some(106.0)));
        assert!(is_valid_coordinate(Some(0.0), Some(106.0)));
        assert!(!is_valid_coordinate(None, Some(106.0)));
        assert!(!is_valid_coordinate(Some(10.0), None));
        assert!(!is_valid_coordinate(Some(f64::NAN), Some(106.0)));
        assert!(!is_valid_coordinate(Some(10.0), Some(f64::INFINITY)));
        assert!(!is_valid_coordinate(Some(0.0), Some(0.0)));
        assert!(!is_valid_coordinate(Some(5e-7), Some(-5e-7)));
        assert!(is_valid_coordinate(Some(2e-6), Some(0.0)));
    }

    #[test]
    fn test_parse_full_record() {
        let json = r#"{
            "vehicleId": "v1",
            "latitude": 10.762622,
            "longitude": 106.660172,
            "licensePlateNumber": "51C-123.45",
            "manufacturer": "Hino",
            "vehicleTypeName": "Truck 5T",
            "vehicleAssignmentId": "va-7",
            "trackingCode": "TRK-1",
            "orderDetailStatus": "IN_TRANSIT",
            "driver1Name": "An",
            "driver1Phone": "0900000000",
            "driver2Name": null,
            "driver2Phone": null,
            "lastUpdated": "2024-05-01T10:00:00Z",
            "bearing": 90.0,
            "speed": 42.5,
            "velocityLat": 0.0001,
            "velocityLng": null,
            "somethingNew": true
        }"#;

        let batch = parse_batch(json.as_bytes()).unwrap();
        assert_eq!(batch.len(), 1);
        let record = &batch[0];
        assert_eq!(record.vehicle_id, "v1");
        assert_eq!(record.license_plate_number.as_deref(), Some("51C-123.45"));
        assert_eq!(record.driver1_name.as_deref(), Some("An"));
        assert!(record.driver2_name.is_none());
        assert!(record.is_valid());
        assert_relative_eq!(record.velocity_magnitude().unwrap(), 0.0001);
    }

    #[test]
    fn test_parse_array_and_skip_blank_ids() {
        let json = r#"[
            {"vehicleId": "a", "latitude": 1.0, "longitude": 2.0},
            {"vehicleId": "  ", "latitude": 1.0, "longitude": 2.0},
            {"vehicleId": "b", "latitude": null, "longitude": null}
        ]"#;
        let batch = parse_batch(json.as_bytes()).unwrap();
        let ids: Vec<_> = batch.iter().map(|r| r.vehicle_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!batch[1].is_valid());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_batch(b"not json").is_err());
        assert!(parse_batch(b"42").is_err());
        assert!(parse_batch(br#"{"latitude": 1.0}"#).is_err());
    }

    #[test]
    fn test_timestamp_formats() {
        let with_offset = parse_timestamp("2024-05-01T17:00:00+07:00").unwrap();
        let utc = parse_timestamp("2024-05-01T10:00:00Z").unwrap();
        let local = parse_timestamp("2024-05-01T10:00:00.123").unwrap();
        assert_eq!(with_offset, utc);
        assert_eq!((local - utc).num_milliseconds(), 123);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_lerp_endpoints() {
        let a = LatLng::new(10.0, 106.0);
        let b = LatLng::new(10.5, 106.5);
        assert_eq!(a.lerp(&b, 0.0), a);
        assert_eq!(a.lerp(&b, 1.0), b);
        assert_relative_eq!(a.lerp(&b, 0.5).lat, 10.25);
    }
}
