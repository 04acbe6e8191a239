//! # point
//!
//! Geographic point: wire encoding and ground distance.

/// Scale applied to degrees before packing into a signed 32-bit field.
const POINT_SCALE: f64 = 1.0e7;

/// Mean earth radius in meters, for ground distance between fixes.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// A point is valid when it is non-origin and within range. A receiver
    /// without a fix reports 0.0/0.0.
    pub fn is_valid(&self) -> bool {
        (self.latitude != 0.0 || self.longitude != 0.0)
            && self.latitude.abs() <= 90.0
            && self.longitude.abs() <= 180.0
    }

    /// 8-byte wire form: big-endian lat then lon, degrees x 10^7.
    pub fn encode(&self) -> [u8; 8] {
        let lat = (self.latitude * POINT_SCALE) as i32;
        let lon = (self.longitude * POINT_SCALE) as i32;
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&lat.to_be_bytes());
        out[4..].copy_from_slice(&lon.to_be_bytes());
        out
    }

    pub fn decode(raw: &[u8; 8]) -> Self {
        let lat = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let lon = i32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        Self {
            latitude: lat as f64 / POINT_SCALE,
            longitude: lon as f64 / POINT_SCALE,
        }
    }

    /// Great-circle distance to another point, in meters.
    pub fn meters_to(&self, other: &GpsPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}
