//! Great-circle distance on a spherical earth

use crate::domain::types::LatLng;

/// Mean earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two coordinates in meters
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlng = (lng2 - lng1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlng / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

#[inline]
pub fn distance_m(a: LatLng, b: LatLng) -> f64 {
    haversine_m(a.lat, a.lng, b.lat, b.lng)
}

/// Point displaced from `origin` by the given north/east offsets in meters
///
/// Exact along a meridian, a local approximation otherwise. Used to script
/// walks in tests and the simulator.
pub fn offset_m(origin: LatLng, north_m: f64, east_m: f64) -> LatLng {
    let dlat = (north_m / EARTH_RADIUS_M).to_degrees();
    let dlng = (east_m / (EARTH_RADIUS_M * origin.lat.to_radians().cos())).to_degrees();
    LatLng::new(origin.lat + dlat, origin.lng + dlng)
}
