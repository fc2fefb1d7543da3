//! Coordinate validity and great-circle distance.

use std::f64::consts::PI;

/// Mean Earth radius used by [`haversine_distance_meters`].
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// `true` when both values are finite and inside the geographic ranges
/// (`lat` in [-90, 90], `lng` in [-180, 180]).
pub fn is_valid_coordinate(lat: f64, lng: f64) -> bool {
    lat.is_finite()
        && lng.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lng)
}

/// Great-circle distance between two points, in metres.
///
/// # Example
///
/// ```
/// use fleetwatch_geo::distance::haversine_distance_meters;
///
/// // One degree of latitude is roughly 111 km.
/// let d = haversine_distance_meters(0.0, 0.0, 1.0, 0.0);
/// assert!((d - 111_195.0).abs() < 1.0);
/// ```
pub fn haversine_distance_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1) * PI / 180.0;
    let d_lng = (lng2 - lng1) * PI / 180.0;
    let a = (d_lat / 2.0).sin() * (d_lat / 2.0).sin()
        + (lat1 * PI / 180.0).cos()
            * (lat2 * PI / 180.0).cos()
            * (d_lng / 2.0).sin()
            * (d_lng / 2.0).sin();
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The poles and the antimeridian are valid; one step past them is not.
    #[test]
    fn validity_boundaries() {
        assert!(!is_valid_coordinate(91.0, 0.0));
        assert!(!is_valid_coordinate(45.0, 200.0));
        assert!(is_valid_coordinate(45.0, 90.0));
        assert!(is_valid_coordinate(-90.0, -180.0));
        assert!(is_valid_coordinate(90.0, 180.0));
    }

    /// NaN and infinities are never valid coordinates.
    #[test]
    fn validity_rejects_non_finite() {
        assert!(!is_valid_coordinate(f64::NAN, 0.0));
        assert!(!is_valid_coordinate(0.0, f64::INFINITY));
        assert!(!is_valid_coordinate(f64::NEG_INFINITY, f64::NAN));
    }

    #[test]
    fn distance_to_self_is_zero() {
        for (lat, lng) in [(30.0, 120.0), (-45.5, 170.25), (89.9, -179.9), (0.0, 0.0)] {
            assert_eq!(haversine_distance_meters(lat, lng, lat, lng), 0.0);
        }
    }

    /// Distance does not depend on argument order.
    #[test]
    fn distance_is_symmetric() {
        let pairs = [
            ((30.0, 120.0), (30.0001, 120.0001)),
            ((51.5, -0.12), (48.8566, 2.3522)),
            ((-33.87, 151.21), (35.68, 139.69)),
        ];
        for ((a_lat, a_lng), (b_lat, b_lng)) in pairs {
            let ab = haversine_distance_meters(a_lat, a_lng, b_lat, b_lng);
            let ba = haversine_distance_meters(b_lat, b_lng, a_lat, a_lng);
            assert_eq!(ab, ba);
        }
    }

    /// A 0.001° hop along a meridian is about 111 m.
    #[test]
    fn short_hop_distance() {
        let d = haversine_distance_meters(30.0, 120.0, 30.0001, 120.0001);
        assert!((d - 14.7097).abs() < 1e-3, "got {d}");
    }

    /// NaN input gives NaN output instead of a panic.
    #[test]
    fn nan_distance_does_not_panic() {
        assert!(haversine_distance_meters(f64::NAN, 0.0, 0.0, 0.0).is_nan());
    }
}
