//! Frame conversions between device, intermediate and native coordinates.
//!
//! Every function takes and returns `(latitude, longitude)` in degrees.
//!
//! The forward chain is [`device_to_native`] = [`to_native`] ∘
//! [`to_intermediate`]. The inverse chain [`native_to_device`] is
//! approximate: the intermediate → device step is a single-shot estimate
//! (no iteration), so a round trip lands within a few metres of the input but
//! does not recover it exactly.
//!
//! # Example
//!
//! ```rust
//! use fleetwatch_geo::transform::{device_to_native, native_to_device};
//!
//! let (lat, lng) = device_to_native(30.307645, 120.389866);
//! assert!((lat - 30.3216).abs() < 1e-3);
//!
//! let (back_lat, back_lng) = native_to_device(lat, lng);
//! assert!((back_lat - 30.307645).abs() < 1e-4);
//! assert!((back_lng - 120.389866).abs() < 1e-4);
//! ```
//!
//! The arithmetic below is order-sensitive. Results are relied on to be
//! bit-identical across runs, so do not reassociate or fold the constants.

use std::f64::consts::PI;

/// Semi-major axis of the Krasovsky 1940 ellipsoid, metres.
const SEMI_MAJOR_AXIS: f64 = 6378245.0;

/// First eccentricity squared of the same ellipsoid.
#[allow(clippy::excessive_precision)]
const ECCENTRICITY_SQ: f64 = 0.00669342162296594323;

/// Angular scale used by the native-frame polar correction.
const X_PI: f64 = PI * 3000.0 / 180.0;

/// Fixed translation applied after the native polar correction.
const NATIVE_LAT_OFFSET: f64 = 0.006;
const NATIVE_LNG_OFFSET: f64 = 0.0065;

/// Bounding region inside which the intermediate-frame offset applies.
const REGION_MIN_LNG: f64 = 72.004;
const REGION_MAX_LNG: f64 = 137.8347;
const REGION_MIN_LAT: f64 = 0.8293;
const REGION_MAX_LAT: f64 = 55.8271;

/// `true` when the intermediate-frame offset applies to this point.
pub fn in_correction_region(lat: f64, lng: f64) -> bool {
    !(lng < REGION_MIN_LNG || lng > REGION_MAX_LNG || lat < REGION_MIN_LAT || lat > REGION_MAX_LAT)
}

fn latitude_distortion(lat: f64, lng: f64) -> f64 {
    let mut ret = -100.0 + 2.0 * lng + 3.0 * lat + 0.2 * lat * lat + 0.1 * lng * lat
        + 0.2 * lng.abs().sqrt();
    ret += (20.0 * (6.0 * lng * PI).sin() + 20.0 * (2.0 * lng * PI).sin()) * 2.0 / 3.0;
    ret += (20.0 * (lat * PI).sin() + 40.0 * (lat / 3.0 * PI).sin()) * 2.0 / 3.0;
    ret += (160.0 * (lat / 12.0 * PI).sin() + 320.0 * (lat * PI / 30.0).sin()) * 2.0 / 3.0;
    ret
}

fn longitude_distortion(lat: f64, lng: f64) -> f64 {
    let mut ret = 300.0 + lng + 2.0 * lat + 0.1 * lng * lng + 0.1 * lng * lat
        + 0.1 * lng.abs().sqrt();
    ret += (20.0 * (6.0 * lng * PI).sin() + 20.0 * (2.0 * lng * PI).sin()) * 2.0 / 3.0;
    ret += (20.0 * (lng * PI).sin() + 40.0 * (lng / 3.0 * PI).sin()) * 2.0 / 3.0;
    ret += (150.0 * (lng / 12.0 * PI).sin() + 300.0 * (lng / 30.0 * PI).sin()) * 2.0 / 3.0;
    ret
}

/// Device frame → intermediate frame.
///
/// Identity outside [`in_correction_region`]; inside it the polynomial
/// distortion is scaled by the ellipsoid's radii of curvature at `lat`.
pub fn to_intermediate(lat: f64, lng: f64) -> (f64, f64) {
    if !in_correction_region(lat, lng) {
        return (lat, lng);
    }

    let mut d_lat = latitude_distortion(lat, lng);
    let mut d_lng = longitude_distortion(lat, lng);
    let rad_lat = lat / 180.0 * PI;
    let mut magic = rad_lat.sin();
    magic = 1.0 - ECCENTRICITY_SQ * magic * magic;
    let sqrt_magic = magic.sqrt();

    d_lat = (d_lat * 180.0)
        / (((SEMI_MAJOR_AXIS * (1.0 - ECCENTRICITY_SQ)) / (magic * sqrt_magic)) * PI);
    d_lng = (d_lng * 180.0) / ((SEMI_MAJOR_AXIS / sqrt_magic) * rad_lat.cos() * PI);

    (lat + d_lat, lng + d_lng)
}

/// Intermediate frame → native frame.
pub fn to_native(lat: f64, lng: f64) -> (f64, f64) {
    let z = (lng * lng + lat * lat).sqrt() + 0.00002 * (lat * X_PI).sin();
    let theta = lat.atan2(lng) + 0.000003 * (lng * X_PI).cos();
    let native_lng = z * theta.cos() + NATIVE_LNG_OFFSET;
    let native_lat = z * theta.sin() + NATIVE_LAT_OFFSET;
    (native_lat, native_lng)
}

/// Device frame → native frame.
pub fn device_to_native(lat: f64, lng: f64) -> (f64, f64) {
    let (lat, lng) = to_intermediate(lat, lng);
    to_native(lat, lng)
}

/// Native frame → intermediate frame (inverse polar correction).
pub fn native_to_intermediate(lat: f64, lng: f64) -> (f64, f64) {
    let x = lng - NATIVE_LNG_OFFSET;
    let y = lat - NATIVE_LAT_OFFSET;
    let z = (x * x + y * y).sqrt() - 0.00002 * (y * X_PI).sin();
    let theta = y.atan2(x) - 0.000003 * (x * X_PI).cos();
    (z * theta.sin(), z * theta.cos())
}

/// Intermediate frame → device frame, approximately.
///
/// Applies the forward offset at the intermediate point and reflects it,
/// which is accurate to the local gradient of the distortion model.
pub fn intermediate_to_device(lat: f64, lng: f64) -> (f64, f64) {
    if !in_correction_region(lat, lng) {
        return (lat, lng);
    }
    let (shifted_lat, shifted_lng) = to_intermediate(lat, lng);
    (lat * 2.0 - shifted_lat, lng * 2.0 - shifted_lng)
}

/// Native frame → device frame (approximate, see [`intermediate_to_device`]).
pub fn native_to_device(lat: f64, lng: f64) -> (f64, f64) {
    let (lat, lng) = native_to_intermediate(lat, lng);
    intermediate_to_device(lat, lng)
}
