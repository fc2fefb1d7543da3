//! `fleetwatch-geo` – Coordinate Transform Engine.
//!
//! Pure, stateless functions that move a coordinate between the three
//! reference frames the dashboard deals with, plus validity and distance
//! helpers. Nothing here allocates, logs or fails: non-finite input simply
//! propagates `NaN` through the math.
//!
//! # Frames
//!
//! | Frame | Produced by |
//! |---|---|
//! | Device | Onboard GPS hardware (WGS-84). |
//! | Intermediate | Regionally-offset national frame (GCJ-02). |
//! | Native | The map provider's own frame (BD-09). |
//!
//! # Modules
//!
//! - [`transform`] – forward and inverse frame conversions.
//! - [`distance`] – coordinate validity and great-circle distance.

pub mod distance;
pub mod transform;

pub use distance::{EARTH_RADIUS_METERS, haversine_distance_meters, is_valid_coordinate};
pub use transform::{
    device_to_native, in_correction_region, intermediate_to_device, native_to_device,
    native_to_intermediate, to_intermediate, to_native,
};
