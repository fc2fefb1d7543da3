//! Map Presentation Adapter boundary.
//!
//! A [`MapSurface`] is whatever actually draws: a browser widget, a tile
//! renderer, or the in-memory [`GeoJsonSurface`] shipped here. [`MapSync`]
//! diffs successive [`FleetView`]s against what it last drew and issues the
//! minimal marker/polyline calls. All coordinates handed to a surface are in
//! the native frame (see [`fleetwatch_geo::device_to_native`]).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use fleetwatch_geo::{device_to_native, is_valid_coordinate};
use fleetwatch_types::{Coordinate, TrajectoryPoint, VehicleId, VehicleRecord, VehicleStatus};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::debug;

use crate::service::FleetView;

/// Drawing operations keyed by vehicle id.
pub trait MapSurface {
    fn upsert_marker(
        &mut self,
        id: VehicleId,
        position: Coordinate,
        status: VehicleStatus,
        label: &str,
    );
    fn remove_marker(&mut self, id: VehicleId);
    fn upsert_polyline(&mut self, id: VehicleId, path: &[Coordinate]);
    fn remove_polyline(&mut self, id: VehicleId);
}

/// Calls issued by one [`MapSync::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub markers_upserted: usize,
    pub markers_removed: usize,
    pub polylines_upserted: usize,
    pub polylines_removed: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct DrawnMarker {
    position: Coordinate,
    status: VehicleStatus,
    label: String,
}

fn native(latitude: f64, longitude: f64) -> Coordinate {
    let (lat, lng) = device_to_native(latitude, longitude);
    Coordinate::new(lat, lng)
}

fn marker_for(vehicle: &VehicleRecord) -> Option<DrawnMarker> {
    let fix = vehicle.position()?;
    if !is_valid_coordinate(fix.latitude, fix.longitude) {
        return None;
    }
    Some(DrawnMarker {
        position: native(fix.latitude, fix.longitude),
        status: vehicle.status,
        label: vehicle.code.clone(),
    })
}

fn path_for(points: &[TrajectoryPoint]) -> Vec<Coordinate> {
    points.iter().map(|p| native(p.latitude, p.longitude)).collect()
}

/// Remembers what has been drawn and reconciles it with new views.
#[derive(Debug, Default)]
pub struct MapSync {
    markers: HashMap<VehicleId, DrawnMarker>,
    polylines: HashMap<VehicleId, Vec<Coordinate>>,
    revision: Option<u64>,
}

impl MapSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revision of the last applied view.
    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    /// Reconcile `surface` with `view`.
    pub fn apply<S: MapSurface + ?Sized>(
        &mut self,
        view: &FleetView,
        surface: &mut S,
    ) -> SyncReport {
        let mut report = SyncReport::default();

        let wanted_markers: HashMap<VehicleId, DrawnMarker> = view
            .vehicles
            .iter()
            .filter_map(|v| marker_for(v).map(|m| (v.id, m)))
            .collect();

        self.markers.retain(|id, _| {
            let keep = wanted_markers.contains_key(id);
            if !keep {
                surface.remove_marker(*id);
                report.markers_removed += 1;
            }
            keep
        });
        for (id, marker) in wanted_markers {
            if self.markers.get(&id) != Some(&marker) {
                surface.upsert_marker(id, marker.position, marker.status, &marker.label);
                report.markers_upserted += 1;
                self.markers.insert(id, marker);
            }
        }

        self.polylines.retain(|id, _| {
            let keep = view.trajectories.contains_key(id);
            if !keep {
                surface.remove_polyline(*id);
                report.polylines_removed += 1;
            }
            keep
        });
        for (id, points) in &view.trajectories {
            let path = path_for(points);
            if self.polylines.get(id) != Some(&path) {
                surface.upsert_polyline(*id, &path);
                report.polylines_upserted += 1;
                self.polylines.insert(*id, path);
            }
        }

        self.revision = Some(view.revision);
        report
    }

    /// Apply every view published on `views` to `surface` until the sender
    /// goes away.
    pub async fn drive<S>(
        mut self,
        mut views: watch::Receiver<Arc<FleetView>>,
        surface: Arc<Mutex<S>>,
    ) where
        S: MapSurface + Send + 'static,
    {
        loop {
            let view = Arc::clone(&views.borrow_and_update());
            let report = {
                let mut surface = surface.lock().unwrap_or_else(PoisonError::into_inner);
                self.apply(&view, &mut *surface)
            };
            if !report.is_empty() {
                debug!(revision = view.revision, ?report, "map synchronised");
            }
            if views.changed().await.is_err() {
                break;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// GeoJSON surface
// ────────────────────────────────────────────────────────────────────────────

/// A marker as held by [`GeoJsonSurface`].
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub position: Coordinate,
    pub status: VehicleStatus,
    pub label: String,
}

/// In-memory surface that can be rendered as a GeoJSON `FeatureCollection`.
#[derive(Debug, Default, Clone)]
pub struct GeoJsonSurface {
    markers: BTreeMap<VehicleId, Marker>,
    polylines: BTreeMap<VehicleId, Vec<Coordinate>>,
}

impl GeoJsonSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn marker(&self, id: VehicleId) -> Option<&Marker> {
        self.markers.get(&id)
    }

    pub fn polyline(&self, id: VehicleId) -> Option<&[Coordinate]> {
        self.polylines.get(&id).map(Vec::as_slice)
    }

    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    pub fn polyline_count(&self) -> usize {
        self.polylines.len()
    }

    /// Markers as `Point` features followed by trails as `LineString`
    /// features. Positions are `[lng, lat]`.
    pub fn to_geojson(&self) -> Value {
        let points = self.markers.iter().map(|(id, m)| {
            json!({
                "type": "Feature",
                "geometry": {
                    "type": "Point",
                    "coordinates": [m.position.longitude, m.position.latitude],
                },
                "properties": {
                    "id": id,
                    "code": m.label,
                    "status": m.status.as_str(),
                },
            })
        });
        let lines = self.polylines.iter().map(|(id, path)| {
            let coordinates: Vec<[f64; 2]> =
                path.iter().map(|c| [c.longitude, c.latitude]).collect();
            json!({
                "type": "Feature",
                "geometry": {
                    "type": "LineString",
                    "coordinates": coordinates,
                },
                "properties": {
                    "id": id,
                    "kind": "trajectory",
                },
            })
        });
        json!({
            "type": "FeatureCollection",
            "features": points.chain(lines).collect::<Vec<_>>(),
        })
    }
}

impl MapSurface for GeoJsonSurface {
    fn upsert_marker(
        &mut self,
        id: VehicleId,
        position: Coordinate,
        status: VehicleStatus,
        label: &str,
    ) {
        self.markers.insert(
            id,
            Marker {
                position,
                status,
                label: label.to_string(),
            },
        );
    }

    fn remove_marker(&mut self, id: VehicleId) {
        self.markers.remove(&id);
    }

    fn upsert_polyline(&mut self, id: VehicleId, path: &[Coordinate]) {
        self.polylines.insert(id, path.to_vec());
    }

    fn remove_polyline(&mut self, id: VehicleId) {
        self.polylines.remove(&id);
    }
}
