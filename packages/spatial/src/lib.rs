#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! In-memory spatial indexes for area attribution and catchment queries.
//!
//! Builds R-tree indexes over DeSO boundary polygons and point features
//! (POIs, transit stops). Used by the aggregation job to attribute points
//! to areas and by the proximity scorer for nearest-feature and
//! count-within-radius queries.

use geo::{Centroid, Contains, MultiPolygon};
use geojson::GeoJson;
use rstar::{AABB, RTree, RTreeObject};

/// Mean meters per degree of latitude.
const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// Earth radius in meters, for haversine.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two WGS84 coordinates.
#[must_use]
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Bounding box in degrees for a radius (meters) around a point.
///
/// Longitude degrees shrink with latitude; the box is padded accordingly so
/// it always covers the true circle at Swedish latitudes.
fn radius_envelope(lat: f64, lng: f64, radius_m: f64) -> AABB<[f64; 2]> {
    let d_lat = radius_m / METERS_PER_DEGREE_LAT;
    let cos_lat = lat.to_radians().cos().max(0.01);
    let d_lng = radius_m / (METERS_PER_DEGREE_LAT * cos_lat);
    AABB::from_corners([lng - d_lng, lat - d_lat], [lng + d_lng, lat + d_lat])
}

/// A boundary polygon stored in the R-tree with its area code.
struct BoundaryEntry {
    deso_code: String,
    envelope: AABB<[f64; 2]>,
    polygon: MultiPolygon<f64>,
    centroid: Option<(f64, f64)>,
}

impl RTreeObject for BoundaryEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// R-tree index over DeSO boundary polygons.
///
/// Constructed once per run and shared across all consumers.
pub struct AreaIndex {
    areas: RTree<BoundaryEntry>,
    count: usize,
}

impl AreaIndex {
    /// Builds the index from `(deso_code, boundary_geojson)` pairs.
    ///
    /// Unparseable geometries are skipped with a warning rather than
    /// failing the whole build; missing areas simply receive no points.
    #[must_use]
    pub fn build(boundaries: &[(String, String)]) -> Self {
        let mut entries = Vec::with_capacity(boundaries.len());

        for (deso_code, geojson_str) in boundaries {
            let Some(multi_polygon) = parse_geojson_to_multipolygon(geojson_str) else {
                log::warn!("Failed to parse GeoJSON for area {deso_code}");
                continue;
            };

            let envelope = compute_envelope(&multi_polygon);
            let centroid = multi_polygon.centroid().map(|c| (c.y(), c.x()));

            entries.push(BoundaryEntry {
                deso_code: deso_code.clone(),
                envelope,
                polygon: multi_polygon,
                centroid,
            });
        }

        let count = entries.len();
        log::info!("Loaded {count} area boundaries into spatial index");

        Self {
            areas: RTree::bulk_load(entries),
            count,
        }
    }

    /// Number of indexed areas.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Looks up the DeSO code containing a point.
    ///
    /// DeSO areas tile the country without overlap, so first match wins.
    #[must_use]
    pub fn lookup_area(&self, lat: f64, lng: f64) -> Option<&str> {
        let point = geo::Point::new(lng, lat);
        let query_env = AABB::from_point([lng, lat]);

        for entry in self.areas.locate_in_envelope_intersecting(&query_env) {
            if entry.polygon.contains(&point) {
                return Some(&entry.deso_code);
            }
        }
        None
    }

    /// Centroid of an area as `(lat, lng)`, used as the catchment origin
    /// for proximity scoring.
    #[must_use]
    pub fn centroid(&self, deso_code: &str) -> Option<(f64, f64)> {
        self.areas
            .iter()
            .find(|entry| entry.deso_code == deso_code)
            .and_then(|entry| entry.centroid)
    }
}

/// A point feature with an attached payload.
struct PointEntry<T> {
    lat: f64,
    lng: f64,
    value: T,
}

impl<T> RTreeObject for PointEntry<T> {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lng, self.lat])
    }
}

/// R-tree index over point features (POIs, transit stops).
pub struct PointIndex<T> {
    points: RTree<PointEntry<T>>,
    count: usize,
}

impl<T> PointIndex<T> {
    /// Builds the index from `(lat, lng, payload)` triples.
    ///
    /// Coordinates outside valid WGS84 ranges are dropped.
    pub fn build(points: impl IntoIterator<Item = (f64, f64, T)>) -> Self {
        let entries: Vec<PointEntry<T>> = points
            .into_iter()
            .filter(|(lat, lng, _)| (-90.0..=90.0).contains(lat) && (-180.0..=180.0).contains(lng))
            .map(|(lat, lng, value)| PointEntry { lat, lng, value })
            .collect();

        let count = entries.len();
        Self {
            points: RTree::bulk_load(entries),
            count,
        }
    }

    /// Number of indexed points.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Counts points within `radius_m` meters of `(lat, lng)`.
    #[must_use]
    pub fn count_within(&self, lat: f64, lng: f64, radius_m: f64) -> usize {
        let query_env = radius_envelope(lat, lng, radius_m);
        self.points
            .locate_in_envelope_intersecting(&query_env)
            .filter(|entry| haversine_m(lat, lng, entry.lat, entry.lng) <= radius_m)
            .count()
    }

    /// All points within `radius_m` meters, as `(distance_m, payload)`,
    /// sorted nearest first.
    #[must_use]
    pub fn within(&self, lat: f64, lng: f64, radius_m: f64) -> Vec<(f64, &T)> {
        let query_env = radius_envelope(lat, lng, radius_m);
        let mut hits: Vec<(f64, &T)> = self
            .points
            .locate_in_envelope_intersecting(&query_env)
            .filter_map(|entry| {
                let distance = haversine_m(lat, lng, entry.lat, entry.lng);
                (distance <= radius_m).then_some((distance, &entry.value))
            })
            .collect();

        hits.sort_by(|a, b| a.0.total_cmp(&b.0));
        hits
    }

    /// The nearest point within `radius_m` meters, if any.
    #[must_use]
    pub fn nearest_within(&self, lat: f64, lng: f64, radius_m: f64) -> Option<(f64, &T)> {
        let query_env = radius_envelope(lat, lng, radius_m);
        self.points
            .locate_in_envelope_intersecting(&query_env)
            .map(|entry| (haversine_m(lat, lng, entry.lat, entry.lng), &entry.value))
            .filter(|(distance, _)| *distance <= radius_m)
            .min_by(|a, b| a.0.total_cmp(&b.0))
    }
}

/// Parse a `GeoJSON` string into a [`MultiPolygon`].
/// Handles both `Polygon` and `MultiPolygon` geometry types.
fn parse_geojson_to_multipolygon(geojson_str: &str) -> Option<MultiPolygon<f64>> {
    let geojson: GeoJson = geojson_str.parse().ok()?;
    if let GeoJson::Geometry(geom) = geojson {
        let geo_geom: geo::Geometry<f64> = geom.try_into().ok()?;
        match geo_geom {
            geo::Geometry::MultiPolygon(mp) => Some(mp),
            geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
            _ => None,
        }
    } else {
        None
    }
}

/// Compute the bounding box envelope for a [`MultiPolygon`].
fn compute_envelope(mp: &MultiPolygon<f64>) -> AABB<[f64; 2]> {
    use geo::BoundingRect;

    mp.bounding_rect().map_or_else(
        || AABB::from_point([0.0, 0.0]),
        |rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // Unit square near Stockholm, roughly 59.30-59.31N 18.05-18.06E.
    const SQUARE_GEOJSON: &str = r#"{
        "type": "Polygon",
        "coordinates": [[
            [18.05, 59.30], [18.06, 59.30], [18.06, 59.31],
            [18.05, 59.31], [18.05, 59.30]
        ]]
    }"#;

    #[test]
    fn haversine_one_degree_at_equator() {
        let d = haversine_m(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_195.0).abs() < 100.0, "got {d}");
    }

    #[test]
    fn haversine_zero_distance() {
        assert!(haversine_m(59.3, 18.05, 59.3, 18.05).abs() < f64::EPSILON);
    }

    #[test]
    fn point_in_area_lookup() {
        let index = AreaIndex::build(&[(
            "0180C1010".to_string(),
            SQUARE_GEOJSON.to_string(),
        )]);

        assert_eq!(index.lookup_area(59.305, 18.055), Some("0180C1010"));
        assert_eq!(index.lookup_area(59.5, 18.055), None);
    }

    #[test]
    fn unparseable_geometry_is_skipped() {
        let index = AreaIndex::build(&[
            ("0180C1010".to_string(), SQUARE_GEOJSON.to_string()),
            ("0180C1011".to_string(), "not geojson".to_string()),
        ]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn area_centroid_is_inside_square() {
        let index = AreaIndex::build(&[(
            "0180C1010".to_string(),
            SQUARE_GEOJSON.to_string(),
        )]);
        let (lat, lng) = index.centroid("0180C1010").unwrap();
        assert!((lat - 59.305).abs() < 1e-6);
        assert!((lng - 18.055).abs() < 1e-6);
    }

    #[test]
    fn count_within_respects_radius() {
        let index = PointIndex::build(vec![
            (59.305, 18.055, "near"),
            (59.306, 18.055, "near"),
            (59.400, 18.055, "far"),
        ]);

        // ~111m per 0.001 deg lat; 500m catches the two near points only.
        assert_eq!(index.count_within(59.305, 18.055, 500.0), 2);
        assert_eq!(index.count_within(59.305, 18.055, 50_000.0), 3);
    }

    #[test]
    fn nearest_within_picks_closest() {
        let index = PointIndex::build(vec![
            (59.305, 18.055, "a"),
            (59.310, 18.055, "b"),
        ]);

        let (distance, value) = index.nearest_within(59.304, 18.055, 5_000.0).unwrap();
        assert_eq!(*value, "a");
        assert!(distance < 200.0);

        assert!(index.nearest_within(59.304, 18.055, 10.0).is_none());
    }

    #[test]
    fn within_sorted_nearest_first() {
        let index = PointIndex::build(vec![
            (59.310, 18.055, "b"),
            (59.305, 18.055, "a"),
        ]);

        let hits = index.within(59.304, 18.055, 5_000.0);
        assert_eq!(hits.len(), 2);
        assert_eq!(*hits[0].1, "a");
        assert!(hits[0].0 < hits[1].0);
    }

    #[test]
    fn invalid_coordinates_dropped() {
        let index = PointIndex::build(vec![
            (59.305, 18.055, "ok"),
            (95.0, 18.055, "bad lat"),
            (59.305, 200.0, "bad lng"),
        ]);
        assert_eq!(index.len(), 1);
    }
}
