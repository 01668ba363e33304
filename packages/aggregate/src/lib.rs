#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cast_precision_loss)]

//! Aggregates point-of-interest density into raw indicator values.
//!
//! For each POI category that feeds an indicator, counts active POIs
//! within the category's catchment radius of every area centroid and
//! writes the per-1000-residents density as that area's raw value. The
//! result then flows through the normal normalization and scoring path
//! like any ingested indicator.

use std::collections::BTreeMap;

use kvarter_config::EngineConfig;
use kvarter_database::queries::{self, RawValueUpsert};
use kvarter_database::DbError;
use kvarter_models::{DesoArea, PoiCategory};
use kvarter_spatial::{AreaIndex, PointIndex};
use switchy_database::Database;

/// Errors raised during POI aggregation.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// Database error.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Per-category result summary.
#[derive(Debug, Clone)]
pub struct CategoryAggregation {
    pub category_slug: String,
    pub indicator_slug: String,
    pub point_count: usize,
    pub areas_processed: usize,
    pub rows_written: u64,
}

/// Density value for an area: POI count per 1000 residents. Areas with a
/// missing or zero population have no meaningful density, so they get
/// `None` and stay out of normalization instead of ranking as zero.
#[must_use]
pub fn density_value(count: usize, population: Option<i64>) -> Option<f64> {
    match population {
        Some(pop) if pop > 0 => Some(count as f64 / pop as f64 * 1000.0),
        _ => None,
    }
}

/// Whether a category's point set is large enough to warrant chunked area
/// processing with intermediate flushes.
#[must_use]
pub const fn is_batched(point_count: usize, config: &EngineConfig) -> bool {
    point_count >= config.aggregation.batched_point_threshold
}

/// Aggregates one category into its indicator for a year.
///
/// Upserts are keyed on `(deso_code, indicator_id, year)`, so re-running
/// replaces previous densities instead of accumulating.
///
/// # Errors
///
/// Returns [`AggregateError`] if any database operation fails.
pub async fn aggregate_category(
    db: &dyn Database,
    config: &EngineConfig,
    category: &PoiCategory,
    areas: &[DesoArea],
    area_index: &AreaIndex,
    year: i32,
) -> Result<Option<CategoryAggregation>, AggregateError> {
    let Some(indicator_slug) = category.indicator_slug.as_deref() else {
        return Ok(None);
    };

    let Some(indicator) = queries::get_indicator_by_slug(db, indicator_slug).await? else {
        log::warn!(
            "POI category {} maps to unknown indicator {indicator_slug}, skipping",
            category.slug
        );
        return Ok(None);
    };

    // Transit has its own authoritative table; everything else is OSM POIs.
    let index = if category.slug == "transit" {
        let stops = queries::get_transit_stops(db).await?;
        PointIndex::build(stops.into_iter().map(|s| (s.lat, s.lng, s.id)))
    } else {
        let pois = queries::get_active_pois(db, Some(&category.slug)).await?;
        PointIndex::build(pois.into_iter().map(|p| (p.lat, p.lng, p.id)))
    };
    let point_count = index.len();

    let radius_m = category.catchment_km * 1000.0;
    let batched = is_batched(point_count, config);
    let chunk_size = if batched {
        config.aggregation.area_batch_size
    } else {
        areas.len().max(1)
    };

    log::info!(
        "Aggregating {point_count} {} POIs into {indicator_slug} ({} mode)",
        category.slug,
        if batched { "batched" } else { "single-pass" }
    );

    let mut buffer: Vec<RawValueUpsert> = Vec::new();
    let mut rows_written = 0u64;
    let mut areas_processed = 0usize;

    for chunk in areas.chunks(chunk_size) {
        for area in chunk {
            let Some((lat, lng)) = area_index.centroid(&area.deso_code) else {
                continue;
            };

            let count = index.count_within(lat, lng, radius_m);
            buffer.push(RawValueUpsert {
                deso_code: area.deso_code.clone(),
                indicator_id: indicator.id,
                year,
                raw_value: density_value(count, area.population),
            });
            areas_processed += 1;

            if buffer.len() >= config.aggregation.flush_rows {
                rows_written += queries::upsert_raw_values(db, &buffer).await?;
                buffer.clear();
            }
        }
    }

    if !buffer.is_empty() {
        rows_written += queries::upsert_raw_values(db, &buffer).await?;
    }

    Ok(Some(CategoryAggregation {
        category_slug: category.slug.clone(),
        indicator_slug: indicator_slug.to_string(),
        point_count,
        areas_processed,
        rows_written,
    }))
}

/// Aggregates every active POI category that feeds an indicator.
///
/// # Errors
///
/// Returns [`AggregateError`] if any database operation fails.
pub async fn aggregate_all(
    db: &dyn Database,
    config: &EngineConfig,
    year: i32,
) -> Result<Vec<CategoryAggregation>, AggregateError> {
    let areas = queries::get_areas(db).await?;
    let boundaries = queries::get_area_boundaries(db).await?;
    let area_index = AreaIndex::build(&boundaries);

    let categories = queries::get_poi_categories(db).await?;
    let mut results = Vec::new();

    for category in &categories {
        if let Some(summary) =
            aggregate_category(db, config, category, &areas, &area_index, year).await?
        {
            log::info!(
                "Wrote {} density rows for {} -> {}",
                summary.rows_written,
                summary.category_slug,
                summary.indicator_slug
            );
            results.push(summary);
        }
    }

    Ok(results)
}

/// Attribution map from POI id to containing area, for diagnostics.
#[must_use]
pub fn attribute_points(
    area_index: &AreaIndex,
    points: &[(i64, f64, f64)],
) -> BTreeMap<i64, String> {
    let mut map = BTreeMap::new();
    for (id, lat, lng) in points {
        if let Some(code) = area_index.lookup_area(*lat, *lng) {
            map.insert(*id, code.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_scales_per_thousand_residents() {
        let v = density_value(5, Some(2500)).unwrap();
        assert!((v - 2.0).abs() < 1e-12);
    }

    #[test]
    fn density_is_null_without_population() {
        assert!(density_value(7, None).is_none());
        assert!(density_value(7, Some(0)).is_none());
    }

    #[test]
    fn batched_mode_threshold() {
        let config = EngineConfig::load().unwrap();
        assert!(!is_batched(9_999, &config));
        assert!(is_batched(10_000, &config));
    }

    #[test]
    fn attribution_maps_contained_points() {
        let square = r#"{
            "type": "Polygon",
            "coordinates": [[
                [18.05, 59.30], [18.06, 59.30], [18.06, 59.31],
                [18.05, 59.31], [18.05, 59.30]
            ]]
        }"#;
        let index = AreaIndex::build(&[("0180C1010".to_string(), square.to_string())]);

        let map = attribute_points(&index, &[(1, 59.305, 18.055), (2, 0.0, 0.0)]);
        assert_eq!(map.get(&1).map(String::as_str), Some("0180C1010"));
        assert!(!map.contains_key(&2));
    }
}
