//! Database query functions for the scoring engine.
//!
//! Spatial data (area boundaries, POI coordinates) is fetched as plain rows
//! and indexed in-process by `kvarter_spatial`; all other access is raw
//! parameterised SQL through `query_raw_params()` / `exec_raw_params()`.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kvarter_models::{
    AreaCrosswalk, CompositeScore, DesoArea, Indicator, IndicatorTrend, MethodologyChange,
    Poi, PoiCategory, ScorePenalty, ScoreVersion, SentinelArea, TenantWeight, TransitMode,
    TransitStop, ValidationRule, VersionStatus, VulnerabilityMapping,
};
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue};

use crate::DbError;

fn parse_enum<T: FromStr>(raw: &str, what: &str) -> Result<T, DbError> {
    raw.parse::<T>().map_err(|_| DbError::Conversion {
        message: format!("Unrecognized {what}: {raw}"),
    })
}

fn opt_f64(value: Option<f64>) -> DatabaseValue {
    value.map_or(DatabaseValue::Null, DatabaseValue::Real64)
}

fn opt_string(value: Option<&str>) -> DatabaseValue {
    value.map_or(DatabaseValue::Null, |s| {
        DatabaseValue::String(s.to_string())
    })
}

fn utc_from_naive(naive: chrono::NaiveDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)
}

// ─── Areas ───────────────────────────────────────────────────────────────

/// Fetches every DeSO area with its population and urbanity tier.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_areas(db: &dyn Database) -> Result<Vec<DesoArea>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT deso_code, name, municipality, population, urbanity_tier, area_km2
             FROM deso_areas
             ORDER BY deso_code",
            &[],
        )
        .await?;

    let mut areas = Vec::with_capacity(rows.len());
    for row in &rows {
        let tier: String = row.to_value("urbanity_tier").unwrap_or_default();
        areas.push(DesoArea {
            deso_code: row.to_value("deso_code").unwrap_or_default(),
            name: row.to_value("name").unwrap_or(None),
            municipality: row.to_value("municipality").unwrap_or(None),
            population: row.to_value("population").unwrap_or(None),
            urbanity_tier: parse_enum(&tier, "urbanity tier")?,
            area_km2: row.to_value("area_km2").unwrap_or(None),
        });
    }

    Ok(areas)
}

/// Counts all DeSO areas (the denominator for completeness checks).
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn count_areas(db: &dyn Database) -> Result<i64, DbError> {
    let rows = db
        .query_raw_params("SELECT COUNT(*) AS cnt FROM deso_areas", &[])
        .await?;
    let row = rows.first().ok_or_else(|| DbError::Conversion {
        message: "Failed to count areas".to_string(),
    })?;
    Ok(row.to_value("cnt").unwrap_or(0))
}

/// Fetches area boundary polygons as `GeoJSON` strings for spatial indexing.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_area_boundaries(
    db: &dyn Database,
) -> Result<Vec<(String, String)>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT deso_code, boundary_geojson
             FROM deso_areas
             WHERE boundary_geojson IS NOT NULL",
            &[],
        )
        .await?;

    let mut boundaries = Vec::with_capacity(rows.len());
    for row in &rows {
        let code: String = row.to_value("deso_code").unwrap_or_default();
        let geojson: String = row.to_value("boundary_geojson").unwrap_or_default();
        if !code.is_empty() && !geojson.is_empty() {
            boundaries.push((code, geojson));
        }
    }

    Ok(boundaries)
}

/// Fetches the boundary-revision crosswalk (old code, new code, overlap).
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_area_crosswalk(db: &dyn Database) -> Result<Vec<AreaCrosswalk>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT old_code, new_code, overlap_fraction FROM deso_crosswalk",
            &[],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| AreaCrosswalk {
            old_code: row.to_value("old_code").unwrap_or_default(),
            new_code: row.to_value("new_code").unwrap_or_default(),
            overlap_fraction: row.to_value("overlap_fraction").unwrap_or(0.0),
        })
        .collect())
}

// ─── Indicators ──────────────────────────────────────────────────────────

fn indicator_from_row(row: &switchy_database::Row) -> Result<Indicator, DbError> {
    let category: String = row.to_value("category").unwrap_or_default();
    let direction: String = row.to_value("direction").unwrap_or_default();
    let normalization: String = row.to_value("normalization").unwrap_or_default();
    let scope: String = row.to_value("normalization_scope").unwrap_or_default();

    Ok(Indicator {
        id: row.to_value("id").unwrap_or(0),
        slug: row.to_value("slug").unwrap_or_default(),
        name: row.to_value("name").unwrap_or_default(),
        source: row.to_value("source").unwrap_or_default(),
        category: parse_enum(&category, "indicator category")?,
        direction: parse_enum(&direction, "direction")?,
        weight: row.to_value("weight").unwrap_or(0.0),
        normalization: parse_enum(&normalization, "normalization method")?,
        normalization_scope: parse_enum(&scope, "normalization scope")?,
        is_active: row.to_value("is_active").unwrap_or(false),
    })
}

/// Fetches all active indicators.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_active_indicators(db: &dyn Database) -> Result<Vec<Indicator>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT id, slug, name, source, category, direction, weight,
                    normalization, normalization_scope, is_active
             FROM indicators
             WHERE is_active = true
             ORDER BY slug",
            &[],
        )
        .await?;

    rows.iter().map(indicator_from_row).collect()
}

/// Fetches the active indicators belonging to one source.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_indicators_for_source(
    db: &dyn Database,
    source: &str,
) -> Result<Vec<Indicator>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT id, slug, name, source, category, direction, weight,
                    normalization, normalization_scope, is_active
             FROM indicators
             WHERE is_active = true AND source = $1
             ORDER BY slug",
            &[DatabaseValue::String(source.to_string())],
        )
        .await?;

    rows.iter().map(indicator_from_row).collect()
}

/// Looks up one indicator by slug.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_indicator_by_slug(
    db: &dyn Database,
    slug: &str,
) -> Result<Option<Indicator>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT id, slug, name, source, category, direction, weight,
                    normalization, normalization_scope, is_active
             FROM indicators
             WHERE slug = $1",
            &[DatabaseValue::String(slug.to_string())],
        )
        .await?;

    rows.first().map(indicator_from_row).transpose()
}

// ─── Indicator values ────────────────────────────────────────────────────

/// One raw-value row destined for the `indicator_values` upsert.
#[derive(Debug, Clone)]
pub struct RawValueUpsert {
    pub deso_code: String,
    pub indicator_id: i32,
    pub year: i32,
    pub raw_value: Option<f64>,
}

/// Upserts raw indicator values keyed on `(deso_code, indicator_id, year)`.
///
/// Re-running with the same inputs overwrites in place.
///
/// # Errors
///
/// Returns [`DbError`] if any database operation fails.
pub async fn upsert_raw_values(
    db: &dyn Database,
    values: &[RawValueUpsert],
) -> Result<u64, DbError> {
    let mut written = 0u64;

    for value in values {
        written += db
            .exec_raw_params(
                "INSERT INTO indicator_values (deso_code, indicator_id, year, raw_value)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (deso_code, indicator_id, year) DO UPDATE SET
                     raw_value = EXCLUDED.raw_value,
                     updated_at = NOW()",
                &[
                    DatabaseValue::String(value.deso_code.clone()),
                    DatabaseValue::Int32(value.indicator_id),
                    DatabaseValue::Int32(value.year),
                    opt_f64(value.raw_value),
                ],
            )
            .await?;
    }

    Ok(written)
}

/// Fetches raw values for an indicator/year as `(deso_code, raw_value)`.
///
/// Includes NULL raw values so callers can compute null rates.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_raw_values(
    db: &dyn Database,
    indicator_id: i32,
    year: i32,
) -> Result<Vec<(String, Option<f64>)>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT deso_code, raw_value
             FROM indicator_values
             WHERE indicator_id = $1 AND year = $2
             ORDER BY deso_code",
            &[DatabaseValue::Int32(indicator_id), DatabaseValue::Int32(year)],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| {
            (
                row.to_value("deso_code").unwrap_or_default(),
                row.to_value("raw_value").unwrap_or(None),
            )
        })
        .collect())
}

/// Writes computed normalized values back for one indicator/year scope.
///
/// Only rows present in `normalized` are touched; every other row in the
/// scope has its normalized value cleared, since normalization is a
/// scope-wide recomputation.
///
/// # Errors
///
/// Returns [`DbError`] if any database operation fails.
pub async fn store_normalized_values(
    db: &dyn Database,
    indicator_id: i32,
    year: i32,
    normalized: &[(String, f64)],
) -> Result<u64, DbError> {
    db.exec_raw_params(
        "UPDATE indicator_values
         SET normalized_value = NULL, updated_at = NOW()
         WHERE indicator_id = $1 AND year = $2",
        &[DatabaseValue::Int32(indicator_id), DatabaseValue::Int32(year)],
    )
    .await?;

    let mut updated = 0u64;
    for (deso_code, value) in normalized {
        updated += db
            .exec_raw_params(
                "UPDATE indicator_values
                 SET normalized_value = $4, updated_at = NOW()
                 WHERE deso_code = $1 AND indicator_id = $2 AND year = $3",
                &[
                    DatabaseValue::String(deso_code.clone()),
                    DatabaseValue::Int32(indicator_id),
                    DatabaseValue::Int32(year),
                    DatabaseValue::Real64(*value),
                ],
            )
            .await?;
    }

    Ok(updated)
}

/// Fetches `deso_code -> normalized_value` for one indicator/year.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_normalized_map(
    db: &dyn Database,
    indicator_id: i32,
    year: i32,
) -> Result<BTreeMap<String, f64>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT deso_code, normalized_value
             FROM indicator_values
             WHERE indicator_id = $1 AND year = $2 AND normalized_value IS NOT NULL",
            &[DatabaseValue::Int32(indicator_id), DatabaseValue::Int32(year)],
        )
        .await?;

    let mut map = BTreeMap::new();
    for row in &rows {
        let code: String = row.to_value("deso_code").unwrap_or_default();
        let value: f64 = row.to_value("normalized_value").unwrap_or(0.0);
        map.insert(code, value);
    }

    Ok(map)
}

/// Finds the year with normalized data closest to `year` for an indicator.
///
/// Used as a fallback when the target year has no data yet (e.g. a source
/// that publishes with a multi-year lag).
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn closest_year_with_normalized(
    db: &dyn Database,
    indicator_id: i32,
    year: i32,
) -> Result<Option<i32>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT year, ABS(year - $2) AS distance
             FROM indicator_values
             WHERE indicator_id = $1 AND normalized_value IS NOT NULL
             GROUP BY year
             ORDER BY distance
             LIMIT 1",
            &[DatabaseValue::Int32(indicator_id), DatabaseValue::Int32(year)],
        )
        .await?;

    Ok(rows.first().map(|row| row.to_value("year").unwrap_or(0)))
}

/// Fetches the non-null raw value series for an indicator over a year
/// window, as `(deso_code, year, raw_value)` rows.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_raw_series(
    db: &dyn Database,
    indicator_id: i32,
    base_year: i32,
    end_year: i32,
) -> Result<Vec<(String, i32, f64)>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT deso_code, year, raw_value
             FROM indicator_values
             WHERE indicator_id = $1
               AND year BETWEEN $2 AND $3
               AND raw_value IS NOT NULL
             ORDER BY deso_code, year",
            &[
                DatabaseValue::Int32(indicator_id),
                DatabaseValue::Int32(base_year),
                DatabaseValue::Int32(end_year),
            ],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| {
            (
                row.to_value("deso_code").unwrap_or_default(),
                row.to_value("year").unwrap_or(0),
                row.to_value("raw_value").unwrap_or(0.0),
            )
        })
        .collect())
}

// ─── Score versions ──────────────────────────────────────────────────────

fn version_from_row(row: &switchy_database::Row) -> Result<ScoreVersion, DbError> {
    let status: String = row.to_value("status").unwrap_or_default();
    let indicators_used: Option<String> = row.to_value("indicators_used").unwrap_or(None);
    let sentinel_results: Option<String> = row.to_value("sentinel_results").unwrap_or(None);
    let validation_summary: Option<String> = row.to_value("validation_summary").unwrap_or(None);
    let computed_at: chrono::NaiveDateTime = row.to_value("computed_at").unwrap_or_default();
    let published_at: Option<chrono::NaiveDateTime> =
        row.to_value("published_at").unwrap_or(None);

    Ok(ScoreVersion {
        id: row.to_value("id").unwrap_or(0),
        year: row.to_value("year").unwrap_or(0),
        tenant_id: row.to_value("tenant_id").unwrap_or(None),
        status: parse_enum(&status, "version status")?,
        deso_count: row.to_value("deso_count").unwrap_or(0),
        mean_score: row.to_value("mean_score").unwrap_or(None),
        stddev_score: row.to_value("stddev_score").unwrap_or(None),
        indicators_used: indicators_used
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(serde_json::Value::Null),
        sentinel_results: sentinel_results.and_then(|raw| serde_json::from_str(&raw).ok()),
        validation_summary: validation_summary.and_then(|raw| serde_json::from_str(&raw).ok()),
        computed_at: utc_from_naive(computed_at),
        published_at: published_at.map(utc_from_naive),
    })
}

/// Creates a new draft score version and returns its id.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn create_draft_version(
    db: &dyn Database,
    year: i32,
    tenant_id: Option<i32>,
    indicators_used: &serde_json::Value,
) -> Result<i32, DbError> {
    let rows = db
        .query_raw_params(
            "INSERT INTO score_versions (year, tenant_id, status, indicators_used, computed_at)
             VALUES ($1, $2, 'draft', $3, NOW())
             RETURNING id",
            &[
                DatabaseValue::Int32(year),
                tenant_id.map_or(DatabaseValue::Null, DatabaseValue::Int32),
                DatabaseValue::String(indicators_used.to_string()),
            ],
        )
        .await?;

    let row = rows.first().ok_or_else(|| DbError::Conversion {
        message: "Failed to get version id from insert".to_string(),
    })?;

    row.to_value("id").map_err(|e| DbError::Conversion {
        message: format!("Failed to parse version id: {e}"),
    })
}

/// Fetches one score version by id.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_version(
    db: &dyn Database,
    version_id: i32,
) -> Result<Option<ScoreVersion>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT id, year, tenant_id, status, deso_count, mean_score, stddev_score,
                    indicators_used, sentinel_results, validation_summary,
                    computed_at, published_at
             FROM score_versions WHERE id = $1",
            &[DatabaseValue::Int32(version_id)],
        )
        .await?;

    rows.first().map(version_from_row).transpose()
}

/// Fetches the latest published version for a year, if any.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn latest_published_version(
    db: &dyn Database,
    year: i32,
) -> Result<Option<ScoreVersion>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT id, year, tenant_id, status, deso_count, mean_score, stddev_score,
                    indicators_used, sentinel_results, validation_summary,
                    computed_at, published_at
             FROM score_versions
             WHERE year = $1 AND status = 'published'
             ORDER BY published_at DESC
             LIMIT 1",
            &[DatabaseValue::Int32(year)],
        )
        .await?;

    rows.first().map(version_from_row).transpose()
}

/// Fetches the most recently computed version for a year, any status.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn latest_version(
    db: &dyn Database,
    year: i32,
) -> Result<Option<ScoreVersion>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT id, year, tenant_id, status, deso_count, mean_score, stddev_score,
                    indicators_used, sentinel_results, validation_summary,
                    computed_at, published_at
             FROM score_versions
             WHERE year = $1
             ORDER BY computed_at DESC
             LIMIT 1",
            &[DatabaseValue::Int32(year)],
        )
        .await?;

    rows.first().map(version_from_row).transpose()
}

/// Recomputes and stores count/mean/stddev for a version's scores.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn update_version_stats(db: &dyn Database, version_id: i32) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE score_versions SET
            deso_count = (SELECT COUNT(*) FROM composite_scores WHERE score_version_id = $1),
            mean_score = (SELECT AVG(score) FROM composite_scores WHERE score_version_id = $1),
            stddev_score = (SELECT STDDEV_POP(score) FROM composite_scores WHERE score_version_id = $1)
         WHERE id = $1",
        &[DatabaseValue::Int32(version_id)],
    )
    .await?;

    Ok(())
}

/// Transitions a version to a new lifecycle status.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn set_version_status(
    db: &dyn Database,
    version_id: i32,
    status: VersionStatus,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE score_versions SET status = $2 WHERE id = $1",
        &[
            DatabaseValue::Int32(version_id),
            DatabaseValue::String(status.to_string()),
        ],
    )
    .await?;

    Ok(())
}

/// Stores the collected sentinel outcomes on a version.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn set_sentinel_results(
    db: &dyn Database,
    version_id: i32,
    results: &serde_json::Value,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE score_versions SET sentinel_results = $2 WHERE id = $1",
        &[
            DatabaseValue::Int32(version_id),
            DatabaseValue::String(results.to_string()),
        ],
    )
    .await?;

    Ok(())
}

/// Stores the validation summary on a version.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn set_validation_summary(
    db: &dyn Database,
    version_id: i32,
    summary: &serde_json::Value,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE score_versions SET validation_summary = $2 WHERE id = $1",
        &[
            DatabaseValue::Int32(version_id),
            DatabaseValue::String(summary.to_string()),
        ],
    )
    .await?;

    Ok(())
}

/// Publishes a version, superseding any previously published version for
/// the same year so exactly one published version exists per year.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn publish_version(db: &dyn Database, version_id: i32, year: i32) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE score_versions SET status = 'superseded'
         WHERE year = $1 AND status = 'published'",
        &[DatabaseValue::Int32(year)],
    )
    .await?;

    db.exec_raw_params(
        "UPDATE score_versions SET status = 'published', published_at = NOW()
         WHERE id = $1",
        &[DatabaseValue::Int32(version_id)],
    )
    .await?;

    Ok(())
}

// ─── Composite scores ────────────────────────────────────────────────────

/// Deletes any scores previously written for a version, so a rerun
/// overwrites deterministically instead of accumulating rows.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn delete_scores_for_version(
    db: &dyn Database,
    version_id: i32,
) -> Result<u64, DbError> {
    Ok(db
        .exec_raw_params(
            "DELETE FROM composite_scores WHERE score_version_id = $1",
            &[DatabaseValue::Int32(version_id)],
        )
        .await?)
}

/// Inserts a batch of composite score rows for a version.
///
/// # Errors
///
/// Returns [`DbError`] if any database operation fails.
pub async fn insert_composite_scores(
    db: &dyn Database,
    scores: &[CompositeScore],
) -> Result<u64, DbError> {
    let mut inserted = 0u64;

    for score in scores {
        inserted += db
            .exec_raw_params(
                "INSERT INTO composite_scores (
                    deso_code, year, score_version_id, score,
                    raw_score_before_penalties, trend_1y, trend_3y,
                    factor_scores, top_positive, top_negative,
                    penalties_applied, computed_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
                ON CONFLICT (deso_code, year, score_version_id) DO UPDATE SET
                    score = EXCLUDED.score,
                    raw_score_before_penalties = EXCLUDED.raw_score_before_penalties,
                    trend_1y = EXCLUDED.trend_1y,
                    trend_3y = EXCLUDED.trend_3y,
                    factor_scores = EXCLUDED.factor_scores,
                    top_positive = EXCLUDED.top_positive,
                    top_negative = EXCLUDED.top_negative,
                    penalties_applied = EXCLUDED.penalties_applied,
                    computed_at = NOW()",
                &[
                    DatabaseValue::String(score.deso_code.clone()),
                    DatabaseValue::Int32(score.year),
                    DatabaseValue::Int32(score.score_version_id),
                    DatabaseValue::Real64(score.score),
                    opt_f64(score.raw_score_before_penalties),
                    opt_f64(score.trend_1y),
                    opt_f64(score.trend_3y),
                    DatabaseValue::String(score.factor_scores.to_string()),
                    DatabaseValue::String(
                        serde_json::to_string(&score.top_positive).unwrap_or_default(),
                    ),
                    DatabaseValue::String(
                        serde_json::to_string(&score.top_negative).unwrap_or_default(),
                    ),
                    score
                        .penalties_applied
                        .as_ref()
                        .map_or(DatabaseValue::Null, |p| DatabaseValue::String(p.to_string())),
                ],
            )
            .await?;
    }

    Ok(inserted)
}

/// Fetches `deso_code -> score` for a version.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_score_map(
    db: &dyn Database,
    version_id: i32,
) -> Result<BTreeMap<String, f64>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT deso_code, score FROM composite_scores WHERE score_version_id = $1",
            &[DatabaseValue::Int32(version_id)],
        )
        .await?;

    let mut map = BTreeMap::new();
    for row in &rows {
        let code: String = row.to_value("deso_code").unwrap_or_default();
        let score: f64 = row.to_value("score").unwrap_or(0.0);
        map.insert(code, score);
    }

    Ok(map)
}

/// Writes the 1-year trend column for every score in a version that has a
/// matching area in the comparison version.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn backfill_score_trends(
    db: &dyn Database,
    version_id: i32,
    previous_version_id: i32,
) -> Result<u64, DbError> {
    Ok(db
        .exec_raw_params(
            "UPDATE composite_scores cs
             SET trend_1y = cs.score - prev.score
             FROM composite_scores prev
             WHERE cs.score_version_id = $1
               AND prev.score_version_id = $2
               AND prev.deso_code = cs.deso_code",
            &[
                DatabaseValue::Int32(version_id),
                DatabaseValue::Int32(previous_version_id),
            ],
        )
        .await?)
}

/// Writes the aggregated composite trend for one area in a version.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn set_score_trend_3y(
    db: &dyn Database,
    version_id: i32,
    deso_code: &str,
    value: f64,
) -> Result<u64, DbError> {
    Ok(db
        .exec_raw_params(
            "UPDATE composite_scores SET trend_3y = $3
             WHERE score_version_id = $1 AND deso_code = $2",
            &[
                DatabaseValue::Int32(version_id),
                DatabaseValue::String(deso_code.to_string()),
                DatabaseValue::Real64(value),
            ],
        )
        .await?)
}

// ─── Validation ──────────────────────────────────────────────────────────

/// Fetches active validation rules matching a source (or source-agnostic).
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_rules_for_source(
    db: &dyn Database,
    source: &str,
) -> Result<Vec<ValidationRule>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT id, name, rule_type, source, indicator_id, severity,
                    blocks_scoring, parameters, is_active
             FROM validation_rules
             WHERE is_active = true AND (source = $1 OR source IS NULL)
             ORDER BY id",
            &[DatabaseValue::String(source.to_string())],
        )
        .await?;

    let mut rules = Vec::with_capacity(rows.len());
    for row in &rows {
        let rule_type: String = row.to_value("rule_type").unwrap_or_default();
        let severity: String = row.to_value("severity").unwrap_or_default();
        let parameters: Option<String> = row.to_value("parameters").unwrap_or(None);

        rules.push(ValidationRule {
            id: row.to_value("id").unwrap_or(0),
            name: row.to_value("name").unwrap_or_default(),
            rule_type: parse_enum(&rule_type, "rule type")?,
            source: row.to_value("source").unwrap_or(None),
            indicator_id: row.to_value("indicator_id").unwrap_or(None),
            severity: parse_enum(&severity, "rule severity")?,
            blocks_scoring: row.to_value("blocks_scoring").unwrap_or(false),
            parameters: parameters
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_else(|| serde_json::json!({})),
            is_active: row.to_value("is_active").unwrap_or(false),
        });
    }

    Ok(rules)
}

/// Opens an ingestion log row for a batch run and returns its id.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn create_ingestion_log(
    db: &dyn Database,
    source: &str,
    year: i32,
) -> Result<i64, DbError> {
    let rows = db
        .query_raw_params(
            "INSERT INTO ingestion_logs (source, year, status, started_at)
             VALUES ($1, $2, 'running', NOW())
             RETURNING id",
            &[
                DatabaseValue::String(source.to_string()),
                DatabaseValue::Int32(year),
            ],
        )
        .await?;

    let row = rows.first().ok_or_else(|| DbError::Conversion {
        message: "Failed to get ingestion log id".to_string(),
    })?;

    row.to_value("id").map_err(|e| DbError::Conversion {
        message: format!("Failed to parse ingestion log id: {e}"),
    })
}

/// Closes an ingestion log with a terminal status.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn finish_ingestion_log(
    db: &dyn Database,
    log_id: i64,
    status: &str,
    rows_processed: i64,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE ingestion_logs
         SET status = $2, rows_processed = $3, finished_at = NOW()
         WHERE id = $1",
        &[
            DatabaseValue::Int64(log_id),
            DatabaseValue::String(status.to_string()),
            DatabaseValue::Int64(rows_processed),
        ],
    )
    .await?;

    Ok(())
}

/// Records the outcome of one rule evaluation against one batch.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn insert_validation_result(
    db: &dyn Database,
    log_id: i64,
    rule_id: i32,
    status: &str,
    affected_count: i64,
    message: &str,
    affected_indicators: &[String],
) -> Result<(), DbError> {
    db.exec_raw_params(
        "INSERT INTO validation_results
            (ingestion_log_id, validation_rule_id, status, affected_count,
             message, affected_indicators, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, NOW())",
        &[
            DatabaseValue::Int64(log_id),
            DatabaseValue::Int32(rule_id),
            DatabaseValue::String(status.to_string()),
            DatabaseValue::Int64(affected_count),
            DatabaseValue::String(message.to_string()),
            DatabaseValue::String(serde_json::to_string(affected_indicators).unwrap_or_default()),
        ],
    )
    .await?;

    Ok(())
}

/// Returns indicator slugs tainted by blocking validation failures for a
/// year. The composite scorer excludes these up front.
///
/// Only each source's most recent ingestion log counts, so a clean
/// re-ingestion unblocks the indicators an earlier bad batch tainted.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn blocked_indicator_slugs(
    db: &dyn Database,
    year: i32,
) -> Result<Vec<String>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT vr.affected_indicators
             FROM validation_results vr
             JOIN validation_rules r ON r.id = vr.validation_rule_id
             JOIN ingestion_logs il ON il.id = vr.ingestion_log_id
             WHERE il.year = $1
               AND il.id = (SELECT MAX(latest.id) FROM ingestion_logs latest
                            WHERE latest.source = il.source AND latest.year = il.year)
               AND vr.status = 'failed'
               AND r.blocks_scoring = true",
            &[DatabaseValue::Int32(year)],
        )
        .await?;

    let mut slugs: Vec<String> = Vec::new();
    for row in &rows {
        let raw: Option<String> = row.to_value("affected_indicators").unwrap_or(None);
        if let Some(parsed) = raw.and_then(|r| serde_json::from_str::<Vec<String>>(&r).ok()) {
            for slug in parsed {
                if !slugs.contains(&slug) {
                    slugs.push(slug);
                }
            }
        }
    }

    Ok(slugs)
}

/// Timestamp of the last completed ingestion for a source, for freshness
/// checking.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn last_completed_ingestion(
    db: &dyn Database,
    source: &str,
) -> Result<Option<DateTime<Utc>>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT MAX(finished_at) AS last_finished
             FROM ingestion_logs
             WHERE source = $1 AND status = 'completed'",
            &[DatabaseValue::String(source.to_string())],
        )
        .await?;

    let Some(row) = rows.first() else {
        return Ok(None);
    };

    let naive: Option<chrono::NaiveDateTime> = row.to_value("last_finished").unwrap_or(None);
    Ok(naive.map(utc_from_naive))
}

// ─── Penalties & sentinels ───────────────────────────────────────────────

/// Fetches active penalties that apply to the composite score.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_active_penalties(db: &dyn Database) -> Result<Vec<ScorePenalty>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT id, slug, name, category, penalty_type, penalty_value, is_active
             FROM score_penalties
             WHERE is_active = true AND applies_to = 'composite_score'
             ORDER BY slug",
            &[],
        )
        .await?;

    let mut penalties = Vec::with_capacity(rows.len());
    for row in &rows {
        let penalty_type: String = row.to_value("penalty_type").unwrap_or_default();
        penalties.push(ScorePenalty {
            id: row.to_value("id").unwrap_or(0),
            slug: row.to_value("slug").unwrap_or_default(),
            name: row.to_value("name").unwrap_or_default(),
            category: row.to_value("category").unwrap_or_default(),
            penalty_type: parse_enum(&penalty_type, "penalty type")?,
            penalty_value: row.to_value("penalty_value").unwrap_or(0.0),
            is_active: row.to_value("is_active").unwrap_or(false),
        });
    }

    Ok(penalties)
}

/// Fetches vulnerability mappings with at least `min_overlap` coverage.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_vulnerability_mappings(
    db: &dyn Database,
    min_overlap: f64,
) -> Result<Vec<VulnerabilityMapping>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT deso_code, tier, overlap_fraction
             FROM deso_vulnerability_mapping
             WHERE overlap_fraction >= $1",
            &[DatabaseValue::Real64(min_overlap)],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| VulnerabilityMapping {
            deso_code: row.to_value("deso_code").unwrap_or_default(),
            tier: row.to_value("tier").unwrap_or_default(),
            overlap_fraction: row.to_value("overlap_fraction").unwrap_or(0.0),
        })
        .collect())
}

/// Fetches active sentinel areas.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_active_sentinels(db: &dyn Database) -> Result<Vec<SentinelArea>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT deso_code, name, expected_score_min, expected_score_max,
                    expected_tier, is_active
             FROM sentinel_areas
             WHERE is_active = true
             ORDER BY deso_code",
            &[],
        )
        .await?;

    let mut sentinels = Vec::with_capacity(rows.len());
    for row in &rows {
        let tier: String = row.to_value("expected_tier").unwrap_or_default();
        sentinels.push(SentinelArea {
            deso_code: row.to_value("deso_code").unwrap_or_default(),
            name: row.to_value("name").unwrap_or_default(),
            expected_score_min: row.to_value("expected_score_min").unwrap_or(0.0),
            expected_score_max: row.to_value("expected_score_max").unwrap_or(100.0),
            expected_tier: parse_enum(&tier, "sentinel tier")?,
            is_active: row.to_value("is_active").unwrap_or(false),
        });
    }

    Ok(sentinels)
}

// ─── Trends & methodology ────────────────────────────────────────────────

/// Upserts computed indicator trends keyed on
/// `(deso_code, indicator_id, base_year, end_year)`.
///
/// # Errors
///
/// Returns [`DbError`] if any database operation fails.
pub async fn upsert_indicator_trends(
    db: &dyn Database,
    trends: &[IndicatorTrend],
) -> Result<u64, DbError> {
    let mut written = 0u64;

    for trend in trends {
        written += db
            .exec_raw_params(
                "INSERT INTO indicator_trends (
                    deso_code, indicator_id, base_year, end_year, data_points,
                    absolute_change, percent_change, direction, confidence
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (deso_code, indicator_id, base_year, end_year) DO UPDATE SET
                    data_points = EXCLUDED.data_points,
                    absolute_change = EXCLUDED.absolute_change,
                    percent_change = EXCLUDED.percent_change,
                    direction = EXCLUDED.direction,
                    confidence = EXCLUDED.confidence,
                    updated_at = NOW()",
                &[
                    DatabaseValue::String(trend.deso_code.clone()),
                    DatabaseValue::Int32(trend.indicator_id),
                    DatabaseValue::Int32(trend.base_year),
                    DatabaseValue::Int32(trend.end_year),
                    DatabaseValue::Int32(trend.data_points),
                    DatabaseValue::Real64(trend.absolute_change),
                    opt_f64(trend.percent_change),
                    DatabaseValue::String(trend.direction.to_string()),
                    DatabaseValue::Real64(trend.confidence),
                ],
            )
            .await?;
    }

    Ok(written)
}

/// Fetches stored trends for a window, for composite trend aggregation.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_trends_for_window(
    db: &dyn Database,
    base_year: i32,
    end_year: i32,
) -> Result<Vec<IndicatorTrend>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT deso_code, indicator_id, base_year, end_year, data_points,
                    absolute_change, percent_change, direction, confidence
             FROM indicator_trends
             WHERE base_year = $1 AND end_year = $2",
            &[DatabaseValue::Int32(base_year), DatabaseValue::Int32(end_year)],
        )
        .await?;

    let mut trends = Vec::with_capacity(rows.len());
    for row in &rows {
        let direction: String = row.to_value("direction").unwrap_or_default();
        trends.push(IndicatorTrend {
            deso_code: row.to_value("deso_code").unwrap_or_default(),
            indicator_id: row.to_value("indicator_id").unwrap_or(0),
            base_year: row.to_value("base_year").unwrap_or(0),
            end_year: row.to_value("end_year").unwrap_or(0),
            data_points: row.to_value("data_points").unwrap_or(0),
            absolute_change: row.to_value("absolute_change").unwrap_or(0.0),
            percent_change: row.to_value("percent_change").unwrap_or(None),
            direction: parse_enum(&direction, "trend direction")?,
            confidence: row.to_value("confidence").unwrap_or(0.0),
        });
    }

    Ok(trends)
}

/// Fetches methodology changes that break trend comparability for an
/// indicator inside a year window.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_methodology_breaks(
    db: &dyn Database,
    indicator_id: i32,
    base_year: i32,
    end_year: i32,
) -> Result<Vec<MethodologyChange>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT indicator_id, year_affected, breaks_trend, description
             FROM methodology_changes
             WHERE indicator_id = $1
               AND breaks_trend = true
               AND year_affected BETWEEN $2 AND $3",
            &[
                DatabaseValue::Int32(indicator_id),
                DatabaseValue::Int32(base_year),
                DatabaseValue::Int32(end_year),
            ],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| MethodologyChange {
            indicator_id: row.to_value("indicator_id").unwrap_or(0),
            year_affected: row.to_value("year_affected").unwrap_or(0),
            breaks_trend: row.to_value("breaks_trend").unwrap_or(false),
            description: row.to_value("description").unwrap_or_default(),
        })
        .collect())
}

// ─── Tenant weights ──────────────────────────────────────────────────────

/// Fetches every weight override a tenant has, keyed by indicator id.
///
/// Inactive and zero-weight overrides are included: an override replaces
/// the indicator's defaults, so `is_active = false` here means the tenant
/// has opted the indicator out of its computation.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_tenant_weights(
    db: &dyn Database,
    tenant_id: i32,
) -> Result<Vec<TenantWeight>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT indicator_id, weight, direction, is_active
             FROM tenant_indicator_weights
             WHERE tenant_id = $1",
            &[DatabaseValue::Int32(tenant_id)],
        )
        .await?;

    let mut weights = Vec::with_capacity(rows.len());
    for row in &rows {
        let direction: String = row.to_value("direction").unwrap_or_default();
        weights.push(TenantWeight {
            indicator_id: row.to_value("indicator_id").unwrap_or(0),
            weight: row.to_value("weight").unwrap_or(0.0),
            direction: parse_enum(&direction, "direction")?,
            is_active: row.to_value("is_active").unwrap_or(false),
        });
    }

    Ok(weights)
}

// ─── POIs & transit ──────────────────────────────────────────────────────

/// Fetches active POI categories.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_poi_categories(db: &dyn Database) -> Result<Vec<PoiCategory>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT slug, name, signal, indicator_slug, catchment_km,
                    safety_sensitivity, is_active
             FROM poi_categories
             WHERE is_active = true
             ORDER BY slug",
            &[],
        )
        .await?;

    let mut categories = Vec::with_capacity(rows.len());
    for row in &rows {
        let signal: String = row.to_value("signal").unwrap_or_default();
        categories.push(PoiCategory {
            slug: row.to_value("slug").unwrap_or_default(),
            name: row.to_value("name").unwrap_or_default(),
            signal: parse_enum(&signal, "poi signal")?,
            indicator_slug: row.to_value("indicator_slug").unwrap_or(None),
            catchment_km: row.to_value("catchment_km").unwrap_or(0.0),
            safety_sensitivity: row.to_value("safety_sensitivity").unwrap_or(1.0),
            is_active: row.to_value("is_active").unwrap_or(false),
        });
    }

    Ok(categories)
}

/// Fetches active POIs, optionally restricted to one category.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_active_pois(
    db: &dyn Database,
    category: Option<&str>,
) -> Result<Vec<Poi>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT id, name, category, lat, lng
             FROM pois
             WHERE status = 'active'
               AND lat IS NOT NULL AND lng IS NOT NULL
               AND ($1::text IS NULL OR category = $1)",
            &[opt_string(category)],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| Poi {
            id: row.to_value("id").unwrap_or(0),
            name: row.to_value("name").unwrap_or(None),
            category: row.to_value("category").unwrap_or_default(),
            lat: row.to_value("lat").unwrap_or(0.0),
            lng: row.to_value("lng").unwrap_or(0.0),
            active: true,
        })
        .collect())
}

/// Fetches all transit stops from the GTFS-derived authoritative table.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_transit_stops(db: &dyn Database) -> Result<Vec<TransitStop>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT id, name, stop_type, weekly_departures, lat, lng
             FROM transit_stops
             WHERE lat IS NOT NULL AND lng IS NOT NULL",
            &[],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let stop_type: String = row.to_value("stop_type").unwrap_or_default();
            let mode = match stop_type.as_str() {
                "rail" | "subway" | "station" | "train" => TransitMode::Rail,
                "tram" | "tram_stop" => TransitMode::Tram,
                _ => TransitMode::Bus,
            };
            TransitStop {
                id: row.to_value("id").unwrap_or(0),
                name: row.to_value("name").unwrap_or(None),
                mode,
                weekly_departures: row.to_value("weekly_departures").unwrap_or(None),
                lat: row.to_value("lat").unwrap_or(0.0),
                lng: row.to_value("lng").unwrap_or(0.0),
            }
        })
        .collect())
}

// ─── Pipeline runs & locking ─────────────────────────────────────────────

/// Opens a pipeline run record and returns its id.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn create_pipeline_run(db: &dyn Database, year: i32) -> Result<i64, DbError> {
    let rows = db
        .query_raw_params(
            "INSERT INTO pipeline_runs (year, status, started_at)
             VALUES ($1, 'running', NOW())
             RETURNING id",
            &[DatabaseValue::Int32(year)],
        )
        .await?;

    let row = rows.first().ok_or_else(|| DbError::Conversion {
        message: "Failed to get pipeline run id".to_string(),
    })?;

    row.to_value("id").map_err(|e| DbError::Conversion {
        message: format!("Failed to parse pipeline run id: {e}"),
    })
}

/// Closes a pipeline run with its final status and summary.
///
/// The summary is persisted regardless of success or failure so partial
/// runs stay inspectable.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn finish_pipeline_run(
    db: &dyn Database,
    run_id: i64,
    status: &str,
    summary: &serde_json::Value,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE pipeline_runs
         SET status = $2, summary = $3, finished_at = NOW()
         WHERE id = $1",
        &[
            DatabaseValue::Int64(run_id),
            DatabaseValue::String(status.to_string()),
            DatabaseValue::String(summary.to_string()),
        ],
    )
    .await?;

    Ok(())
}

/// Advisory-lock namespace for per-year pipeline runs.
const PIPELINE_LOCK_CLASS: i32 = 0x6b76;

/// Tries to take the per-year pipeline advisory lock without blocking.
///
/// Two pipeline runs for the same year must not race to publish different
/// versions; the loser should bail out immediately.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn try_year_lock(db: &dyn Database, year: i32) -> Result<bool, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT pg_try_advisory_lock($1, $2) AS locked",
            &[
                DatabaseValue::Int32(PIPELINE_LOCK_CLASS),
                DatabaseValue::Int32(year),
            ],
        )
        .await?;

    let Some(row) = rows.first() else {
        return Ok(false);
    };

    Ok(row.to_value("locked").unwrap_or(false))
}

/// Releases the per-year pipeline advisory lock.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn release_year_lock(db: &dyn Database, year: i32) -> Result<(), DbError> {
    db.query_raw_params(
        "SELECT pg_advisory_unlock($1, $2)",
        &[
            DatabaseValue::Int32(PIPELINE_LOCK_CLASS),
            DatabaseValue::Int32(year),
        ],
    )
    .await?;

    Ok(())
}
