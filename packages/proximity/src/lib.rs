#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cast_precision_loss)]

//! Distance-decay proximity scoring.
//!
//! Scores how well-served an area centroid is by six amenity factors
//! (schools, green space, transit, groceries, plus negative and positive
//! POI pressure). Each factor decays linearly to zero at a per-urbanity
//! radius; perceived distances stretch in low-safety areas. The blended
//! 0-100 composite is written back as the raw value of the proximity
//! indicator so it rides the normal normalization path.

use kvarter_config::{EngineConfig, TieredMeters};
use kvarter_database::queries::{self, RawValueUpsert};
use kvarter_database::DbError;
use kvarter_models::{
    Direction, IndicatorCategory, PoiSignal, TransitMode, UrbanityTier,
};
use kvarter_spatial::{AreaIndex, PointIndex};
use serde::Serialize;
use switchy_database::Database;

/// Indicator slug the composite proximity score feeds.
pub const PROXIMITY_INDICATOR_SLUG: &str = "proximity_composite";

/// Neutral score when an area has no proximity data at all.
pub const NO_DATA_SCORE: f64 = 50.0;

/// Errors raised during proximity computation.
#[derive(Debug, thiserror::Error)]
pub enum ProximityError {
    /// Database error.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The proximity indicator is missing from the registry.
    #[error("Indicator {0} is not registered")]
    MissingIndicator(String),
}

/// The six scored amenity factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    School,
    GreenSpace,
    Transit,
    Grocery,
    NegativePoi,
    PositivePoi,
}

/// Typed per-factor evidence, serialized into score explanations.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FactorDetail {
    /// Nearest-amenity factors (school, green space, grocery).
    Nearest {
        distance_m: f64,
        effective_distance_m: f64,
    },
    /// Transit access with the winning stop's attributes.
    Transit {
        best_distance_m: f64,
        mode: TransitMode,
        weekly_departures: Option<i64>,
        stop_count: usize,
    },
    /// Count-based POI pressure factors.
    Count { within_radius: usize },
    /// Nothing found within the factor radius.
    NoData,
}

/// One factor's contribution to an area's proximity picture.
#[derive(Debug, Clone, Serialize)]
pub struct FactorScore {
    pub kind: FactorKind,
    /// 0-100; higher is better even for negative-pressure factors.
    pub score: f64,
    pub detail: FactorDetail,
}

/// Full proximity result for one area.
#[derive(Debug, Clone, Serialize)]
pub struct AreaProximity {
    pub deso_code: String,
    pub composite: f64,
    pub factors: Vec<FactorScore>,
}

/// Attributes of a transit stop carried through the point index.
#[derive(Debug, Clone)]
pub struct StopInfo {
    pub mode: TransitMode,
    pub weekly_departures: Option<i64>,
}

/// Point indexes for every factor, built once per run.
pub struct ProximityInputs {
    pub schools: PointIndex<()>,
    pub green_spaces: PointIndex<()>,
    pub groceries: PointIndex<()>,
    pub transit: PointIndex<StopInfo>,
    /// Payload is the venue category's safety sensitivity.
    pub negative: PointIndex<f64>,
    pub positive: PointIndex<()>,
}

/// Linear decay from 1 at the origin to 0 at `radius_m`.
#[must_use]
pub fn linear_decay(distance_m: f64, radius_m: f64) -> f64 {
    if radius_m <= 0.0 {
        return 0.0;
    }
    (1.0 - distance_m / radius_m).clamp(0.0, 1.0)
}

/// Distance as perceived in a low-safety area.
///
/// `safety` is the area's 0-1 safety standing; `sensitivity` scales how
/// strongly this factor reacts to it. A fully safe area leaves the
/// distance untouched.
#[must_use]
pub fn effective_distance(distance_m: f64, safety: f64, sensitivity: f64) -> f64 {
    let safety = safety.clamp(0.0, 1.0);
    distance_m * (1.0 + (1.0 - safety) * sensitivity)
}

/// Service-frequency multiplier for a transit stop.
///
/// Grows with the log of daily departures and saturates at 1.5 so a
/// metro hub cannot dominate the factor on frequency alone.
#[must_use]
pub fn frequency_bonus(weekly_departures: Option<i64>) -> f64 {
    let weekly = weekly_departures.unwrap_or(0).max(0) as f64;
    let daily = (weekly / 7.0).max(1.0);
    (0.5 + daily.log10() / 3.0).min(1.5)
}

/// Small additive bonus for stop redundancy, capped at 0.2.
#[must_use]
pub fn count_bonus(stop_count: usize) -> f64 {
    (stop_count as f64 * 0.02).min(0.2)
}

/// Best theoretical per-stop quality, for normalizing transit scores.
const MAX_STOP_QUALITY: f64 = 1.5 * 1.5;

fn nearest_factor(
    kind: FactorKind,
    index: &PointIndex<()>,
    lat: f64,
    lng: f64,
    radius_m: f64,
    safety: f64,
    sensitivity: f64,
) -> FactorScore {
    // Search wider than the scoring radius so a stretched distance can
    // still find the amenity and score it near zero.
    index.nearest_within(lat, lng, radius_m * 2.0).map_or(
        FactorScore {
            kind,
            score: 0.0,
            detail: FactorDetail::NoData,
        },
        |(distance_m, ())| {
            let effective = effective_distance(distance_m, safety, sensitivity);
            FactorScore {
                kind,
                score: linear_decay(effective, radius_m) * 100.0,
                detail: FactorDetail::Nearest {
                    distance_m,
                    effective_distance_m: effective,
                },
            }
        },
    )
}

fn transit_factor(
    inputs: &ProximityInputs,
    lat: f64,
    lng: f64,
    radius_m: f64,
    safety: f64,
    sensitivity: f64,
) -> FactorScore {
    let stops = inputs.transit.within(lat, lng, radius_m);
    if stops.is_empty() {
        return FactorScore {
            kind: FactorKind::Transit,
            score: 0.0,
            detail: FactorDetail::NoData,
        };
    }

    let mut best_quality = 0.0f64;
    let mut best: Option<(f64, &StopInfo)> = None;

    for (distance_m, stop) in &stops {
        let effective = effective_distance(*distance_m, safety, sensitivity);
        let quality = linear_decay(effective, radius_m)
            * stop.mode.weight()
            * frequency_bonus(stop.weekly_departures);
        if quality > best_quality {
            best_quality = quality;
            best = Some((*distance_m, stop));
        }
    }

    let base = best_quality / MAX_STOP_QUALITY;
    let score = (base + count_bonus(stops.len())).min(1.0) * 100.0;

    best.map_or(
        FactorScore {
            kind: FactorKind::Transit,
            score: 0.0,
            detail: FactorDetail::NoData,
        },
        |(best_distance_m, stop)| FactorScore {
            kind: FactorKind::Transit,
            score,
            detail: FactorDetail::Transit {
                best_distance_m,
                mode: stop.mode,
                weekly_departures: stop.weekly_departures,
                stop_count: stops.len(),
            },
        },
    )
}

/// Negative POI pressure: starts at 100, each nearby negative POI
/// subtracts up to 20 points depending on its decay and its category's
/// safety sensitivity, floored at 0. A nightlife venue weighs more than
/// a pawn shop.
fn negative_factor(
    index: &PointIndex<f64>,
    lat: f64,
    lng: f64,
    radius_m: f64,
) -> FactorScore {
    let hits = index.within(lat, lng, radius_m);
    let pressure: f64 = hits
        .iter()
        .map(|(distance_m, sensitivity)| {
            20.0 * linear_decay(*distance_m, radius_m) * **sensitivity
        })
        .sum();

    FactorScore {
        kind: FactorKind::NegativePoi,
        score: (100.0 - pressure).clamp(0.0, 100.0),
        detail: FactorDetail::Count {
            within_radius: hits.len(),
        },
    }
}

/// Positive POI richness: nearest contributions count most, each further
/// one is halved, thirded, and so on; capped at 100.
fn positive_factor(
    index: &PointIndex<()>,
    lat: f64,
    lng: f64,
    radius_m: f64,
) -> FactorScore {
    let hits = index.within(lat, lng, radius_m);
    let score: f64 = hits
        .iter()
        .enumerate()
        .map(|(i, (distance_m, ()))| 15.0 * linear_decay(*distance_m, radius_m) / (i + 1) as f64)
        .sum::<f64>()
        .min(100.0);

    FactorScore {
        kind: FactorKind::PositivePoi,
        score,
        detail: FactorDetail::Count {
            within_radius: hits.len(),
        },
    }
}

const fn weight_for(kind: FactorKind, config: &EngineConfig) -> f64 {
    let weights = &config.proximity.weights;
    match kind {
        FactorKind::School => weights.school,
        FactorKind::GreenSpace => weights.green_space,
        FactorKind::Transit => weights.transit,
        FactorKind::Grocery => weights.grocery,
        FactorKind::NegativePoi => weights.negative_poi,
        FactorKind::PositivePoi => weights.positive_poi,
    }
}

const fn radius_for(kind: FactorKind, config: &EngineConfig) -> &TieredMeters {
    let radii = &config.proximity.radii;
    match kind {
        FactorKind::School => &radii.school,
        FactorKind::GreenSpace => &radii.green_space,
        FactorKind::Transit => &radii.transit,
        FactorKind::Grocery => &radii.grocery,
        FactorKind::NegativePoi => &radii.negative_poi,
        FactorKind::PositivePoi => &radii.positive_poi,
    }
}

/// Scores one area centroid against every factor.
///
/// `safety` is the area's 0-1 safety standing; `safety_sensitivity` is the
/// stretch strength applied to nearest-amenity factors.
#[must_use]
pub fn score_area(
    deso_code: &str,
    inputs: &ProximityInputs,
    lat: f64,
    lng: f64,
    tier: UrbanityTier,
    safety: f64,
    safety_sensitivity: f64,
    config: &EngineConfig,
) -> AreaProximity {
    let r = |kind| radius_for(kind, config).for_tier(tier);

    let factors = vec![
        nearest_factor(
            FactorKind::School,
            &inputs.schools,
            lat,
            lng,
            r(FactorKind::School),
            safety,
            safety_sensitivity,
        ),
        nearest_factor(
            FactorKind::GreenSpace,
            &inputs.green_spaces,
            lat,
            lng,
            r(FactorKind::GreenSpace),
            safety,
            safety_sensitivity,
        ),
        transit_factor(
            inputs,
            lat,
            lng,
            r(FactorKind::Transit),
            safety,
            safety_sensitivity,
        ),
        nearest_factor(
            FactorKind::Grocery,
            &inputs.groceries,
            lat,
            lng,
            r(FactorKind::Grocery),
            safety,
            safety_sensitivity,
        ),
        negative_factor(&inputs.negative, lat, lng, r(FactorKind::NegativePoi)),
        positive_factor(&inputs.positive, lat, lng, r(FactorKind::PositivePoi)),
    ];

    // Factors with no evidence are left out of the blend; the remaining
    // factor weights renormalize, and an area with no evidence at all lands
    // exactly on the neutral midpoint.
    let scored: Vec<(f64, f64)> = factors
        .iter()
        .filter(|f| !matches!(f.detail, FactorDetail::NoData))
        .map(|f| (weight_for(f.kind, config), f.score))
        .collect();

    let weight_sum: f64 = scored.iter().map(|(weight, _)| weight).sum();
    let composite = if weight_sum <= 0.0 {
        NO_DATA_SCORE
    } else {
        scored
            .iter()
            .map(|(weight, score)| weight * score)
            .sum::<f64>()
            / weight_sum
    };

    AreaProximity {
        deso_code: deso_code.to_string(),
        composite,
        factors,
    }
}

/// Computes proximity scores for every area and stores the composite as
/// the proximity indicator's raw value for `year`.
///
/// # Errors
///
/// Returns [`ProximityError`] if the proximity indicator is missing or a
/// database operation fails.
pub async fn compute_proximity(
    db: &dyn Database,
    config: &EngineConfig,
    year: i32,
) -> Result<Vec<AreaProximity>, ProximityError> {
    let indicator = queries::get_indicator_by_slug(db, PROXIMITY_INDICATOR_SLUG)
        .await?
        .ok_or_else(|| ProximityError::MissingIndicator(PROXIMITY_INDICATOR_SLUG.to_string()))?;

    let areas = queries::get_areas(db).await?;
    let boundaries = queries::get_area_boundaries(db).await?;
    let area_index = AreaIndex::build(&boundaries);

    let inputs = load_inputs(db).await?;
    let safety_by_area = load_safety(db, year).await?;

    let mut results = Vec::with_capacity(areas.len());
    let mut upserts = Vec::with_capacity(areas.len());

    for area in &areas {
        let Some((lat, lng)) = area_index.centroid(&area.deso_code) else {
            continue;
        };
        let safety = safety_by_area
            .get(&area.deso_code)
            .copied()
            .unwrap_or(0.5);

        let result = score_area(
            &area.deso_code,
            &inputs,
            lat,
            lng,
            area.urbanity_tier,
            safety,
            1.0,
            config,
        );

        upserts.push(RawValueUpsert {
            deso_code: area.deso_code.clone(),
            indicator_id: indicator.id,
            year,
            raw_value: Some(result.composite),
        });
        results.push(result);
    }

    let written = queries::upsert_raw_values(db, &upserts).await?;
    log::info!("Wrote {written} proximity composite values for {year}");

    Ok(results)
}

/// Scores a single query point, the synchronous per-address path.
///
/// The point inherits the urbanity tier and safety standing of its
/// containing area; points outside every boundary are treated as rural
/// with neutral safety.
///
/// # Errors
///
/// Returns [`ProximityError`] if a database operation fails.
pub async fn score_point(
    db: &dyn Database,
    config: &EngineConfig,
    lat: f64,
    lng: f64,
    year: i32,
) -> Result<AreaProximity, ProximityError> {
    let boundaries = queries::get_area_boundaries(db).await?;
    let area_index = AreaIndex::build(&boundaries);
    let inputs = load_inputs(db).await?;

    let deso_code = area_index.lookup_area(lat, lng).map(str::to_string);
    let (tier, safety) = if let Some(code) = &deso_code {
        let areas = queries::get_areas(db).await?;
        let tier = areas
            .iter()
            .find(|a| &a.deso_code == code)
            .map_or(UrbanityTier::Rural, |a| a.urbanity_tier);
        let safety = load_safety(db, year)
            .await?
            .get(code)
            .copied()
            .unwrap_or(0.5);
        (tier, safety)
    } else {
        (UrbanityTier::Rural, 0.5)
    };

    Ok(score_area(
        deso_code.as_deref().unwrap_or(""),
        &inputs,
        lat,
        lng,
        tier,
        safety,
        1.0,
        config,
    ))
}

async fn load_inputs(db: &dyn Database) -> Result<ProximityInputs, DbError> {
    let categories = queries::get_poi_categories(db).await?;

    let mut schools = Vec::new();
    let mut green_spaces = Vec::new();
    let mut groceries = Vec::new();
    let mut negative: Vec<(f64, f64, f64)> = Vec::new();
    let mut positive = Vec::new();

    for category in &categories {
        let pois = queries::get_active_pois(db, Some(&category.slug)).await?;
        let points = pois.iter().map(|p| (p.lat, p.lng, ()));

        match category.slug.as_str() {
            "school" => schools.extend(points),
            "green_space" => green_spaces.extend(points),
            "grocery" => groceries.extend(points),
            _ => match category.signal {
                PoiSignal::Negative => negative.extend(
                    pois.iter()
                        .map(|p| (p.lat, p.lng, category.safety_sensitivity)),
                ),
                PoiSignal::Positive => positive.extend(points),
                PoiSignal::Neutral => {}
            },
        }
    }

    let stops = queries::get_transit_stops(db).await?;
    let transit = PointIndex::build(stops.into_iter().map(|s| {
        (
            s.lat,
            s.lng,
            StopInfo {
                mode: s.mode,
                weekly_departures: s.weekly_departures,
            },
        )
    }));

    Ok(ProximityInputs {
        schools: PointIndex::build(schools),
        green_spaces: PointIndex::build(green_spaces),
        groceries: PointIndex::build(groceries),
        transit,
        negative: PointIndex::build(negative),
        positive: PointIndex::build(positive),
    })
}

/// Per-area 0-1 safety standing: the mean effective normalized value of
/// the active safety-category indicators, with direction applied.
async fn load_safety(
    db: &dyn Database,
    year: i32,
) -> Result<std::collections::BTreeMap<String, f64>, DbError> {
    use std::collections::BTreeMap;

    let indicators = queries::get_active_indicators(db).await?;
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();

    for indicator in indicators
        .iter()
        .filter(|i| i.category == IndicatorCategory::Safety)
    {
        let normalized = queries::get_normalized_map(db, indicator.id, year).await?;
        for (code, value) in normalized {
            let effective = match indicator.direction {
                Direction::Negative => 1.0 - value,
                Direction::Positive | Direction::Neutral => value,
            };
            let entry = sums.entry(code).or_insert((0.0, 0));
            entry.0 += effective;
            entry.1 += 1;
        }
    }

    Ok(sums
        .into_iter()
        .map(|(code, (sum, count))| (code, sum / count as f64))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        EngineConfig::load().unwrap()
    }

    fn empty_inputs() -> ProximityInputs {
        ProximityInputs {
            schools: PointIndex::build(Vec::<(f64, f64, ())>::new()),
            green_spaces: PointIndex::build(Vec::<(f64, f64, ())>::new()),
            groceries: PointIndex::build(Vec::<(f64, f64, ())>::new()),
            transit: PointIndex::build(Vec::<(f64, f64, StopInfo)>::new()),
            negative: PointIndex::build(Vec::<(f64, f64, f64)>::new()),
            positive: PointIndex::build(Vec::<(f64, f64, ())>::new()),
        }
    }

    #[test]
    fn decay_is_linear_and_clamped() {
        assert!((linear_decay(0.0, 1000.0) - 1.0).abs() < f64::EPSILON);
        assert!((linear_decay(500.0, 1000.0) - 0.5).abs() < f64::EPSILON);
        assert!(linear_decay(1500.0, 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unsafe_areas_stretch_distances() {
        let safe = effective_distance(1000.0, 1.0, 1.0);
        let unsafe_area = effective_distance(1000.0, 0.0, 1.0);
        assert!((safe - 1000.0).abs() < f64::EPSILON);
        assert!((unsafe_area - 2000.0).abs() < f64::EPSILON);

        // Sensitivity 0 disables the stretch entirely.
        assert!((effective_distance(1000.0, 0.0, 0.0) - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn frequency_bonus_saturates() {
        assert!((frequency_bonus(None) - 0.5).abs() < f64::EPSILON);
        assert!((frequency_bonus(Some(7)) - 0.5).abs() < f64::EPSILON);
        let busy = frequency_bonus(Some(7_000));
        assert!(busy > 1.0 && busy <= 1.5);
        assert!((frequency_bonus(Some(10_000_000)) - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn count_bonus_caps_at_point_two() {
        assert!((count_bonus(1) - 0.02).abs() < 1e-12);
        assert!((count_bonus(50) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn no_data_area_lands_on_neutral_midpoint() {
        let result = score_area(
            "0180C1010",
            &empty_inputs(),
            59.305,
            18.055,
            UrbanityTier::Urban,
            0.5,
            1.0,
            &test_config(),
        );
        assert!((result.composite - NO_DATA_SCORE).abs() < f64::EPSILON);
        assert!(result
            .factors
            .iter()
            .all(|f| matches!(f.detail, FactorDetail::NoData)));
    }

    #[test]
    fn composite_blends_by_factor_weight() {
        // School on the centroid (100) and a grocery near the edge of its
        // radius (~5): the school's 0.10 weight should dominate the
        // grocery's 0.03, far above the 52.5 an unweighted mean would give.
        let mut inputs = empty_inputs();
        inputs.schools = PointIndex::build(vec![(59.305, 18.055, ())]);
        inputs.groceries = PointIndex::build(vec![(59.3118, 18.055, ())]);

        let result = score_area(
            "0180C1010",
            &inputs,
            59.305,
            18.055,
            UrbanityTier::Urban,
            1.0,
            1.0,
            &test_config(),
        );
        assert!(result.composite > 70.0, "got {}", result.composite);
    }

    #[test]
    fn nearby_school_scores_high() {
        let mut inputs = empty_inputs();
        inputs.schools = PointIndex::build(vec![(59.3055, 18.055, ())]);

        let result = score_area(
            "0180C1010",
            &inputs,
            59.305,
            18.055,
            UrbanityTier::Urban,
            1.0,
            1.0,
            &test_config(),
        );

        let school = result
            .factors
            .iter()
            .find(|f| f.kind == FactorKind::School)
            .unwrap();
        assert!(school.score > 90.0, "got {}", school.score);
    }

    #[test]
    fn low_safety_lowers_nearest_scores() {
        let mut inputs = empty_inputs();
        inputs.schools = PointIndex::build(vec![(59.310, 18.055, ())]);
        let config = test_config();

        let safe = score_area(
            "a", &inputs, 59.305, 18.055, UrbanityTier::Urban, 1.0, 1.0, &config,
        );
        let risky = score_area(
            "a", &inputs, 59.305, 18.055, UrbanityTier::Urban, 0.0, 1.0, &config,
        );

        let score_of = |r: &AreaProximity| {
            r.factors
                .iter()
                .find(|f| f.kind == FactorKind::School)
                .unwrap()
                .score
        };
        assert!(score_of(&risky) < score_of(&safe));
    }

    #[test]
    fn negative_pressure_floors_at_zero() {
        let mut inputs = empty_inputs();
        // Ten negative POIs stacked on the centroid: 10 x 20 > 100.
        inputs.negative = PointIndex::build(vec![(59.305, 18.055, 1.0); 10]);

        let result = score_area(
            "a",
            &inputs,
            59.305,
            18.055,
            UrbanityTier::Urban,
            0.5,
            1.0,
            &test_config(),
        );
        let negative = result
            .factors
            .iter()
            .find(|f| f.kind == FactorKind::NegativePoi)
            .unwrap();
        assert!(negative.score.abs() < f64::EPSILON);
    }

    #[test]
    fn negative_pressure_scales_with_category_sensitivity() {
        // A single venue at distance zero: 20 x decay(1) x sensitivity.
        let index = PointIndex::build(vec![(59.305, 18.055, 0.5)]);
        let factor = negative_factor(&index, 59.305, 18.055, 400.0);
        assert!((factor.score - 90.0).abs() < 1e-9);
    }

    #[test]
    fn positive_contributions_diminish() {
        let mut inputs = empty_inputs();
        inputs.positive = PointIndex::build(vec![(59.305, 18.055, ()); 3]);

        let result = score_area(
            "a",
            &inputs,
            59.305,
            18.055,
            UrbanityTier::Urban,
            0.5,
            1.0,
            &test_config(),
        );
        let positive = result
            .factors
            .iter()
            .find(|f| f.kind == FactorKind::PositivePoi)
            .unwrap();

        // 15 + 7.5 + 5 = 27.5 for three perfectly-placed POIs.
        assert!((positive.score - 27.5).abs() < 1e-9, "got {}", positive.score);
    }

    #[test]
    fn rail_beats_bus_at_equal_distance() {
        let config = test_config();
        let mut rail_inputs = empty_inputs();
        rail_inputs.transit = PointIndex::build(vec![(
            59.306,
            18.055,
            StopInfo {
                mode: TransitMode::Rail,
                weekly_departures: Some(700),
            },
        )]);

        let mut bus_inputs = empty_inputs();
        bus_inputs.transit = PointIndex::build(vec![(
            59.306,
            18.055,
            StopInfo {
                mode: TransitMode::Bus,
                weekly_departures: Some(700),
            },
        )]);

        let score_of = |inputs: &ProximityInputs| {
            score_area(
                "a", inputs, 59.305, 18.055, UrbanityTier::Urban, 1.0, 1.0, &config,
            )
            .factors
            .iter()
            .find(|f| f.kind == FactorKind::Transit)
            .unwrap()
            .score
        };

        assert!(score_of(&rail_inputs) > score_of(&bus_inputs));
    }
}
