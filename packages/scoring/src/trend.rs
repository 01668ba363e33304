//! Indicator trend computation over multi-year windows.
//!
//! Trends compare raw values, not normalized ones, so a trend means "this
//! area's number moved", not "this area's rank moved". A methodology break
//! inside the window zeroes confidence and marks the trend insufficient
//! since the numbers are not comparable across the break.

use std::collections::{BTreeMap, BTreeSet};

use kvarter_config::EngineConfig;
use kvarter_database::queries;
use kvarter_models::{Direction, Indicator, IndicatorTrend, TrendDirection};
use switchy_database::Database;

use crate::ScoringError;

/// Classifies a signed percent change given the indicator's direction.
///
/// The result is expressed from the resident's point of view: a falling
/// crime rate is `Improving`.
#[must_use]
pub fn classify(
    direction: Direction,
    percent_change: f64,
    stable_threshold_pct: f64,
) -> TrendDirection {
    if percent_change.abs() <= stable_threshold_pct {
        return TrendDirection::Stable;
    }

    let raw_up = percent_change > 0.0;
    let improving = match direction {
        Direction::Negative => !raw_up,
        Direction::Positive | Direction::Neutral => raw_up,
    };

    if improving {
        TrendDirection::Improving
    } else {
        TrendDirection::Declining
    }
}

/// Computes one `(area, indicator)` trend from its raw value series.
///
/// `series` holds `(year, value)` pairs inside the window, in year order.
#[must_use]
pub fn compute_trend(
    deso_code: &str,
    indicator: &Indicator,
    base_year: i32,
    end_year: i32,
    series: &[(i32, f64)],
    has_methodology_break: bool,
    stable_threshold_pct: f64,
) -> IndicatorTrend {
    let expected_points = (end_year - base_year + 1).max(1);
    let data_points = i32::try_from(series.len()).unwrap_or(i32::MAX);

    let insufficient = |confidence: f64| IndicatorTrend {
        deso_code: deso_code.to_string(),
        indicator_id: indicator.id,
        base_year,
        end_year,
        data_points,
        absolute_change: 0.0,
        percent_change: None,
        direction: TrendDirection::Insufficient,
        confidence,
    };

    if has_methodology_break {
        return insufficient(0.0);
    }
    if series.len() < 2 {
        return insufficient(f64::from(data_points) / f64::from(expected_points));
    }

    let (_, first) = series[0];
    let (_, last) = series[series.len() - 1];
    let absolute_change = last - first;

    let percent_change = if first.abs() < f64::EPSILON {
        None
    } else {
        Some(absolute_change / first.abs() * 100.0)
    };

    let direction = percent_change.map_or(TrendDirection::Insufficient, |pct| {
        classify(indicator.direction, pct, stable_threshold_pct)
    });

    IndicatorTrend {
        deso_code: deso_code.to_string(),
        indicator_id: indicator.id,
        base_year,
        end_year,
        data_points,
        absolute_change,
        percent_change,
        direction,
        confidence: f64::from(data_points) / f64::from(expected_points),
    }
}

/// Fills gap years in an area's raw series from its predecessor areas.
///
/// After a boundary revision the new code has no history of its own, so
/// missing years are filled with the overlap-weighted mean of whatever
/// predecessors have data for that year. Years the area observed directly
/// are never overwritten.
#[must_use]
pub fn stitch_series(
    own: &[(i32, f64)],
    predecessors: &[(f64, Vec<(i32, f64)>)],
) -> Vec<(i32, f64)> {
    let mut merged: BTreeMap<i32, f64> = own.iter().copied().collect();

    let mut fills: BTreeMap<i32, (f64, f64)> = BTreeMap::new();
    for (overlap, series) in predecessors {
        for (year, value) in series {
            if merged.contains_key(year) {
                continue;
            }
            let entry = fills.entry(*year).or_insert((0.0, 0.0));
            entry.0 += overlap * value;
            entry.1 += overlap;
        }
    }

    for (year, (weighted, total_overlap)) in fills {
        if total_overlap > 0.0 {
            merged.insert(year, weighted / total_overlap);
        }
    }

    merged.into_iter().collect()
}

/// Composite trend for one area: the weighted mean of its signed,
/// direction-adjusted indicator changes.
///
/// Gated on weight coverage and mean confidence; `None` means "not enough
/// comparable history to say", which consumers must distinguish from a
/// zero (flat) trend.
#[must_use]
pub fn composite_trend(
    area_trends: &[(f64, IndicatorTrend, Direction)],
    total_weight: f64,
    min_weight_coverage: f64,
    min_confidence: f64,
) -> Option<f64> {
    let usable: Vec<&(f64, IndicatorTrend, Direction)> = area_trends
        .iter()
        .filter(|(_, t, _)| t.direction != TrendDirection::Insufficient)
        .filter(|(_, t, _)| t.percent_change.is_some())
        .collect();

    if usable.is_empty() || total_weight <= 0.0 {
        return None;
    }

    let covered_weight: f64 = usable.iter().map(|(w, _, _)| w).sum();
    if covered_weight / total_weight < min_weight_coverage {
        return None;
    }

    #[allow(clippy::cast_precision_loss)]
    let mean_confidence =
        usable.iter().map(|(_, t, _)| t.confidence).sum::<f64>() / usable.len() as f64;
    if mean_confidence < min_confidence {
        return None;
    }

    let weighted: f64 = usable
        .iter()
        .map(|(weight, trend, direction)| {
            let pct = trend.percent_change.unwrap_or(0.0);
            let signed = match direction {
                Direction::Negative => -pct,
                Direction::Positive | Direction::Neutral => pct,
            };
            weight * signed
        })
        .sum();

    Some(weighted / covered_weight)
}

/// Summary of one trend computation run.
#[derive(Debug, Clone)]
pub struct TrendSummary {
    pub trends_written: u64,
    pub composites_written: u64,
    pub indicators_with_breaks: usize,
}

/// Computes and stores trends for every active indicator over the window,
/// then aggregates per-area composite trends onto the latest score
/// version for `end_year`.
///
/// # Errors
///
/// Returns [`ScoringError`] if any database operation fails.
pub async fn compute_trends(
    db: &dyn Database,
    config: &EngineConfig,
    base_year: i32,
    end_year: i32,
) -> Result<TrendSummary, ScoringError> {
    let indicators = queries::get_active_indicators(db).await?;
    let stable_pct = config.scoring.stable_threshold_pct;

    let crosswalk = queries::get_area_crosswalk(db).await?;
    let mut predecessors: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
    let mut retired: BTreeSet<String> = BTreeSet::new();
    for entry in &crosswalk {
        predecessors
            .entry(entry.new_code.clone())
            .or_default()
            .push((entry.old_code.clone(), entry.overlap_fraction));
        retired.insert(entry.old_code.clone());
    }

    let mut trends_written = 0u64;
    let mut indicators_with_breaks = 0usize;

    for indicator in &indicators {
        let breaks =
            queries::get_methodology_breaks(db, indicator.id, base_year, end_year).await?;
        let has_break = !breaks.is_empty();
        if has_break {
            indicators_with_breaks += 1;
            log::warn!(
                "Indicator {} has a methodology break inside {base_year}-{end_year}",
                indicator.slug
            );
        }

        let rows = queries::get_raw_series(db, indicator.id, base_year, end_year).await?;
        let mut by_area: BTreeMap<String, Vec<(i32, f64)>> = BTreeMap::new();
        for (deso_code, year, value) in rows {
            by_area.entry(deso_code).or_default().push((year, value));
        }

        let series_of = |code: &str| -> Vec<(i32, f64)> {
            let own: &[(i32, f64)] = by_area.get(code).map_or(&[], Vec::as_slice);
            predecessors.get(code).map_or_else(
                || own.to_vec(),
                |olds| {
                    let preds: Vec<(f64, Vec<(i32, f64)>)> = olds
                        .iter()
                        .filter_map(|(old, overlap)| {
                            by_area.get(old).map(|s| (*overlap, s.clone()))
                        })
                        .collect();
                    stitch_series(own, &preds)
                },
            )
        };

        // Revised-away codes are represented through their successors.
        let mut codes: BTreeSet<&str> = by_area
            .keys()
            .map(String::as_str)
            .filter(|code| !retired.contains(*code))
            .collect();
        codes.extend(predecessors.keys().map(String::as_str));

        let trends: Vec<IndicatorTrend> = codes
            .iter()
            .filter_map(|deso_code| {
                let series = series_of(deso_code);
                if series.is_empty() {
                    return None;
                }
                Some(compute_trend(
                    deso_code, indicator, base_year, end_year, &series, has_break, stable_pct,
                ))
            })
            .collect();

        trends_written += queries::upsert_indicator_trends(db, &trends).await?;
    }

    let composites_written =
        aggregate_composite_trends(db, config, &indicators, base_year, end_year).await?;

    log::info!(
        "Computed {trends_written} indicator trends and {composites_written} composite trends for {base_year}-{end_year}"
    );

    Ok(TrendSummary {
        trends_written,
        composites_written,
        indicators_with_breaks,
    })
}

async fn aggregate_composite_trends(
    db: &dyn Database,
    config: &EngineConfig,
    indicators: &[Indicator],
    base_year: i32,
    end_year: i32,
) -> Result<u64, ScoringError> {
    let Some(version) = queries::latest_version(db, end_year).await? else {
        log::debug!("No score version for {end_year}, skipping composite trends");
        return Ok(0);
    };

    let scored: Vec<&Indicator> = indicators
        .iter()
        .filter(|i| i.direction != Direction::Neutral && i.weight > 0.0)
        .collect();
    let total_weight: f64 = scored.iter().map(|i| i.weight).sum();

    let by_id: BTreeMap<i32, &Indicator> = scored.iter().map(|i| (i.id, *i)).collect();

    let all_trends = queries::get_trends_for_window(db, base_year, end_year).await?;
    let mut by_area: BTreeMap<String, Vec<(f64, IndicatorTrend, Direction)>> = BTreeMap::new();
    for trend in all_trends {
        if let Some(indicator) = by_id.get(&trend.indicator_id) {
            by_area.entry(trend.deso_code.clone()).or_default().push((
                indicator.weight,
                trend,
                indicator.direction,
            ));
        }
    }

    let mut written = 0u64;
    for (deso_code, area_trends) in &by_area {
        if let Some(value) = composite_trend(
            area_trends,
            total_weight,
            config.scoring.composite_trend_min_weight_coverage,
            config.scoring.min_trend_confidence,
        ) {
            written +=
                queries::set_score_trend_3y(db, version.id, deso_code, value).await?;
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvarter_models::{IndicatorCategory, NormalizationMethod, NormalizationScope};

    fn indicator(direction: Direction) -> Indicator {
        Indicator {
            id: 1,
            slug: "crime_rate".to_string(),
            name: "Crime rate".to_string(),
            source: "bra".to_string(),
            category: IndicatorCategory::Safety,
            direction,
            weight: 0.2,
            normalization: NormalizationMethod::RankPercentile,
            normalization_scope: NormalizationScope::National,
            is_active: true,
        }
    }

    #[test]
    fn within_threshold_is_stable() {
        assert_eq!(
            classify(Direction::Positive, 2.9, 3.0),
            TrendDirection::Stable
        );
        assert_eq!(
            classify(Direction::Positive, -3.0, 3.0),
            TrendDirection::Stable
        );
    }

    #[test]
    fn falling_negative_indicator_improves() {
        assert_eq!(
            classify(Direction::Negative, -10.0, 3.0),
            TrendDirection::Improving
        );
        assert_eq!(
            classify(Direction::Negative, 10.0, 3.0),
            TrendDirection::Declining
        );
    }

    #[test]
    fn trend_over_full_series() {
        let series = vec![(2021, 100.0), (2022, 95.0), (2023, 88.0), (2024, 80.0)];
        let trend = compute_trend(
            "0180C1010",
            &indicator(Direction::Negative),
            2021,
            2024,
            &series,
            false,
            3.0,
        );

        assert_eq!(trend.data_points, 4);
        assert!((trend.absolute_change + 20.0).abs() < 1e-9);
        assert!((trend.percent_change.unwrap() + 20.0).abs() < 1e-9);
        assert_eq!(trend.direction, TrendDirection::Improving);
        assert!((trend.confidence - 1.0).abs() < 1e-12);
    }

    #[test]
    fn gap_years_reduce_confidence() {
        let series = vec![(2021, 100.0), (2024, 110.0)];
        let trend = compute_trend(
            "0180C1010",
            &indicator(Direction::Positive),
            2021,
            2024,
            &series,
            false,
            3.0,
        );
        assert!((trend.confidence - 0.5).abs() < 1e-12);
        assert_eq!(trend.direction, TrendDirection::Improving);
    }

    #[test]
    fn methodology_break_zeroes_confidence() {
        let series = vec![(2021, 100.0), (2022, 95.0), (2023, 88.0)];
        let trend = compute_trend(
            "0180C1010",
            &indicator(Direction::Negative),
            2021,
            2023,
            &series,
            true,
            3.0,
        );
        assert_eq!(trend.direction, TrendDirection::Insufficient);
        assert!(trend.confidence.abs() < f64::EPSILON);
        assert!(trend.percent_change.is_none());
    }

    #[test]
    fn single_point_is_insufficient() {
        let trend = compute_trend(
            "0180C1010",
            &indicator(Direction::Positive),
            2021,
            2024,
            &[(2022, 5.0)],
            false,
            3.0,
        );
        assert_eq!(trend.direction, TrendDirection::Insufficient);
    }

    #[test]
    fn zero_base_has_no_percent_change() {
        let trend = compute_trend(
            "0180C1010",
            &indicator(Direction::Positive),
            2021,
            2024,
            &[(2021, 0.0), (2024, 5.0)],
            false,
            3.0,
        );
        assert!(trend.percent_change.is_none());
        assert_eq!(trend.direction, TrendDirection::Insufficient);
        assert!((trend.absolute_change - 5.0).abs() < 1e-12);
    }

    #[test]
    fn stitched_series_fills_gaps_from_predecessors() {
        let own = vec![(2023, 50.0), (2024, 52.0)];
        let preds = vec![
            (0.6, vec![(2021, 40.0), (2022, 44.0), (2023, 999.0)]),
            (0.4, vec![(2021, 60.0)]),
        ];

        let merged = stitch_series(&own, &preds);

        assert_eq!(merged.len(), 4);
        // 2021: overlap-weighted mean of both predecessors.
        assert!((merged[0].1 - 48.0).abs() < 1e-9);
        // 2022: only one predecessor has data.
        assert!((merged[1].1 - 44.0).abs() < 1e-9);
        // 2023: the area's own observation wins.
        assert!((merged[2].1 - 50.0).abs() < 1e-9);
    }

    fn trend_with(pct: Option<f64>, confidence: f64) -> IndicatorTrend {
        IndicatorTrend {
            deso_code: "0180C1010".to_string(),
            indicator_id: 1,
            base_year: 2021,
            end_year: 2024,
            data_points: 4,
            absolute_change: 1.0,
            percent_change: pct,
            direction: if pct.is_some() {
                TrendDirection::Improving
            } else {
                TrendDirection::Insufficient
            },
            confidence,
        }
    }

    #[test]
    fn composite_gated_on_weight_coverage() {
        // Only 0.2 of 0.8 total weight has a usable trend.
        let trends = vec![(0.2, trend_with(Some(10.0), 1.0), Direction::Positive)];
        assert!(composite_trend(&trends, 0.8, 0.60, 0.50).is_none());
    }

    #[test]
    fn composite_gated_on_confidence() {
        let trends = vec![(0.8, trend_with(Some(10.0), 0.4), Direction::Positive)];
        assert!(composite_trend(&trends, 0.8, 0.60, 0.50).is_none());
    }

    #[test]
    fn composite_blends_with_direction_applied() {
        let trends = vec![
            (0.5, trend_with(Some(10.0), 1.0), Direction::Positive),
            // Rising negative indicator counts against the area.
            (0.5, trend_with(Some(4.0), 1.0), Direction::Negative),
        ];
        let value = composite_trend(&trends, 1.0, 0.60, 0.50).unwrap();
        assert!((value - 3.0).abs() < 1e-9);
    }
}
