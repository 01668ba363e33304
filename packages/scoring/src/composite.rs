//! Composite score computation.
//!
//! Blends normalized indicator values into a 0-100 score per area.
//! Direction is applied here (`effective = 1 - normalized` for negative
//! indicators); weights renormalize over the indicators that actually have
//! data for an area so missing data never drags a score toward zero.

use std::collections::BTreeMap;

use kvarter_config::EngineConfig;
use kvarter_database::queries;
use kvarter_models::{
    CompositeScore, Direction, Indicator, PenaltyType, ScorePenalty, TenantContext,
};
use serde::Serialize;
use switchy_database::Database;

use crate::ScoringError;

/// One indicator's contribution to an area, after direction is applied.
#[derive(Debug, Clone)]
pub struct FactorInput {
    pub slug: String,
    pub weight: f64,
    /// 0-1, higher is always better.
    pub effective: f64,
}

/// Effective threshold at or above which a factor counts as a strength.
const TOP_POSITIVE_THRESHOLD: f64 = 0.7;
/// Effective threshold at or below which a factor counts as a weakness.
const TOP_NEGATIVE_THRESHOLD: f64 = 0.3;

/// A penalty that actually fired for an area.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedPenalty {
    pub slug: String,
    pub category: String,
    /// Score delta, always negative.
    pub amount: f64,
}

/// Applies direction to a normalized value.
#[must_use]
pub fn effective_value(direction: Direction, normalized: f64) -> f64 {
    match direction {
        Direction::Negative => 1.0 - normalized,
        Direction::Positive | Direction::Neutral => normalized,
    }
}

/// Weighted blend over available factors, renormalized and scaled to
/// 0-100. `None` when no factor has data.
#[must_use]
pub fn blend(inputs: &[FactorInput]) -> Option<f64> {
    let weight_sum: f64 = inputs.iter().map(|i| i.weight).sum();
    if weight_sum <= 0.0 {
        return None;
    }

    let weighted: f64 = inputs.iter().map(|i| i.weight * i.effective).sum();
    Some(weighted / weight_sum * 100.0)
}

/// Up to `limit` strongest and weakest factor slugs, strongest/weakest
/// first.
#[must_use]
pub fn top_factors(inputs: &[FactorInput], limit: usize) -> (Vec<String>, Vec<String>) {
    let mut sorted: Vec<&FactorInput> = inputs.iter().collect();
    sorted.sort_by(|a, b| b.effective.total_cmp(&a.effective));

    let positive = sorted
        .iter()
        .filter(|i| i.effective >= TOP_POSITIVE_THRESHOLD)
        .take(limit)
        .map(|i| i.slug.clone())
        .collect();

    let negative = sorted
        .iter()
        .rev()
        .filter(|i| i.effective <= TOP_NEGATIVE_THRESHOLD)
        .take(limit)
        .map(|i| i.slug.clone())
        .collect();

    (positive, negative)
}

/// Score delta a penalty would produce against a raw score.
fn penalty_delta(penalty: &ScorePenalty, raw_score: f64) -> f64 {
    match penalty.penalty_type {
        PenaltyType::Absolute => penalty.penalty_value,
        PenaltyType::Percentage => raw_score * penalty.penalty_value / 100.0,
    }
}

/// Applies triggered penalties to a raw score.
///
/// Penalties in the same category never stack; only the worst one in each
/// category fires. The result is clamped to `[0, 100]`.
#[must_use]
pub fn apply_penalties(
    raw_score: f64,
    triggered: &[&ScorePenalty],
) -> (f64, Vec<AppliedPenalty>) {
    let mut worst_by_category: BTreeMap<&str, (&ScorePenalty, f64)> = BTreeMap::new();

    for penalty in triggered {
        let delta = penalty_delta(penalty, raw_score);
        match worst_by_category.get(penalty.category.as_str()) {
            Some((_, existing)) if *existing <= delta => {}
            _ => {
                worst_by_category.insert(&penalty.category, (penalty, delta));
            }
        }
    }

    let applied: Vec<AppliedPenalty> = worst_by_category
        .into_values()
        .map(|(penalty, amount)| AppliedPenalty {
            slug: penalty.slug.clone(),
            category: penalty.category.clone(),
            amount,
        })
        .collect();

    let total: f64 = applied.iter().map(|p| p.amount).sum();
    ((raw_score + total).clamp(0.0, 100.0), applied)
}

/// Whether a penalty's trigger condition holds for an area with the given
/// vulnerability tiers. Vulnerability penalties are tier-scoped: the slug
/// names the tier it fires on, so `vuln_utsatt` fires on `utsatt` areas
/// and leaves `sarskilt_utsatt` to the harsher penalty.
#[must_use]
pub fn penalty_applies(penalty: &ScorePenalty, tiers: &[&str]) -> bool {
    penalty
        .slug
        .strip_prefix("vuln_")
        .is_some_and(|tier| tiers.contains(&tier))
}

/// The effective indicator set for a computation: default weights and
/// active flags, or the tenant's overrides where present. An override
/// replaces both, so a tenant can deactivate a globally-active indicator.
#[must_use]
pub fn effective_indicators(
    indicators: &[Indicator],
    tenant_weights: &[kvarter_models::TenantWeight],
    blocked_slugs: &[String],
) -> Vec<Indicator> {
    indicators
        .iter()
        .filter(|i| !blocked_slugs.contains(&i.slug))
        .filter_map(|indicator| {
            let mut effective = indicator.clone();
            if let Some(over) = tenant_weights
                .iter()
                .find(|w| w.indicator_id == indicator.id)
            {
                effective.weight = over.weight;
                effective.direction = over.direction;
                effective.is_active = over.is_active;
            }
            (effective.is_active
                && effective.weight > 0.0
                && effective.direction != Direction::Neutral)
                .then_some(effective)
        })
        .collect()
}

/// Categories whose effective weight sum exceeds the configured budget,
/// as `(category, weight_sum, budget)`.
#[must_use]
pub fn over_budget_categories(
    indicators: &[Indicator],
    config: &EngineConfig,
) -> Vec<(String, f64, f64)> {
    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    for indicator in indicators {
        *sums.entry(indicator.category.to_string()).or_default() += indicator.weight;
    }

    sums.into_iter()
        .filter_map(|(category, sum)| {
            config
                .category_budget(&category)
                .filter(|budget| sum > budget + 1e-9)
                .map(|budget| (category, sum, budget))
        })
        .collect()
}

/// Summary of one computation run.
#[derive(Debug, Clone)]
pub struct ComputeSummary {
    pub version_id: i32,
    pub areas_scored: usize,
    pub indicators_used: usize,
    pub fallback_years: BTreeMap<String, i32>,
}

/// Computes composite scores for a year and stores them under a fresh
/// draft version.
///
/// # Errors
///
/// Returns [`ScoringError`] if no indicator has usable data or a database
/// operation fails.
pub async fn compute_scores(
    db: &dyn Database,
    config: &EngineConfig,
    year: i32,
    tenant: &TenantContext,
) -> Result<ComputeSummary, ScoringError> {
    let all_indicators = queries::get_active_indicators(db).await?;
    let blocked = queries::blocked_indicator_slugs(db, year).await?;
    if !blocked.is_empty() {
        log::warn!(
            "Excluding {} indicator(s) blocked by validation: {}",
            blocked.len(),
            blocked.join(", ")
        );
    }

    let tenant_weights = match tenant.tenant_id {
        Some(id) => queries::get_tenant_weights(db, id).await?,
        None => vec![],
    };

    let indicators = effective_indicators(&all_indicators, &tenant_weights, &blocked);
    if indicators.is_empty() {
        return Err(ScoringError::NoUsableIndicators { year });
    }

    for (category, sum, budget) in over_budget_categories(&indicators, config) {
        log::warn!(
            "Category {category} has {sum:.2} total indicator weight against a {budget:.2} budget"
        );
    }

    // Per-indicator normalized maps, falling back to the closest year with
    // data for lagged sources.
    let mut maps: Vec<(Indicator, BTreeMap<String, f64>)> = Vec::new();
    let mut fallback_years: BTreeMap<String, i32> = BTreeMap::new();

    for indicator in indicators {
        let mut map = queries::get_normalized_map(db, indicator.id, year).await?;
        if map.is_empty() {
            if let Some(other_year) =
                queries::closest_year_with_normalized(db, indicator.id, year).await?
            {
                map = queries::get_normalized_map(db, indicator.id, other_year).await?;
                if !map.is_empty() {
                    log::info!(
                        "Indicator {} has no {year} data, falling back to {other_year}",
                        indicator.slug
                    );
                    fallback_years.insert(indicator.slug.clone(), other_year);
                }
            }
        }
        if !map.is_empty() {
            maps.push((indicator, map));
        }
    }

    if maps.is_empty() {
        return Err(ScoringError::NoUsableIndicators { year });
    }

    let indicators_used_json = serde_json::json!(
        maps.iter()
            .map(|(i, _)| {
                serde_json::json!({
                    "slug": i.slug,
                    "weight": i.weight,
                    "direction": i.direction,
                    "fallback_year": fallback_years.get(&i.slug),
                })
            })
            .collect::<Vec<_>>()
    );

    let version_id =
        queries::create_draft_version(db, year, tenant.tenant_id, &indicators_used_json).await?;
    queries::delete_scores_for_version(db, version_id).await?;

    let penalties = queries::get_active_penalties(db).await?;
    let vulnerability =
        queries::get_vulnerability_mappings(db, config.scoring.penalty_overlap_fraction).await?;
    let mut tiers_by_area: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for mapping in &vulnerability {
        tiers_by_area
            .entry(mapping.deso_code.as_str())
            .or_default()
            .push(mapping.tier.as_str());
    }
    let areas = queries::get_areas(db).await?;

    let mut scores: Vec<CompositeScore> = Vec::with_capacity(areas.len());

    for area in &areas {
        let inputs: Vec<FactorInput> = maps
            .iter()
            .filter_map(|(indicator, map)| {
                map.get(&area.deso_code).map(|normalized| FactorInput {
                    slug: indicator.slug.clone(),
                    weight: indicator.weight,
                    effective: effective_value(indicator.direction, *normalized),
                })
            })
            .collect();

        let Some(raw_score) = blend(&inputs) else {
            continue;
        };

        let triggered: Vec<&ScorePenalty> = tiers_by_area
            .get(area.deso_code.as_str())
            .map_or_else(Vec::new, |tiers| {
                penalties
                    .iter()
                    .filter(|p| penalty_applies(p, tiers))
                    .collect()
            });

        let (final_score, applied) = apply_penalties(raw_score, &triggered);
        let (top_positive, top_negative) =
            top_factors(&inputs, config.scoring.top_factor_count);

        let factor_scores = serde_json::json!(
            inputs
                .iter()
                .map(|i| (i.slug.clone(), i.effective))
                .collect::<BTreeMap<String, f64>>()
        );

        scores.push(CompositeScore {
            deso_code: area.deso_code.clone(),
            year,
            score_version_id: version_id,
            score: final_score,
            raw_score_before_penalties: (!applied.is_empty()).then_some(raw_score),
            trend_1y: None,
            trend_3y: None,
            factor_scores,
            top_positive,
            top_negative,
            penalties_applied: (!applied.is_empty())
                .then(|| serde_json::json!(applied)),
        });
    }

    let written = queries::insert_composite_scores(db, &scores).await?;
    queries::update_version_stats(db, version_id).await?;

    // 1-year trend against the currently published version for last year.
    if let Some(previous) = queries::latest_published_version(db, year - 1).await? {
        queries::backfill_score_trends(db, version_id, previous.id).await?;
    }

    log::info!(
        "Computed {written} composite scores for {year} under version {version_id}"
    );

    Ok(ComputeSummary {
        version_id,
        areas_scored: scores.len(),
        indicators_used: maps.len(),
        fallback_years,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvarter_models::{
        IndicatorCategory, NormalizationMethod, NormalizationScope, TenantWeight,
    };

    fn input(slug: &str, weight: f64, effective: f64) -> FactorInput {
        FactorInput {
            slug: slug.to_string(),
            weight,
            effective,
        }
    }

    fn penalty(slug: &str, category: &str, penalty_type: PenaltyType, value: f64) -> ScorePenalty {
        ScorePenalty {
            id: 1,
            slug: slug.to_string(),
            name: slug.to_string(),
            category: category.to_string(),
            penalty_type,
            penalty_value: value,
            is_active: true,
        }
    }

    #[test]
    fn negative_direction_inverts() {
        assert!((effective_value(Direction::Negative, 0.8) - 0.2).abs() < 1e-12);
        assert!((effective_value(Direction::Positive, 0.8) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn blend_renormalizes_over_available_weight() {
        // Only half the configured weight has data; the score should not
        // be dragged down by the missing half.
        let inputs = vec![input("a", 0.25, 0.8), input("b", 0.25, 0.6)];
        let score = blend(&inputs).unwrap();
        assert!((score - 70.0).abs() < 1e-9);
    }

    #[test]
    fn blend_empty_is_none() {
        assert!(blend(&[]).is_none());
    }

    #[test]
    fn all_median_percentiles_blend_to_fifty() {
        let inputs = vec![
            input("safety", 0.25, 0.5),
            input("economy", 0.25, 0.5),
            input("education", 0.20, 0.5),
            input("proximity", 0.30, 0.5),
        ];
        let score = blend(&inputs).unwrap();
        assert!((score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn top_factors_respect_thresholds_and_limit() {
        let inputs = vec![
            input("s1", 0.1, 0.95),
            input("s2", 0.1, 0.85),
            input("s3", 0.1, 0.75),
            input("s4", 0.1, 0.71),
            input("mid", 0.1, 0.5),
            input("w1", 0.1, 0.1),
        ];

        let (positive, negative) = top_factors(&inputs, 3);
        assert_eq!(positive, vec!["s1", "s2", "s3"]);
        assert_eq!(negative, vec!["w1"]);
    }

    #[test]
    fn penalties_never_stack_within_category() {
        let a = penalty("utsatt", "vulnerability", PenaltyType::Absolute, -5.0);
        let b = penalty(
            "sarskilt_utsatt",
            "vulnerability",
            PenaltyType::Absolute,
            -12.0,
        );

        let (score, applied) = apply_penalties(60.0, &[&a, &b]);
        assert!((score - 48.0).abs() < 1e-9);
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].slug, "sarskilt_utsatt");
    }

    #[test]
    fn percentage_penalty_scales_with_raw_score() {
        let p = penalty("pct", "vulnerability", PenaltyType::Percentage, -10.0);
        let (score, applied) = apply_penalties(80.0, &[&p]);
        assert!((score - 72.0).abs() < 1e-9);
        assert!((applied[0].amount + 8.0).abs() < 1e-9);
    }

    #[test]
    fn penalised_score_clamps_at_zero() {
        let p = penalty("huge", "vulnerability", PenaltyType::Absolute, -500.0);
        let (score, _) = apply_penalties(30.0, &[&p]);
        assert!(score.abs() < f64::EPSILON);
    }

    fn indicator(id: i32, slug: &str, weight: f64, direction: Direction) -> Indicator {
        Indicator {
            id,
            slug: slug.to_string(),
            name: slug.to_string(),
            source: "scb".to_string(),
            category: IndicatorCategory::Economy,
            direction,
            weight,
            normalization: NormalizationMethod::RankPercentile,
            normalization_scope: NormalizationScope::National,
            is_active: true,
        }
    }

    #[test]
    fn tenant_overrides_replace_defaults() {
        let base = vec![
            indicator(1, "income", 0.3, Direction::Positive),
            indicator(2, "crime", 0.2, Direction::Negative),
        ];
        let overrides = vec![TenantWeight {
            indicator_id: 1,
            weight: 0.9,
            direction: Direction::Positive,
            is_active: true,
        }];

        let effective = effective_indicators(&base, &overrides, &[]);
        let income = effective.iter().find(|i| i.slug == "income").unwrap();
        assert!((income.weight - 0.9).abs() < 1e-12);
    }

    #[test]
    fn penalty_fires_only_on_its_own_tier() {
        let light = penalty("vuln_utsatt", "vulnerability", PenaltyType::Absolute, -8.0);
        let heavy = penalty(
            "vuln_sarskilt_utsatt",
            "vulnerability",
            PenaltyType::Absolute,
            -12.0,
        );
        let tiers = ["utsatt"];

        assert!(penalty_applies(&light, &tiers));
        assert!(!penalty_applies(&heavy, &tiers));

        // An utsatt-only area takes the -8, never the harsher -12.
        let triggered: Vec<&ScorePenalty> = [&light, &heavy]
            .into_iter()
            .filter(|p| penalty_applies(p, &tiers))
            .collect();
        let (score, applied) = apply_penalties(60.0, &triggered);
        assert!((score - 52.0).abs() < 1e-9);
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].slug, "vuln_utsatt");
    }

    #[test]
    fn unmapped_area_triggers_no_penalty() {
        let p = penalty("vuln_utsatt", "vulnerability", PenaltyType::Absolute, -8.0);
        assert!(!penalty_applies(&p, &[]));
        assert!(!penalty_applies(&p, &["sarskilt_utsatt"]));
    }

    #[test]
    fn inactive_override_drops_indicator() {
        let base = vec![
            indicator(1, "income", 0.3, Direction::Positive),
            indicator(2, "crime", 0.2, Direction::Negative),
        ];
        let overrides = vec![TenantWeight {
            indicator_id: 2,
            weight: 0.2,
            direction: Direction::Negative,
            is_active: false,
        }];

        let effective = effective_indicators(&base, &overrides, &[]);
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].slug, "income");
    }

    #[test]
    fn category_over_its_weight_budget_is_flagged() {
        let config = EngineConfig::load().unwrap();
        // Two economy indicators at 0.30 against the 0.25 budget.
        let indicators = vec![
            indicator(1, "income", 0.2, Direction::Positive),
            indicator(2, "debt", 0.1, Direction::Negative),
        ];

        let over = over_budget_categories(&indicators, &config);
        assert_eq!(over.len(), 1);
        assert_eq!(over[0].0, "economy");
        assert!((over[0].1 - 0.3).abs() < 1e-9);

        let within = vec![indicator(1, "income", 0.25, Direction::Positive)];
        assert!(over_budget_categories(&within, &config).is_empty());
    }

    #[test]
    fn profile_scores_land_in_expected_bands() {
        // Affluent suburb profile: strong effective values everywhere.
        let wealthy = vec![
            input("median_income", 0.25, 0.9),
            input("crime_total_rate", 0.25, 0.88),
            input("education_post_secondary_pct", 0.20, 0.85),
            input("proximity_composite", 0.30, 0.8),
        ];
        let score = blend(&wealthy).unwrap();
        assert!((65.0..=95.0).contains(&score), "got {score}");

        // Disadvantaged profile: weak values plus a vulnerability penalty.
        let weak = vec![
            input("median_income", 0.25, 0.1),
            input("crime_total_rate", 0.25, 0.12),
            input("education_post_secondary_pct", 0.20, 0.15),
            input("proximity_composite", 0.30, 0.1),
        ];
        let raw = blend(&weak).unwrap();
        let p = penalty("vuln_utsatt", "vulnerability", PenaltyType::Absolute, -8.0);
        let triggered: Vec<&ScorePenalty> = [&p]
            .into_iter()
            .filter(|p| penalty_applies(p, &["utsatt"]))
            .collect();
        let (final_score, _) = apply_penalties(raw, &triggered);
        assert!((2.0..=25.0).contains(&final_score), "got {final_score}");
    }

    #[test]
    fn blocked_and_neutral_indicators_excluded() {
        let base = vec![
            indicator(1, "income", 0.3, Direction::Positive),
            indicator(2, "reference_only", 0.2, Direction::Neutral),
            indicator(3, "crime", 0.2, Direction::Negative),
        ];
        let blocked = vec!["crime".to_string()];

        let effective = effective_indicators(&base, &[], &blocked);
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].slug, "income");
    }
}
