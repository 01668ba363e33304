#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cast_precision_loss)]

//! Turns raw indicator values into comparable values in `[0, 1]`.
//!
//! Normalized values always mean "how high is this raw number within its
//! scope" regardless of indicator direction; direction is applied later by
//! the composite scorer. NULL raw values are never normalized and never
//! default to anything.

use std::collections::BTreeMap;

use kvarter_database::{DbError, queries};
use kvarter_models::{
    DesoArea, Indicator, NormalizationMethod, NormalizationScope, UrbanityTier,
};
use switchy_database::Database;

/// Errors raised during normalization.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    /// Database error.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Normalizes one scope's values with the given method.
///
/// Input is `(deso_code, raw_value)`; output preserves codes. A scope with
/// fewer than 2 values yields nothing (the rows keep a NULL
/// normalized_value, there is no basis for a rank). A scope where every
/// value is identical maps to 0.5 for all entries.
#[must_use]
pub fn normalize_scope(
    method: NormalizationMethod,
    values: &[(String, f64)],
) -> Vec<(String, f64)> {
    if values.len() < 2 {
        return vec![];
    }

    match method {
        NormalizationMethod::RankPercentile => rank_percentile(values),
        NormalizationMethod::MinMax => min_max(values),
        NormalizationMethod::ZScore => z_score(values),
    }
}

/// `(rank - 1) / (n - 1)` over ascending raw values, ties sharing the mean
/// percentile of their rank span.
fn rank_percentile(values: &[(String, f64)]) -> Vec<(String, f64)> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].1.total_cmp(&values[b].1));

    let denom = (n - 1) as f64;
    let mut result = vec![0.0f64; n];

    // Walk runs of equal values so ties share one percentile.
    let mut start = 0usize;
    while start < n {
        let mut end = start;
        while end + 1 < n
            && (values[order[end + 1]].1 - values[order[start]].1).abs() < f64::EPSILON
        {
            end += 1;
        }

        let mean_rank = (start + end) as f64 / 2.0;
        let percentile = mean_rank / denom;
        for &idx in &order[start..=end] {
            result[idx] = percentile;
        }

        start = end + 1;
    }

    values
        .iter()
        .zip(result)
        .map(|((code, _), p)| (code.clone(), p))
        .collect()
}

/// `(value - min) / (max - min)`, clamped to `[0, 1]`.
fn min_max(values: &[(String, f64)]) -> Vec<(String, f64)> {
    let min = values.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
    let max = values
        .iter()
        .map(|(_, v)| *v)
        .fold(f64::NEG_INFINITY, f64::max);

    if (max - min).abs() < f64::EPSILON {
        return values.iter().map(|(code, _)| (code.clone(), 0.5)).collect();
    }

    values
        .iter()
        .map(|(code, v)| (code.clone(), ((v - min) / (max - min)).clamp(0.0, 1.0)))
        .collect()
}

/// `(value - mean) / stddev`, squashed into `(0, 1)` with a logistic curve
/// so extreme outliers saturate instead of dominating.
fn z_score(values: &[(String, f64)]) -> Vec<(String, f64)> {
    let n = values.len() as f64;
    let mean = values.iter().map(|(_, v)| v).sum::<f64>() / n;
    let stddev = (values.iter().map(|(_, v)| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

    if stddev < f64::EPSILON {
        return values.iter().map(|(code, _)| (code.clone(), 0.5)).collect();
    }

    values
        .iter()
        .map(|(code, v)| {
            let z = (v - mean) / stddev;
            (code.clone(), 1.0 / (1.0 + (-z).exp()))
        })
        .collect()
}

/// Splits values into normalization scopes per the indicator's
/// configuration: one national scope, or one per urbanity tier.
#[must_use]
pub fn partition_scopes(
    scope: NormalizationScope,
    values: Vec<(String, f64)>,
    tiers: &BTreeMap<String, UrbanityTier>,
) -> Vec<Vec<(String, f64)>> {
    match scope {
        NormalizationScope::National => vec![values],
        NormalizationScope::UrbanityStratified => {
            let mut by_tier: BTreeMap<UrbanityTier, Vec<(String, f64)>> = BTreeMap::new();
            for (code, value) in values {
                // Areas missing a tier classification count as rural.
                let tier = tiers.get(&code).copied().unwrap_or(UrbanityTier::Rural);
                by_tier.entry(tier).or_default().push((code, value));
            }
            by_tier.into_values().collect()
        }
    }
}

/// Normalizes one indicator for one year and stores the results.
///
/// Returns the number of rows that received a normalized value.
///
/// # Errors
///
/// Returns [`NormalizeError`] if any database operation fails.
pub async fn normalize_indicator(
    db: &dyn Database,
    indicator: &Indicator,
    year: i32,
    areas: &[DesoArea],
) -> Result<u64, NormalizeError> {
    let raw = queries::get_raw_values(db, indicator.id, year).await?;
    let present: Vec<(String, f64)> = raw
        .into_iter()
        .filter_map(|(code, value)| value.map(|v| (code, v)))
        .collect();

    if present.is_empty() {
        log::debug!("No raw values for {} in {year}, skipping", indicator.slug);
        return Ok(0);
    }

    let tiers: BTreeMap<String, UrbanityTier> = areas
        .iter()
        .map(|a| (a.deso_code.clone(), a.urbanity_tier))
        .collect();

    let mut normalized: Vec<(String, f64)> = Vec::with_capacity(present.len());
    for scope_values in partition_scopes(indicator.normalization_scope, present, &tiers) {
        normalized.extend(normalize_scope(indicator.normalization, &scope_values));
    }

    let written = queries::store_normalized_values(db, indicator.id, year, &normalized).await?;
    log::info!(
        "Normalized {written} values for {} ({}, {})",
        indicator.slug,
        indicator.normalization,
        indicator.normalization_scope
    );

    Ok(written)
}

/// Normalizes every active indicator for a year.
///
/// # Errors
///
/// Returns [`NormalizeError`] if any database operation fails.
pub async fn normalize_year(db: &dyn Database, year: i32) -> Result<u64, NormalizeError> {
    let indicators = queries::get_active_indicators(db).await?;
    let areas = queries::get_areas(db).await?;

    let mut total = 0u64;
    for indicator in &indicators {
        total += normalize_indicator(db, indicator, year, &areas).await?;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(values: &[f64]) -> Vec<(String, f64)> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("deso-{i}"), *v))
            .collect()
    }

    fn value_of(result: &[(String, f64)], code: &str) -> f64 {
        result.iter().find(|(c, _)| c == code).unwrap().1
    }

    #[test]
    fn rank_percentile_spans_zero_to_one() {
        let result = rank_percentile(&named(&[10.0, 20.0, 30.0, 40.0, 50.0]));
        assert!((value_of(&result, "deso-0") - 0.0).abs() < 1e-12);
        assert!((value_of(&result, "deso-2") - 0.5).abs() < 1e-12);
        assert!((value_of(&result, "deso-4") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rank_percentile_ties_share_mean() {
        // Values 10, 20, 20, 30: the two 20s occupy ranks 1 and 2
        // (0-based), so both get (1+2)/2 / 3 = 0.5.
        let result = rank_percentile(&named(&[10.0, 20.0, 20.0, 30.0]));
        assert!((value_of(&result, "deso-1") - 0.5).abs() < 1e-12);
        assert!((value_of(&result, "deso-2") - 0.5).abs() < 1e-12);
    }

    #[test]
    fn undersized_scope_yields_nothing() {
        for method in [
            NormalizationMethod::RankPercentile,
            NormalizationMethod::MinMax,
            NormalizationMethod::ZScore,
        ] {
            assert!(normalize_scope(method, &named(&[42.0])).is_empty());
            assert!(normalize_scope(method, &[]).is_empty());
        }
    }

    #[test]
    fn min_max_clamps_and_scales() {
        let result = min_max(&named(&[0.0, 50.0, 100.0]));
        assert!((value_of(&result, "deso-0") - 0.0).abs() < 1e-12);
        assert!((value_of(&result, "deso-1") - 0.5).abs() < 1e-12);
        assert!((value_of(&result, "deso-2") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn constant_values_map_to_half() {
        for method in [
            NormalizationMethod::RankPercentile,
            NormalizationMethod::MinMax,
            NormalizationMethod::ZScore,
        ] {
            let result = normalize_scope(method, &named(&[7.0, 7.0, 7.0]));
            for (_, v) in result {
                assert!((v - 0.5).abs() < 1e-9, "{method} gave {v}");
            }
        }
    }

    #[test]
    fn z_score_stays_in_open_unit_interval() {
        let result = z_score(&named(&[1.0, 2.0, 3.0, 4.0, 1000.0]));
        for (_, v) in &result {
            assert!(*v > 0.0 && *v < 1.0);
        }
        // The extreme outlier saturates near 1 without leaving the range.
        assert!(value_of(&result, "deso-4") > 0.85);
    }

    #[test]
    fn stratified_partition_groups_by_tier() {
        let mut tiers = BTreeMap::new();
        tiers.insert("a".to_string(), UrbanityTier::Urban);
        tiers.insert("b".to_string(), UrbanityTier::Urban);
        tiers.insert("c".to_string(), UrbanityTier::Rural);

        let values = vec![
            ("a".to_string(), 1.0),
            ("b".to_string(), 2.0),
            ("c".to_string(), 3.0),
        ];

        let scopes = partition_scopes(NormalizationScope::UrbanityStratified, values, &tiers);
        assert_eq!(scopes.len(), 2);
        let sizes: Vec<usize> = scopes.iter().map(Vec::len).collect();
        assert!(sizes.contains(&2) && sizes.contains(&1));
    }

    #[test]
    fn unknown_tier_defaults_to_rural() {
        let tiers = BTreeMap::new();
        let values = vec![("x".to_string(), 1.0)];
        let scopes = partition_scopes(NormalizationScope::UrbanityStratified, values, &tiers);
        assert_eq!(scopes.len(), 1);
    }

    #[test]
    fn national_scope_is_single_partition() {
        let values = named(&[1.0, 2.0]);
        let scopes = partition_scopes(NormalizationScope::National, values, &BTreeMap::new());
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].len(), 2);
    }
}
