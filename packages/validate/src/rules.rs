//! Pure rule evaluators.
//!
//! Every evaluator takes the batch plus context and returns a
//! [`RuleOutcome`] without touching the database, so rules are testable
//! against in-memory fixtures.

use std::collections::{BTreeMap, BTreeSet};

use kvarter_models::{RuleOutcome, RuleType, ValidationRule, ValidationStatus};

/// One incoming value in a source batch.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub indicator_slug: String,
    pub deso_code: String,
    pub value: Option<f64>,
}

/// A batch of incoming values for one source and year.
#[derive(Debug, Clone)]
pub struct ValueBatch {
    pub source: String,
    pub year: i32,
    pub rows: Vec<BatchRow>,
}

/// Reference data the evaluators compare the batch against.
#[derive(Debug, Clone, Default)]
pub struct BatchContext {
    /// Total DeSO areas in the country, the completeness denominator.
    pub expected_area_count: usize,
    /// `indicator_slug -> deso_code -> prior-year value`.
    pub prior_values: BTreeMap<String, BTreeMap<String, f64>>,
    /// `indicator_id -> slug`, for rules pinned to one indicator.
    pub indicator_slugs: BTreeMap<i32, String>,
    /// Null rate of the prior ingestion run for this source, in percent.
    pub prior_null_rate_pct: Option<f64>,
}

fn param_f64(rule: &ValidationRule, key: &str, default: f64) -> f64 {
    rule.parameters
        .get(key)
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(default)
}

fn param_usize(rule: &ValidationRule, key: &str, default: usize) -> usize {
    rule.parameters
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .map_or(default, |v| usize::try_from(v).unwrap_or(default))
}

fn outcome(
    rule: &ValidationRule,
    status: ValidationStatus,
    affected_count: i64,
    message: String,
    affected_indicators: Vec<String>,
) -> RuleOutcome {
    RuleOutcome {
        rule_name: rule.name.clone(),
        rule_type: rule.rule_type,
        status,
        severity: rule.severity,
        blocks_scoring: rule.blocks_scoring,
        affected_count,
        message,
        affected_indicators,
    }
}

/// Rows the rule applies to: all of them, or only the pinned indicator's.
fn target_rows<'a>(
    rule: &ValidationRule,
    batch: &'a ValueBatch,
    ctx: &BatchContext,
) -> Vec<&'a BatchRow> {
    let pinned_slug = rule
        .indicator_id
        .and_then(|id| ctx.indicator_slugs.get(&id));

    batch
        .rows
        .iter()
        .filter(|row| pinned_slug.is_none_or(|slug| &row.indicator_slug == slug))
        .collect()
}

fn slugs_of(rows: &[&BatchRow]) -> BTreeSet<String> {
    rows.iter().map(|r| r.indicator_slug.clone()).collect()
}

/// Evaluates one rule against a batch.
#[must_use]
pub fn evaluate_rule(rule: &ValidationRule, batch: &ValueBatch, ctx: &BatchContext) -> RuleOutcome {
    match rule.rule_type {
        RuleType::Range => evaluate_range(rule, batch, ctx),
        RuleType::Completeness => evaluate_completeness(rule, batch, ctx),
        RuleType::ChangeRate => evaluate_change_rate(rule, batch, ctx),
        RuleType::Distribution => evaluate_distribution(rule, batch, ctx),
        RuleType::GlobalMinCount => evaluate_global_min_count(rule, batch),
        RuleType::GlobalNoIdentical => evaluate_global_no_identical(rule, batch, ctx),
        RuleType::GlobalNullSpike => evaluate_global_null_spike(rule, batch, ctx),
    }
}

fn evaluate_range(rule: &ValidationRule, batch: &ValueBatch, ctx: &BatchContext) -> RuleOutcome {
    let min = param_f64(rule, "min", f64::NEG_INFINITY);
    let max = param_f64(rule, "max", f64::INFINITY);

    let rows = target_rows(rule, batch, ctx);
    let offenders: Vec<&&BatchRow> = rows
        .iter()
        .filter(|row| row.value.is_some_and(|v| v < min || v > max))
        .collect();

    if offenders.is_empty() {
        return outcome(
            rule,
            ValidationStatus::Passed,
            0,
            format!("All values within [{min}, {max}]"),
            vec![],
        );
    }

    let affected: BTreeSet<String> = offenders
        .iter()
        .map(|row| row.indicator_slug.clone())
        .collect();

    outcome(
        rule,
        ValidationStatus::Failed,
        offenders.len() as i64,
        format!(
            "{} values outside [{min}, {max}]",
            offenders.len()
        ),
        affected.into_iter().collect(),
    )
}

fn evaluate_completeness(
    rule: &ValidationRule,
    batch: &ValueBatch,
    ctx: &BatchContext,
) -> RuleOutcome {
    let min_coverage_pct = param_f64(rule, "min_coverage_pct", 90.0);

    if ctx.expected_area_count == 0 {
        return outcome(
            rule,
            ValidationStatus::Skipped,
            0,
            "No area universe to measure coverage against".to_string(),
            vec![],
        );
    }

    let rows = target_rows(rule, batch, ctx);
    let mut covered: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    for row in &rows {
        if row.value.is_some() {
            covered
                .entry(row.indicator_slug.clone())
                .or_default()
                .insert(row.deso_code.as_str());
        }
    }

    let mut failing: Vec<String> = Vec::new();
    let mut missing_total = 0i64;
    for slug in slugs_of(&rows) {
        let have = covered.get(&slug).map_or(0, BTreeSet::len);
        #[allow(clippy::cast_precision_loss)]
        let coverage_pct = have as f64 / ctx.expected_area_count as f64 * 100.0;
        if coverage_pct < min_coverage_pct {
            missing_total += (ctx.expected_area_count - have) as i64;
            failing.push(slug);
        }
    }

    if failing.is_empty() {
        outcome(
            rule,
            ValidationStatus::Passed,
            0,
            format!("Coverage at or above {min_coverage_pct}% for every indicator"),
            vec![],
        )
    } else {
        outcome(
            rule,
            ValidationStatus::Failed,
            missing_total,
            format!(
                "{} indicator(s) below {min_coverage_pct}% area coverage",
                failing.len()
            ),
            failing,
        )
    }
}

fn median(sorted: &mut [f64]) -> f64 {
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        f64::midpoint(sorted[n / 2 - 1], sorted[n / 2])
    }
}

fn evaluate_change_rate(
    rule: &ValidationRule,
    batch: &ValueBatch,
    ctx: &BatchContext,
) -> RuleOutcome {
    let max_change_pct = param_f64(rule, "max_change_pct", 50.0);

    if ctx.prior_values.is_empty() {
        return outcome(
            rule,
            ValidationStatus::Skipped,
            0,
            "No prior-year data to compare against".to_string(),
            vec![],
        );
    }

    let rows = target_rows(rule, batch, ctx);
    let mut changes: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for row in &rows {
        let Some(value) = row.value else { continue };
        let Some(prior) = ctx
            .prior_values
            .get(&row.indicator_slug)
            .and_then(|m| m.get(&row.deso_code))
        else {
            continue;
        };
        if prior.abs() < f64::EPSILON {
            continue;
        }

        changes
            .entry(row.indicator_slug.clone())
            .or_default()
            .push(((value - prior) / prior).abs() * 100.0);
    }

    if changes.is_empty() {
        return outcome(
            rule,
            ValidationStatus::Skipped,
            0,
            "No comparable prior values".to_string(),
            vec![],
        );
    }

    // A typo'd unit or a re-based series moves the whole distribution, so
    // the median is the signal; individual outliers are legitimate.
    let mut failing: Vec<(String, f64, usize)> = Vec::new();
    for (slug, mut pcts) in changes {
        let count = pcts.len();
        let med = median(&mut pcts);
        if med > max_change_pct {
            failing.push((slug, med, count));
        }
    }

    if failing.is_empty() {
        outcome(
            rule,
            ValidationStatus::Passed,
            0,
            format!("Median year-over-year change within {max_change_pct}%"),
            vec![],
        )
    } else {
        let affected: i64 = failing.iter().map(|(_, _, n)| *n as i64).sum();
        let worst = failing
            .iter()
            .map(|(_, med, _)| *med)
            .fold(0.0f64, f64::max);
        outcome(
            rule,
            ValidationStatus::Failed,
            affected,
            format!(
                "{} indicator(s) with a median change above {max_change_pct}% (worst {worst:.1}%)",
                failing.len()
            ),
            failing.into_iter().map(|(slug, _, _)| slug).collect(),
        )
    }
}

fn evaluate_distribution(
    rule: &ValidationRule,
    batch: &ValueBatch,
    ctx: &BatchContext,
) -> RuleOutcome {
    let mean_min = param_f64(rule, "expected_mean_min", f64::NEG_INFINITY);
    let mean_max = param_f64(rule, "expected_mean_max", f64::INFINITY);
    let stddev_min = param_f64(rule, "expected_stddev_min", 0.0);
    let stddev_max = param_f64(rule, "expected_stddev_max", f64::INFINITY);

    let rows = target_rows(rule, batch, ctx);
    let mut failing: Vec<String> = Vec::new();
    let mut checked = 0usize;

    // Absolute bounds on the batch's own shape, so a unit error (income in
    // thousands) or a collapsed extract fails even on the first year.
    for slug in slugs_of(&rows) {
        let values: Vec<f64> = rows
            .iter()
            .filter(|r| r.indicator_slug == slug)
            .filter_map(|r| r.value)
            .collect();
        if values.len() < 2 {
            continue;
        }
        checked += 1;

        let m = mean(&values);
        let sd = stddev(&values, m);
        if m < mean_min || m > mean_max || sd < stddev_min || sd > stddev_max {
            failing.push(slug);
        }
    }

    if checked == 0 {
        return outcome(
            rule,
            ValidationStatus::Skipped,
            0,
            "Too few values to measure a distribution".to_string(),
            vec![],
        );
    }

    if failing.is_empty() {
        outcome(
            rule,
            ValidationStatus::Passed,
            0,
            format!(
                "Mean within [{mean_min}, {mean_max}], stddev within [{stddev_min}, {stddev_max}]"
            ),
            vec![],
        )
    } else {
        outcome(
            rule,
            ValidationStatus::Failed,
            failing.len() as i64,
            format!(
                "{} indicator(s) with mean or stddev outside expected bounds",
                failing.len()
            ),
            failing,
        )
    }
}

fn evaluate_global_min_count(rule: &ValidationRule, batch: &ValueBatch) -> RuleOutcome {
    let min_deso_count = param_usize(rule, "min_deso_count", 1000);

    // Distinct areas, not rows: a truncated extract repeated across many
    // indicators still covers too few areas.
    let areas: BTreeSet<&str> = batch.rows.iter().map(|r| r.deso_code.as_str()).collect();
    let total = areas.len();

    if total >= min_deso_count {
        outcome(
            rule,
            ValidationStatus::Passed,
            total as i64,
            format!("Batch covers {total} areas (minimum {min_deso_count})"),
            vec![],
        )
    } else {
        outcome(
            rule,
            ValidationStatus::Failed,
            total as i64,
            format!("Batch covers only {total} areas, expected at least {min_deso_count}"),
            batch
                .rows
                .iter()
                .map(|r| r.indicator_slug.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        )
    }
}

fn evaluate_global_no_identical(
    rule: &ValidationRule,
    batch: &ValueBatch,
    ctx: &BatchContext,
) -> RuleOutcome {
    let min_values = param_usize(rule, "min_values", 10);
    let rows = target_rows(rule, batch, ctx);

    let mut failing: Vec<String> = Vec::new();
    for slug in slugs_of(&rows) {
        let values: Vec<f64> = rows
            .iter()
            .filter(|r| r.indicator_slug == slug)
            .filter_map(|r| r.value)
            .collect();
        if values.len() >= min_values
            && values
                .iter()
                .all(|v| (v - values[0]).abs() < f64::EPSILON)
        {
            failing.push(slug);
        }
    }

    if failing.is_empty() {
        outcome(
            rule,
            ValidationStatus::Passed,
            0,
            "No indicator has an all-identical value set".to_string(),
            vec![],
        )
    } else {
        outcome(
            rule,
            ValidationStatus::Failed,
            failing.len() as i64,
            format!(
                "{} indicator(s) with every value identical, likely a broken extract",
                failing.len()
            ),
            failing,
        )
    }
}

fn evaluate_global_null_spike(
    rule: &ValidationRule,
    batch: &ValueBatch,
    ctx: &BatchContext,
) -> RuleOutcome {
    let max_null_increase_pct = param_f64(rule, "max_null_increase_pct", 20.0);
    let total = batch.rows.len();

    if total == 0 {
        return outcome(
            rule,
            ValidationStatus::Skipped,
            0,
            "Empty batch".to_string(),
            vec![],
        );
    }
    let Some(prior_rate) = ctx.prior_null_rate_pct else {
        return outcome(
            rule,
            ValidationStatus::Skipped,
            0,
            "No prior run to compare null rates against".to_string(),
            vec![],
        );
    };

    let nulls = batch.rows.iter().filter(|r| r.value.is_none()).count();
    #[allow(clippy::cast_precision_loss)]
    let null_pct = nulls as f64 / total as f64 * 100.0;
    let increase = null_pct - prior_rate;

    if increase > max_null_increase_pct {
        let affected: BTreeSet<String> = batch
            .rows
            .iter()
            .filter(|r| r.value.is_none())
            .map(|r| r.indicator_slug.clone())
            .collect();
        outcome(
            rule,
            ValidationStatus::Failed,
            nulls as i64,
            format!(
                "Null rate jumped from {prior_rate:.1}% to {null_pct:.1}% (limit +{max_null_increase_pct}%)"
            ),
            affected.into_iter().collect(),
        )
    } else {
        outcome(
            rule,
            ValidationStatus::Passed,
            nulls as i64,
            format!("Null rate {null_pct:.1}% vs {prior_rate:.1}% prior, within limit"),
            vec![],
        )
    }
}

fn mean(values: &[f64]) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    values.iter().sum::<f64>() / n
}

fn stddev(values: &[f64], mean: f64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvarter_models::{RuleSeverity, RuleType};

    fn rule(rule_type: RuleType, parameters: serde_json::Value, blocks: bool) -> ValidationRule {
        ValidationRule {
            id: 1,
            name: format!("{rule_type} check"),
            rule_type,
            source: Some("scb".to_string()),
            indicator_id: None,
            severity: RuleSeverity::Error,
            blocks_scoring: blocks,
            parameters,
            is_active: true,
        }
    }

    fn batch(rows: Vec<(&str, &str, Option<f64>)>) -> ValueBatch {
        ValueBatch {
            source: "scb".to_string(),
            year: 2024,
            rows: rows
                .into_iter()
                .map(|(slug, deso, value)| BatchRow {
                    indicator_slug: slug.to_string(),
                    deso_code: deso.to_string(),
                    value,
                })
                .collect(),
        }
    }

    #[test]
    fn range_flags_out_of_bounds_values() {
        let r = rule(
            RuleType::Range,
            serde_json::json!({"min": 0.0, "max": 100.0}),
            true,
        );
        let b = batch(vec![
            ("median_income", "0180C1010", Some(42.0)),
            ("median_income", "0180C1020", Some(140.0)),
            ("median_income", "0180C1030", Some(-5.0)),
        ]);

        let out = evaluate_rule(&r, &b, &BatchContext::default());
        assert_eq!(out.status, ValidationStatus::Failed);
        assert_eq!(out.affected_count, 2);
        assert_eq!(out.affected_indicators, vec!["median_income".to_string()]);
        assert!(out.is_blocking_failure());
    }

    #[test]
    fn range_ignores_nulls() {
        let r = rule(RuleType::Range, serde_json::json!({"min": 0.0}), true);
        let b = batch(vec![("median_income", "0180C1010", None)]);
        let out = evaluate_rule(&r, &b, &BatchContext::default());
        assert_eq!(out.status, ValidationStatus::Passed);
    }

    #[test]
    fn completeness_fails_below_coverage() {
        let r = rule(
            RuleType::Completeness,
            serde_json::json!({"min_coverage_pct": 90.0}),
            true,
        );
        let b = batch(vec![
            ("school_results", "0180C1010", Some(210.0)),
            ("school_results", "0180C1020", None),
        ]);
        let ctx = BatchContext {
            expected_area_count: 10,
            ..Default::default()
        };

        let out = evaluate_rule(&r, &b, &ctx);
        assert_eq!(out.status, ValidationStatus::Failed);
        assert_eq!(out.affected_indicators, vec!["school_results".to_string()]);
    }

    #[test]
    fn half_coverage_is_a_nonblocking_warning() {
        let mut r = rule(
            RuleType::Completeness,
            serde_json::json!({"min_coverage_pct": 85.0}),
            false,
        );
        r.severity = RuleSeverity::Warning;

        let b = batch(vec![
            ("school_results", "0180C1010", Some(210.0)),
            ("school_results", "0180C1020", Some(195.0)),
        ]);
        let ctx = BatchContext {
            expected_area_count: 4,
            ..Default::default()
        };

        let out = evaluate_rule(&r, &b, &ctx);
        assert_eq!(out.status, ValidationStatus::Failed);
        assert!(!out.is_blocking_failure());
    }

    #[test]
    fn change_rate_skipped_without_prior_data() {
        let r = rule(RuleType::ChangeRate, serde_json::json!({}), false);
        let b = batch(vec![("crime_rate", "0180C1010", Some(12.0))]);
        let out = evaluate_rule(&r, &b, &BatchContext::default());
        assert_eq!(out.status, ValidationStatus::Skipped);
    }

    #[test]
    fn change_rate_flags_shifted_median() {
        let r = rule(
            RuleType::ChangeRate,
            serde_json::json!({"max_change_pct": 50.0}),
            false,
        );
        // Every area roughly doubled, as if the unit changed.
        let b = batch(vec![
            ("crime_rate", "0180C1010", Some(20.0)),
            ("crime_rate", "0180C1020", Some(22.0)),
            ("crime_rate", "0180C1030", Some(18.0)),
        ]);

        let mut prior_values = BTreeMap::new();
        let mut per_area = BTreeMap::new();
        per_area.insert("0180C1010".to_string(), 10.0);
        per_area.insert("0180C1020".to_string(), 10.0);
        per_area.insert("0180C1030".to_string(), 10.0);
        prior_values.insert("crime_rate".to_string(), per_area);

        let ctx = BatchContext {
            prior_values,
            ..Default::default()
        };

        let out = evaluate_rule(&r, &b, &ctx);
        assert_eq!(out.status, ValidationStatus::Failed);
        assert_eq!(out.affected_count, 3);
        assert_eq!(out.affected_indicators, vec!["crime_rate".to_string()]);
    }

    #[test]
    fn change_rate_tolerates_individual_outliers() {
        let r = rule(
            RuleType::ChangeRate,
            serde_json::json!({"max_change_pct": 50.0}),
            false,
        );
        // One area spiked but the median change is small.
        let b = batch(vec![
            ("crime_rate", "0180C1010", Some(30.0)),
            ("crime_rate", "0180C1020", Some(10.5)),
            ("crime_rate", "0180C1030", Some(9.8)),
        ]);

        let mut prior_values = BTreeMap::new();
        let mut per_area = BTreeMap::new();
        per_area.insert("0180C1010".to_string(), 10.0);
        per_area.insert("0180C1020".to_string(), 10.0);
        per_area.insert("0180C1030".to_string(), 10.0);
        prior_values.insert("crime_rate".to_string(), per_area);

        let ctx = BatchContext {
            prior_values,
            ..Default::default()
        };

        let out = evaluate_rule(&r, &b, &ctx);
        assert_eq!(out.status, ValidationStatus::Passed);
    }

    #[test]
    fn distribution_catches_unit_error_without_prior_data() {
        // Income in SEK where thousands were expected: the mean blows past
        // the bound even though this is the first year ingested.
        let r = rule(
            RuleType::Distribution,
            serde_json::json!({"expected_mean_min": 100.0, "expected_mean_max": 1000.0}),
            true,
        );
        let b = batch(vec![
            ("median_income", "0180C1010", Some(310_000.0)),
            ("median_income", "0180C1020", Some(285_000.0)),
            ("median_income", "0180C1030", Some(342_000.0)),
        ]);

        let out = evaluate_rule(&r, &b, &BatchContext::default());
        assert_eq!(out.status, ValidationStatus::Failed);
        assert_eq!(out.affected_indicators, vec!["median_income".to_string()]);
    }

    #[test]
    fn distribution_checks_stddev_bounds() {
        let r = rule(
            RuleType::Distribution,
            serde_json::json!({"expected_stddev_min": 1.0}),
            true,
        );
        // A nearly constant series: mean is fine, spread is not.
        let b = batch(vec![
            ("employment_rate", "0180C1010", Some(80.0)),
            ("employment_rate", "0180C1020", Some(80.1)),
            ("employment_rate", "0180C1030", Some(79.9)),
        ]);

        let out = evaluate_rule(&r, &b, &BatchContext::default());
        assert_eq!(out.status, ValidationStatus::Failed);
    }

    #[test]
    fn distribution_passes_within_bounds() {
        let r = rule(
            RuleType::Distribution,
            serde_json::json!({
                "expected_mean_min": 100.0,
                "expected_mean_max": 1000.0,
                "expected_stddev_min": 1.0,
                "expected_stddev_max": 500.0
            }),
            true,
        );
        let b = batch(vec![
            ("median_income", "0180C1010", Some(310.0)),
            ("median_income", "0180C1020", Some(285.0)),
            ("median_income", "0180C1030", Some(342.0)),
        ]);

        let out = evaluate_rule(&r, &b, &BatchContext::default());
        assert_eq!(out.status, ValidationStatus::Passed);
    }

    #[test]
    fn global_min_count_counts_distinct_areas() {
        let r = rule(
            RuleType::GlobalMinCount,
            serde_json::json!({"min_deso_count": 3}),
            true,
        );
        // Four rows but only two areas.
        let b = batch(vec![
            ("a", "0180C1010", Some(1.0)),
            ("a", "0180C1020", Some(2.0)),
            ("b", "0180C1010", Some(3.0)),
            ("b", "0180C1020", Some(4.0)),
        ]);
        let out = evaluate_rule(&r, &b, &BatchContext::default());
        assert_eq!(out.status, ValidationStatus::Failed);
        assert_eq!(out.affected_count, 2);
    }

    #[test]
    fn identical_values_detected() {
        let r = rule(
            RuleType::GlobalNoIdentical,
            serde_json::json!({"min_values": 3}),
            true,
        );
        let b = batch(vec![
            ("debt_rate", "0180C1010", Some(7.0)),
            ("debt_rate", "0180C1020", Some(7.0)),
            ("debt_rate", "0180C1030", Some(7.0)),
        ]);
        let out = evaluate_rule(&r, &b, &BatchContext::default());
        assert_eq!(out.status, ValidationStatus::Failed);
        assert_eq!(out.affected_indicators, vec!["debt_rate".to_string()]);
    }

    #[test]
    fn null_spike_compares_against_prior_run() {
        let r = rule(
            RuleType::GlobalNullSpike,
            serde_json::json!({"max_null_increase_pct": 20.0}),
            false,
        );
        let b = batch(vec![
            ("a", "0180C1010", Some(1.0)),
            ("a", "0180C1020", None),
        ]);

        let ctx = BatchContext {
            prior_null_rate_pct: Some(2.0),
            ..Default::default()
        };
        let out = evaluate_rule(&r, &b, &ctx);
        assert_eq!(out.status, ValidationStatus::Failed);
        assert_eq!(out.affected_count, 1);
    }

    #[test]
    fn null_spike_skipped_without_prior_run() {
        let r = rule(RuleType::GlobalNullSpike, serde_json::json!({}), false);
        let b = batch(vec![("a", "0180C1010", None)]);
        let out = evaluate_rule(&r, &b, &BatchContext::default());
        assert_eq!(out.status, ValidationStatus::Skipped);
    }
}
