#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(
    clippy::multiple_crate_versions,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]

//! Data-quality validation for ingestion batches.
//!
//! Rules live in the `validation_rules` table and are evaluated in-memory
//! against a [`rules::ValueBatch`]. Outcomes are persisted per ingestion
//! log; a failed blocking rule marks its indicators so the scorer excludes
//! them until the next clean batch.

pub mod rules;

use std::collections::BTreeMap;

use kvarter_database::{DbError, queries};
use kvarter_models::{RuleOutcome, ValidationStatus};
use switchy_database::Database;

use crate::rules::{BatchContext, ValueBatch};

/// Errors raised while running validation.
#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    /// Database error.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Aggregated outcomes for one batch run.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub source: String,
    pub year: i32,
    pub outcomes: Vec<RuleOutcome>,
}

impl ValidationReport {
    /// True when any blocking rule failed.
    #[must_use]
    pub fn has_blocking_failures(&self) -> bool {
        self.outcomes.iter().any(RuleOutcome::is_blocking_failure)
    }

    /// Indicator slugs tainted by blocking failures, deduplicated.
    #[must_use]
    pub fn blocked_indicators(&self) -> Vec<String> {
        let mut slugs: Vec<String> = Vec::new();
        for out in &self.outcomes {
            if out.is_blocking_failure() {
                for slug in &out.affected_indicators {
                    if !slugs.contains(slug) {
                        slugs.push(slug.clone());
                    }
                }
            }
        }
        slugs
    }

    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.count(ValidationStatus::Passed)
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.count(ValidationStatus::Failed)
    }

    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.count(ValidationStatus::Skipped)
    }

    fn count(&self, status: ValidationStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Compact JSON summary stored on score versions and pipeline runs.
    #[must_use]
    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "source": self.source,
            "year": self.year,
            "passed": self.passed_count(),
            "failed": self.failed_count(),
            "skipped": self.skipped_count(),
            "blocking_failures": self.has_blocking_failures(),
            "blocked_indicators": self.blocked_indicators(),
        })
    }
}

/// Evaluates every rule against the batch. Pure; no persistence.
#[must_use]
pub fn evaluate_batch(
    batch: &ValueBatch,
    ctx: &BatchContext,
    active_rules: &[kvarter_models::ValidationRule],
) -> ValidationReport {
    let outcomes = active_rules
        .iter()
        .map(|rule| rules::evaluate_rule(rule, batch, ctx))
        .collect();

    ValidationReport {
        source: batch.source.clone(),
        year: batch.year,
        outcomes,
    }
}

/// Runs validation for a batch end to end: loads the matching rules and
/// prior-year reference data, evaluates, and persists the outcomes under a
/// fresh ingestion log.
///
/// Returns the log id and the report so callers can decide whether to
/// proceed with the batch.
///
/// # Errors
///
/// Returns [`ValidateError`] if any database operation fails.
pub async fn validate_batch(
    db: &dyn Database,
    batch: &ValueBatch,
) -> Result<(i64, ValidationReport), ValidateError> {
    let active_rules = queries::get_rules_for_source(db, &batch.source).await?;
    let indicators = queries::get_indicators_for_source(db, &batch.source).await?;
    let expected_area_count = usize::try_from(queries::count_areas(db).await?).unwrap_or(0);

    let mut prior_values: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    let mut indicator_slugs: BTreeMap<i32, String> = BTreeMap::new();
    let mut prior_total = 0usize;
    let mut prior_nulls = 0usize;
    for indicator in &indicators {
        indicator_slugs.insert(indicator.id, indicator.slug.clone());

        let prior = queries::get_raw_values(db, indicator.id, batch.year - 1).await?;
        prior_total += prior.len();
        prior_nulls += prior.iter().filter(|(_, v)| v.is_none()).count();

        let per_area: BTreeMap<String, f64> = prior
            .into_iter()
            .filter_map(|(deso, value)| value.map(|v| (deso, v)))
            .collect();
        if !per_area.is_empty() {
            prior_values.insert(indicator.slug.clone(), per_area);
        }
    }

    let prior_null_rate_pct =
        (prior_total > 0).then(|| prior_nulls as f64 / prior_total as f64 * 100.0);

    let ctx = BatchContext {
        expected_area_count,
        prior_values,
        indicator_slugs,
        prior_null_rate_pct,
    };

    let report = evaluate_batch(batch, &ctx, &active_rules);

    let log_id = queries::create_ingestion_log(db, &batch.source, batch.year).await?;
    for (rule, out) in active_rules.iter().zip(&report.outcomes) {
        queries::insert_validation_result(
            db,
            log_id,
            rule.id,
            out.status.as_ref(),
            out.affected_count,
            &out.message,
            &out.affected_indicators,
        )
        .await?;
    }

    let log_status = if report.has_blocking_failures() {
        "failed"
    } else {
        "completed"
    };
    queries::finish_ingestion_log(db, log_id, log_status, batch.rows.len() as i64).await?;

    if report.has_blocking_failures() {
        log::warn!(
            "Validation for {}/{} blocked {} indicator(s)",
            batch.source,
            batch.year,
            report.blocked_indicators().len()
        );
    } else {
        log::info!(
            "Validation for {}/{} passed ({} rules, {} skipped)",
            batch.source,
            batch.year,
            report.passed_count(),
            report.skipped_count()
        );
    }

    Ok((log_id, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvarter_models::{RuleSeverity, RuleType, ValidationRule};
    use rules::BatchRow;

    fn blocking_range_rule() -> ValidationRule {
        ValidationRule {
            id: 1,
            name: "income range".to_string(),
            rule_type: RuleType::Range,
            source: Some("scb".to_string()),
            indicator_id: None,
            severity: RuleSeverity::Error,
            blocks_scoring: true,
            parameters: serde_json::json!({"min": 0.0}),
            is_active: true,
        }
    }

    #[test]
    fn report_collects_blocked_indicators() {
        let batch = ValueBatch {
            source: "scb".to_string(),
            year: 2024,
            rows: vec![BatchRow {
                indicator_slug: "median_income".to_string(),
                deso_code: "0180C1010".to_string(),
                value: Some(-1.0),
            }],
        };

        let report = evaluate_batch(&batch, &BatchContext::default(), &[blocking_range_rule()]);
        assert!(report.has_blocking_failures());
        assert_eq!(report.blocked_indicators(), vec!["median_income".to_string()]);
        assert_eq!(report.failed_count(), 1);
    }

    #[test]
    fn summary_json_shape() {
        let batch = ValueBatch {
            source: "scb".to_string(),
            year: 2024,
            rows: vec![],
        };
        let report = evaluate_batch(&batch, &BatchContext::default(), &[]);
        let summary = report.summary_json();
        assert_eq!(summary["source"], "scb");
        assert_eq!(summary["blocking_failures"], false);
    }
}
