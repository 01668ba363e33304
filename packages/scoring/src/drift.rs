//! Score drift detection between two versions.
//!
//! Compares a candidate version against the previously published one and
//! flags distribution-level movements that usually mean a data or
//! methodology problem rather than real neighborhood change.

use std::collections::BTreeMap;

use kvarter_config::EngineConfig;
use kvarter_database::queries;
use serde::Serialize;
use switchy_database::Database;

use crate::ScoringError;

/// One distribution-level red flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftFlag {
    /// National mean moved more than the systemic threshold.
    SystemicMeanShift,
    /// More areas than allowed moved past the per-area threshold.
    TooManyLargeDrifts,
    /// Score spread changed by more than the allowed fraction.
    StddevShift,
}

/// Full comparison between two score distributions.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub compared_areas: usize,
    pub mean_shift: f64,
    pub large_drift_areas: usize,
    /// Relative stddev change; 0 when the old spread was zero.
    pub stddev_change_fraction: f64,
    /// The worst movers, largest absolute delta first, capped at 20.
    pub top_movers: Vec<(String, f64)>,
    pub flags: Vec<DriftFlag>,
}

impl DriftReport {
    /// True when any flag fired.
    #[must_use]
    pub fn is_flagged(&self) -> bool {
        !self.flags.is_empty()
    }

    #[must_use]
    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "compared_areas": self.compared_areas,
            "mean_shift": self.mean_shift,
            "large_drift_areas": self.large_drift_areas,
            "stddev_change_fraction": self.stddev_change_fraction,
            "flags": self.flags,
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    values.iter().sum::<f64>() / n
}

fn stddev(values: &[f64]) -> f64 {
    let m = mean(values);
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n).sqrt()
}

/// Compares two `deso_code -> score` maps. Pure; only shared areas are
/// compared, so boundary revisions don't count as drift.
#[must_use]
pub fn compare(
    old_scores: &BTreeMap<String, f64>,
    new_scores: &BTreeMap<String, f64>,
    config: &EngineConfig,
) -> DriftReport {
    let mut old_shared: Vec<f64> = Vec::new();
    let mut new_shared: Vec<f64> = Vec::new();
    let mut deltas: Vec<(String, f64)> = Vec::new();

    for (code, new_score) in new_scores {
        if let Some(old_score) = old_scores.get(code) {
            old_shared.push(*old_score);
            new_shared.push(*new_score);
            deltas.push((code.clone(), new_score - old_score));
        }
    }

    if deltas.is_empty() {
        return DriftReport {
            compared_areas: 0,
            mean_shift: 0.0,
            large_drift_areas: 0,
            stddev_change_fraction: 0.0,
            top_movers: vec![],
            flags: vec![],
        };
    }

    let mean_shift = mean(&new_shared) - mean(&old_shared);

    let large_drift_areas = deltas
        .iter()
        .filter(|(_, d)| d.abs() > config.drift.per_area_threshold)
        .count();

    let old_stddev = stddev(&old_shared);
    let stddev_change_fraction = if old_stddev < f64::EPSILON {
        0.0
    } else {
        (stddev(&new_shared) - old_stddev).abs() / old_stddev
    };

    let mut flags = Vec::new();
    if mean_shift.abs() > config.drift.systemic_mean_shift {
        flags.push(DriftFlag::SystemicMeanShift);
    }
    if large_drift_areas > config.drift.max_large_drift_areas {
        flags.push(DriftFlag::TooManyLargeDrifts);
    }
    if stddev_change_fraction > config.drift.stddev_shift_fraction {
        flags.push(DriftFlag::StddevShift);
    }

    deltas.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
    deltas.truncate(20);

    DriftReport {
        compared_areas: old_shared.len(),
        mean_shift,
        large_drift_areas,
        stddev_change_fraction,
        top_movers: deltas,
        flags,
    }
}

/// Compares a candidate version against the published version for the
/// prior year (or the same year, when re-running).
///
/// Returns `None` when there is nothing to compare against, which is
/// normal for the first year of operation.
///
/// # Errors
///
/// Returns [`ScoringError`] if any database operation fails.
pub async fn detect_drift(
    db: &dyn Database,
    config: &EngineConfig,
    candidate_version_id: i32,
) -> Result<Option<DriftReport>, ScoringError> {
    let Some(candidate) = queries::get_version(db, candidate_version_id).await? else {
        return Err(ScoringError::VersionNotFound {
            version_id: candidate_version_id,
        });
    };

    let baseline = match queries::latest_published_version(db, candidate.year).await? {
        Some(v) if v.id != candidate.id => Some(v),
        _ => queries::latest_published_version(db, candidate.year - 1).await?,
    };

    let Some(baseline) = baseline else {
        log::info!("No published baseline to compare version {candidate_version_id} against");
        return Ok(None);
    };

    let old_scores = queries::get_score_map(db, baseline.id).await?;
    let new_scores = queries::get_score_map(db, candidate.id).await?;
    let report = compare(&old_scores, &new_scores, config);

    if report.is_flagged() {
        log::warn!(
            "Drift flags for version {candidate_version_id} vs {}: {:?}",
            baseline.id,
            report.flags
        );
    }

    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::load().unwrap()
    }

    fn scores(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs
            .iter()
            .map(|(code, score)| ((*code).to_string(), *score))
            .collect()
    }

    #[test]
    fn identical_distributions_are_clean() {
        let old = scores(&[("a", 50.0), ("b", 60.0), ("c", 70.0)]);
        let report = compare(&old, &old, &config());
        assert!(!report.is_flagged());
        assert!(report.mean_shift.abs() < f64::EPSILON);
    }

    #[test]
    fn systemic_mean_shift_flagged() {
        let old = scores(&[("a", 50.0), ("b", 60.0)]);
        let new = scores(&[("a", 58.0), ("b", 68.0)]);
        let report = compare(&old, &new, &config());
        assert!(report.flags.contains(&DriftFlag::SystemicMeanShift));
    }

    #[test]
    fn per_area_threshold_counts_large_movers() {
        let old = scores(&[("a", 50.0), ("b", 60.0), ("c", 70.0)]);
        // One mover past 15 points, two small moves that offset the mean.
        let new = scores(&[("a", 70.0), ("b", 55.0), ("c", 63.0)]);
        let report = compare(&old, &new, &config());
        assert_eq!(report.large_drift_areas, 1);
        // 100-area limit not exceeded, so no flag.
        assert!(!report.flags.contains(&DriftFlag::TooManyLargeDrifts));
        assert_eq!(report.top_movers[0].0, "a");
    }

    #[test]
    fn stddev_collapse_flagged() {
        let old = scores(&[("a", 20.0), ("b", 50.0), ("c", 80.0)]);
        let new = scores(&[("a", 49.0), ("b", 50.0), ("c", 51.0)]);
        let report = compare(&old, &new, &config());
        assert!(report.flags.contains(&DriftFlag::StddevShift));
    }

    #[test]
    fn disjoint_areas_compare_nothing() {
        let old = scores(&[("a", 50.0)]);
        let new = scores(&[("b", 90.0)]);
        let report = compare(&old, &new, &config());
        assert_eq!(report.compared_areas, 0);
        assert!(!report.is_flagged());
    }
}
