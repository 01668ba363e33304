//! Sentinel area checks.
//!
//! Sentinels are hand-verified areas with known expected placements. A
//! computed version that puts a sentinel outside its expected band or
//! percentile tier has probably broken something upstream, so sentinel
//! failures gate publication.

use std::collections::BTreeMap;

use kvarter_database::queries;
use kvarter_models::{SentinelArea, SentinelTier};
use serde::Serialize;
use switchy_database::Database;

use crate::ScoringError;

/// Outcome for one sentinel against one version.
#[derive(Debug, Clone, Serialize)]
pub struct SentinelOutcome {
    pub deso_code: String,
    pub name: String,
    pub score: Option<f64>,
    pub percentile: Option<f64>,
    pub in_band: bool,
    pub in_tier: bool,
}

impl SentinelOutcome {
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.in_band && self.in_tier
    }
}

/// All sentinel outcomes for a version.
#[derive(Debug, Clone, Serialize)]
pub struct SentinelReport {
    pub outcomes: Vec<SentinelOutcome>,
}

impl SentinelReport {
    /// True when every sentinel passed. An empty sentinel set passes.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(SentinelOutcome::passed)
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.passed()).count()
    }

    #[must_use]
    pub fn results_json(&self) -> serde_json::Value {
        serde_json::json!({
            "passed": self.all_passed(),
            "failed_count": self.failed_count(),
            "outcomes": self.outcomes,
        })
    }
}

/// Whether a percentile (0-1) falls in the expected tier, splitting the
/// distribution into thirds.
#[must_use]
pub fn in_expected_tier(percentile: f64, tier: SentinelTier) -> bool {
    match tier {
        SentinelTier::Top => percentile >= 2.0 / 3.0,
        SentinelTier::Middle => (1.0 / 3.0..2.0 / 3.0).contains(&percentile),
        SentinelTier::Bottom => percentile < 1.0 / 3.0,
    }
}

/// Percentile of `score` within `all_scores` (fraction strictly below).
#[must_use]
pub fn percentile_of(score: f64, all_scores: &[f64]) -> f64 {
    if all_scores.is_empty() {
        return 0.0;
    }
    let below = all_scores.iter().filter(|s| **s < score).count();
    #[allow(clippy::cast_precision_loss)]
    let fraction = below as f64 / all_scores.len() as f64;
    fraction
}

/// Evaluates sentinels against a score map. Pure.
#[must_use]
pub fn evaluate(
    sentinels: &[SentinelArea],
    score_map: &BTreeMap<String, f64>,
) -> SentinelReport {
    let all_scores: Vec<f64> = score_map.values().copied().collect();

    let outcomes = sentinels
        .iter()
        .map(|sentinel| {
            let score = score_map.get(&sentinel.deso_code).copied();
            score.map_or(
                SentinelOutcome {
                    deso_code: sentinel.deso_code.clone(),
                    name: sentinel.name.clone(),
                    score: None,
                    percentile: None,
                    // A missing sentinel is a failure, not a skip: the
                    // whole point is that these areas must be present.
                    in_band: false,
                    in_tier: false,
                },
                |s| {
                    let percentile = percentile_of(s, &all_scores);
                    SentinelOutcome {
                        deso_code: sentinel.deso_code.clone(),
                        name: sentinel.name.clone(),
                        score: Some(s),
                        percentile: Some(percentile),
                        in_band: s >= sentinel.expected_score_min
                            && s <= sentinel.expected_score_max,
                        in_tier: in_expected_tier(percentile, sentinel.expected_tier),
                    }
                },
            )
        })
        .collect();

    SentinelReport { outcomes }
}

/// Runs sentinel checks for a version and stores the results on it.
///
/// # Errors
///
/// Returns [`ScoringError`] if any database operation fails.
pub async fn check_version(
    db: &dyn Database,
    version_id: i32,
) -> Result<SentinelReport, ScoringError> {
    let sentinels = queries::get_active_sentinels(db).await?;
    let score_map = queries::get_score_map(db, version_id).await?;

    let report = evaluate(&sentinels, &score_map);
    queries::set_sentinel_results(db, version_id, &report.results_json()).await?;

    if report.all_passed() {
        log::info!(
            "All {} sentinels passed for version {version_id}",
            report.outcomes.len()
        );
    } else {
        log::warn!(
            "{} sentinel(s) failed for version {version_id}",
            report.failed_count()
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentinel(code: &str, min: f64, max: f64, tier: SentinelTier) -> SentinelArea {
        SentinelArea {
            deso_code: code.to_string(),
            name: format!("sentinel {code}"),
            expected_score_min: min,
            expected_score_max: max,
            expected_tier: tier,
            is_active: true,
        }
    }

    fn spread_scores() -> BTreeMap<String, f64> {
        // Nine areas evenly spread 10..90.
        (1..=9)
            .map(|i| (format!("deso-{i}"), f64::from(i) * 10.0))
            .collect()
    }

    #[test]
    fn tier_thirds() {
        assert!(in_expected_tier(0.9, SentinelTier::Top));
        assert!(!in_expected_tier(0.5, SentinelTier::Top));
        assert!(in_expected_tier(0.5, SentinelTier::Middle));
        assert!(in_expected_tier(0.1, SentinelTier::Bottom));
    }

    #[test]
    fn sentinel_in_band_and_tier_passes() {
        let sentinels = vec![sentinel("deso-9", 80.0, 100.0, SentinelTier::Top)];
        let report = evaluate(&sentinels, &spread_scores());
        assert!(report.all_passed());
        let outcome = &report.outcomes[0];
        assert!(outcome.in_band && outcome.in_tier);
    }

    #[test]
    fn sentinel_outside_band_fails() {
        let sentinels = vec![sentinel("deso-5", 80.0, 100.0, SentinelTier::Middle)];
        let report = evaluate(&sentinels, &spread_scores());
        assert!(!report.all_passed());
        assert!(!report.outcomes[0].in_band);
        assert!(report.outcomes[0].in_tier);
    }

    #[test]
    fn missing_sentinel_area_fails() {
        let sentinels = vec![sentinel("missing", 0.0, 100.0, SentinelTier::Middle)];
        let report = evaluate(&sentinels, &spread_scores());
        assert_eq!(report.failed_count(), 1);
        assert!(report.outcomes[0].score.is_none());
    }

    #[test]
    fn empty_sentinel_set_passes() {
        let report = evaluate(&[], &spread_scores());
        assert!(report.all_passed());
    }
}
