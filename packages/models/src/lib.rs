#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Indicator taxonomy and scoring domain types shared across the kvarter
//! engine.
//!
//! These are plain value structs and enums with no persistence logic. The
//! database crate maps rows into these types and the engine crates operate
//! on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Whether a high raw value is good, bad, or not scored.
///
/// Direction is applied at *consumption* time by the composite scorer
/// (`effective = 1 - normalized` for negative indicators). Normalized values
/// always mean "how high is this raw number within its scope".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
    /// Higher raw value raises the composite score (e.g. median income).
    Positive,
    /// Higher raw value lowers the composite score (e.g. crime rate).
    Negative,
    /// Stored and normalized but never blended into the composite.
    Neutral,
}

/// Statistical method used to turn raw values into comparable 0-1 values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NormalizationMethod {
    /// `(rank - 1) / (n - 1)` ascending; ties share the mean percentile.
    RankPercentile,
    /// `(value - min) / (max - min)`, clamped; constant scope yields 0.5.
    MinMax,
    /// `(value - mean) / stddev`, squashed to (0, 1) with a logistic curve.
    ZScore,
}

/// The comparison population a raw value is ranked within.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NormalizationScope {
    /// One scope covering every area in the country.
    National,
    /// One scope per urbanity tier, so rural areas are ranked against
    /// rural areas only.
    UrbanityStratified,
}

/// Urbanity classification of a DeSO area.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UrbanityTier {
    Urban,
    SemiUrban,
    Rural,
}

impl UrbanityTier {
    pub const ALL: &[Self] = &[Self::Urban, Self::SemiUrban, Self::Rural];
}

/// Top-level indicator groupings, each with a weight budget that the active
/// indicator weights within the category should sum to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IndicatorCategory {
    Safety,
    Economy,
    Education,
    Proximity,
}

impl IndicatorCategory {
    pub const ALL: &[Self] = &[Self::Safety, Self::Economy, Self::Education, Self::Proximity];
}

/// A named, versionable metric. Administrator-edited reference data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indicator {
    pub id: i32,
    pub slug: String,
    pub name: String,
    /// Registry the indicator is ingested from (e.g. `scb`, `bra`).
    pub source: String,
    pub category: IndicatorCategory,
    pub direction: Direction,
    /// Default blend weight in `[0, 1]`; tenant overrides may replace it.
    pub weight: f64,
    pub normalization: NormalizationMethod,
    pub normalization_scope: NormalizationScope,
    pub is_active: bool,
}

/// A DeSO statistical area. Immutable reference data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesoArea {
    pub deso_code: String,
    pub name: Option<String>,
    pub municipality: Option<String>,
    pub population: Option<i64>,
    pub urbanity_tier: UrbanityTier,
    pub area_km2: Option<f64>,
}

/// Crosswalk entry tracking a boundary revision so historical values stay
/// attributable across DeSO code changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaCrosswalk {
    pub old_code: String,
    pub new_code: String,
    /// Fraction of the old area's population covered by the new area.
    pub overlap_fraction: f64,
}

/// One observed value for `(area, indicator, year)`. Unique per triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorValue {
    pub deso_code: String,
    pub indicator_id: i32,
    pub year: i32,
    /// NULL when the area has no data for the year.
    pub raw_value: Option<f64>,
    /// Computed by the normalization engine, never hand-edited.
    pub normalized_value: Option<f64>,
}

/// Lifecycle state of a score version.
///
/// Exactly one `Published` version should exist per year; publishing a new
/// one supersedes the old.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    /// Sentinel and drift checks passed; awaiting publish.
    Validated,
    Published,
    /// Was published, replaced by a newer published version.
    Superseded,
    Rejected,
}

/// One immutable, auditable computation run for a year.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreVersion {
    pub id: i32,
    pub year: i32,
    pub tenant_id: Option<i32>,
    pub status: VersionStatus,
    pub deso_count: i64,
    pub mean_score: Option<f64>,
    pub stddev_score: Option<f64>,
    /// Snapshot of the indicator slugs/weights/directions used.
    pub indicators_used: serde_json::Value,
    pub sentinel_results: Option<serde_json::Value>,
    pub validation_summary: Option<serde_json::Value>,
    pub computed_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// A computed composite score row, immutable once its version is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeScore {
    pub deso_code: String,
    pub year: i32,
    pub score_version_id: i32,
    pub score: f64,
    /// Pre-penalty score, recorded only when penalties applied.
    pub raw_score_before_penalties: Option<f64>,
    pub trend_1y: Option<f64>,
    pub trend_3y: Option<f64>,
    /// `slug -> effective value` for every indicator that contributed.
    pub factor_scores: serde_json::Value,
    pub top_positive: Vec<String>,
    pub top_negative: Vec<String>,
    pub penalties_applied: Option<serde_json::Value>,
}

/// Data-quality rule kinds. `Global*` rules look at a whole source batch
/// rather than a single indicator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RuleType {
    Range,
    Completeness,
    ChangeRate,
    Distribution,
    GlobalMinCount,
    GlobalNoIdentical,
    GlobalNullSpike,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RuleSeverity {
    Error,
    Warning,
    Info,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValidationStatus {
    Passed,
    Failed,
    /// Rule could not be evaluated (e.g. no prior-year data).
    Skipped,
}

/// An active data-quality rule, matched against a batch by source and
/// optionally a specific indicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
    pub id: i32,
    pub name: String,
    pub rule_type: RuleType,
    /// NULL matches every source.
    pub source: Option<String>,
    pub indicator_id: Option<i32>,
    pub severity: RuleSeverity,
    /// A failed blocking rule prevents scoring from consuming the batch.
    pub blocks_scoring: bool,
    /// Rule-type-specific parameters (`min`, `max`, `min_coverage_pct`, ...).
    pub parameters: serde_json::Value,
    pub is_active: bool,
}

/// Outcome of evaluating one rule against one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule_name: String,
    pub rule_type: RuleType,
    pub status: ValidationStatus,
    pub severity: RuleSeverity,
    pub blocks_scoring: bool,
    pub affected_count: i64,
    pub message: String,
    /// Indicator slugs whose data the failure taints, for scoring exclusion.
    pub affected_indicators: Vec<String>,
}

impl RuleOutcome {
    /// True when this outcome must keep the batch away from the scorer.
    #[must_use]
    pub fn is_blocking_failure(&self) -> bool {
        self.status == ValidationStatus::Failed && self.blocks_scoring
    }
}

/// Penalty adjustment applied after raw composite aggregation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PenaltyType {
    /// Adds a fixed (negative) amount to the raw score.
    Absolute,
    /// Adds `raw_score * value / 100` (value is negative).
    Percentage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorePenalty {
    pub id: i32,
    pub slug: String,
    pub name: String,
    /// Penalties in the same category never stack; the worst one wins.
    pub category: String,
    pub penalty_type: PenaltyType,
    pub penalty_value: f64,
    pub is_active: bool,
}

/// Police vulnerability designation mapped onto a DeSO with an overlap
/// fraction, used as a penalty trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilityMapping {
    pub deso_code: String,
    /// `utsatt` or `sarskilt_utsatt`.
    pub tier: String,
    pub overlap_fraction: f64,
}

/// Expected placement band for a hand-verified sentinel area.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SentinelTier {
    Top,
    Middle,
    Bottom,
}

/// Hand-curated regression-check area. Never used as scoring input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelArea {
    pub deso_code: String,
    pub name: String,
    pub expected_score_min: f64,
    pub expected_score_max: f64,
    pub expected_tier: SentinelTier,
    pub is_active: bool,
}

/// Direction classification for a computed trend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Declining,
    /// Too few data points or no comparable base value.
    Insufficient,
}

/// Year-over-year change for `(area, indicator)` over a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorTrend {
    pub deso_code: String,
    pub indicator_id: i32,
    pub base_year: i32,
    pub end_year: i32,
    pub data_points: i32,
    pub absolute_change: f64,
    /// NULL when the base value is zero or missing.
    pub percent_change: Option<f64>,
    pub direction: TrendDirection,
    /// 0.0 - 1.0; zero when a methodology break invalidates the window.
    pub confidence: f64,
}

/// Recorded break in indicator methodology. A break inside a trend window
/// makes the trend incomparable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodologyChange {
    pub indicator_id: i32,
    pub year_affected: i32,
    pub breaks_trend: bool,
    pub description: String,
}

/// Tenant-specific weight override; replaces the indicator's default weight
/// and active flag for that tenant's computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantWeight {
    pub indicator_id: i32,
    pub weight: f64,
    pub direction: Direction,
    pub is_active: bool,
}

/// Explicit tenant context threaded through scoring calls.
///
/// `None` means the public/default weights apply. There is deliberately no
/// ambient "current tenant" global.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: Option<i32>,
}

impl TenantContext {
    #[must_use]
    pub const fn public() -> Self {
        Self { tenant_id: None }
    }

    #[must_use]
    pub const fn for_tenant(tenant_id: i32) -> Self {
        Self {
            tenant_id: Some(tenant_id),
        }
    }
}

/// Whether closeness to a POI category helps or hurts a location.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PoiSignal {
    Positive,
    Negative,
    Neutral,
}

/// Administrator-curated POI category settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoiCategory {
    pub slug: String,
    pub name: String,
    pub signal: PoiSignal,
    /// Indicator the category's density feeds; NULL if display-only.
    pub indicator_slug: Option<String>,
    /// Catchment radius for density aggregation, in kilometres.
    pub catchment_km: f64,
    /// How strongly local safety stretches distances for this category
    /// (1.0 = full effect, 0.0 = safety-insensitive).
    pub safety_sensitivity: f64,
    pub is_active: bool,
}

/// A geocoded point of interest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poi {
    pub id: i64,
    pub name: Option<String>,
    pub category: String,
    pub lat: f64,
    pub lng: f64,
    pub active: bool,
}

/// Transit mode of a stop, carrying its attractiveness weight.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransitMode {
    Rail,
    Tram,
    Bus,
}

impl TransitMode {
    /// Relative attractiveness of the mode when scoring transit access.
    #[must_use]
    pub const fn weight(self) -> f64 {
        match self {
            Self::Rail => 1.5,
            Self::Tram => 1.2,
            Self::Bus => 1.0,
        }
    }
}

/// A transit stop from the authoritative GTFS-derived table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitStop {
    pub id: i64,
    pub name: Option<String>,
    pub mode: TransitMode,
    pub weekly_departures: Option<i64>,
    pub lat: f64,
    pub lng: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_round_trips_through_strings() {
        assert_eq!("negative".parse::<Direction>().unwrap(), Direction::Negative);
        assert_eq!(Direction::Positive.to_string(), "positive");
    }

    #[test]
    fn normalization_method_parses_db_strings() {
        assert_eq!(
            "rank_percentile".parse::<NormalizationMethod>().unwrap(),
            NormalizationMethod::RankPercentile
        );
        assert_eq!(
            "z_score".parse::<NormalizationMethod>().unwrap(),
            NormalizationMethod::ZScore
        );
    }

    #[test]
    fn urbanity_tier_parses_semi_urban() {
        assert_eq!(
            "semi_urban".parse::<UrbanityTier>().unwrap(),
            UrbanityTier::SemiUrban
        );
    }

    #[test]
    fn blocking_failure_requires_failed_status() {
        let outcome = RuleOutcome {
            rule_name: "range".into(),
            rule_type: RuleType::Range,
            status: ValidationStatus::Passed,
            severity: RuleSeverity::Error,
            blocks_scoring: true,
            affected_count: 0,
            message: String::new(),
            affected_indicators: vec![],
        };
        assert!(!outcome.is_blocking_failure());
    }

    #[test]
    fn rail_outweighs_bus() {
        assert!(TransitMode::Rail.weight() > TransitMode::Bus.weight());
    }
}
