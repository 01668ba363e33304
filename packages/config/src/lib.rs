#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Strongly-typed engine configuration, embedded at compile time.
//!
//! `kvarter.toml` is baked into the binary via [`include_str!`] and parsed
//! once at startup into an immutable [`EngineConfig`]. Every statistical
//! threshold the engine consults (trend gating, drift flags, penalty
//! overlap, proximity radii) is defined here and nowhere else.

use std::collections::BTreeMap;

use kvarter_models::UrbanityTier;
use serde::Deserialize;

/// The embedded default configuration.
const DEFAULT_TOML: &str = include_str!("../kvarter.toml");

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML syntax or schema error.
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantically invalid configuration.
    #[error("Invalid config: {message}")]
    Invalid {
        /// What is wrong with the values.
        message: String,
    },
}

/// Thresholds consumed by the composite, trend, and penalty logic.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    pub stable_threshold_pct: f64,
    pub composite_trend_min_weight_coverage: f64,
    pub min_trend_confidence: f64,
    pub penalty_overlap_fraction: f64,
    pub top_factor_count: usize,
}

/// Thresholds for comparing two score versions.
#[derive(Debug, Clone, Deserialize)]
pub struct DriftConfig {
    pub per_area_threshold: f64,
    pub systemic_mean_shift: f64,
    pub max_large_drift_areas: usize,
    pub stddev_shift_fraction: f64,
}

/// Batch sizing for the POI catchment aggregation job.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    pub batched_point_threshold: usize,
    pub area_batch_size: usize,
    pub flush_rows: usize,
}

/// Per-urbanity-tier value (urban is strict, rural is forgiving).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TieredMeters {
    pub urban: f64,
    pub semi_urban: f64,
    pub rural: f64,
}

impl TieredMeters {
    #[must_use]
    pub const fn for_tier(&self, tier: UrbanityTier) -> f64 {
        match tier {
            UrbanityTier::Urban => self.urban,
            UrbanityTier::SemiUrban => self.semi_urban,
            UrbanityTier::Rural => self.rural,
        }
    }
}

/// Scoring radii for the six proximity factors.
#[derive(Debug, Clone, Deserialize)]
pub struct ProximityRadii {
    pub school: TieredMeters,
    pub green_space: TieredMeters,
    pub transit: TieredMeters,
    pub grocery: TieredMeters,
    pub negative_poi: TieredMeters,
    pub positive_poi: TieredMeters,
}

/// Blend weights for the six proximity factors.
///
/// These mirror the proximity indicator weights so the per-pin composite
/// and the area-level composite agree on how much each factor matters.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProximityWeights {
    pub school: f64,
    pub green_space: f64,
    pub transit: f64,
    pub grocery: f64,
    pub negative_poi: f64,
    pub positive_poi: f64,
}

impl ProximityWeights {
    /// Sum of all six factor weights.
    #[must_use]
    pub const fn total(&self) -> f64 {
        self.school
            + self.green_space
            + self.transit
            + self.grocery
            + self.negative_poi
            + self.positive_poi
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProximityConfig {
    pub radii: ProximityRadii,
    pub weights: ProximityWeights,
}

/// One entry in the pipeline source registry.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    /// A failed step for a critical source halts the remaining pipeline.
    pub critical: bool,
    /// Data older than this is flagged by the freshness check.
    pub stale_after_days: i64,
    /// Indicator slugs this source produces.
    pub indicators: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub sources: Vec<SourceConfig>,
}

/// Root configuration object. Treated as immutable input after load.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub scoring: ScoringConfig,
    pub drift: DriftConfig,
    pub category_budgets: BTreeMap<String, f64>,
    pub aggregation: AggregationConfig,
    pub proximity: ProximityConfig,
    pub pipeline: PipelineConfig,
}

impl EngineConfig {
    /// Parses the embedded default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the embedded TOML is malformed or fails
    /// semantic validation.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_toml(DEFAULT_TOML)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on parse failure or invalid values.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Weight budget for a category, if configured.
    #[must_use]
    pub fn category_budget(&self, category: &str) -> Option<f64> {
        self.category_budgets.get(category).copied()
    }

    /// Looks up a pipeline source by id.
    #[must_use]
    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.pipeline.sources.iter().find(|s| s.id == id)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let budget_sum: f64 = self.category_budgets.values().sum();
        if (budget_sum - 1.0).abs() > 1e-9 {
            return Err(ConfigError::Invalid {
                message: format!("category budgets sum to {budget_sum}, expected 1.0"),
            });
        }

        if !(0.0..=1.0).contains(&self.scoring.composite_trend_min_weight_coverage) {
            return Err(ConfigError::Invalid {
                message: "composite_trend_min_weight_coverage must be in [0, 1]".to_string(),
            });
        }

        if self.drift.per_area_threshold <= 0.0 {
            return Err(ConfigError::Invalid {
                message: "drift per_area_threshold must be positive".to_string(),
            });
        }

        let w = &self.proximity.weights;
        let weights = [
            w.school,
            w.green_space,
            w.transit,
            w.grocery,
            w.negative_poi,
            w.positive_poi,
        ];
        if weights.iter().any(|weight| *weight <= 0.0) {
            return Err(ConfigError::Invalid {
                message: "proximity factor weights must be positive".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_config_parses() {
        let config = EngineConfig::load().unwrap();
        assert!((config.scoring.stable_threshold_pct - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.drift.max_large_drift_areas, 100);
    }

    #[test]
    fn category_budgets_sum_to_one() {
        let config = EngineConfig::load().unwrap();
        let sum: f64 = config.category_budgets.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn radii_shrink_with_urbanity() {
        let config = EngineConfig::load().unwrap();
        let radii = &config.proximity.radii;
        assert!(radii.school.urban < radii.school.rural);
        assert!(
            radii.grocery.for_tier(UrbanityTier::Urban)
                < radii.grocery.for_tier(UrbanityTier::Rural)
        );
    }

    #[test]
    fn proximity_weights_match_category_budget() {
        let config = EngineConfig::load().unwrap();
        let total = config.proximity.weights.total();
        let budget = config.category_budget("proximity").unwrap();
        assert!((total - budget).abs() < 1e-9);
    }

    #[test]
    fn rejects_nonpositive_proximity_weight() {
        let toml_str = DEFAULT_TOML.replace("school = 0.10", "school = 0.0");
        assert!(EngineConfig::from_toml(&toml_str).is_err());
    }

    #[test]
    fn rejects_unbalanced_budgets() {
        let toml_str = DEFAULT_TOML.replace("safety = 0.25", "safety = 0.50");
        assert!(EngineConfig::from_toml(&toml_str).is_err());
    }

    #[test]
    fn critical_sources_present() {
        let config = EngineConfig::load().unwrap();
        assert!(config.source("scb").is_some_and(|s| s.critical));
        assert!(config.source("kronofogden").is_some_and(|s| !s.critical));
    }
}
