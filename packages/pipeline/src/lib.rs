#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Yearly scoring pipeline orchestration.
//!
//! Chains the engine steps in dependency order: freshness check, POI
//! aggregation, proximity, normalization, composite scoring, trends, and
//! version validation, optionally ending in a publish. One run per year at
//! a time, enforced with a database advisory lock; every run is recorded
//! in `pipeline_runs` with a per-step summary whether it succeeds or not.

pub mod progress;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use kvarter_config::{EngineConfig, SourceConfig};
use kvarter_database::{DbError, queries};
use kvarter_models::TenantContext;
use serde::Serialize;
use switchy_database::Database;

use crate::progress::ProgressCallback;

/// Errors that abort a pipeline run before any step executes.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Database error.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Another run already holds the year lock.
    #[error("A pipeline run for {year} is already in progress")]
    Locked {
        /// The contested year.
        year: i32,
    },
}

/// Terminal state of one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

/// One executed (or skipped) pipeline step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: u128,
    pub detail: String,
}

/// Full record of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub year: i32,
    pub run_id: i64,
    pub version_id: Option<i32>,
    pub steps: Vec<StepReport>,
    pub succeeded: bool,
}

impl RunReport {
    #[must_use]
    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "year": self.year,
            "version_id": self.version_id,
            "succeeded": self.succeeded,
            "steps": self.steps,
        })
    }
}

/// Knobs for one pipeline invocation.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub year: i32,
    /// Trend window length; trends compare `year - window .. year`.
    pub trend_window_years: i32,
    /// Publish the version if it validates cleanly.
    pub publish: bool,
    /// Publish even when validation rejected the version.
    pub force_publish: bool,
    /// Skip the source freshness gate (backfills of old years).
    pub skip_freshness: bool,
    pub tenant: TenantContext,
}

impl PipelineOptions {
    #[must_use]
    pub const fn for_year(year: i32) -> Self {
        Self {
            year,
            trend_window_years: 3,
            publish: false,
            force_publish: false,
            skip_freshness: false,
            tenant: TenantContext::public(),
        }
    }
}

/// Freshness standing of one configured source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFreshness {
    pub source_id: String,
    pub critical: bool,
    pub last_completed: Option<DateTime<Utc>>,
    pub stale: bool,
}

/// A source is stale when it has never completed an ingestion or its last
/// completed one is older than its configured shelf life.
#[must_use]
pub fn is_stale(
    last_completed: Option<DateTime<Utc>>,
    stale_after_days: i64,
    now: DateTime<Utc>,
) -> bool {
    last_completed.is_none_or(|t| now - t > Duration::days(stale_after_days))
}

/// Checks every configured source against its ingestion history.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn check_freshness(
    db: &dyn Database,
    config: &EngineConfig,
) -> Result<Vec<SourceFreshness>, DbError> {
    let now = Utc::now();
    let mut results = Vec::with_capacity(config.pipeline.sources.len());

    for source in &config.pipeline.sources {
        let last_completed = queries::last_completed_ingestion(db, &source.id).await?;
        results.push(SourceFreshness {
            source_id: source.id.clone(),
            critical: source.critical,
            last_completed,
            stale: is_stale(last_completed, source.stale_after_days, now),
        });
    }

    Ok(results)
}

/// Stale critical sources, the ones that block a run.
#[must_use]
pub fn blocking_sources<'a>(
    freshness: &'a [SourceFreshness],
    config: &EngineConfig,
) -> Vec<&'a SourceFreshness> {
    freshness
        .iter()
        .filter(|f| f.stale && config.source(&f.source_id).is_some_and(|s: &SourceConfig| s.critical))
        .collect()
}

struct StepTimer {
    name: &'static str,
    started: Instant,
}

impl StepTimer {
    fn start(name: &'static str, progress: &Arc<dyn ProgressCallback>) -> Self {
        progress.set_message(name.to_string());
        log::info!("Pipeline step: {name}");
        Self {
            name,
            started: Instant::now(),
        }
    }

    fn complete(self, detail: String) -> StepReport {
        StepReport {
            name: self.name.to_string(),
            status: StepStatus::Completed,
            duration_ms: self.started.elapsed().as_millis(),
            detail,
        }
    }

    fn fail(self, detail: String) -> StepReport {
        log::error!("Pipeline step {} failed: {detail}", self.name);
        StepReport {
            name: self.name.to_string(),
            status: StepStatus::Failed,
            duration_ms: self.started.elapsed().as_millis(),
            detail,
        }
    }

    fn skip(self, detail: String) -> StepReport {
        StepReport {
            name: self.name.to_string(),
            status: StepStatus::Skipped,
            duration_ms: 0,
            detail,
        }
    }
}

/// Runs the full pipeline for a year.
///
/// A step failure stops the remaining steps and marks the run failed, but
/// still records the run and releases the year lock. Only lock contention
/// and bookkeeping failures surface as `Err`.
///
/// # Errors
///
/// Returns [`PipelineError`] if the year lock is held or run bookkeeping
/// fails.
pub async fn run_pipeline(
    db: &dyn Database,
    config: &EngineConfig,
    options: &PipelineOptions,
    progress: &Arc<dyn ProgressCallback>,
) -> Result<RunReport, PipelineError> {
    let year = options.year;

    if !queries::try_year_lock(db, year).await? {
        return Err(PipelineError::Locked { year });
    }

    // The lock must be released on every path from here, including run
    // bookkeeping failures, or the year stays locked until the session dies.
    let run_id = match queries::create_pipeline_run(db, year).await {
        Ok(id) => id,
        Err(e) => {
            queries::release_year_lock(db, year).await?;
            return Err(e.into());
        }
    };
    let report = execute_steps(db, config, options, progress, run_id).await;

    let (status, summary) = match &report {
        Ok(r) => {
            let status = if r.succeeded { "completed" } else { "failed" };
            (status, r.summary_json())
        }
        Err(e) => ("failed", serde_json::json!({ "error": e.to_string() })),
    };
    let finished = queries::finish_pipeline_run(db, run_id, status, &summary).await;
    queries::release_year_lock(db, year).await?;
    finished?;

    report
}

#[allow(clippy::too_many_lines)]
async fn execute_steps(
    db: &dyn Database,
    config: &EngineConfig,
    options: &PipelineOptions,
    progress: &Arc<dyn ProgressCallback>,
    run_id: i64,
) -> Result<RunReport, PipelineError> {
    let year = options.year;
    let mut report = RunReport {
        year,
        run_id,
        version_id: None,
        steps: Vec::new(),
        succeeded: false,
    };

    progress.set_total(8);

    // Freshness gate.
    let timer = StepTimer::start("freshness", progress);
    if options.skip_freshness {
        report.steps.push(timer.skip("skipped by request".to_string()));
    } else {
        let freshness = check_freshness(db, config).await?;
        let blocking = blocking_sources(&freshness, config);
        if blocking.is_empty() {
            let stale_count = freshness.iter().filter(|f| f.stale).count();
            for f in freshness.iter().filter(|f| f.stale) {
                log::warn!("Non-critical source {} is stale", f.source_id);
            }
            report
                .steps
                .push(timer.complete(format!("{stale_count} stale non-critical source(s)")));
        } else {
            let names: Vec<&str> = blocking.iter().map(|f| f.source_id.as_str()).collect();
            report
                .steps
                .push(timer.fail(format!("stale critical source(s): {}", names.join(", "))));
            return Ok(report);
        }
    }
    progress.inc(1);

    // POI aggregation.
    let timer = StepTimer::start("aggregate_pois", progress);
    match kvarter_aggregate::aggregate_all(db, config, year).await {
        Ok(summaries) => {
            let rows: u64 = summaries.iter().map(|s| s.rows_written).sum();
            report
                .steps
                .push(timer.complete(format!("{} categories, {rows} rows", summaries.len())));
        }
        Err(e) => {
            report.steps.push(timer.fail(e.to_string()));
            return Ok(report);
        }
    }
    progress.inc(1);

    // Proximity composite.
    let timer = StepTimer::start("proximity", progress);
    match kvarter_proximity::compute_proximity(db, config, year).await {
        Ok(results) => {
            report
                .steps
                .push(timer.complete(format!("{} areas scored", results.len())));
        }
        Err(e) => {
            report.steps.push(timer.fail(e.to_string()));
            return Ok(report);
        }
    }
    progress.inc(1);

    // Normalization.
    let timer = StepTimer::start("normalize", progress);
    match kvarter_normalize::normalize_year(db, year).await {
        Ok(written) => {
            report.steps.push(timer.complete(format!("{written} values")));
        }
        Err(e) => {
            report.steps.push(timer.fail(e.to_string()));
            return Ok(report);
        }
    }
    progress.inc(1);

    // Composite scoring.
    let timer = StepTimer::start("score", progress);
    let version_id =
        match kvarter_scoring::composite::compute_scores(db, config, year, &options.tenant).await
        {
            Ok(summary) => {
                report.steps.push(timer.complete(format!(
                    "{} areas, {} indicators, version {}",
                    summary.areas_scored, summary.indicators_used, summary.version_id
                )));
                summary.version_id
            }
            Err(e) => {
                report.steps.push(timer.fail(e.to_string()));
                return Ok(report);
            }
        };
    report.version_id = Some(version_id);
    progress.inc(1);

    // Trends.
    let timer = StepTimer::start("trends", progress);
    let base_year = year - options.trend_window_years;
    match kvarter_scoring::trend::compute_trends(db, config, base_year, year).await {
        Ok(summary) => {
            report.steps.push(timer.complete(format!(
                "{} trends, {} composites",
                summary.trends_written, summary.composites_written
            )));
        }
        Err(e) => {
            report.steps.push(timer.fail(e.to_string()));
            return Ok(report);
        }
    }
    progress.inc(1);

    // Sentinel + drift validation.
    let timer = StepTimer::start("validate_version", progress);
    let accepted =
        match kvarter_scoring::version::validate_version(db, config, version_id).await {
            Ok(outcome) => {
                report
                    .steps
                    .push(timer.complete(format!("version status {}", outcome.status)));
                outcome.accepted()
            }
            Err(e) => {
                report.steps.push(timer.fail(e.to_string()));
                return Ok(report);
            }
        };
    progress.inc(1);

    // Publication.
    let timer = StepTimer::start("publish", progress);
    if options.publish && (accepted || options.force_publish) {
        match kvarter_scoring::version::publish_version(db, version_id, options.force_publish)
            .await
        {
            Ok(()) => {
                report
                    .steps
                    .push(timer.complete(format!("version {version_id} published")));
            }
            Err(e) => {
                report.steps.push(timer.fail(e.to_string()));
                return Ok(report);
            }
        }
    } else if options.publish {
        report
            .steps
            .push(timer.skip("validation rejected the version".to_string()));
    } else {
        report.steps.push(timer.skip("publish not requested".to_string()));
    }
    progress.inc(1);

    report.succeeded = report
        .steps
        .iter()
        .all(|s| s.status != StepStatus::Failed);
    progress.finish(format!(
        "Pipeline for {year} {}",
        if report.succeeded { "completed" } else { "failed" }
    ));

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_ingested_source_is_stale() {
        assert!(is_stale(None, 365, Utc::now()));
    }

    #[test]
    fn freshness_window_boundary() {
        let now = Utc::now();
        let recent = now - Duration::days(10);
        let old = now - Duration::days(40);
        assert!(!is_stale(Some(recent), 30, now));
        assert!(is_stale(Some(old), 30, now));
    }

    #[test]
    fn blocking_sources_only_critical() {
        let config = EngineConfig::load().unwrap();
        let freshness = vec![
            SourceFreshness {
                source_id: "scb".to_string(),
                critical: true,
                last_completed: None,
                stale: true,
            },
            SourceFreshness {
                source_id: "osm_poi".to_string(),
                critical: false,
                last_completed: None,
                stale: true,
            },
        ];

        let blocking = blocking_sources(&freshness, &config);
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].source_id, "scb");
    }

    #[test]
    fn default_options_do_not_publish() {
        let options = PipelineOptions::for_year(2024);
        assert!(!options.publish);
        assert_eq!(options.trend_window_years, 3);
        assert_eq!(options.tenant, TenantContext::public());
    }
}
