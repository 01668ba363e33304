#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Command-line entry point for the kvarter scoring engine.
//!
//! Each subcommand runs one engine step against the configured database;
//! `pipeline` chains them all for a year. Uses `indicatif-log-bridge`
//! (via [`kvarter_cli_utils::init_logger`]) so log lines and progress
//! bars never fight for the terminal.

use clap::{Parser, Subcommand};
use kvarter_cli_utils::IndicatifProgress;
use kvarter_config::EngineConfig;
use kvarter_models::TenantContext;
use kvarter_pipeline::PipelineOptions;
use kvarter_validate::rules::{BatchRow, ValueBatch};

#[derive(Parser)]
#[command(name = "kvarter", about = "Neighborhood quality scoring engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations
    Migrate,

    /// Report source data freshness against configured shelf lives
    Freshness,

    /// Validate an ingestion batch from a JSON file of rows
    Validate {
        /// Source id the batch belongs to (e.g. scb, bra)
        #[arg(long)]
        source: String,
        /// Data year of the batch
        #[arg(long)]
        year: i32,
        /// Path to a JSON array of {indicator_slug, deso_code, value}
        #[arg(long)]
        file: String,
    },

    /// Aggregate POI densities into indicator values
    AggregatePois {
        #[arg(long)]
        year: i32,
    },

    /// Compute proximity composites for every area
    Proximity {
        #[arg(long)]
        year: i32,
    },

    /// Score a single query point, as the synchronous address path would
    ProximityPin {
        #[arg(long)]
        lat: f64,
        #[arg(long)]
        lng: f64,
        /// Year whose safety standings apply
        #[arg(long)]
        year: i32,
    },

    /// Normalize raw values for every active indicator
    Normalize {
        #[arg(long)]
        year: i32,
    },

    /// Compute composite scores under a new draft version
    Score {
        #[arg(long)]
        year: i32,
        /// Tenant whose weight overrides apply; omit for public weights
        #[arg(long)]
        tenant: Option<i32>,
    },

    /// Compute indicator and composite trends over a window
    Trends {
        #[arg(long)]
        year: i32,
        /// Window length in years
        #[arg(long, default_value_t = 3)]
        window: i32,
    },

    /// Run sentinel and drift checks on a draft version
    ValidateVersion {
        #[arg(long)]
        version: i32,
    },

    /// Run sentinel checks alone against a version's scores
    Sentinels {
        #[arg(long)]
        version: i32,
    },

    /// Compare a version against the published baseline
    Drift {
        #[arg(long)]
        version: i32,
    },

    /// Publish a validated version, superseding the previous publish
    Publish {
        #[arg(long)]
        version: i32,
        /// Publish even if validation rejected the version
        #[arg(long)]
        force: bool,
    },

    /// Run the full yearly pipeline
    Pipeline {
        #[arg(long)]
        year: i32,
        /// Publish the version if it validates cleanly
        #[arg(long)]
        publish: bool,
        /// Publish even if validation rejects the version
        #[arg(long)]
        force: bool,
        /// Skip the source freshness gate (backfills)
        #[arg(long)]
        skip_freshness: bool,
        #[arg(long)]
        tenant: Option<i32>,
        #[arg(long, default_value_t = 3)]
        window: i32,
    },
}

fn tenant_context(tenant: Option<i32>) -> TenantContext {
    tenant.map_or_else(TenantContext::public, TenantContext::for_tenant)
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = kvarter_cli_utils::init_logger();
    let cli = Cli::parse();

    let config = EngineConfig::load()?;
    let db = kvarter_database::db::connect_from_env().await?;

    match cli.command {
        Command::Migrate => {
            kvarter_database::run_migrations(&*db).await?;
        }

        Command::Freshness => {
            let freshness = kvarter_pipeline::check_freshness(&*db, &config).await?;
            for entry in &freshness {
                let age = entry
                    .last_completed
                    .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
                println!(
                    "{:<16} critical={:<5} stale={:<5} last_completed={age}",
                    entry.source_id, entry.critical, entry.stale
                );
            }
            let blocking = kvarter_pipeline::blocking_sources(&freshness, &config);
            if !blocking.is_empty() {
                log::warn!("{} critical source(s) are stale", blocking.len());
            }
        }

        Command::Validate { source, year, file } => {
            let raw = std::fs::read_to_string(&file)?;
            let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
            let rows: Vec<BatchRow> = parsed
                .iter()
                .map(|v| BatchRow {
                    indicator_slug: v["indicator_slug"].as_str().unwrap_or_default().to_string(),
                    deso_code: v["deso_code"].as_str().unwrap_or_default().to_string(),
                    value: v["value"].as_f64(),
                })
                .collect();

            let batch = ValueBatch { source, year, rows };
            let (log_id, report) = kvarter_validate::validate_batch(&*db, &batch).await?;
            println!("{}", serde_json::to_string_pretty(&report.summary_json())?);
            if report.has_blocking_failures() {
                log::error!("Batch blocked (ingestion log {log_id})");
                std::process::exit(1);
            }
        }

        Command::AggregatePois { year } => {
            let summaries = kvarter_aggregate::aggregate_all(&*db, &config, year).await?;
            for s in &summaries {
                println!(
                    "{:<24} -> {:<24} {} POIs, {} areas, {} rows",
                    s.category_slug, s.indicator_slug, s.point_count, s.areas_processed,
                    s.rows_written
                );
            }
        }

        Command::Proximity { year } => {
            let results = kvarter_proximity::compute_proximity(&*db, &config, year).await?;
            log::info!("Scored {} areas", results.len());
        }

        Command::ProximityPin { lat, lng, year } => {
            let result = kvarter_proximity::score_point(&*db, &config, lat, lng, year).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Command::Normalize { year } => {
            let written = kvarter_normalize::normalize_year(&*db, year).await?;
            log::info!("Normalized {written} values for {year}");
        }

        Command::Score { year, tenant } => {
            let summary = kvarter_scoring::composite::compute_scores(
                &*db,
                &config,
                year,
                &tenant_context(tenant),
            )
            .await?;
            println!(
                "version {} with {} areas over {} indicators",
                summary.version_id, summary.areas_scored, summary.indicators_used
            );
            for (slug, fallback_year) in &summary.fallback_years {
                println!("  {slug}: fell back to {fallback_year} data");
            }
        }

        Command::Trends { year, window } => {
            let summary =
                kvarter_scoring::trend::compute_trends(&*db, &config, year - window, year).await?;
            println!(
                "{} trends, {} composite trends, {} indicator(s) with methodology breaks",
                summary.trends_written, summary.composites_written, summary.indicators_with_breaks
            );
        }

        Command::ValidateVersion { version } => {
            let outcome =
                kvarter_scoring::version::validate_version(&*db, &config, version).await?;
            println!("version {version} -> {}", outcome.status);
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome.sentinel_report.results_json())?
            );
            if let Some(drift) = &outcome.drift_report {
                println!("{}", serde_json::to_string_pretty(&drift.summary_json())?);
            }
            if !outcome.accepted() {
                std::process::exit(1);
            }
        }

        Command::Sentinels { version } => {
            let report = kvarter_scoring::sentinel::check_version(&*db, version).await?;
            println!("{}", serde_json::to_string_pretty(&report.results_json())?);
            if !report.all_passed() {
                std::process::exit(1);
            }
        }

        Command::Drift { version } => {
            match kvarter_scoring::drift::detect_drift(&*db, &config, version).await? {
                Some(report) => {
                    println!("{}", serde_json::to_string_pretty(&report.summary_json())?);
                    if report.is_flagged() {
                        std::process::exit(1);
                    }
                }
                None => println!("no published baseline to compare against"),
            }
        }

        Command::Publish { version, force } => {
            kvarter_scoring::version::publish_version(&*db, version, force).await?;
        }

        Command::Pipeline {
            year,
            publish,
            force,
            skip_freshness,
            tenant,
            window,
        } => {
            let options = PipelineOptions {
                year,
                trend_window_years: window,
                publish,
                force_publish: force,
                skip_freshness,
                tenant: tenant_context(tenant),
            };

            let progress = IndicatifProgress::steps_bar(&multi, "pipeline", 8);
            let report =
                kvarter_pipeline::run_pipeline(&*db, &config, &options, &progress).await?;
            println!("{}", serde_json::to_string_pretty(&report.summary_json())?);
            if !report.succeeded {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
