//! Score version lifecycle.
//!
//! Versions move `draft -> validated -> published`, with `rejected` for
//! drafts that fail their checks and `superseded` for published versions
//! replaced by a newer publish. Scores under a published version are never
//! recomputed in place; corrections always go through a new version.

use kvarter_config::EngineConfig;
use kvarter_database::queries;
use kvarter_models::VersionStatus;
use switchy_database::Database;

use crate::drift::{self, DriftReport};
use crate::sentinel::{self, SentinelReport};
use crate::ScoringError;

/// Outcome of validating a draft version.
#[derive(Debug)]
pub struct ValidationOutcome {
    pub version_id: i32,
    pub status: VersionStatus,
    pub sentinel_report: SentinelReport,
    pub drift_report: Option<DriftReport>,
}

impl ValidationOutcome {
    #[must_use]
    pub const fn accepted(&self) -> bool {
        matches!(self.status, VersionStatus::Validated)
    }
}

/// Runs sentinel and drift checks on a draft and transitions it to
/// `validated` or `rejected`.
///
/// Drift flags reject the version outright; an operator who has verified
/// the movement is real publishes with `force` instead.
///
/// # Errors
///
/// Returns [`ScoringError`] if the version is missing, not a draft, or a
/// database operation fails.
pub async fn validate_version(
    db: &dyn Database,
    config: &EngineConfig,
    version_id: i32,
) -> Result<ValidationOutcome, ScoringError> {
    let version = queries::get_version(db, version_id)
        .await?
        .ok_or(ScoringError::VersionNotFound { version_id })?;

    if version.status != VersionStatus::Draft {
        return Err(ScoringError::InvalidTransition {
            version_id,
            from: version.status,
            to: VersionStatus::Validated,
        });
    }

    let sentinel_report = sentinel::check_version(db, version_id).await?;
    let drift_report = drift::detect_drift(db, config, version_id).await?;

    let drift_ok = drift_report.as_ref().is_none_or(|r| !r.is_flagged());
    let status = if sentinel_report.all_passed() && drift_ok {
        VersionStatus::Validated
    } else {
        VersionStatus::Rejected
    };

    let summary = serde_json::json!({
        "sentinels_passed": sentinel_report.all_passed(),
        "sentinels_failed": sentinel_report.failed_count(),
        "drift": drift_report.as_ref().map(DriftReport::summary_json),
    });
    queries::set_validation_summary(db, version_id, &summary).await?;
    queries::set_version_status(db, version_id, status).await?;
    log::info!("Version {version_id} -> {status}");

    Ok(ValidationOutcome {
        version_id,
        status,
        sentinel_report,
        drift_report,
    })
}

/// Publishes a validated version, superseding the previously published
/// version for its year.
///
/// `force` allows publishing a rejected version after manual review; it
/// never allows re-publishing a superseded one.
///
/// # Errors
///
/// Returns [`ScoringError`] if the version is missing, not in a
/// publishable state, or a database operation fails.
pub async fn publish_version(
    db: &dyn Database,
    version_id: i32,
    force: bool,
) -> Result<(), ScoringError> {
    let version = queries::get_version(db, version_id)
        .await?
        .ok_or(ScoringError::VersionNotFound { version_id })?;

    let publishable = match version.status {
        VersionStatus::Validated => true,
        VersionStatus::Rejected | VersionStatus::Draft => force,
        VersionStatus::Published | VersionStatus::Superseded => false,
    };

    if !publishable {
        return Err(ScoringError::InvalidTransition {
            version_id,
            from: version.status,
            to: VersionStatus::Published,
        });
    }

    if force && version.status != VersionStatus::Validated {
        log::warn!(
            "Force-publishing version {version_id} from status {}",
            version.status
        );
    }

    queries::publish_version(db, version_id, version.year).await?;
    log::info!("Published version {version_id} for {}", version.year);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentinel::SentinelReport;

    #[test]
    fn outcome_accepted_only_when_validated() {
        let outcome = ValidationOutcome {
            version_id: 1,
            status: VersionStatus::Validated,
            sentinel_report: SentinelReport { outcomes: vec![] },
            drift_report: None,
        };
        assert!(outcome.accepted());

        let rejected = ValidationOutcome {
            status: VersionStatus::Rejected,
            ..outcome
        };
        assert!(!rejected.accepted());
    }
}
