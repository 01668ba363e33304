#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Composite scoring and its guard rails.
//!
//! [`composite`] blends normalized indicators into 0-100 area scores under
//! immutable versions, [`trend`] computes multi-year movement, [`drift`]
//! and [`sentinel`] gate publication, and [`version`] owns the lifecycle
//! transitions.

pub mod composite;
pub mod drift;
pub mod sentinel;
pub mod trend;
pub mod version;

use kvarter_database::DbError;
use kvarter_models::VersionStatus;

/// Errors raised by the scoring engine.
#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    /// Database error.
    #[error(transparent)]
    Db(#[from] DbError),

    /// No indicator had usable data for the requested year.
    #[error("No usable indicators for {year}")]
    NoUsableIndicators {
        /// Requested scoring year.
        year: i32,
    },

    /// Referenced score version does not exist.
    #[error("Score version {version_id} not found")]
    VersionNotFound {
        /// The missing version id.
        version_id: i32,
    },

    /// The version is not in a state that allows the transition.
    #[error("Version {version_id} cannot move from {from} to {to}")]
    InvalidTransition {
        version_id: i32,
        from: VersionStatus,
        to: VersionStatus,
    },
}
