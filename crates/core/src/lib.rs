//! Core data model for publication quality testing.
//!
//! This crate defines the records that flow between the rule compiler, the
//! test pipeline and the datastore. It performs no I/O.

#![warn(missing_docs)]

// Identities
mod id;

// Rules and their outcomes
mod rule;
mod result;

// Packages and jobs
mod package;

pub use id::{IdParseError, InfoId, OrganisationId, PackageId, RuleId, RuntimeId};
pub use rule::{Level, LevelParseError, RuleDefinition};
pub use result::{AggregateRow, InfoResult, ResultCode, TestResult, TestRun, Verdict};
pub use package::{JobPayload, OrganisationTarget, PackageStatus, VALID_DOCUMENT_TEST};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
