//! Test and info results.

use serde::{Deserialize, Serialize};
use crate::id::{InfoId, OrganisationId, PackageId, RuleId, RuntimeId};
use crate::Time;

/// Outcome codes that are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultCode {
    /// Predicate returned true
    Pass,
    /// Predicate returned false, or the activity lacks an identifier
    Fail,
    /// Predicate raised a fault
    Error,
}

impl ResultCode {
    /// Uppercase code as written to the datastore.
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Pass => "PASS",
            ResultCode::Fail => "FAIL",
            ResultCode::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating one rule against one document unit.
///
/// `Skip` is computed for predicates that cannot decide and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Rule holds
    Pass,
    /// Rule does not hold
    Fail,
    /// Rule could not decide
    Skip,
    /// Rule evaluation faulted
    Error,
}

impl Verdict {
    /// The code to write, or `None` for verdicts that are dropped.
    pub fn persisted(self) -> Option<ResultCode> {
        match self {
            Verdict::Pass => Some(ResultCode::Pass),
            Verdict::Fail => Some(ResultCode::Fail),
            Verdict::Error => Some(ResultCode::Error),
            Verdict::Skip => None,
        }
    }
}

/// One persisted rule outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// Execution this result belongs to
    pub runtime_id: RuntimeId,

    /// Package under test
    pub package_id: PackageId,

    /// Rule that produced the outcome
    pub test_id: RuleId,

    /// Outcome
    pub result_data: ResultCode,

    /// Activity identifier (absent for organisation-level results)
    pub result_identifier: Option<String>,

    /// Hierarchy of the activity, 0 when absent
    pub result_hierarchy: i64,

    /// Organisation the unit was tested for
    pub organisation_id: Option<OrganisationId>,
}

/// One persisted info metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoResult {
    /// Execution this value belongs to
    pub runtime_id: RuntimeId,

    /// Package the value was computed from
    pub package_id: PackageId,

    /// Organisation the value describes
    pub organisation_id: OrganisationId,

    /// Configured metric
    pub info_id: InfoId,

    /// Metric value
    pub result_data: f64,
}

/// A test run groups every result of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    /// Runtime identifier
    pub id: RuntimeId,

    /// When the run was started
    pub started_at: Time,
}

/// Per-rule outcome counts for one package within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRow {
    /// Run
    pub runtime_id: RuntimeId,

    /// Package
    pub package_id: PackageId,

    /// Organisation, if the results carried one
    pub organisation_id: Option<OrganisationId>,

    /// Rule
    pub test_id: RuleId,

    /// Number of PASS results
    pub pass: u64,

    /// Number of FAIL results
    pub fail: u64,

    /// Number of ERROR results
    pub error: u64,
}

impl AggregateRow {
    /// Total results counted.
    pub fn total(&self) -> u64 {
        self.pass + self.fail + self.error
    }

    /// Add one result to the counts.
    pub fn count(&mut self, code: ResultCode) {
        match code {
            ResultCode::Pass => self.pass += 1,
            ResultCode::Fail => self.fail += 1,
            ResultCode::Error => self.error += 1,
        }
    }
}
