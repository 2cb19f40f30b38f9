//! Packages, organisations and queued jobs.

use serde::{Deserialize, Serialize};
use crate::id::{OrganisationId, PackageId, RuleId, RuntimeId};

/// Rule id reserved for the synthetic "document is valid" result.
///
/// Rule files number their rules from 1, so 0 never collides.
pub const VALID_DOCUMENT_TEST: RuleId = RuleId(0);

/// Processing status of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    /// Tested; results and aggregation are available
    Tested,
}

/// An organisation to test within a package, and how to find its activities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganisationTarget {
    /// Organisation identifier
    pub organisation_id: OrganisationId,

    /// Path selector returning the organisation's activity nodes
    pub activities_selector: String,
}

/// A queued request to test one package file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Path of the downloaded document
    pub filename: String,

    /// Run the results belong to
    pub runtime_id: RuntimeId,

    /// Package under test
    pub package_id: PackageId,
}

impl JobPayload {
    /// Decode a queue message body.
    pub fn decode(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Encode for a queue message body.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
