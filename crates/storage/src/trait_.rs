//! Storage trait abstraction.

use async_trait::async_trait;
use dq_core::{
    AggregateRow, InfoResult, OrganisationId, OrganisationTarget, PackageId, PackageStatus,
    RuntimeId, TestResult, TestRun,
};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Storage for test runs and their results.
///
/// Every mutation is staged. Staged writes become visible together on
/// [`Storage::commit`] and are discarded by [`Storage::rollback`], so one
/// commit is one transaction boundary.
#[async_trait]
pub trait Storage: Send + Sync {
    // === Test results ===

    /// Stage a test result.
    async fn save_result(&mut self, result: &TestResult) -> Result<()>;

    /// Stage deletion of every result recorded for a package.
    async fn delete_results(&mut self, package_id: PackageId) -> Result<()>;

    /// List committed results for a package.
    async fn list_results(&self, package_id: PackageId) -> Result<Vec<TestResult>>;

    // === Info results ===

    /// Stage replacement of the value for `(info_id, organisation_id)`: any
    /// prior value for that pair is deleted before the new one is inserted.
    async fn replace_info_result(&mut self, result: &InfoResult) -> Result<()>;

    /// List committed info results for an organisation.
    async fn list_info_results(&self, organisation_id: OrganisationId) -> Result<Vec<InfoResult>>;

    // === Test runs ===

    /// Allocate a new run. The run is staged like any other write.
    async fn start_testrun(&mut self) -> Result<TestRun>;

    /// Stage the record that `package_id` was last tested in `runtime_id`.
    async fn record_testrun(&mut self, package_id: PackageId, runtime_id: RuntimeId) -> Result<()>;

    /// Run in which the package was last tested.
    async fn last_tested_run(&self, package_id: PackageId) -> Result<Option<RuntimeId>>;

    // === Transaction support ===

    /// Make staged writes visible.
    async fn commit(&mut self, message: &str) -> Result<()>;

    /// Discard staged writes.
    async fn rollback(&mut self) -> Result<()>;
}

/// Supplies the organisations to test in a package.
#[async_trait]
pub trait OrganisationSelector: Send + Sync {
    /// Organisations published in `package_id`, each with its activity selector.
    async fn organisations_for_testing(&self, package_id: PackageId) -> Result<Vec<OrganisationTarget>>;
}

/// Tracks package processing status.
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    /// Stage a status change for a package.
    async fn set_package_status(&mut self, package_id: PackageId, status: PackageStatus) -> Result<()>;

    /// Committed status of a package.
    async fn package_status(&self, package_id: PackageId) -> Result<Option<PackageStatus>>;
}

/// Rolls committed results up into per-rule summaries.
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Count committed results of `(runtime_id, package_id)` per rule and stage
    /// them, replacing any earlier aggregation of the same pair.
    async fn aggregate_results(
        &mut self,
        runtime_id: RuntimeId,
        package_id: PackageId,
    ) -> Result<Vec<AggregateRow>>;
}

/// Resolves codes to display names.
pub trait CodelistLookup: Send + Sync {
    /// Display name for `code`, if known.
    fn name_for(&self, code: &str) -> Option<String>;
}

/// Everything the test pipeline needs from a backend.
pub trait Datastore: Storage + OrganisationSelector + StatusUpdater + Aggregator {}

impl<T> Datastore for T where T: Storage + OrganisationSelector + StatusUpdater + Aggregator {}
