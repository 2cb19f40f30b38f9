//! In-memory storage backend.

use async_trait::async_trait;
use dq_core::{
    AggregateRow, InfoResult, OrganisationId, OrganisationTarget, PackageId, PackageStatus,
    RuntimeId, TestResult, TestRun,
};

use crate::tables::{Op, Tables};
use crate::trait_::{Aggregator, OrganisationSelector, Result, StatusUpdater, Storage};

/// Storage that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: Tables,
    pending: Vec<Op>,
    commits: usize,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the organisations published in a package.
    pub fn with_organisations(mut self, package_id: PackageId, targets: Vec<OrganisationTarget>) -> Self {
        self.tables.organisations.insert(package_id, targets);
        self
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits
    }

    /// Number of staged, uncommitted writes.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Committed aggregation rows.
    pub fn aggregates(&self) -> &[AggregateRow] {
        &self.tables.aggregates
    }

    /// Committed runs.
    pub fn runs(&self) -> &[TestRun] {
        &self.tables.runs
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_result(&mut self, result: &TestResult) -> Result<()> {
        self.pending.push(Op::SaveResult(result.clone()));
        Ok(())
    }

    async fn delete_results(&mut self, package_id: PackageId) -> Result<()> {
        self.pending.push(Op::DeleteResults { package_id });
        Ok(())
    }

    async fn list_results(&self, package_id: PackageId) -> Result<Vec<TestResult>> {
        Ok(self.tables.results_for(package_id))
    }

    async fn replace_info_result(&mut self, result: &InfoResult) -> Result<()> {
        self.pending.push(Op::ReplaceInfo(result.clone()));
        Ok(())
    }

    async fn list_info_results(&self, organisation_id: OrganisationId) -> Result<Vec<InfoResult>> {
        Ok(self.tables.info_for(organisation_id))
    }

    async fn start_testrun(&mut self) -> Result<TestRun> {
        let run = TestRun {
            id: self.tables.next_runtime_id(&self.pending),
            started_at: chrono::Utc::now(),
        };
        self.pending.push(Op::StartRun(run.clone()));
        Ok(run)
    }

    async fn record_testrun(&mut self, package_id: PackageId, runtime_id: RuntimeId) -> Result<()> {
        self.pending.push(Op::RecordTestrun { package_id, runtime_id });
        Ok(())
    }

    async fn last_tested_run(&self, package_id: PackageId) -> Result<Option<RuntimeId>> {
        Ok(self.tables.tested.get(&package_id).copied())
    }

    async fn commit(&mut self, message: &str) -> Result<()> {
        let ops = std::mem::take(&mut self.pending);
        tracing::trace!(ops = ops.len(), "commit: {}", message);
        for op in ops {
            self.tables.apply(op);
        }
        self.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }
}

#[async_trait]
impl OrganisationSelector for MemoryStorage {
    async fn organisations_for_testing(&self, package_id: PackageId) -> Result<Vec<OrganisationTarget>> {
        Ok(self.tables.organisations.get(&package_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl StatusUpdater for MemoryStorage {
    async fn set_package_status(&mut self, package_id: PackageId, status: PackageStatus) -> Result<()> {
        self.pending.push(Op::SetStatus { package_id, status });
        Ok(())
    }

    async fn package_status(&self, package_id: PackageId) -> Result<Option<PackageStatus>> {
        Ok(self.tables.statuses.get(&package_id).copied())
    }
}

#[async_trait]
impl Aggregator for MemoryStorage {
    async fn aggregate_results(
        &mut self,
        runtime_id: RuntimeId,
        package_id: PackageId,
    ) -> Result<Vec<AggregateRow>> {
        let rows = self.tables.aggregate(runtime_id, package_id);
        self.pending.push(Op::PutAggregates {
            runtime_id,
            package_id,
            rows: rows.clone(),
        });
        Ok(rows)
    }
}
