//! Committed state shared by the storage backends, and the staged operations
//! that change it.

use std::collections::BTreeMap;

use dq_core::{
    AggregateRow, InfoResult, OrganisationId, OrganisationTarget, PackageId, PackageStatus,
    RuleId, RuntimeId, TestResult, TestRun,
};
use serde::{Deserialize, Serialize};

/// A staged write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum Op {
    SaveResult(TestResult),
    DeleteResults { package_id: PackageId },
    ReplaceInfo(InfoResult),
    StartRun(TestRun),
    RecordTestrun { package_id: PackageId, runtime_id: RuntimeId },
    SetStatus { package_id: PackageId, status: PackageStatus },
    PutAggregates {
        runtime_id: RuntimeId,
        package_id: PackageId,
        rows: Vec<AggregateRow>,
    },
}

/// Committed tables.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    pub results: Vec<TestResult>,
    pub info_results: Vec<InfoResult>,
    pub runs: Vec<TestRun>,
    pub tested: BTreeMap<PackageId, RuntimeId>,
    pub statuses: BTreeMap<PackageId, PackageStatus>,
    pub aggregates: Vec<AggregateRow>,
    pub organisations: BTreeMap<PackageId, Vec<OrganisationTarget>>,
}

impl Tables {
    pub fn apply(&mut self, op: Op) {
        match op {
            Op::SaveResult(result) => self.results.push(result),
            Op::DeleteResults { package_id } => {
                self.results.retain(|r| r.package_id != package_id);
            }
            Op::ReplaceInfo(info) => {
                self.info_results.retain(|r| {
                    !(r.info_id == info.info_id && r.organisation_id == info.organisation_id)
                });
                self.info_results.push(info);
            }
            Op::StartRun(run) => self.runs.push(run),
            Op::RecordTestrun { package_id, runtime_id } => {
                self.tested.insert(package_id, runtime_id);
            }
            Op::SetStatus { package_id, status } => {
                self.statuses.insert(package_id, status);
            }
            Op::PutAggregates { runtime_id, package_id, rows } => {
                self.aggregates
                    .retain(|a| !(a.runtime_id == runtime_id && a.package_id == package_id));
                self.aggregates.extend(rows);
            }
        }
    }

    /// Next free runtime id, counting staged runs as taken.
    pub fn next_runtime_id(&self, staged: &[Op]) -> RuntimeId {
        let staged_max = staged.iter().filter_map(|op| match op {
            Op::StartRun(run) => Some(run.id.get()),
            _ => None,
        });
        let max = self.runs.iter().map(|r| r.id.get()).chain(staged_max).max().unwrap_or(0);
        RuntimeId(max + 1)
    }

    pub fn results_for(&self, package_id: PackageId) -> Vec<TestResult> {
        self.results
            .iter()
            .filter(|r| r.package_id == package_id)
            .cloned()
            .collect()
    }

    pub fn info_for(&self, organisation_id: OrganisationId) -> Vec<InfoResult> {
        self.info_results
            .iter()
            .filter(|r| r.organisation_id == organisation_id)
            .cloned()
            .collect()
    }

    /// Per-rule counts of the committed results of one package in one run.
    pub fn aggregate(&self, runtime_id: RuntimeId, package_id: PackageId) -> Vec<AggregateRow> {
        let mut rows: BTreeMap<(Option<OrganisationId>, RuleId), AggregateRow> = BTreeMap::new();
        for result in self
            .results
            .iter()
            .filter(|r| r.runtime_id == runtime_id && r.package_id == package_id)
        {
            rows.entry((result.organisation_id, result.test_id))
                .or_insert_with(|| AggregateRow {
                    runtime_id,
                    package_id,
                    organisation_id: result.organisation_id,
                    test_id: result.test_id,
                    pass: 0,
                    fail: 0,
                    error: 0,
                })
                .count(result.result_data);
        }
        rows.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dq_core::{InfoId, ResultCode};

    fn result(package: i64, test: i64, code: ResultCode) -> TestResult {
        TestResult {
            runtime_id: RuntimeId(1),
            package_id: PackageId(package),
            test_id: RuleId(test),
            result_data: code,
            result_identifier: Some("GB-1".to_string()),
            result_hierarchy: 0,
            organisation_id: Some(OrganisationId(1)),
        }
    }

    #[test]
    fn test_replace_info_keeps_one_value_per_pair() {
        let mut tables = Tables::default();
        for (runtime, value) in [(1, 10.0), (2, 20.0)] {
            tables.apply(Op::ReplaceInfo(InfoResult {
                runtime_id: RuntimeId(runtime),
                package_id: PackageId(1),
                organisation_id: OrganisationId(4),
                info_id: InfoId(2),
                result_data: value,
            }));
        }
        let values = tables.info_for(OrganisationId(4));
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].result_data, 20.0);
    }

    #[test]
    fn test_aggregate_counts_per_rule() {
        let mut tables = Tables::default();
        tables.apply(Op::SaveResult(result(1, 1, ResultCode::Pass)));
        tables.apply(Op::SaveResult(result(1, 1, ResultCode::Fail)));
        tables.apply(Op::SaveResult(result(1, 2, ResultCode::Error)));
        tables.apply(Op::SaveResult(result(2, 1, ResultCode::Pass)));

        let rows = tables.aggregate(RuntimeId(1), PackageId(1));
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].pass, rows[0].fail, rows[0].error), (1, 1, 0));
        assert_eq!((rows[1].pass, rows[1].fail, rows[1].error), (0, 0, 1));
    }

    #[test]
    fn test_next_runtime_id_counts_staged_runs() {
        let tables = Tables::default();
        let staged = vec![Op::StartRun(TestRun { id: RuntimeId(3), started_at: chrono::Utc::now() })];
        assert_eq!(tables.next_runtime_id(&[]), RuntimeId(1));
        assert_eq!(tables.next_runtime_id(&staged), RuntimeId(4));
    }
}
