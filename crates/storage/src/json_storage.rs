//! JSON directory storage implementation.
//!
//! Committed writes are appended to `journal.jsonl`, one line per commit, and
//! replayed when the store is opened. A torn final line (a crash mid-append)
//! is cut off on open, so each commit is all-or-nothing. The organisations
//! to test per package are read from `organisations.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dq_core::{
    AggregateRow, InfoResult, OrganisationId, OrganisationTarget, PackageId, PackageStatus,
    RuntimeId, TestResult, TestRun,
};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::tables::{Op, Tables};
use crate::trait_::{Aggregator, OrganisationSelector, Result, StatusUpdater, Storage};

const JOURNAL: &str = "journal.jsonl";
const ORGANISATIONS: &str = "organisations.json";

/// File-based JSON storage backend.
pub struct JsonStorage {
    root: PathBuf,
    tables: Tables,
    pending: Vec<Op>,
}

impl JsonStorage {
    /// Open (or create) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let mut tables = Tables::default();
        if let Some(organisations) =
            read_json::<BTreeMap<PackageId, Vec<OrganisationTarget>>>(&root.join(ORGANISATIONS)).await?
        {
            tables.organisations = organisations;
        }

        let journal = root.join(JOURNAL);
        match fs::read_to_string(&journal).await {
            Ok(text) => {
                // every commit ends with a newline; anything after the last one is torn
                let complete = text.rfind('\n').map_or(0, |idx| idx + 1);
                if complete < text.len() {
                    tracing::warn!(
                        "Dropping torn journal tail of {} bytes in {}",
                        text.len() - complete,
                        journal.display()
                    );
                    let file = fs::OpenOptions::new().write(true).open(&journal).await?;
                    file.set_len(complete as u64).await?;
                    file.sync_data().await?;
                }
                for line in text[..complete].lines().filter(|l| !l.trim().is_empty()) {
                    let ops: Vec<Op> = serde_json::from_str(line)?;
                    ops.into_iter().for_each(|op| tables.apply(op));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(
            results = tables.results.len(),
            runs = tables.runs.len(),
            "Opened JSON storage at {}",
            root.display()
        );

        Ok(Self {
            root,
            tables,
            pending: Vec::new(),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replace the organisation list of a package and persist it.
    pub async fn set_organisations(
        &mut self,
        package_id: PackageId,
        targets: Vec<OrganisationTarget>,
    ) -> Result<()> {
        self.tables.organisations.insert(package_id, targets);
        let json = serde_json::to_string_pretty(&self.tables.organisations)?;
        let tmp = self.root.join(format!("{}.tmp", ORGANISATIONS));
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, self.root.join(ORGANISATIONS)).await?;
        Ok(())
    }

}

#[async_trait]
impl Storage for JsonStorage {
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
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut line = serde_json::to_string(&self.pending)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(JOURNAL))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;

        tracing::trace!(ops = self.pending.len(), "commit: {}", message);
        for op in std::mem::take(&mut self.pending) {
            self.tables.apply(op);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }
}

#[async_trait]
impl OrganisationSelector for JsonStorage {
    async fn organisations_for_testing(&self, package_id: PackageId) -> Result<Vec<OrganisationTarget>> {
        Ok(self.tables.organisations.get(&package_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl StatusUpdater for JsonStorage {
    async fn set_package_status(&mut self, package_id: PackageId, status: PackageStatus) -> Result<()> {
        self.pending.push(Op::SetStatus { package_id, status });
        Ok(())
    }

    async fn package_status(&self, package_id: PackageId) -> Result<Option<PackageStatus>> {
        Ok(self.tables.statuses.get(&package_id).copied())
    }
}

#[async_trait]
impl Aggregator for JsonStorage {
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

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
