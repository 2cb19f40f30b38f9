//! Test execution pipeline.
//!
//! Walks one document organisation by organisation: each activity is tested
//! with the activity rules and its transactions with the transaction rules,
//! then each organisation node gets its metrics and organisation rules. Every
//! unit's results are committed as one batch.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use dq_core::{
    InfoResult, Level, OrganisationId, PackageId, PackageStatus, ResultCode, RuleId, RuntimeId,
    TestResult, Time, Verdict, VALID_DOCUMENT_TEST,
};
use dq_storage::{CodelistLookup, Datastore, StorageError};
use roxmltree::{Document, Node};
use tracing::{debug, error, info, warn};

use crate::compiler::{CompiledRules, Predicate, Tri};
use crate::document::{child_text, children, parse_document, read_document};
use crate::info::InfoMetricsEngine;
use crate::registry::MetricRegistry;
use crate::selector::{Selector, SelectorError};

/// Organisation nodes are found with this selector unless configured otherwise.
pub const DEFAULT_ORGANISATION_SELECTOR: &str = "//iati-organisation";

/// Errors that end testing of a package.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The datastore lists no organisations for the package
    #[error("package {0} has no organisations to test")]
    NoOrganisations(PackageId),

    /// An organisation's activity selector does not parse
    #[error("invalid activities selector for organisation {organisation_id}: {source}")]
    InvalidActivitiesSelector {
        /// Organisation the selector belongs to
        organisation_id: OrganisationId,
        /// Parse error
        #[source]
        source: SelectorError,
    },

    /// The configured organisation selector does not parse
    #[error("invalid organisation selector: {0}")]
    InvalidOrganisationSelector(#[source] SelectorError),

    /// Datastore failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Delete the package's earlier results before testing it
    pub remove_results: bool,

    /// Selector for the organisation nodes of a document
    pub organisation_selector: String,

    /// Metrics computed per organisation
    pub metrics: MetricRegistry,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            remove_results: false,
            organisation_selector: DEFAULT_ORGANISATION_SELECTOR.to_string(),
            metrics: MetricRegistry::new(),
        }
    }
}

/// State for testing one package in one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Run the results belong to
    pub runtime_id: RuntimeId,
    /// Package under test
    pub package_id: PackageId,
    /// Reference time for the budget metrics
    pub now: Time,
    missing: u64,
}

impl RunContext {
    /// Create a context using the current time.
    pub fn new(runtime_id: RuntimeId, package_id: PackageId) -> Self {
        Self {
            runtime_id,
            package_id,
            now: Utc::now(),
            missing: 0,
        }
    }

    /// Use a fixed reference time.
    pub fn with_now(mut self, now: Time) -> Self {
        self.now = now;
        self
    }

    /// Move the context on to another package of the same run.
    pub fn for_package(&mut self, package_id: PackageId) -> &mut Self {
        self.package_id = package_id;
        self
    }

    /// Allocate the next `MISSING-n` identifier.
    pub fn next_missing_identifier(&mut self) -> String {
        self.missing += 1;
        format!("MISSING-{}", self.missing)
    }

    /// How many identifiers have been synthesised.
    pub fn missing_count(&self) -> u64 {
        self.missing
    }
}

/// How a package ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageOutcome {
    /// The document was tested
    Tested {
        /// Rule results written
        results: usize,
        /// Metric values written
        info_results: usize,
        /// Aggregation rows produced
        aggregates: usize,
    },
    /// The document could not be read or parsed; only the validity result was written
    InvalidDocument,
}

/// Map a predicate outcome onto a verdict. Evaluation faults become ERROR.
fn verdict(id: RuleId, predicate: &Predicate, node: Node<'_, '_>) -> Verdict {
    match predicate.evaluate(node) {
        Ok(Tri::True) => Verdict::Pass,
        Ok(Tri::False) => Verdict::Fail,
        Ok(Tri::Unknown) => Verdict::Skip,
        Err(e) => {
            debug!("Rule {} raised an error: {}", id, e);
            Verdict::Error
        }
    }
}

/// Canonical identifier of an activity, if it has one.
fn activity_identifier(activity: Node<'_, '_>) -> Option<String> {
    child_text(activity, "iati-identifier")
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// The activity's `hierarchy` attribute; 0 when absent, blank or not a number.
fn result_hierarchy(activity: Node<'_, '_>) -> i64 {
    match activity.attribute("hierarchy").map(str::trim) {
        None | Some("") => 0,
        Some(value) => value.parse().unwrap_or_else(|_| {
            debug!("Ignoring non-numeric hierarchy {:?}", value);
            0
        }),
    }
}

/// Applies compiled rules and metrics to package documents.
pub struct TestPipeline<S: Datastore> {
    store: S,
    rules: Arc<CompiledRules>,
    config: PipelineConfig,
    codelist: Option<Arc<dyn CodelistLookup>>,
    runs: HashMap<RuntimeId, RunContext>,
}

impl<S: Datastore> TestPipeline<S> {
    /// Create a pipeline.
    pub fn new(store: S, rules: impl Into<Arc<CompiledRules>>, config: PipelineConfig) -> Self {
        Self {
            store,
            rules: rules.into(),
            config,
            codelist: None,
            runs: HashMap::new(),
        }
    }

    /// Resolve country names through a codelist.
    pub fn with_codelist(mut self, codelist: Arc<dyn CodelistLookup>) -> Self {
        self.codelist = Some(codelist);
        self
    }

    /// The datastore.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The compiled rules.
    pub fn rules(&self) -> &CompiledRules {
        &self.rules
    }

    /// Test one package file.
    ///
    /// Packages of the same run share one context, so synthesised
    /// identifiers keep counting up across them.
    pub async fn check_file(
        &mut self,
        path: impl AsRef<Path>,
        runtime_id: RuntimeId,
        package_id: PackageId,
    ) -> Result<PackageOutcome, PipelineError> {
        let mut ctx = self
            .runs
            .remove(&runtime_id)
            .unwrap_or_else(|| RunContext::new(runtime_id, package_id));
        ctx.for_package(package_id);
        let outcome = self.check_file_in(&mut ctx, path.as_ref()).await;
        self.runs.insert(runtime_id, ctx);
        outcome
    }

    /// Test one package file.
    ///
    /// An unreadable or malformed document is recorded as a failed validity
    /// result and is not an error. The package is recorded as tested in the
    /// run unless testing fails.
    pub async fn check_file_in(
        &mut self,
        ctx: &mut RunContext,
        path: &Path,
    ) -> Result<PackageOutcome, PipelineError> {
        info!(
            "Testing package {} from {} in run {}",
            ctx.package_id,
            path.display(),
            ctx.runtime_id
        );

        if self.config.remove_results {
            if let Err(e) = self.store.delete_results(ctx.package_id).await {
                return self.abort(e).await;
            }
            self.commit_or_rollback(&format!("Remove results for package {}", ctx.package_id))
                .await?;
        }

        let outcome = match read_document(path).await {
            Ok(text) => self.check_text(ctx, &text).await?,
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                self.record_validity(ctx, ResultCode::Fail).await?;
                PackageOutcome::InvalidDocument
            }
        };

        self.record_testrun(ctx).await;
        Ok(outcome)
    }

    /// Test a document held in memory.
    pub async fn check_text(&mut self, ctx: &mut RunContext, text: &str) -> Result<PackageOutcome, PipelineError> {
        let doc = match parse_document(text) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Package {} is not a valid document: {}", ctx.package_id, e);
                self.record_validity(ctx, ResultCode::Fail).await?;
                return Ok(PackageOutcome::InvalidDocument);
            }
        };
        self.record_validity(ctx, ResultCode::Pass).await?;
        self.check_document(ctx, &doc).await
    }

    /// Test a parsed document, then aggregate and mark the package tested.
    pub async fn check_document(
        &mut self,
        ctx: &mut RunContext,
        doc: &Document<'_>,
    ) -> Result<PackageOutcome, PipelineError> {
        let targets = self.store.organisations_for_testing(ctx.package_id).await?;
        if targets.is_empty() {
            return Err(PipelineError::NoOrganisations(ctx.package_id));
        }
        let organisations = Selector::parse(&self.config.organisation_selector)
            .map_err(PipelineError::InvalidOrganisationSelector)?;

        let root = doc.root();
        let mut results = 0;
        let mut info_results = 0;

        for target in &targets {
            let organisation_id = target.organisation_id;
            let activities = Selector::parse(&target.activities_selector)
                .map_err(|source| PipelineError::InvalidActivitiesSelector {
                    organisation_id,
                    source,
                })?
                .select_nodes(root);
            debug!(
                "Organisation {}: {} activities",
                organisation_id,
                activities.len()
            );

            for activity in &activities {
                results += self.test_activity(ctx, organisation_id, *activity).await?;
            }
            if !activities.is_empty() {
                info_results += self.run_metrics(ctx, organisation_id, Level::Activity, root).await?;
            }

            for node in organisations.select_nodes(root) {
                info_results += self.run_metrics(ctx, organisation_id, Level::Organisation, node).await?;
                results += self.test_organisation(ctx, organisation_id, node).await?;
            }
        }

        let rows = match self.store.aggregate_results(ctx.runtime_id, ctx.package_id).await {
            Ok(rows) => rows,
            Err(e) => return self.abort(e).await,
        };
        if let Err(e) = self.store.set_package_status(ctx.package_id, PackageStatus::Tested).await {
            return self.abort(e).await;
        }
        self.commit_or_rollback(&format!("Aggregate package {}", ctx.package_id))
            .await?;

        info!(
            "Package {}: {} results, {} info results",
            ctx.package_id, results, info_results
        );
        Ok(PackageOutcome::Tested {
            results,
            info_results,
            aggregates: rows.len(),
        })
    }

    async fn test_activity(
        &mut self,
        ctx: &mut RunContext,
        organisation_id: OrganisationId,
        activity: Node<'_, '_>,
    ) -> Result<usize, PipelineError> {
        // without an identifier every result is forced to FAIL
        let (identifier, forced) = match activity_identifier(activity) {
            Some(identifier) => (identifier, None),
            None => {
                let identifier = ctx.next_missing_identifier();
                warn!("Activity without an identifier recorded as {}", identifier);
                (identifier, Some(Verdict::Fail))
            }
        };
        let hierarchy = result_hierarchy(activity);

        let mut verdicts = Vec::new();
        for (id, predicate) in self.rules.for_level(Level::Activity) {
            verdicts.push((id, forced.unwrap_or_else(|| verdict(id, predicate, activity))));
        }
        let transaction_rules = self.rules.for_level(Level::Transaction);
        if !transaction_rules.is_empty() {
            for transaction in children(activity, "transaction") {
                for (id, predicate) in &transaction_rules {
                    verdicts.push((*id, forced.unwrap_or_else(|| verdict(*id, predicate, transaction))));
                }
            }
        }

        let batch: Vec<TestResult> = verdicts
            .into_iter()
            .filter_map(|(test_id, verdict)| {
                Some(TestResult {
                    runtime_id: ctx.runtime_id,
                    package_id: ctx.package_id,
                    test_id,
                    result_data: verdict.persisted()?,
                    result_identifier: Some(identifier.clone()),
                    result_hierarchy: hierarchy,
                    organisation_id: Some(organisation_id),
                })
            })
            .collect();

        debug!("Activity {}: {} results", identifier, batch.len());
        self.flush(&batch, &format!("Test activity {}", identifier)).await
    }

    async fn test_organisation(
        &mut self,
        ctx: &RunContext,
        organisation_id: OrganisationId,
        node: Node<'_, '_>,
    ) -> Result<usize, PipelineError> {
        let batch: Vec<TestResult> = self
            .rules
            .for_level(Level::Organisation)
            .into_iter()
            .filter_map(|(test_id, predicate)| {
                Some(TestResult {
                    runtime_id: ctx.runtime_id,
                    package_id: ctx.package_id,
                    test_id,
                    result_data: verdict(test_id, predicate, node).persisted()?,
                    result_identifier: None,
                    result_hierarchy: 0,
                    organisation_id: Some(organisation_id),
                })
            })
            .collect();

        debug!("Organisation {}: {} results", organisation_id, batch.len());
        self.flush(&batch, &format!("Test organisation {}", organisation_id))
            .await
    }

    async fn run_metrics(
        &mut self,
        ctx: &RunContext,
        organisation_id: OrganisationId,
        level: Level,
        node: Node<'_, '_>,
    ) -> Result<usize, PipelineError> {
        let bindings: Vec<_> = self.config.metrics.for_level(level).into_iter().copied().collect();
        if bindings.is_empty() {
            return Ok(0);
        }

        let mut engine = InfoMetricsEngine::new(ctx.now);
        if let Some(codelist) = &self.codelist {
            engine = engine.with_codelist(Arc::clone(codelist));
        }

        for binding in &bindings {
            let value = binding.metric.evaluate(&engine, node).unwrap_or_else(|e| {
                warn!(
                    "Metric {} failed for organisation {}: {}",
                    binding.metric, organisation_id, e
                );
                0.0
            });
            debug!("Metric {} = {}", binding.metric, value);

            let result = InfoResult {
                runtime_id: ctx.runtime_id,
                package_id: ctx.package_id,
                organisation_id,
                info_id: binding.info_id,
                result_data: value,
            };
            if let Err(e) = self.store.replace_info_result(&result).await {
                return self.abort(e).await;
            }
            self.commit_or_rollback(&format!("Info {} for organisation {}", binding.info_id, organisation_id))
                .await?;
        }

        Ok(bindings.len())
    }

    async fn record_validity(&mut self, ctx: &RunContext, code: ResultCode) -> Result<(), PipelineError> {
        let result = TestResult {
            runtime_id: ctx.runtime_id,
            package_id: ctx.package_id,
            test_id: VALID_DOCUMENT_TEST,
            result_data: code,
            result_identifier: None,
            result_hierarchy: 0,
            organisation_id: None,
        };
        self.flush(std::slice::from_ref(&result), "Record document validity")
            .await?;
        Ok(())
    }

    async fn record_testrun(&mut self, ctx: &RunContext) {
        let recorded = match self.store.record_testrun(ctx.package_id, ctx.runtime_id).await {
            Ok(()) => self.commit_or_rollback("Record tested run").await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = recorded {
            warn!("Could not record run {} for package {}: {}", ctx.runtime_id, ctx.package_id, e);
        }
    }

    async fn flush(&mut self, batch: &[TestResult], message: &str) -> Result<usize, PipelineError> {
        if batch.is_empty() {
            return Ok(0);
        }
        for result in batch {
            if let Err(e) = self.store.save_result(result).await {
                return self.abort(e).await;
            }
        }
        self.commit_or_rollback(message).await?;
        Ok(batch.len())
    }

    async fn commit_or_rollback(&mut self, message: &str) -> Result<(), PipelineError> {
        if let Err(e) = self.store.commit(message).await {
            return self.abort(e).await;
        }
        Ok(())
    }

    /// Discard staged writes and surface the error that interrupted them.
    async fn abort<T>(&mut self, e: StorageError) -> Result<T, PipelineError> {
        self.rollback().await;
        Err(e.into())
    }

    async fn rollback(&mut self) {
        if let Err(e) = self.store.rollback().await {
            error!("Rollback failed: {}", e);
        }
    }
}
