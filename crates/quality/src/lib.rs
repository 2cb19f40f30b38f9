//! Rule evaluation for published documents.
//!
//! Path selectors, the rule compiler, the test pipeline and the info metrics.

#![warn(missing_docs)]

pub mod document;
pub mod selector;
pub mod compiler;
pub mod info;
pub mod registry;
pub mod pipeline;

pub use document::{parse_document, read_document, DocumentError};
pub use selector::{Item, Selector, SelectorError};
pub use compiler::{CompiledRules, EvalError, Predicate, RuleCompiler, RuleSyntaxError, Tri};
pub use info::{fix_value, BudgetWindow, FutureBudgets, InfoMetricsEngine, MetricError};
pub use registry::{DuplicateInfoId, InfoMetric, MetricBinding, MetricRegistry, UnknownMetric};
pub use pipeline::{PackageOutcome, PipelineConfig, PipelineError, RunContext, TestPipeline};
