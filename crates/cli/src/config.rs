//! Configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dq_core::Level;
use dq_quality::{MetricBinding, MetricRegistry, PipelineConfig};
use dq_quality::pipeline::DEFAULT_ORGANISATION_SELECTOR;
use serde::{Deserialize, Serialize};

/// Settings for the `dq` binary. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Datastore directory
    pub data_dir: PathBuf,
    /// Rule file, plain text or JSON
    pub rules_file: PathBuf,
    /// Spool directory of queued jobs
    pub queue_dir: PathBuf,
    /// JSON object of country code to name
    pub codelist_file: Option<PathBuf>,
    /// Delete a package's earlier results before testing it
    pub remove_results: bool,
    /// Rule levels to compile
    pub compile_levels: Vec<Level>,
    /// Info metrics to compute
    pub metrics: Vec<MetricBinding>,
    /// Test each queued job in a child process
    pub use_subprocess: bool,
    /// Delay between polls of an empty queue
    pub poll_interval_ms: u64,
    /// Selector for organisation nodes
    pub organisation_selector: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".dq"),
            rules_file: PathBuf::from("rules.txt"),
            queue_dir: PathBuf::from(".dq/queue"),
            codelist_file: None,
            remove_results: false,
            compile_levels: vec![Level::Activity],
            metrics: Vec::new(),
            use_subprocess: false,
            poll_interval_ms: 1000,
            organisation_selector: DEFAULT_ORGANISATION_SELECTOR.to_string(),
        }
    }
}

impl Config {
    /// Load a configuration file, or the defaults when no path is given.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Pipeline settings.
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let metrics = MetricRegistry::from_bindings(self.metrics.iter().copied())?;
        Ok(PipelineConfig {
            remove_results: self.remove_results,
            organisation_selector: self.organisation_selector.clone(),
            metrics,
        })
    }
}
