//! Info metric registry.

use std::collections::HashMap;

use dq_core::{InfoId, Level};
use roxmltree::Node;
use serde::{Deserialize, Serialize};

use crate::info::{InfoMetricsEngine, MetricError};

/// The metrics that can be bound to an info id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoMetric {
    /// Country budgets as a share of total budgets, or the sector budget proxy
    TotalCountryBudgets,
    /// Country strategy-paper coverage, or the sector paper proxy
    CountryStrategyPapers,
    /// Share of the next three years with a total budget
    TotalBudgetsAvailable,
    /// Budget-line coverage of total budgets
    TotalSectorBudgets,
    /// Sector strategy-paper coverage
    SectorStrategyPapers,
}

impl InfoMetric {
    /// Every metric.
    pub const ALL: [InfoMetric; 5] = [
        InfoMetric::TotalCountryBudgets,
        InfoMetric::CountryStrategyPapers,
        InfoMetric::TotalBudgetsAvailable,
        InfoMetric::TotalSectorBudgets,
        InfoMetric::SectorStrategyPapers,
    ];

    /// Configuration name.
    pub fn name(self) -> &'static str {
        match self {
            InfoMetric::TotalCountryBudgets => "total_country_budgets",
            InfoMetric::CountryStrategyPapers => "country_strategy_papers",
            InfoMetric::TotalBudgetsAvailable => "total_budgets_available",
            InfoMetric::TotalSectorBudgets => "total_sector_budgets",
            InfoMetric::SectorStrategyPapers => "sector_strategy_papers",
        }
    }

    /// Compute the metric for a document node.
    pub fn evaluate(self, engine: &InfoMetricsEngine, node: Node<'_, '_>) -> Result<f64, MetricError> {
        match self {
            InfoMetric::TotalCountryBudgets => engine.total_country_budgets_single_result(node),
            InfoMetric::CountryStrategyPapers => engine.country_strategy_papers(node),
            InfoMetric::TotalBudgetsAvailable => engine.total_budgets_available(node),
            InfoMetric::TotalSectorBudgets => engine.total_sector_budgets_single_result(node),
            InfoMetric::SectorStrategyPapers => engine.total_sector_strategy_papers(node),
        }
    }
}

impl std::fmt::Display for InfoMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Unknown metric name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown info metric: {0:?}")]
pub struct UnknownMetric(pub String);

impl std::str::FromStr for InfoMetric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InfoMetric::ALL
            .into_iter()
            .find(|metric| metric.name() == s.trim())
            .ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

/// An info id bound to a metric, evaluated at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricBinding {
    /// Id the results are stored under
    pub info_id: InfoId,
    /// Metric to compute
    #[serde(rename = "name")]
    pub metric: InfoMetric,
    /// Level the metric runs at
    pub level: Level,
}

impl MetricBinding {
    /// Create a binding.
    pub fn new(info_id: InfoId, metric: InfoMetric, level: Level) -> Self {
        Self {
            info_id,
            metric,
            level,
        }
    }
}

/// Info id registered twice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("info id {0} is already registered")]
pub struct DuplicateInfoId(pub InfoId);

/// Registry of metric bindings.
#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    bindings: HashMap<InfoId, MetricBinding>,
    by_level: HashMap<Level, Vec<InfoId>>,
}

impl MetricRegistry {
    /// Create a new registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from bindings, rejecting duplicate ids.
    pub fn from_bindings(bindings: impl IntoIterator<Item = MetricBinding>) -> Result<Self, DuplicateInfoId> {
        let mut registry = Self::new();
        for binding in bindings {
            registry.register(binding)?;
        }
        Ok(registry)
    }

    /// Register a binding.
    pub fn register(&mut self, binding: MetricBinding) -> Result<(), DuplicateInfoId> {
        if self.bindings.contains_key(&binding.info_id) {
            return Err(DuplicateInfoId(binding.info_id));
        }
        self.by_level.entry(binding.level).or_default().push(binding.info_id);
        self.bindings.insert(binding.info_id, binding);
        Ok(())
    }

    /// Unregister a binding.
    pub fn unregister(&mut self, info_id: InfoId) -> Option<MetricBinding> {
        let binding = self.bindings.remove(&info_id)?;
        if let Some(ids) = self.by_level.get_mut(&binding.level) {
            ids.retain(|id| *id != info_id);
        }
        Some(binding)
    }

    /// Get a binding by info id.
    pub fn get(&self, info_id: InfoId) -> Option<&MetricBinding> {
        self.bindings.get(&info_id)
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Bindings for a level, in registration order.
    pub fn for_level(&self, level: Level) -> Vec<&MetricBinding> {
        self.by_level
            .get(&level)
            .into_iter()
            .flat_map(|ids| ids.iter().filter_map(|id| self.bindings.get(id)))
            .collect()
    }
}
