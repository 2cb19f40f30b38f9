//! Rule definitions as stored by the datastore.

use serde::{Deserialize, Serialize};
use crate::id::RuleId;

/// Granularity at which a rule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// One activity record
    Activity,
    /// One transaction inside an activity
    Transaction,
    /// The organisation record
    Organisation,
}

impl Level {
    /// All levels, in evaluation order within an activity.
    pub const ALL: [Level; 3] = [Level::Activity, Level::Transaction, Level::Organisation];

    /// Lowercase name used in configuration and rule files.
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Activity => "activity",
            Level::Transaction => "transaction",
            Level::Organisation => "organisation",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for an unknown level name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown level: {0:?}")]
pub struct LevelParseError(pub String);

impl std::str::FromStr for Level {
    type Err = LevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "activity" => Ok(Level::Activity),
            "transaction" => Ok(Level::Transaction),
            "organisation" | "organization" => Ok(Level::Organisation),
            other => Err(LevelParseError(other.to_string())),
        }
    }
}

/// A declarative rule sentence plus the metadata that selects when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Unique identifier
    pub id: RuleId,

    /// Raw rule sentence, e.g. `title/text() exists?`
    pub text: String,

    /// Evaluation level
    pub level: Level,

    /// Inactive rules are never evaluated
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl RuleDefinition {
    /// Create an active rule.
    pub fn new(id: impl Into<RuleId>, text: impl Into<String>, level: Level) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            level,
            active: true,
        }
    }

    /// Read a plain-text rule source: one activity-level rule per line, the id
    /// being the 1-based line number. Comment and blank lines keep their line
    /// numbers so ids stay stable when the file is edited.
    pub fn from_lines(source: &str) -> Vec<RuleDefinition> {
        source
            .lines()
            .enumerate()
            .map(|(idx, line)| RuleDefinition::new(idx as i64 + 1, line, Level::Activity))
            .collect()
    }
}
