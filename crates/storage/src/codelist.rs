//! Static codelists loaded from JSON.

use std::collections::HashMap;
use std::path::Path;

use crate::trait_::{CodelistLookup, Result};

/// A `code -> name` codelist.
#[derive(Debug, Clone, Default)]
pub struct StaticCodelist {
    names: HashMap<String, String>,
}

impl StaticCodelist {
    /// Create an empty codelist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON object mapping codes to names.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        let names: HashMap<String, String> = serde_json::from_str(&json)?;
        Ok(Self::from_pairs(names))
    }

    /// Build from `(code, name)` pairs. Codes are matched case-insensitively.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            names: pairs
                .into_iter()
                .map(|(code, name)| (code.into().to_uppercase(), name.into()))
                .collect(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the codelist is empty.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl CodelistLookup for StaticCodelist {
    fn name_for(&self, code: &str) -> Option<String> {
        self.names.get(&code.to_uppercase()).cloned()
    }
}
