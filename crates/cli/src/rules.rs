//! Rule file loading.

use std::path::Path;

use anyhow::{Context, Result};
use dq_core::RuleDefinition;

/// Load rule definitions.
///
/// A `.json` file holds an array of definitions. Any other file holds one
/// activity rule per line, numbered from 1.
pub async fn load_rules(path: &Path) -> Result<Vec<RuleDefinition>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading rules {}", path.display()))?;

    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&text).with_context(|| format!("parsing rules {}", path.display()))
    } else {
        Ok(RuleDefinition::from_lines(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dq_core::{Level, RuleId};

    #[tokio::test]
    async fn test_plain_text_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.txt");
        tokio::fs::write(&path, "# comment\ntitle exists?\n").await.unwrap();

        let rules = load_rules(&path).await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].id, RuleId(2));
        assert_eq!(rules[1].level, Level::Activity);
    }

    #[tokio::test]
    async fn test_json_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        tokio::fs::write(
            &path,
            r#"[
                {"id": 10, "text": "value exists?", "level": "transaction"},
                {"id": 11, "text": "name exists?", "level": "organisation", "active": false}
            ]"#,
        )
        .await
        .unwrap();

        let rules = load_rules(&path).await.unwrap();
        assert_eq!(rules[0].level, Level::Transaction);
        assert!(rules[0].active);
        assert!(!rules[1].active);
    }

    #[tokio::test]
    async fn test_malformed_json_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        tokio::fs::write(&path, "title exists?").await.unwrap();
        assert!(load_rules(&path).await.is_err());
    }
}
