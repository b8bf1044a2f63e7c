//! Ordered, declarative redaction rule table.
//!
//! The table is plain TOML (`[[rule]]` entries with `name`, `pattern` and
//! `replacement`), so rules can be reviewed and tested one by one and
//! changed without touching the pipeline.

use crate::config::RuleConfig;
use crate::error::RedactError;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Table shipped with the binary.
const BUILTIN_RULES: &str = include_str!("default_rules.toml");

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RuleConfig>,
}

/// Ordered list of rule definitions, not yet compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleTable {
    rules: Vec<RuleConfig>,
}

/// A rule ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub regex: Regex,
    pub replacement: String,
}

impl RuleTable {
    /// The built-in table.
    pub fn builtin() -> Result<Self, RedactError> {
        Self::from_toml(BUILTIN_RULES)
    }

    /// Parse a table from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, RedactError> {
        let file: RuleFile =
            toml::from_str(content).map_err(|e| RedactError::RuleTable(e.to_string()))?;
        Ok(Self { rules: file.rules })
    }

    /// Load a table from a TOML file.
    pub fn load(path: &Path) -> Result<Self, RedactError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RedactError::RuleTable(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Put `extra` in front of the table, keeping their relative order.
    pub fn with_leading(mut self, extra: &[RuleConfig]) -> Self {
        let mut rules = extra.to_vec();
        rules.append(&mut self.rules);
        self.rules = rules;
        self
    }

    /// Keep only the named rule. Used to exercise rules in isolation.
    #[cfg(test)]
    pub fn only(mut self, name: &str) -> Self {
        self.rules.retain(|r| r.name == name);
        self
    }

    #[cfg(test)]
    pub fn names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Compile every rule, preserving order.
    pub fn compile(&self) -> Result<Vec<CompiledRule>, RedactError> {
        if self.is_empty() {
            return Err(RedactError::RuleTable("rule table is empty".to_string()));
        }

        let mut seen = HashSet::new();
        self.rules
            .iter()
            .map(|rule| {
                if !seen.insert(rule.name.as_str()) {
                    return Err(RedactError::RuleTable(format!(
                        "duplicate rule name '{}'",
                        rule.name
                    )));
                }
                let regex = Regex::new(&rule.pattern).map_err(|e| RedactError::InvalidPattern {
                    rule: rule.name.clone(),
                    reason: e.to_string(),
                })?;
                Ok(CompiledRule {
                    name: rule.name.clone(),
                    regex,
                    replacement: rule.replacement.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_compiles() {
        let table = RuleTable::builtin().unwrap();
        assert!(table.len() >= 15);
        assert_eq!(table.compile().unwrap().len(), table.len());
    }

    #[test]
    fn test_specific_rules_precede_generic_fallbacks() {
        let table = RuleTable::builtin().unwrap();
        let names = table.names();
        let pos = |name: &str| names.iter().position(|n| *n == name).unwrap();

        for specific in ["aws_access_key", "github_token", "stripe_key", "anthropic_key", "openai_key"] {
            assert!(pos(specific) < pos("password_assignment"), "{} out of order", specific);
            assert!(pos(specific) < pos("generic_secret"), "{} out of order", specific);
        }
        assert!(pos("anthropic_key") < pos("openai_key"));
        assert_eq!(names.last(), Some(&"generic_secret"));
    }

    #[test]
    fn test_extra_rules_lead() {
        let extra = vec![RuleConfig {
            name: "order_id".to_string(),
            pattern: r"ORD-\d{6}".to_string(),
            replacement: "[ORDER]".to_string(),
        }];
        let table = RuleTable::builtin().unwrap().with_leading(&extra);
        assert_eq!(table.names()[0], "order_id");
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let table = RuleTable::from_toml(
            r#"
[[rule]]
name = "broken"
pattern = "(unclosed"
replacement = "[X]"
"#,
        )
        .unwrap();

        match table.compile() {
            Err(RedactError::InvalidPattern { rule, .. }) => assert_eq!(rule, "broken"),
            other => panic!("expected InvalidPattern, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_duplicate_and_empty_tables_rejected() {
        let dup = RuleTable::from_toml(
            r#"
[[rule]]
name = "a"
pattern = "x"
replacement = "[A]"

[[rule]]
name = "a"
pattern = "y"
replacement = "[A]"
"#,
        )
        .unwrap();
        assert!(dup.compile().is_err());

        let empty = RuleTable::from_toml("").unwrap();
        assert!(empty.is_empty());
        assert!(empty.compile().is_err());
    }
}
