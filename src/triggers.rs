//! Explicit trigger rules: text patterns mapped to surfaceable advice.
//!
//! Rules live in a TOML file maintained by the host collaborator. Patterns
//! are regexes; ones that fail to compile are matched as literals. Critical
//! rules may carry `interrupt = true`, which the advisor surfaces but never
//! enforces.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Priority of a trigger rule; maps to the advisor's priority bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPriority {
    Critical,
    High,
    Normal,
}

impl TriggerPriority {
    /// Additive fusion bonus.
    pub fn bonus(self) -> f64 {
        match self {
            TriggerPriority::Critical => 0.2,
            TriggerPriority::High => 0.1,
            TriggerPriority::Normal => 0.0,
        }
    }
}

/// One rule as written in the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRuleSpec {
    pub pattern: String,
    pub rule_name: String,
    #[serde(default = "default_priority")]
    pub priority: TriggerPriority,
    #[serde(default)]
    pub interrupt: bool,
    /// The advice text surfaced when the rule matches.
    pub advice: String,
}

fn default_priority() -> TriggerPriority {
    TriggerPriority::Normal
}

#[derive(Debug, Default, Deserialize)]
struct TriggerFile {
    #[serde(default, rename = "rule")]
    rules: Vec<TriggerRuleSpec>,
}

/// A compiled rule ready for matching.
#[derive(Debug)]
pub struct TriggerRule {
    pub spec: TriggerRuleSpec,
    matcher: Matcher,
}

#[derive(Debug)]
enum Matcher {
    Pattern(Regex),
    Literal(String),
}

impl TriggerRule {
    fn compile(spec: TriggerRuleSpec) -> Self {
        let matcher = match Regex::new(&spec.pattern) {
            Ok(regex) => Matcher::Pattern(regex),
            Err(_) => Matcher::Literal(spec.pattern.to_lowercase()),
        };
        Self { spec, matcher }
    }

    pub fn matches(&self, text: &str) -> bool {
        match &self.matcher {
            Matcher::Pattern(regex) => regex.is_match(text),
            Matcher::Literal(needle) => text.to_lowercase().contains(needle),
        }
    }
}

/// The loaded rule set.
#[derive(Debug, Default)]
pub struct TriggerSet {
    rules: Vec<TriggerRule>,
}

impl TriggerSet {
    /// Load rules from the TOML file; a missing file is an empty set.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::TriggerRules {
                    path: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        };
        let file: TriggerFile = toml::from_str(&raw).map_err(|e| ConfigError::TriggerRules {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            rules: file.rules.into_iter().map(TriggerRule::compile).collect(),
        })
    }

    /// Build a set directly from specs (tests and embedding hosts).
    pub fn from_specs(specs: Vec<TriggerRuleSpec>) -> Self {
        Self {
            rules: specs.into_iter().map(TriggerRule::compile).collect(),
        }
    }

    /// Every rule matching the given text.
    pub fn matching(&self, text: &str) -> Vec<&TriggerRule> {
        self.rules.iter().filter(|r| r.matches(text)).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(pattern: &str, name: &str, priority: TriggerPriority) -> TriggerRuleSpec {
        TriggerRuleSpec {
            pattern: pattern.into(),
            rule_name: name.into(),
            priority,
            interrupt: false,
            advice: format!("advice for {name}"),
        }
    }

    #[test]
    fn regex_rule_matches() {
        let set = TriggerSet::from_specs(vec![spec(
            r"(?i)drop\s+table",
            "no-drop-table",
            TriggerPriority::Critical,
        )]);
        assert_eq!(set.matching("DROP TABLE users").len(), 1);
        assert!(set.matching("create table users").is_empty());
    }

    #[test]
    fn invalid_regex_falls_back_to_literal() {
        let set = TriggerSet::from_specs(vec![spec("rm -rf (", "careful-rm", TriggerPriority::High)]);
        assert_eq!(set.matching("about to run rm -rf ( oops").len(), 1);
        assert!(set.matching("plain rm call").is_empty());
    }

    #[test]
    fn load_from_toml_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("trigger_rules.toml");
        std::fs::write(
            &path,
            r#"
[[rule]]
pattern = "(?i)force\\s+push"
rule_name = "no-force-push"
priority = "critical"
interrupt = true
advice = "Never force-push shared branches"

[[rule]]
pattern = "migration"
rule_name = "migration-check"
advice = "Check pending migrations first"
"#,
        )
        .unwrap();

        let set = TriggerSet::load(&path).unwrap();
        assert_eq!(set.len(), 2);
        let hits = set.matching("git Force Push to main");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].spec.rule_name, "no-force-push");
        assert!(hits[0].spec.interrupt);
        assert_eq!(hits[0].spec.priority, TriggerPriority::Critical);
    }

    #[test]
    fn missing_file_is_empty_set() {
        let dir = tempfile::TempDir::new().unwrap();
        let set = TriggerSet::load(&dir.path().join("absent.toml")).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn priority_bonuses() {
        assert!((TriggerPriority::Critical.bonus() - 0.2).abs() < f64::EPSILON);
        assert!((TriggerPriority::High.bonus() - 0.1).abs() < f64::EPSILON);
        assert!(TriggerPriority::Normal.bonus().abs() < f64::EPSILON);
    }
}
