use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::event::EventType;
use crate::error::{Error, Result};

/// Rule as written in configuration, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
  pub name: String,
  /// Regex matched against cache keys and event resources
  pub pattern: String,
  /// Rules whose invalidation cascades into this one
  #[serde(default)]
  pub depends_on: Vec<String>,
  /// Event types (`entity:action`, `dependency:<rule>` or custom)
  pub triggers: Vec<String>,
}

impl RuleSpec {
  pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      pattern: pattern.into(),
      depends_on: Vec::new(),
      triggers: Vec::new(),
    }
  }

  pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
    self.triggers.push(trigger.into());
    self
  }

  pub fn with_dependency(mut self, rule: impl Into<String>) -> Self {
    self.depends_on.push(rule.into());
    self
  }
}

/// Validated, compiled rule.
#[derive(Debug, Clone)]
pub struct InvalidationRule {
  pub name: String,
  pub key_pattern: Regex,
  pub depends_on: Vec<String>,
  pub triggers: HashSet<EventType>,
}

impl InvalidationRule {
  /// Whether `event_type` on `resource` should fire this rule.
  pub fn matches(&self, event_type: &EventType, resource: &str) -> bool {
    self.triggers.contains(event_type) && self.key_pattern.is_match(resource)
  }
}

impl TryFrom<RuleSpec> for InvalidationRule {
  type Error = Error;

  fn try_from(spec: RuleSpec) -> Result<Self> {
    let invalid = |reason: String| Error::InvalidRule {
      rule: spec.name.clone(),
      reason,
    };

    if spec.name.trim().is_empty() {
      return Err(invalid("rule name is empty".to_string()));
    }
    if spec.triggers.is_empty() {
      return Err(invalid("rule has no triggers".to_string()));
    }
    if spec.depends_on.iter().any(|d| d == &spec.name) {
      return Err(invalid("rule depends on itself".to_string()));
    }

    let key_pattern =
      Regex::new(&spec.pattern).map_err(|e| invalid(format!("bad pattern: {}", e)))?;

    let triggers = spec
      .triggers
      .iter()
      .map(|t| {
        t.parse::<EventType>()
          .map_err(|_| invalid(format!("bad trigger '{}'", t)))
      })
      .collect::<Result<HashSet<_>>>()?;

    let mut depends_on: Vec<String> = Vec::with_capacity(spec.depends_on.len());
    for dep in &spec.depends_on {
      if !depends_on.contains(dep) {
        depends_on.push(dep.clone());
      }
    }

    Ok(Self {
      name: spec.name.clone(),
      key_pattern,
      depends_on,
      triggers,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::invalidation::Action;

  #[test]
  fn test_compile_valid_rule() {
    let rule = InvalidationRule::try_from(
      RuleSpec::new("users", "^user:")
        .with_trigger("user:update")
        .with_dependency("accounts")
        .with_dependency("accounts"),
    )
    .unwrap();

    assert_eq!(rule.depends_on, vec!["accounts".to_string()]);
    assert!(rule.matches(&EventType::mutation("user", Action::Update), "user:1"));
    assert!(!rule.matches(&EventType::mutation("user", Action::Update), "order:1"));
    assert!(!rule.matches(&EventType::mutation("user", Action::Delete), "user:1"));
  }

  #[test]
  fn test_reject_malformed_rules() {
    let bad_regex = RuleSpec::new("broken", "([").with_trigger("user:update");
    assert!(matches!(
      InvalidationRule::try_from(bad_regex),
      Err(Error::InvalidRule { rule, .. }) if rule == "broken"
    ));

    let no_triggers = RuleSpec::new("quiet", "^x");
    assert!(InvalidationRule::try_from(no_triggers).is_err());

    let unnamed = RuleSpec::new(" ", "^x").with_trigger("x:update");
    assert!(InvalidationRule::try_from(unnamed).is_err());

    let self_dep = RuleSpec::new("loop", "^x")
      .with_trigger("x:update")
      .with_dependency("loop");
    assert!(InvalidationRule::try_from(self_dep).is_err());
  }
}
