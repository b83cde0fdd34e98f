//! Domain events fed into the invalidation graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
  Create,
  Update,
  Delete,
  Refresh,
}

impl Action {
  pub fn as_str(&self) -> &'static str {
    match self {
      Action::Create => "create",
      Action::Update => "update",
      Action::Delete => "delete",
      Action::Refresh => "refresh",
    }
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Action {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "create" => Ok(Action::Create),
      "update" => Ok(Action::Update),
      "delete" => Ok(Action::Delete),
      "refresh" => Ok(Action::Refresh),
      other => Err(format!("unknown action '{}'", other)),
    }
  }
}

/// Kind of event a rule can be triggered by.
///
/// Textual forms: `entity:action` for mutations (e.g. `keyword:update`),
/// `dependency:<rule>` for cascade events, anything else is custom.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
  Mutation { entity: String, action: Action },
  /// Synthetic event passed down a cascade from the named rule
  Dependency { rule: String },
  Custom(String),
}

impl EventType {
  pub fn mutation(entity: impl Into<String>, action: Action) -> Self {
    EventType::Mutation {
      entity: entity.into(),
      action,
    }
  }
}

impl fmt::Display for EventType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EventType::Mutation { entity, action } => write!(f, "{}:{}", entity, action),
      EventType::Dependency { rule } => write!(f, "dependency:{}", rule),
      EventType::Custom(name) => f.write_str(name),
    }
  }
}

impl FromStr for EventType {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    if s.is_empty() {
      return Err(Error::InvalidRule {
        rule: String::new(),
        reason: "empty event type".to_string(),
      });
    }

    if let Some((prefix, suffix)) = s.rsplit_once(':') {
      if prefix == "dependency" && !suffix.is_empty() {
        return Ok(EventType::Dependency {
          rule: suffix.to_string(),
        });
      }
      if !prefix.is_empty() {
        if let Ok(action) = suffix.parse::<Action>() {
          return Ok(EventType::mutation(prefix, action));
        }
      }
    }

    Ok(EventType::Custom(s.to_string()))
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
  pub event_type: EventType,
  /// Resource the event is about, matched against rule patterns
  pub resource: String,
  pub action: Action,
  pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
  pub fn new(
    event_type: EventType,
    resource: impl Into<String>,
    action: Action,
    timestamp: DateTime<Utc>,
  ) -> Self {
    Self {
      event_type,
      resource: resource.into(),
      action,
      timestamp,
    }
  }

  /// `entity:action` event about `resource`.
  pub fn mutation(
    entity: impl Into<String>,
    action: Action,
    resource: impl Into<String>,
    timestamp: DateTime<Utc>,
  ) -> Self {
    Self::new(EventType::mutation(entity, action), resource, action, timestamp)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_event_types() {
    assert_eq!(
      "user:update".parse::<EventType>().unwrap(),
      EventType::mutation("user", Action::Update)
    );
    assert_eq!(
      "dependency:keywords".parse::<EventType>().unwrap(),
      EventType::Dependency {
        rule: "keywords".into()
      }
    );
    assert_eq!(
      "ranking:recalculated".parse::<EventType>().unwrap(),
      EventType::Custom("ranking:recalculated".into())
    );
    assert!("  ".parse::<EventType>().is_err());
  }

  #[test]
  fn test_display_matches_parse() {
    for text in ["keyword:delete", "dependency:reports", "nightly-refresh"] {
      let parsed: EventType = text.parse().unwrap();
      assert_eq!(parsed.to_string(), text);
    }
  }
}
