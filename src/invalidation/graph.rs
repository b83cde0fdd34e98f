//! Rule engine mapping domain events to cache invalidations.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::event::{DomainEvent, EventType};
use super::rule::{InvalidationRule, RuleSpec};
use crate::cache::TtlCache;
use crate::error::{Error, Result};

/// Store whose keys the graph can invalidate.
pub trait InvalidationTarget: Send + Sync {
  /// Remove every key matching `pattern`, returning how many were removed.
  fn invalidate_matching(&self, pattern: &Regex) -> usize;
}

impl<V: Clone + Send> InvalidationTarget for TtlCache<V> {
  fn invalidate_matching(&self, pattern: &Regex) -> usize {
    self.delete_matching(pattern)
  }
}

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Observer of processed events. Errors and panics are logged, never
/// propagated.
pub type EventListener =
  Arc<dyn Fn(&DomainEvent) -> std::result::Result<(), ListenerError> + Send + Sync>;

/// What a single `process_event` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
  /// Rules whose triggers matched the event directly
  pub matched: Vec<String>,
  /// Every rule invalidated, direct or cascaded, with keys removed
  pub invalidated: Vec<(String, usize)>,
}

impl InvalidationReport {
  pub fn keys_removed(&self) -> usize {
    self.invalidated.iter().map(|(_, n)| n).sum()
  }

  pub fn was_invalidated(&self, rule: &str) -> bool {
    self.invalidated.iter().any(|(name, _)| name == rule)
  }
}

#[derive(Default)]
struct RuleTable {
  /// Registration order
  rules: Vec<Arc<InvalidationRule>>,
  by_name: HashMap<String, Arc<InvalidationRule>>,
  /// dependency name → rules that depend on it, in registration order
  dependents: HashMap<String, Vec<String>>,
}

pub struct InvalidationGraph {
  target: Arc<dyn InvalidationTarget>,
  table: Mutex<RuleTable>,
  listeners: Mutex<Vec<(usize, EventListener)>>,
  next_listener: Mutex<usize>,
}

impl InvalidationGraph {
  pub fn new(target: Arc<dyn InvalidationTarget>) -> Self {
    Self {
      target,
      table: Mutex::new(RuleTable::default()),
      listeners: Mutex::new(Vec::new()),
      next_listener: Mutex::new(0),
    }
  }

  fn table(&self) -> MutexGuard<'_, RuleTable> {
    self.table.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Validate and add a rule. Duplicate names and malformed rules are errors.
  pub fn register_rule(&self, spec: RuleSpec) -> Result<()> {
    let rule = InvalidationRule::try_from(spec)?;
    let mut table = self.table();

    if table.by_name.contains_key(&rule.name) {
      return Err(Error::InvalidRule {
        rule: rule.name.clone(),
        reason: "a rule with this name is already registered".to_string(),
      });
    }

    for dep in &rule.depends_on {
      if !table.by_name.contains_key(dep) {
        // Allowed: the dependency may be registered later
        debug!(rule = %rule.name, dependency = %dep, "Rule depends on a rule not yet registered");
      }
      table
        .dependents
        .entry(dep.clone())
        .or_default()
        .push(rule.name.clone());
    }

    info!(
      rule = %rule.name,
      pattern = %rule.key_pattern,
      triggers = rule.triggers.len(),
      "Registered invalidation rule"
    );

    let rule = Arc::new(rule);
    table.by_name.insert(rule.name.clone(), Arc::clone(&rule));
    table.rules.push(rule);
    Ok(())
  }

  /// Register every rule, stopping at the first malformed one.
  pub fn register_rules(&self, specs: impl IntoIterator<Item = RuleSpec>) -> Result<()> {
    specs.into_iter().try_for_each(|spec| self.register_rule(spec))
  }

  pub fn rules(&self) -> Vec<Arc<InvalidationRule>> {
    self.table().rules.clone()
  }

  /// Invalidate everything the event touches, cascade to dependent rules,
  /// then notify listeners.
  pub fn process_event(&self, event: &DomainEvent) -> InvalidationReport {
    let (matched, by_name, dependents) = {
      let table = self.table();
      let matched: Vec<Arc<InvalidationRule>> = table
        .rules
        .iter()
        .filter(|r| r.matches(&event.event_type, &event.resource))
        .cloned()
        .collect();
      (matched, table.by_name.clone(), table.dependents.clone())
    };

    let mut report = InvalidationReport {
      matched: matched.iter().map(|r| r.name.clone()).collect(),
      ..Default::default()
    };
    let mut visited: HashSet<String> = HashSet::new();

    for rule in &matched {
      self.invalidate_rule(rule, event, &by_name, &dependents, &mut visited, &mut report);
    }

    debug!(
      event_type = %event.event_type,
      resource = %event.resource,
      matched = report.matched.len(),
      invalidated = report.invalidated.len(),
      keys_removed = report.keys_removed(),
      "Processed domain event"
    );

    self.emit(event);
    report
  }

  /// Depth-first cascade. A rule already visited in this pass is skipped,
  /// which keeps cyclic dependencies finite.
  fn invalidate_rule(
    &self,
    rule: &InvalidationRule,
    event: &DomainEvent,
    by_name: &HashMap<String, Arc<InvalidationRule>>,
    dependents: &HashMap<String, Vec<String>>,
    visited: &mut HashSet<String>,
    report: &mut InvalidationReport,
  ) {
    if !visited.insert(rule.name.clone()) {
      return;
    }

    let removed = self.target.invalidate_matching(&rule.key_pattern);
    debug!(
      rule = %rule.name,
      trigger = %event.event_type,
      removed,
      "Invalidated rule"
    );
    report.invalidated.push((rule.name.clone(), removed));

    let Some(names) = dependents.get(&rule.name) else {
      return;
    };

    let cascade = DomainEvent::new(
      EventType::Dependency {
        rule: rule.name.clone(),
      },
      event.resource.clone(),
      event.action,
      event.timestamp,
    );

    for name in names {
      match by_name.get(name) {
        Some(dependent) => {
          self.invalidate_rule(dependent, &cascade, by_name, dependents, visited, report)
        }
        None => warn!(rule = %rule.name, dependent = %name, "Cascade target is not registered"),
      }
    }
  }

  /// Delete every key matching `pattern`, bypassing rules.
  pub fn force_invalidate(&self, pattern: &str) -> Result<usize> {
    let regex = Regex::new(pattern).map_err(|e| Error::InvalidRule {
      rule: pattern.to_string(),
      reason: format!("bad pattern: {}", e),
    })?;
    let removed = self.target.invalidate_matching(&regex);
    info!(pattern = %pattern, removed, "Forced cache invalidation");
    Ok(removed)
  }

  /// Add a listener; returns an id for [`unsubscribe`](Self::unsubscribe).
  pub fn subscribe<F>(&self, listener: F) -> usize
  where
    F: Fn(&DomainEvent) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
  {
    let listener: EventListener = Arc::new(listener);
    let id = {
      let mut next = self.next_listener.lock().unwrap_or_else(|e| e.into_inner());
      *next += 1;
      *next
    };
    self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push((id, listener));
    id
  }

  pub fn unsubscribe(&self, id: usize) -> bool {
    let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
    let before = listeners.len();
    listeners.retain(|(lid, _)| *lid != id);
    listeners.len() != before
  }

  /// Listeners run outside the lock, so they may call back into the graph.
  fn emit(&self, event: &DomainEvent) {
    let listeners: Vec<(usize, EventListener)> = self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone();
    for (id, listener) in &listeners {
      match catch_unwind(AssertUnwindSafe(|| listener(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
          error!(listener = id, event_type = %event.event_type, error = %e, "Event listener failed")
        }
        Err(_) => {
          error!(listener = id, event_type = %event.event_type, "Event listener panicked")
        }
      }
    }
  }
}
