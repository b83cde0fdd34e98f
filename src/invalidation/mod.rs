//! Event-driven cache invalidation.
//!
//! Rules map domain event types to cache key patterns. A rule may depend on
//! other rules; invalidating a rule cascades depth-first into everything
//! that depends on it, visiting each rule at most once per event.

mod event;
mod graph;
mod rule;

pub use event::{Action, DomainEvent, EventType};
pub use graph::{
  EventListener, InvalidationGraph, InvalidationReport, InvalidationTarget, ListenerError,
};
pub use rule::{InvalidationRule, RuleSpec};
