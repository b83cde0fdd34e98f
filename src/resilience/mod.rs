//! # Resilience
//!
//! Circuit breakers that stop calling a failing resource for a cooldown
//! period, one per resource group.
//!
//! ```rust,no_run
//! use kwdata::clock::SystemClock;
//! use kwdata::metrics::TracingSink;
//! use kwdata::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!   "keywords",
//!   CircuitBreakerConfig::default(),
//!   Arc::new(SystemClock),
//!   Arc::new(TracingSink),
//! );
//!
//! let result = breaker
//!   .call(|| async { Ok::<_, String>("volume: 1200") })
//!   .await;
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod metrics;
pub mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::{BreakerOverrides, CircuitBreakerConfig, CircuitBreakerSettings};
pub use metrics::CircuitBreakerMetrics;
pub use registry::CircuitBreakerRegistry;
