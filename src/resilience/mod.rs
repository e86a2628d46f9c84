//! Circuit breaking for calls to downstream dependencies.
//!
//! | State | Behavior |
//! |-------|----------|
//! | Closed | calls pass; `failure_threshold` consecutive failures open the breaker |
//! | Open | calls are rejected until `open_timeout` elapses |
//! | HalfOpen | calls probe; one failure reopens, `success_threshold` successes close |
//!
//! ```rust
//! use resilience_kit::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> resilience_kit::Result<()> {
//! let config = CircuitBreakerConfig::new()
//!     .with_failure_threshold(5)
//!     .with_open_timeout(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new("payments", config)?;
//!
//! let body = breaker
//!     .execute(|| async { Ok::<_, std::io::Error>("charged") })
//!     .await?;
//! assert_eq!(body, "charged");
//! # Ok(())
//! # }
//! ```

pub mod breaker_manager;
pub mod circuit_breaker;

pub use breaker_manager::{BreakerAggregate, CircuitBreakerManager};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, FailureClassifier,
};
