//! # resilience-kit
//!
//! Overload and failure guards for async services: an adaptive load shedder,
//! circuit breakers, and a connection drain controller, with HTTP middleware
//! adapters and Prometheus-style metrics.
//!
//! ## Overview
//!
//! Each guard is an independent object with its own metrics recorder. Managers
//! own named instances of the shedder and breaker and expose administrative
//! operations (force, reset, aggregate stats) over them.
//!
//! - **Load shedding**: [`shedding::LoadShedder`] samples CPU, memory, in-flight
//!   requests, request rate and latency, maps them to a [`shedding::SheddingLevel`]
//!   and rejects a share of traffic
//! - **Circuit breaking**: [`resilience::CircuitBreaker`] fails fast while a
//!   dependency is unhealthy and probes it back to health
//! - **Draining**: [`draining::ConnectionTracker`] winds connections down on shutdown
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resilience_kit::middleware::{handler_fn, LoadSheddingMiddleware, MiddlewareChain};
//! use resilience_kit::shedding::{LoadShedderConfig, LoadSheddingManager};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> resilience_kit::Result<()> {
//!     let config = resilience_kit::ResilienceConfig::load()?;
//!     let shedders = LoadSheddingManager::with_system_probe();
//!     let api = shedders.create(
//!         "api",
//!         config.shedders.get("api").cloned().unwrap_or_default(),
//!     )?;
//!
//!     let service = MiddlewareChain::new()
//!         .add(Arc::new(LoadSheddingMiddleware::new(api)))
//!         .service(Arc::new(handler_fn(|_req| async {
//!             http::Response::new(bytes::Bytes::from_static(b"ok"))
//!         })));
//!     # let _ = service;
//!
//!     shedders.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`shedding`] | Adaptive load shedder and its manager |
//! | [`resilience`] | Circuit breaker and its manager |
//! | [`draining`] | Connection tracking and graceful drain |
//! | [`middleware`] | HTTP middleware adapters |
//! | [`sampler`] | System pressure sampling |
//! | [`metrics`] | Stats recorders and Prometheus rendering |
//! | [`config`] | YAML configuration |

pub mod config;
pub mod draining;
pub mod metrics;
pub mod middleware;
pub mod registry;
pub mod resilience;
pub mod sampler;
pub mod shedding;
pub mod worker;

pub use config::ResilienceConfig;
pub use draining::{ConnectionTracker, DrainConfig};
pub use metrics::StatsRecorder;
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState};
pub use shedding::{LoadShedder, LoadShedderConfig, LoadSheddingManager, SheddingLevel};

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

// Re-export error types
pub mod error;
pub use error::{BoxError, Error, ErrorContext};
