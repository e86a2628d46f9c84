//! Adaptive load shedding.
//!
//! A [`LoadShedder`] periodically samples process pressure through a
//! [`SystemSampler`](crate::sampler::SystemSampler), reduces it to a single
//! normalized load according to its [`SheddingStrategy`], and maps the load
//! onto a [`SheddingLevel`] with a configured shed rate.
//!
//! | Level | Default threshold | Default shed rate |
//! |-------|-------------------|-------------------|
//! | Light | 0.60 | 0.1 |
//! | Moderate | 0.75 | 0.3 |
//! | Heavy | 0.85 | 0.6 |
//! | Critical | 0.95 | 0.9 |
//!
//! ```rust,no_run
//! use resilience_kit::sampler::{SysinfoProbe, SystemSampler};
//! use resilience_kit::shedding::{LoadShedder, LoadShedderConfig, RequestContext};
//! use std::sync::Arc;
//!
//! # async fn run() -> resilience_kit::Result<()> {
//! let sampler = Arc::new(SystemSampler::new(Arc::new(SysinfoProbe::new())));
//! let shedder = LoadShedder::spawn("api", LoadShedderConfig::default(), sampler)?;
//!
//! if shedder.should_shed(&RequestContext::new("GET", "/orders")) {
//!     // respond 503
//! }
//! shedder.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod level;
pub mod manager;
pub mod shedder;

pub use config::{LevelThresholds, LoadShedderConfig, ShedRates};
pub use level::{SheddingLevel, SheddingStrategy};
pub use manager::{LoadSheddingManager, SheddingAggregate};
pub use shedder::{
    LoadShedder, RequestContext, ShedDecision, ShedderStats, COMPAT_SHED_THRESHOLD,
};
