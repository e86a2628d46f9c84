//! Graceful connection draining.
//!
//! ```rust,no_run
//! use resilience_kit::draining::{ConnectionHandle, ConnectionTracker, DrainConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn shutdown() -> resilience_kit::Result<()> {
//! let tracker = Arc::new(ConnectionTracker::new("http", DrainConfig::default())?);
//! tracker.track_connection(Arc::new(ConnectionHandle::new()));
//!
//! tracker.start_draining()?;
//! tracker.wait_for_draining(&CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod tracker;

pub use config::DrainConfig;
pub use connection::{Connection, ConnectionHandle, ConnectionId};
pub use tracker::{ConnectionInfo, ConnectionStats, ConnectionTracker, DrainPhase};
