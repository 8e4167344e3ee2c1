//! Drift Common - Shared types for the edge drift monitor
//!
//! Data model, error taxonomy, configuration and the SQLite meter store.
//! The daemon (`driftd`) builds its control loop on top of these.

pub mod config;
pub mod error;
pub mod meter_db;
pub mod types;

pub use config::MonitorConfig;
pub use error::{MonitorError, MonitorResult};
pub use meter_db::MeterDb;
pub use types::*;
