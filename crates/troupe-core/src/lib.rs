//! `troupe-core` — configuration, shared error type, and id helpers.

pub mod config;
pub mod error;
pub mod ids;

pub use config::{SchedulerConfig, TroupeConfig};
pub use error::{Result, TroupeError};
