//! # Rollcall Core
//! Configuration, error taxonomy, and backoff policy shared by the
//! scheduler and dead-letter retry daemons.

pub mod backoff;
pub mod config;
pub mod error;

pub use backoff::Backoff;
pub use config::RollcallConfig;
pub use error::{Result, RollcallError};
