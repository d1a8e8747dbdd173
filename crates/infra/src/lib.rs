//! Infrastructure layer: job stores, the queue engine, workers, config.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, QueueConfig};
