//! Runtime for mirrorline: SQLite persistence, the job pipeline, the
//! mapping cache and the destination credential broker.

pub mod config;
pub mod credentials;
pub mod db;
pub mod jobs;
pub mod locks;
pub mod mapping;
pub mod pipeline;
pub mod throttle;

pub use config::{ConfigError, PipelineConfig};
pub use db::{Database, DbError};
pub use pipeline::{Pipeline, PipelineError, PipelineHandle};
