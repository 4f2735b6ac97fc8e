//! Configuration types and loading for replication pipelines and cluster membership.

pub mod environment;
pub mod load;
pub mod shared;

pub use load::{Config, LoadConfigError, load_config, load_config_from};
