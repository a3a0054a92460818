//! Dynamic system configuration

pub mod error;
pub mod manager;

pub use error::{ConfigError, Result};
pub use manager::{
    decide_merge, merge_into_yaml, parse_yaml_entries, ConfigKey, ConfigManager, ConfigPaths,
    ConfigValue, MergeDecision,
};
