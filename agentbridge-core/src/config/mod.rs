//! Bridge configuration: YAML file, env substitution, defaults, validation.

pub mod defaults;
pub mod duration_format;
mod error;
mod loader;
mod schema;

pub use defaults::BridgeDefaults;
pub use error::ConfigError;
pub use loader::{
    default_config_paths, find_config_file, load_and_validate, load_config, parse_config,
    substitute_env_vars, validate,
};
pub use schema::{AdminConfig, Config, CorrelationSection, RegistryConfig, TopicsConfig};
