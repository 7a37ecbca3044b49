//! # Configuration
//!
//! Hub configuration resolved from defaults, an optional file (TOML, YAML or
//! JSON), `COPARENT_*` environment variables and command-line overrides.

pub mod hub;

pub use hub::{
    Config, ConfigError, ConfigOverrides, DatabaseConfig, LogFormat, LoggingConfig, Profile,
    RealtimeConfig,
};
