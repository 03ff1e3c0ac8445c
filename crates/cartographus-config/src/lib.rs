#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cartographus-config** – Typed, validated startup configuration.
//!
//! The core exposes its configuration as a typed record with defaults,
//! loaded once at startup and never hot-reloaded. Layering follows the
//! usual `config`-crate convention: built-in defaults, then an optional
//! file, then environment variables prefixed `CARTOGRAPHUS__`, each layer
//! overriding the last. Invalid configuration is always fatal (§6): use
//! [`load`] in `main` and exit on error rather than recovering.

mod config;
mod error;
mod validation;

pub use config::{
    AnalyticsConfig, AuditConfig, BloomConfig, BrokerConfig, CartographusConfig, IngestConfig,
    PipelineConfig, TimeoutConfig, WalConfig,
};
pub use error::{ConfigError, Result};

use std::path::Path;

/// Load and validate the pipeline configuration.
///
/// `file` is an optional path to a TOML/YAML/JSON file (format is
/// inferred from its extension by the `config` crate); when absent only
/// defaults and environment overrides apply. Environment variables use a
/// `CARTOGRAPHUS__` prefix with `__` as the nesting separator, e.g.
/// `CARTOGRAPHUS__PIPELINE__SUBSCRIBERS=8`.
pub fn load(file: Option<&Path>) -> Result<CartographusConfig> {
    let defaults = ::config::Config::try_from(&CartographusConfig::default())?;
    let mut builder = ::config::Config::builder().add_source(defaults);

    if let Some(path) = file {
        builder = builder.add_source(::config::File::from(path).required(false));
    }

    builder = builder.add_source(
        ::config::Environment::with_prefix("CARTOGRAPHUS")
            .separator("__")
            .try_parsing(true),
    );

    let raw: CartographusConfig = builder.build()?.try_deserialize()?;
    validation::validate(&raw)?;
    Ok(raw)
}
