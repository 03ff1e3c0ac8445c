//! Error type for configuration loading and validation.

use thiserror::Error;

/// Errors raised while loading or validating [`crate::CartographusConfig`].
///
/// Per the error taxonomy, configuration errors are always fatal at
/// startup: callers are expected to log and exit, never retry.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The underlying `config` crate failed to build or deserialize the
    /// layered sources (file, environment, defaults).
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A loaded value failed a semantic validation rule.
    #[error("invalid configuration field '{field}': {reason}")]
    Validation {
        /// Dotted path of the offending field, e.g. `ingest.max_skew_secs`.
        field: String,
        /// Human-readable reason the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Build a validation error for `field` with `reason`.
    pub fn validation<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
