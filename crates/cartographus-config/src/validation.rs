//! Semantic validation of a loaded [`crate::CartographusConfig`].
//!
//! The `config` crate only guarantees the shape deserializes; it says
//! nothing about whether a value makes sense (a zero batch size, a
//! false-positive rate of 2.0). This module is that second pass.

use crate::config::CartographusConfig;
use crate::error::{ConfigError, Result};

/// Validate every section of `config`, returning the first violation
/// encountered.
///
/// Invalid configuration is always fatal at startup (§6): callers should
/// propagate this error up to `main` and exit rather than retry or patch
/// around it.
pub fn validate(config: &CartographusConfig) -> Result<()> {
    validate_ingest(config)?;
    validate_bloom(config)?;
    validate_wal(config)?;
    validate_broker(config)?;
    validate_pipeline(config)?;
    validate_analytics(config)?;
    validate_audit(config)?;
    validate_timeouts(config)?;
    Ok(())
}

fn validate_ingest(config: &CartographusConfig) -> Result<()> {
    if config.ingest.max_skew_secs <= 0 {
        return Err(ConfigError::validation(
            "ingest.max_skew_secs",
            "must be positive",
        ));
    }
    if config.ingest.max_payload_bytes == 0 {
        return Err(ConfigError::validation(
            "ingest.max_payload_bytes",
            "must be positive",
        ));
    }
    Ok(())
}

fn validate_bloom(config: &CartographusConfig) -> Result<()> {
    if config.bloom.capacity == 0 {
        return Err(ConfigError::validation("bloom.capacity", "must be positive"));
    }
    if !(0.0..1.0).contains(&config.bloom.false_positive_rate) {
        return Err(ConfigError::validation(
            "bloom.false_positive_rate",
            "must be in (0.0, 1.0)",
        ));
    }
    if config.bloom.lru_capacity == 0 {
        return Err(ConfigError::validation(
            "bloom.lru_capacity",
            "must be positive",
        ));
    }
    Ok(())
}

fn validate_wal(config: &CartographusConfig) -> Result<()> {
    if config.wal.path.trim().is_empty() {
        return Err(ConfigError::validation("wal.path", "must not be empty"));
    }
    if config.wal.lease_duration_secs == 0 {
        return Err(ConfigError::validation(
            "wal.lease_duration_secs",
            "must be positive",
        ));
    }
    if config.wal.max_retries == 0 {
        return Err(ConfigError::validation(
            "wal.max_retries",
            "must be positive",
        ));
    }
    Ok(())
}

fn validate_broker(config: &CartographusConfig) -> Result<()> {
    if config.broker.path.trim().is_empty() {
        return Err(ConfigError::validation("broker.path", "must not be empty"));
    }
    if config.broker.ack_wait_secs == 0 {
        return Err(ConfigError::validation(
            "broker.ack_wait_secs",
            "must be positive",
        ));
    }
    if config.broker.max_deliveries == 0 {
        return Err(ConfigError::validation(
            "broker.max_deliveries",
            "must be positive",
        ));
    }
    Ok(())
}

fn validate_pipeline(config: &CartographusConfig) -> Result<()> {
    if config.pipeline.subscribers == 0 {
        return Err(ConfigError::validation(
            "pipeline.subscribers",
            "must be positive",
        ));
    }
    if config.pipeline.batch_size == 0 {
        return Err(ConfigError::validation(
            "pipeline.batch_size",
            "must be positive",
        ));
    }
    if config.pipeline.queue_capacity < config.pipeline.batch_size {
        return Err(ConfigError::validation(
            "pipeline.queue_capacity",
            "must be at least batch_size",
        ));
    }
    if !(0.0..=1.0).contains(&config.pipeline.backpressure_threshold) {
        return Err(ConfigError::validation(
            "pipeline.backpressure_threshold",
            "must be in [0.0, 1.0]",
        ));
    }
    Ok(())
}

fn validate_analytics(config: &CartographusConfig) -> Result<()> {
    if config.analytics.database_url.trim().is_empty() {
        return Err(ConfigError::validation(
            "analytics.database_url",
            "must not be empty",
        ));
    }
    if config.analytics.retention_days == 0 {
        return Err(ConfigError::validation(
            "analytics.retention_days",
            "must be positive",
        ));
    }
    Ok(())
}

fn validate_audit(config: &CartographusConfig) -> Result<()> {
    if config.audit.buffer_size == 0 {
        return Err(ConfigError::validation(
            "audit.buffer_size",
            "must be positive",
        ));
    }
    if config.audit.retention_days == 0 {
        return Err(ConfigError::validation(
            "audit.retention_days",
            "must be positive",
        ));
    }
    match config.audit.min_severity.as_str() {
        "debug" | "info" | "warning" | "error" | "critical" => {}
        other => {
            return Err(ConfigError::validation(
                "audit.min_severity",
                format!("'{other}' is not a recognized severity"),
            ));
        }
    }
    Ok(())
}

fn validate_timeouts(config: &CartographusConfig) -> Result<()> {
    if config.timeouts.broker_publish_secs == 0
        || config.timeouts.analytics_flush_secs == 0
        || config.timeouts.audit_write_secs == 0
    {
        return Err(ConfigError::validation(
            "timeouts",
            "every timeout must be positive",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate(&CartographusConfig::default()).is_ok());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut config = CartographusConfig::default();
        config.pipeline.batch_size = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("pipeline.batch_size"));
    }

    #[test]
    fn rejects_out_of_range_false_positive_rate() {
        let mut config = CartographusConfig::default();
        config.bloom.false_positive_rate = 1.5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_unrecognized_severity() {
        let mut config = CartographusConfig::default();
        config.audit.min_severity = "verbose".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn queue_capacity_must_cover_one_batch() {
        let mut config = CartographusConfig::default();
        config.pipeline.queue_capacity = 10;
        config.pipeline.batch_size = 500;
        assert!(validate(&config).is_err());
    }
}
