//! Runtime configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! [lock_retry]
//! max_attempts = 10
//! initial_delay_ms = 100
//! max_delay_ms = 100
//!
//! [visibility_retry]
//! max_attempts = 10
//! initial_delay_ms = 100
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{UnifyError, ValidationError};
use crate::retry::RetryPolicy;

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Configuration of the profile service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnifyConfig {
    /// Retries while waiting for a profile lock.
    pub lock_retry: RetryPolicy,
    /// Retries while waiting for a written profile to become readable.
    pub visibility_retry: RetryPolicy,
    /// Log output.
    pub logging: LoggingConfig,
}

impl UnifyConfig {
    const MAX_ATTEMPTS: u32 = 1_000;
    const MAX_DELAY: Duration = Duration::from_secs(60);

    /// Parses a TOML document and validates it.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for malformed TOML or out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, UnifyError> {
        let config: Self = toml::from_str(text).map_err(|e| invalid(e.to_string()))?;
        config.validate()
    }

    /// Reads and validates a TOML file.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the file cannot be read or is invalid.
    pub fn from_file(path: &Path) -> Result<Self, UnifyError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(self) -> Result<Self, UnifyError> {
        check_policy("lock_retry", &self.lock_retry)?;
        check_policy("visibility_retry", &self.visibility_retry)?;
        if self.logging.level.trim().is_empty() {
            return Err(invalid("logging.level must not be empty".to_string()));
        }
        Ok(self)
    }
}

fn check_policy(name: &str, policy: &RetryPolicy) -> Result<(), UnifyError> {
    if policy.max_attempts == 0 || policy.max_attempts > UnifyConfig::MAX_ATTEMPTS {
        return Err(invalid(format!(
            "{name}.max_attempts must be between 1 and {} (got {})",
            UnifyConfig::MAX_ATTEMPTS,
            policy.max_attempts
        )));
    }
    if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
        return Err(invalid(format!(
            "{name}.multiplier must be a finite number >= 1 (got {})",
            policy.multiplier
        )));
    }
    if policy.initial_delay > UnifyConfig::MAX_DELAY || policy.max_delay > UnifyConfig::MAX_DELAY {
        return Err(invalid(format!(
            "{name} delays must not exceed {} ms",
            UnifyConfig::MAX_DELAY.as_millis()
        )));
    }
    if policy.max_delay < policy.initial_delay {
        return Err(invalid(format!(
            "{name}.max_delay_ms must be >= initial_delay_ms ({:?} < {:?})",
            policy.max_delay, policy.initial_delay
        )));
    }
    Ok(())
}

fn invalid(reason: String) -> UnifyError {
    ValidationError::InvalidConfig { reason }.into()
}
