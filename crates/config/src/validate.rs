//! Configuration validation and linting.

use std::fmt;

use crate::{Config, ConfigError, ContentionPolicy};

/// A validation failure that makes the configuration unusable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// A finding that does not block use of the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Accumulated validation findings
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse into a `Result`, joining all error messages
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        if self.errors.is_empty() {
            return Ok(self.warnings);
        }
        let joined = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(ConfigError::Validation(joined))
    }
}

pub(crate) fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if let Some(ttl) = config.signer.min_ttl_seconds {
        if ttl < 0 {
            result.add_error(ValidationError::new(format!(
                "min-ttl-seconds must not be negative (got {ttl})"
            )));
        } else if ttl == 0 {
            result.add_warning(ValidationWarning::new(
                "min-ttl-seconds is 0: certificates are only renewed once expired",
            ));
        }
    }

    if config.lock.max_attempts == 0 {
        result.add_error(ValidationError::new("lock max-attempts must be at least 1"));
    }

    if config.tools.keygen.trim().is_empty() {
        result.add_error(ValidationError::new("tools keygen must not be empty"));
    }
    if config.tools.vault.trim().is_empty() {
        result.add_error(ValidationError::new("tools vault must not be empty"));
    }

    if config.signer.force_refresh == Some(true) {
        result.add_warning(ValidationWarning::new(
            "force-refresh is enabled: every connection attempt requests a new certificate",
        ));
    }

    if config.signer.sign_path.is_none() && config.signer.ca_signing_role.is_none() {
        result.add_warning(ValidationWarning::new(
            "neither sign-path nor ca-signing-role is set; the fallback sign path will be used",
        ));
    }

    if config.lock.on_contention == ContentionPolicy::Proceed {
        let wait_ms =
            u64::from(config.lock.max_attempts).saturating_mul(config.lock.retry_delay_ms);
        if wait_ms == 0 {
            result.add_warning(ValidationWarning::new(
                "lock retry-delay-ms is 0: contended renewals proceed without waiting",
            ));
        }
    }

    if config.lock.stale_after_secs > 0 && config.lock.stale_after_secs < 60 {
        result.add_warning(ValidationWarning::new(format!(
            "lock stale-after-secs is {}: a slow renewal may have its lock reclaimed",
            config.lock.stale_after_secs
        )));
    }

    result
}
