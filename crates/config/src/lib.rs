//! Configuration loading and resolution for vaultsign
//!
//! Configuration is layered, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. KDL configuration file
//! 3. `VAULTSIGN_*` environment variables
//! 4. Command-line flags (applied by the binary)
//!
//! The merged [`Config`] is then resolved against a [`ConnectionContext`]
//! into [`ResolvedSettings`], which is what the certificate lifecycle
//! consumes.
//!
//! # Example
//!
//! ```kdl
//! signer {
//!     sign-path "ssh-engine/sign/my-role"
//!     public-key-path "~/.ssh/id_ed25519.pub"
//!     signed-key-path "~/.ssh/id_ed25519-cert.pub"
//!     valid-principals "deploy"
//!     min-ttl-seconds 3600
//! }
//!
//! lock {
//!     max-attempts 10
//!     retry-delay-ms 500
//!     on-contention "proceed"
//!     stale-after-secs 300
//! }
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

mod env;
mod error;
mod kdl;
mod paths;
mod resolve;
pub mod validate;

pub use env::EnvOverrides;
pub use error::ConfigError;
pub use paths::{default_config_path, expand_tilde};
pub use resolve::{ConnectionContext, PrincipalSource, ResolvedSettings, SignPathSource};

/// Default public key to be signed
pub const DEFAULT_PUBLIC_KEY_PATH: &str = "~/.ssh/id_rsa.pub";

/// Default location of the signed certificate
pub const DEFAULT_SIGNED_KEY_PATH: &str = "~/.ssh/id_rsa-cert.pub";

/// Default minimum remaining validity before renewal
pub const DEFAULT_MIN_TTL_SECONDS: i64 = 3600;

/// Principal used when neither an explicit list nor a remote user is known
pub const DEFAULT_PRINCIPAL: &str = "ansible";

/// Sign path used when nothing else is configured
pub const FALLBACK_SIGN_PATH: &str = "ssh/sign/default-role";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Signing options
    #[serde(default)]
    pub signer: SignerConfig,

    /// External tool locations
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Renewal lock behaviour
    #[serde(default)]
    pub lock: LockConfig,
}

/// Signing options.
///
/// Every field is optional so that layers can be merged; defaults are
/// applied during resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Vault SSH signing path (e.g. `ssh-engine/sign/my-role`)
    pub sign_path: Option<String>,
    /// Vault SSH role path, converted to a sign path when `sign_path` is unset
    pub ca_signing_role: Option<String>,
    /// Public key to be signed
    pub public_key_path: Option<String>,
    /// Where the signed certificate is stored
    pub signed_key_path: Option<String>,
    /// Comma-separated principals to request
    pub valid_principals: Option<String>,
    /// Minimum remaining validity in seconds
    pub min_ttl_seconds: Option<i64>,
    /// Renew even if the certificate is still fresh
    pub force_refresh: Option<bool>,
}

impl SignerConfig {
    /// Overlay `other` onto `self`; set fields in `other` win
    pub fn merge(&mut self, other: SignerConfig) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        overlay!(
            sign_path,
            ca_signing_role,
            public_key_path,
            signed_key_path,
            valid_principals,
            min_ttl_seconds,
            force_refresh
        );
    }
}

/// External executables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Certificate metadata tool (`ssh-keygen`)
    #[serde(default = "default_keygen")]
    pub keygen: String,
    /// Authority CLI (`vault`)
    #[serde(default = "default_vault")]
    pub vault: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            keygen: default_keygen(),
            vault: default_vault(),
        }
    }
}

fn default_keygen() -> String {
    "ssh-keygen".to_string()
}

fn default_vault() -> String {
    "vault".to_string()
}

/// What to do when the renewal lock cannot be acquired in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentionPolicy {
    /// Renew without exclusivity (fail-open)
    #[default]
    Proceed,
    /// Abort the connection attempt (fail-closed)
    Fail,
}

impl FromStr for ContentionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "proceed" => Ok(Self::Proceed),
            "fail" => Ok(Self::Fail),
            _ => Err(ConfigError::InvalidValue {
                key: "on-contention".to_string(),
                expected: "\"proceed\" or \"fail\"",
            }),
        }
    }
}

impl fmt::Display for ContentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proceed => write!(f, "proceed"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Renewal lock settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Number of exclusive-create attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Behaviour once attempts are exhausted
    #[serde(default)]
    pub on_contention: ContentionPolicy,
    /// Age after which a lock marker is considered abandoned (0 disables)
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl LockConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        (self.stale_after_secs > 0).then(|| Duration::from_secs(self.stale_after_secs))
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            on_contention: ContentionPolicy::default(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_stale_after_secs() -> u64 {
    300
}

impl Config {
    /// Parse configuration from KDL text
    pub fn from_kdl(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        kdl::parse_config(text, origin)
    }

    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let config = Self::from_kdl(&text, path)?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Load configuration from the explicit path, or the default location.
    ///
    /// An explicit path must exist; a missing default file falls back to
    /// built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            Some(path) => {
                debug!(
                    path = %path.display(),
                    "No configuration file at default location, using defaults"
                );
                Ok(Self::default())
            }
            None => {
                debug!("No configuration directory available, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration and apply environment overrides
    pub fn load_with_env(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::load(explicit)?;
        config.apply_env(EnvOverrides::from_env()?)?;
        Ok(config)
    }

    /// Overlay environment overrides
    pub fn apply_env(&mut self, overrides: EnvOverrides) -> Result<(), ConfigError> {
        overrides.apply(self)
    }

    /// Resolve the merged configuration for a connection
    pub fn resolve(&self, ctx: &ConnectionContext) -> Result<ResolvedSettings, ConfigError> {
        resolve::resolve(self, ctx)
    }

    /// Validate value ranges.
    ///
    /// Returns the accumulated result; callers decide whether warnings matter.
    pub fn validate(&self) -> validate::ValidationResult {
        validate::validate(self)
    }
}
