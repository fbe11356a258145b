//! Environment variable overrides (`VAULTSIGN_*`).

use serde::Deserialize;
use tracing::debug;

use crate::{Config, ConfigError, ContentionPolicy, SignerConfig};

const ENV_PREFIX: &str = "VAULTSIGN_";

/// Values read from `VAULTSIGN_*` environment variables.
///
/// | Variable                           | Field                    |
/// |------------------------------------|--------------------------|
/// | `VAULTSIGN_SIGN_PATH`              | `signer.sign_path`       |
/// | `VAULTSIGN_CA_SIGNING_ROLE`        | `signer.ca_signing_role` |
/// | `VAULTSIGN_PUBLIC_KEY_PATH`        | `signer.public_key_path` |
/// | `VAULTSIGN_SIGNED_KEY_PATH`        | `signer.signed_key_path` |
/// | `VAULTSIGN_VALID_PRINCIPALS`       | `signer.valid_principals`|
/// | `VAULTSIGN_MIN_TTL_SECONDS`        | `signer.min_ttl_seconds` |
/// | `VAULTSIGN_FORCE_REFRESH`          | `signer.force_refresh`   |
/// | `VAULTSIGN_KEYGEN`                 | `tools.keygen`           |
/// | `VAULTSIGN_VAULT`                  | `tools.vault`            |
/// | `VAULTSIGN_LOCK_MAX_ATTEMPTS`      | `lock.max_attempts`      |
/// | `VAULTSIGN_LOCK_RETRY_DELAY_MS`    | `lock.retry_delay_ms`    |
/// | `VAULTSIGN_LOCK_ON_CONTENTION`     | `lock.on_contention`     |
/// | `VAULTSIGN_LOCK_STALE_AFTER_SECS`  | `lock.stale_after_secs`  |
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvOverrides {
    pub sign_path: Option<String>,
    pub ca_signing_role: Option<String>,
    pub public_key_path: Option<String>,
    pub signed_key_path: Option<String>,
    pub valid_principals: Option<String>,
    pub min_ttl_seconds: Option<i64>,
    pub force_refresh: Option<bool>,
    pub keygen: Option<String>,
    pub vault: Option<String>,
    pub lock_max_attempts: Option<u32>,
    pub lock_retry_delay_ms: Option<u64>,
    pub lock_on_contention: Option<String>,
    pub lock_stale_after_secs: Option<u64>,
}

impl EnvOverrides {
    /// Read overrides from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| ConfigError::Environment(e.to_string()))
    }

    /// Read overrides from explicit key/value pairs
    pub fn from_pairs<I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed(ENV_PREFIX)
            .from_iter(pairs)
            .map_err(|e| ConfigError::Environment(e.to_string()))
    }

    pub(crate) fn apply(self, config: &mut Config) -> Result<(), ConfigError> {
        config.signer.merge(SignerConfig {
            sign_path: self.sign_path,
            ca_signing_role: self.ca_signing_role,
            public_key_path: self.public_key_path,
            signed_key_path: self.signed_key_path,
            valid_principals: self.valid_principals,
            min_ttl_seconds: self.min_ttl_seconds,
            force_refresh: self.force_refresh,
        });

        if let Some(keygen) = self.keygen {
            config.tools.keygen = keygen;
        }
        if let Some(vault) = self.vault {
            config.tools.vault = vault;
        }
        if let Some(attempts) = self.lock_max_attempts {
            config.lock.max_attempts = attempts;
        }
        if let Some(delay) = self.lock_retry_delay_ms {
            config.lock.retry_delay_ms = delay;
        }
        if let Some(policy) = self.lock_on_contention {
            config.lock.on_contention = policy.parse::<ContentionPolicy>()?;
        }
        if let Some(stale) = self.lock_stale_after_secs {
            config.lock.stale_after_secs = stale;
        }

        debug!("Applied environment overrides");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_overrides_win_over_file_values() {
        let mut config = Config::default();
        config.signer.sign_path = Some("ssh/sign/from-file".to_string());
        config.signer.min_ttl_seconds = Some(100);

        let overrides = EnvOverrides::from_pairs(pairs(&[
            ("VAULTSIGN_MIN_TTL_SECONDS", "1800"),
            ("VAULTSIGN_FORCE_REFRESH", "true"),
            ("VAULTSIGN_VAULT", "/opt/vault"),
            ("VAULTSIGN_LOCK_ON_CONTENTION", "fail"),
            ("UNRELATED", "ignored"),
        ]))
        .unwrap();
        config.apply_env(overrides).unwrap();

        assert_eq!(config.signer.sign_path.as_deref(), Some("ssh/sign/from-file"));
        assert_eq!(config.signer.min_ttl_seconds, Some(1800));
        assert_eq!(config.signer.force_refresh, Some(true));
        assert_eq!(config.tools.vault, "/opt/vault");
        assert_eq!(config.lock.on_contention, ContentionPolicy::Fail);
    }

    #[test]
    fn test_malformed_number_is_an_error() {
        let err = EnvOverrides::from_pairs(pairs(&[("VAULTSIGN_MIN_TTL_SECONDS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Environment(_)));
    }

    #[test]
    fn test_empty_environment_changes_nothing() {
        let mut config = Config::default();
        config
            .apply_env(EnvOverrides::from_pairs(Vec::new()).unwrap())
            .unwrap();
        assert_eq!(config.signer, SignerConfig::default());
    }
}
