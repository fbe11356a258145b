//! Resolution of merged configuration into per-connection settings.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};
use vaultsign_common::Principals;

use crate::{
    expand_tilde, Config, ConfigError, LockConfig, DEFAULT_MIN_TTL_SECONDS, DEFAULT_PRINCIPAL,
    DEFAULT_PUBLIC_KEY_PATH, DEFAULT_SIGNED_KEY_PATH, FALLBACK_SIGN_PATH,
};

/// Facts about the connection that influence resolution
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    /// Target host, used for log context only
    pub host: Option<String>,
    /// Login user for the connection
    pub remote_user: Option<String>,
}

impl ConnectionContext {
    pub fn new(host: Option<String>, remote_user: Option<String>) -> Self {
        Self { host, remote_user }
    }
}

/// Where the sign path came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignPathSource {
    /// `sign-path` was set
    Explicit,
    /// `ca-signing-role` with `/roles/` rewritten to `/sign/`
    TransformedRole,
    /// `ca-signing-role` used verbatim
    Role,
    /// Built-in fallback
    Fallback,
}

/// Where the principals came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrincipalSource {
    Explicit,
    RemoteUser,
    Default,
}

/// Fully resolved settings for one connection attempt
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedSettings {
    pub host: Option<String>,
    pub sign_path: String,
    pub sign_path_source: SignPathSource,
    /// `None` when configured as an empty string
    pub public_key_path: Option<PathBuf>,
    /// `None` when configured as an empty string
    pub signed_key_path: Option<PathBuf>,
    pub principals: Principals,
    pub principals_source: PrincipalSource,
    pub min_ttl_seconds: i64,
    pub force_refresh: bool,
    pub keygen: String,
    pub vault: String,
    pub lock: LockConfig,
}

pub(crate) fn resolve(
    config: &Config,
    ctx: &ConnectionContext,
) -> Result<ResolvedSettings, ConfigError> {
    let signer = &config.signer;
    let host = ctx.host.as_deref().unwrap_or("-");

    let (sign_path, sign_path_source) = resolve_sign_path(
        signer.sign_path.as_deref(),
        signer.ca_signing_role.as_deref(),
    );
    match sign_path_source {
        SignPathSource::Explicit => {
            debug!(host = %host, sign_path = %sign_path, "Using configured sign path");
        }
        SignPathSource::TransformedRole => {
            debug!(host = %host, sign_path = %sign_path, "Derived sign path from signing role");
        }
        SignPathSource::Role => {
            warn!(
                host = %host,
                sign_path = %sign_path,
                "Signing role does not contain '/roles/', using it directly as sign path"
            );
        }
        SignPathSource::Fallback => {
            warn!(
                host = %host,
                sign_path = %sign_path,
                "Using fallback sign path; consider setting 'sign-path' or 'ca-signing-role'"
            );
        }
    }

    if sign_path.trim().is_empty() {
        return Err(ConfigError::MissingSignPath {
            host: ctx.host.clone(),
        });
    }

    let (principals, principals_source) =
        resolve_principals(signer.valid_principals.as_deref(), ctx.remote_user.as_deref());
    if principals.is_empty() {
        warn!(
            host = %host,
            "Valid principals could not be determined, the signing role's default will apply"
        );
    } else {
        debug!(
            host = %host,
            principals = %principals,
            source = ?principals_source,
            "Resolved valid principals"
        );
    }

    let settings = ResolvedSettings {
        host: ctx.host.clone(),
        sign_path,
        sign_path_source,
        public_key_path: resolve_path(signer.public_key_path.as_deref(), DEFAULT_PUBLIC_KEY_PATH),
        signed_key_path: resolve_path(signer.signed_key_path.as_deref(), DEFAULT_SIGNED_KEY_PATH),
        principals,
        principals_source,
        min_ttl_seconds: signer.min_ttl_seconds.unwrap_or(DEFAULT_MIN_TTL_SECONDS),
        force_refresh: signer.force_refresh.unwrap_or(false),
        keygen: config.tools.keygen.clone(),
        vault: config.tools.vault.clone(),
        lock: config.lock.clone(),
    };

    debug!(
        host = %host,
        public_key = ?settings.public_key_path,
        signed_key = ?settings.signed_key_path,
        min_ttl_secs = settings.min_ttl_seconds,
        force_refresh = settings.force_refresh,
        "Resolved signer settings"
    );

    Ok(settings)
}

fn resolve_sign_path(explicit: Option<&str>, role: Option<&str>) -> (String, SignPathSource) {
    if let Some(path) = explicit {
        return (path.to_string(), SignPathSource::Explicit);
    }
    match role {
        Some(role) if role.contains("/roles/") => (
            role.replacen("/roles/", "/sign/", 1),
            SignPathSource::TransformedRole,
        ),
        Some(role) => (role.to_string(), SignPathSource::Role),
        None => (FALLBACK_SIGN_PATH.to_string(), SignPathSource::Fallback),
    }
}

fn resolve_principals(
    explicit: Option<&str>,
    remote_user: Option<&str>,
) -> (Principals, PrincipalSource) {
    if let Some(explicit) = explicit {
        return (Principals::parse(explicit), PrincipalSource::Explicit);
    }
    match remote_user.filter(|u| !u.is_empty()) {
        Some(user) => (Principals::parse(user), PrincipalSource::RemoteUser),
        None => (Principals::parse(DEFAULT_PRINCIPAL), PrincipalSource::Default),
    }
}

fn resolve_path(configured: Option<&str>, default: &str) -> Option<PathBuf> {
    let raw = configured.unwrap_or(default);
    if raw.trim().is_empty() {
        None
    } else {
        Some(expand_tilde(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SignerConfig;

    fn config_with(signer: SignerConfig) -> Config {
        Config {
            signer,
            ..Default::default()
        }
    }

    #[test]
    fn test_explicit_sign_path_wins() {
        let config = config_with(SignerConfig {
            sign_path: Some("ssh/sign/explicit".to_string()),
            ca_signing_role: Some("ssh/roles/other".to_string()),
            ..Default::default()
        });
        let resolved = config.resolve(&ConnectionContext::default()).unwrap();
        assert_eq!(resolved.sign_path, "ssh/sign/explicit");
        assert_eq!(resolved.sign_path_source, SignPathSource::Explicit);
    }

    #[test]
    fn test_role_is_transformed_once() {
        let (path, source) = resolve_sign_path(None, Some("ssh/roles/ops/roles/x"));
        assert_eq!(path, "ssh/sign/ops/roles/x");
        assert_eq!(source, SignPathSource::TransformedRole);
    }

    #[test]
    fn test_role_without_roles_segment_used_verbatim() {
        let (path, source) = resolve_sign_path(None, Some("ssh/custom"));
        assert_eq!(path, "ssh/custom");
        assert_eq!(source, SignPathSource::Role);
    }

    #[test]
    fn test_fallback_sign_path() {
        let (path, source) = resolve_sign_path(None, None);
        assert_eq!(path, FALLBACK_SIGN_PATH);
        assert_eq!(source, SignPathSource::Fallback);
    }

    #[test]
    fn test_empty_sign_path_is_an_error() {
        let config = config_with(SignerConfig {
            sign_path: Some(String::new()),
            ..Default::default()
        });
        let ctx = ConnectionContext::new(Some("db1".to_string()), None);
        let err = config.resolve(&ctx).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSignPath { .. }));
        assert!(err.to_string().contains("db1"));
    }

    #[test]
    fn test_principal_precedence() {
        let (p, s) = resolve_principals(Some("a,b"), Some("deploy"));
        assert_eq!(p.to_string(), "a,b");
        assert_eq!(s, PrincipalSource::Explicit);

        let (p, s) = resolve_principals(None, Some("deploy"));
        assert_eq!(p.to_string(), "deploy");
        assert_eq!(s, PrincipalSource::RemoteUser);

        let (p, s) = resolve_principals(None, None);
        assert_eq!(p.to_string(), DEFAULT_PRINCIPAL);
        assert_eq!(s, PrincipalSource::Default);
    }

    #[test]
    fn test_defaults_applied() {
        let resolved = Config::default()
            .resolve(&ConnectionContext::default())
            .unwrap();
        assert_eq!(resolved.min_ttl_seconds, DEFAULT_MIN_TTL_SECONDS);
        assert!(!resolved.force_refresh);
        assert!(resolved
            .signed_key_path
            .as_ref()
            .is_some_and(|p| p.ends_with(".ssh/id_rsa-cert.pub")));
        assert!(resolved
            .public_key_path
            .as_ref()
            .is_some_and(|p| p.ends_with(".ssh/id_rsa.pub")));
    }

    #[test]
    fn test_empty_paths_resolve_to_none() {
        let config = config_with(SignerConfig {
            public_key_path: Some(String::new()),
            signed_key_path: Some("  ".to_string()),
            ..Default::default()
        });
        let resolved = config.resolve(&ConnectionContext::default()).unwrap();
        assert_eq!(resolved.public_key_path, None);
        assert_eq!(resolved.signed_key_path, None);
    }
}
