//! KDL configuration parsing.

use std::path::Path;

use ::kdl::{KdlDocument, KdlNode, KdlValue};
use tracing::{trace, warn};

use crate::{Config, ConfigError, ContentionPolicy, LockConfig, SignerConfig, ToolsConfig};

/// Parse a whole configuration document
pub fn parse_config(text: &str, origin: &Path) -> Result<Config, ConfigError> {
    let doc: KdlDocument = text.parse().map_err(|e: ::kdl::KdlError| ConfigError::Parse {
        path: origin.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "signer" => config.signer = parse_signer(node)?,
            "tools" => config.tools = parse_tools(node)?,
            "lock" => config.lock = parse_lock(node)?,
            other => {
                warn!(
                    node = %other,
                    path = %origin.display(),
                    "Ignoring unknown configuration block"
                );
            }
        }
    }

    Ok(config)
}

fn parse_signer(node: &KdlNode) -> Result<SignerConfig, ConfigError> {
    trace!("Parsing signer configuration block");
    warn_unknown_children(
        node,
        &[
            "sign-path",
            "ca-signing-role",
            "public-key-path",
            "signed-key-path",
            "valid-principals",
            "min-ttl-seconds",
            "force-refresh",
        ],
    );

    let config = SignerConfig {
        sign_path: get_string_entry(node, "sign-path")?,
        ca_signing_role: get_string_entry(node, "ca-signing-role")?,
        public_key_path: get_string_entry(node, "public-key-path")?,
        signed_key_path: get_string_entry(node, "signed-key-path")?,
        valid_principals: get_string_entry(node, "valid-principals")?,
        min_ttl_seconds: get_int_entry(node, "min-ttl-seconds")?,
        force_refresh: get_bool_entry(node, "force-refresh")?,
    };

    trace!(
        sign_path = ?config.sign_path,
        min_ttl_seconds = ?config.min_ttl_seconds,
        "Parsed signer configuration"
    );
    Ok(config)
}

fn parse_tools(node: &KdlNode) -> Result<ToolsConfig, ConfigError> {
    trace!("Parsing tools configuration block");
    warn_unknown_children(node, &["keygen", "vault"]);

    let defaults = ToolsConfig::default();
    Ok(ToolsConfig {
        keygen: get_string_entry(node, "keygen")?.unwrap_or(defaults.keygen),
        vault: get_string_entry(node, "vault")?.unwrap_or(defaults.vault),
    })
}

fn parse_lock(node: &KdlNode) -> Result<LockConfig, ConfigError> {
    trace!("Parsing lock configuration block");
    warn_unknown_children(
        node,
        &["max-attempts", "retry-delay-ms", "on-contention", "stale-after-secs"],
    );

    let defaults = LockConfig::default();
    let max_attempts = match get_int_entry(node, "max-attempts")? {
        Some(v) => u32::try_from(v).map_err(|_| ConfigError::InvalidValue {
            key: "max-attempts".to_string(),
            expected: "a non-negative 32-bit integer",
        })?,
        None => defaults.max_attempts,
    };
    let retry_delay_ms = match get_int_entry(node, "retry-delay-ms")? {
        Some(v) => u64::try_from(v).map_err(|_| ConfigError::InvalidValue {
            key: "retry-delay-ms".to_string(),
            expected: "a non-negative integer",
        })?,
        None => defaults.retry_delay_ms,
    };
    let on_contention = match get_string_entry(node, "on-contention")? {
        Some(s) => s.parse::<ContentionPolicy>()?,
        None => defaults.on_contention,
    };
    let stale_after_secs = match get_int_entry(node, "stale-after-secs")? {
        Some(v) => u64::try_from(v).map_err(|_| ConfigError::InvalidValue {
            key: "stale-after-secs".to_string(),
            expected: "a non-negative integer",
        })?,
        None => defaults.stale_after_secs,
    };

    Ok(LockConfig {
        max_attempts,
        retry_delay_ms,
        on_contention,
        stale_after_secs,
    })
}

// ============================================================================
// Entry helpers
// ============================================================================

fn child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|n| n.name().value() == name)
}

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn warn_unknown_children(node: &KdlNode, known: &[&str]) {
    let Some(children) = node.children() else {
        return;
    };
    for c in children.nodes() {
        let name = c.name().value();
        if !known.contains(&name) {
            warn!(
                block = %node.name().value(),
                key = %name,
                "Ignoring unknown configuration key"
            );
        }
    }
}

fn get_string_entry(node: &KdlNode, name: &str) -> Result<Option<String>, ConfigError> {
    let Some(value) = child(node, name).and_then(first_arg) else {
        return Ok(None);
    };
    value
        .as_string()
        .map(|s| Some(s.to_string()))
        .ok_or_else(|| ConfigError::InvalidValue {
            key: name.to_string(),
            expected: "a string",
        })
}

fn get_int_entry(node: &KdlNode, name: &str) -> Result<Option<i64>, ConfigError> {
    let Some(value) = child(node, name).and_then(first_arg) else {
        return Ok(None);
    };
    value
        .as_integer()
        .and_then(|v| i64::try_from(v).ok())
        .map(Some)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: name.to_string(),
            expected: "an integer",
        })
}

fn get_bool_entry(node: &KdlNode, name: &str) -> Result<Option<bool>, ConfigError> {
    let Some(value) = child(node, name).and_then(first_arg) else {
        return Ok(None);
    };
    value
        .as_bool()
        .map(Some)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: name.to_string(),
            expected: "a boolean",
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config, ConfigError> {
        parse_config(text, Path::new("test.kdl"))
    }

    #[test]
    fn test_parse_full_document() {
        let config = parse(
            r#"
            signer {
                sign-path "ssh-engine/sign/ops"
                ca-signing-role "ssh-engine/roles/ops"
                public-key-path "~/.ssh/id_ed25519.pub"
                signed-key-path "~/.ssh/id_ed25519-cert.pub"
                valid-principals "deploy,admin"
                min-ttl-seconds 7200
            }
            tools {
                keygen "/usr/bin/ssh-keygen"
                vault "/opt/vault/bin/vault"
            }
            lock {
                max-attempts 20
                retry-delay-ms 250
                on-contention "fail"
                stale-after-secs 0
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.signer.sign_path.as_deref(), Some("ssh-engine/sign/ops"));
        assert_eq!(config.signer.valid_principals.as_deref(), Some("deploy,admin"));
        assert_eq!(config.signer.min_ttl_seconds, Some(7200));
        assert_eq!(config.signer.force_refresh, None);
        assert_eq!(config.tools.keygen, "/usr/bin/ssh-keygen");
        assert_eq!(config.tools.vault, "/opt/vault/bin/vault");
        assert_eq!(config.lock.max_attempts, 20);
        assert_eq!(config.lock.retry_delay_ms, 250);
        assert_eq!(config.lock.on_contention, ContentionPolicy::Fail);
        assert_eq!(config.lock.stale_after(), None);
    }

    #[test]
    fn test_missing_blocks_keep_defaults() {
        let config = parse("signer {\n    min-ttl-seconds 60\n}\n").unwrap();
        assert_eq!(config.tools, ToolsConfig::default());
        assert_eq!(config.lock, LockConfig::default());
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let err = parse("signer {\n    min-ttl-seconds \"soon\"\n}\n").unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "min-ttl-seconds"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_negative_attempts_rejected() {
        let err = parse("lock {\n    max-attempts -1\n}\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_unknown_contention_policy_rejected() {
        let err = parse("lock {\n    on-contention \"maybe\"\n}\n").unwrap_err();
        assert!(err.to_string().contains("on-contention"));
    }

    #[test]
    fn test_syntax_error_reports_origin() {
        let err = parse("signer {").unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, Path::new("test.kdl")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
