//! Certificate signing and installation.
//!
//! Requests a signed certificate from the Vault SSH secrets engine through
//! the `vault` CLI and writes it to its destination. The write is atomic:
//! the payload goes to a temporary file in the destination directory which
//! is synced and then renamed over the target, so concurrent readers see
//! either the old certificate or the complete new one.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{debug, info, trace, warn};
use vaultsign_common::Principals;

use crate::error::{Precondition, SigningError};
use crate::exec::{display_args, CommandRunner};

const CERT_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o700;

/// One signing request
#[derive(Debug, Clone)]
pub struct SigningRequest {
    /// Signing endpoint path, e.g. `ssh-engine/sign/my-role`
    pub authority_endpoint: String,
    pub public_key_path: PathBuf,
    /// Empty means the role's default principals apply
    pub principals: Principals,
}

impl SigningRequest {
    /// Arguments for `vault write`
    pub fn vault_args(&self) -> Vec<OsString> {
        let mut public_key = OsString::from("public_key=@");
        public_key.push(self.public_key_path.as_os_str());

        let mut args = vec![
            OsString::from("write"),
            OsString::from("-field=signed_key"),
            OsString::from(&self.authority_endpoint),
            public_key,
        ];
        if !self.principals.is_empty() {
            args.push(OsString::from(format!("valid_principals={}", self.principals)));
        }
        args
    }
}

/// A certificate written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledCertificate {
    pub path: PathBuf,
    pub bytes: usize,
}

/// Talks to the signing authority and installs what it returns
#[derive(Clone)]
pub struct SigningClient {
    runner: Arc<dyn CommandRunner>,
    vault: String,
}

impl SigningClient {
    pub fn new(runner: Arc<dyn CommandRunner>, vault: impl Into<String>) -> Self {
        Self {
            runner,
            vault: vault.into(),
        }
    }

    /// Request a certificate for `request` and install it at `destination`
    pub fn request_and_install(
        &self,
        request: &SigningRequest,
        destination: Option<&Path>,
    ) -> Result<InstalledCertificate, SigningError> {
        if !request.public_key_path.exists() {
            return Err(SigningError::PreconditionMissing {
                what: Precondition::PublicKey,
                detail: format!("{} does not exist", request.public_key_path.display()),
            });
        }
        let Some(destination) = destination else {
            return Err(SigningError::PreconditionMissing {
                what: Precondition::Destination,
                detail: "no signed certificate path configured".to_string(),
            });
        };
        if request.authority_endpoint.trim().is_empty() {
            return Err(SigningError::PreconditionMissing {
                what: Precondition::Endpoint,
                detail: "no sign path configured".to_string(),
            });
        }

        if std::env::var_os("VAULT_ADDR").is_none() {
            warn!("VAULT_ADDR is not set, the vault CLI will use its default address");
        }

        remove_previous(destination);

        let payload = self.sign(request)?;
        let installed = install(destination, &payload)?;

        info!(
            path = %installed.path.display(),
            endpoint = %request.authority_endpoint,
            principals = %request.principals,
            "Installed signed SSH certificate"
        );
        Ok(installed)
    }

    fn sign(&self, request: &SigningRequest) -> Result<String, SigningError> {
        let args = request.vault_args();
        debug!(
            program = %self.vault,
            args = ?display_args(&args),
            "Requesting SSH certificate signature"
        );

        let output = self
            .runner
            .run(&self.vault, &args)
            .map_err(|e| SigningError::AuthorityUnavailable {
                program: self.vault.clone(),
                detail: e.to_string(),
            })?;

        if !output.success() {
            warn!(
                endpoint = %request.authority_endpoint,
                code = ?output.code,
                stderr = %output.stderr.trim(),
                "Signing request rejected"
            );
            return Err(SigningError::AuthorityRejected {
                endpoint: request.authority_endpoint.clone(),
                code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        let payload = output.stdout.trim();
        if payload.is_empty() {
            return Err(SigningError::EmptyResult {
                endpoint: request.authority_endpoint.clone(),
            });
        }

        trace!(bytes = payload.len(), "Received signed certificate");
        Ok(payload.to_string())
    }
}

impl std::fmt::Debug for SigningClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningClient")
            .field("vault", &self.vault)
            .finish_non_exhaustive()
    }
}

fn remove_previous(destination: &Path) {
    match fs::remove_file(destination) {
        Ok(()) => debug!(path = %destination.display(), "Removed previous certificate"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            path = %destination.display(),
            error = %e,
            "Failed to remove previous certificate, it will be replaced"
        ),
    }
}

/// Atomically write `payload` to `destination`.
///
/// A missing parent directory is created with owner-only permissions; the
/// certificate itself is world-readable.
pub fn install(destination: &Path, payload: &str) -> Result<InstalledCertificate, SigningError> {
    let failed = |detail: String| SigningError::InstallFailed {
        path: destination.to_path_buf(),
        detail,
    };

    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    ensure_private_dir(parent).map_err(|e| failed(format!("creating {}: {e}", parent.display())))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| failed(e.to_string()))?;
    tmp.write_all(payload.as_bytes())
        .and_then(|()| tmp.write_all(b"\n"))
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| failed(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(CERT_MODE))
            .map_err(|e| failed(e.to_string()))?;
    }

    tmp.persist(destination).map_err(|e| failed(e.error.to_string()))?;

    Ok(InstalledCertificate {
        path: destination.to_path_buf(),
        bytes: payload.len() + 1,
    })
}

fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE))?;
    }

    debug!(path = %dir.display(), "Created certificate directory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn request(dir: &TempDir, principals: &str) -> SigningRequest {
        let public_key_path = dir.path().join("id_ed25519.pub");
        fs::write(&public_key_path, "ssh-ed25519 AAAA test").unwrap();
        SigningRequest {
            authority_endpoint: "ssh-engine/sign/ops".to_string(),
            public_key_path,
            principals: Principals::parse(principals),
        }
    }

    fn client<F>(f: F) -> SigningClient
    where
        F: Fn(&str, &[OsString]) -> io::Result<CommandOutput> + Send + Sync + 'static,
    {
        SigningClient::new(Arc::new(f), "vault")
    }

    #[test]
    fn test_vault_args() {
        let req = SigningRequest {
            authority_endpoint: "ssh-engine/sign/ops".to_string(),
            public_key_path: PathBuf::from("/home/ops/.ssh/id_ed25519.pub"),
            principals: Principals::parse("deploy,admin"),
        };
        insta::assert_snapshot!(
            display_args(&req.vault_args()).join(" "),
            @"write -field=signed_key ssh-engine/sign/ops public_key=@/home/ops/.ssh/id_ed25519.pub valid_principals=deploy,admin"
        );
    }

    #[test]
    fn test_vault_args_without_principals() {
        let req = SigningRequest {
            authority_endpoint: "ssh/sign/x".to_string(),
            public_key_path: PathBuf::from("k.pub"),
            principals: Principals::default(),
        };
        let args = display_args(&req.vault_args());
        assert_eq!(args.len(), 4);
        assert!(!args.iter().any(|a| a.starts_with("valid_principals")));
    }

    #[test]
    fn test_request_and_install() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, "deploy");
        let dest = dir.path().join("certs").join("id_ed25519-cert.pub");
        let calls = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&calls);
        let client = client(move |program: &str, args: &[OsString]| {
            seen.lock().push((program.to_string(), display_args(args)));
            Ok(CommandOutput::ok("ssh-ed25519-cert-v01@openssh.com AAAACERT\n\n"))
        });

        let installed = client.request_and_install(&req, Some(&dest)).unwrap();
        assert_eq!(installed.path, dest);
        assert_eq!(
            fs::read_to_string(&dest).unwrap(),
            "ssh-ed25519-cert-v01@openssh.com AAAACERT\n"
        );

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "vault");
        assert!(calls[0].1.contains(&"valid_principals=deploy".to_string()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, CERT_MODE);
            let dir_mode = fs::metadata(dest.parent().unwrap()).unwrap().permissions().mode() & 0o777;
            assert_eq!(dir_mode, DIR_MODE);
        }
    }

    #[test]
    fn test_missing_public_key_makes_no_call() {
        let dir = TempDir::new().unwrap();
        let req = SigningRequest {
            authority_endpoint: "ssh/sign/ops".to_string(),
            public_key_path: dir.path().join("absent.pub"),
            principals: Principals::default(),
        };
        let client = client(|_: &str, _: &[OsString]| -> io::Result<CommandOutput> {
            panic!("authority must not be called")
        });
        let err = client
            .request_and_install(&req, Some(&dir.path().join("cert.pub")))
            .unwrap_err();
        assert!(matches!(
            err,
            SigningError::PreconditionMissing {
                what: Precondition::PublicKey,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_destination() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, "deploy");
        let client = client(|_: &str, _: &[OsString]| Ok(CommandOutput::ok("cert")));
        let err = client.request_and_install(&req, None).unwrap_err();
        assert!(matches!(
            err,
            SigningError::PreconditionMissing {
                what: Precondition::Destination,
                ..
            }
        ));
    }

    #[test]
    fn test_rejection_keeps_streams() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, "deploy");
        let client = client(|_: &str, _: &[OsString]| {
            Ok(CommandOutput {
                code: Some(2),
                stdout: "partial".to_string(),
                stderr: "* permission denied".to_string(),
            })
        });
        let err = client
            .request_and_install(&req, Some(&dir.path().join("cert.pub")))
            .unwrap_err();
        match err {
            SigningError::AuthorityRejected {
                code,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(code, Some(2));
                assert_eq!(stdout, "partial");
                assert_eq!(stderr, "* permission denied");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_result() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, "");
        let dest = dir.path().join("cert.pub");
        let client = client(|_: &str, _: &[OsString]| Ok(CommandOutput::ok("  \n")));
        let err = client.request_and_install(&req, Some(&dest)).unwrap_err();
        assert!(matches!(err, SigningError::EmptyResult { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_vault_missing() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir, "deploy");
        let client = client(|_: &str, _: &[OsString]| {
            Err(io::Error::new(io::ErrorKind::NotFound, "No such file or directory"))
        });
        let err = client
            .request_and_install(&req, Some(&dir.path().join("cert.pub")))
            .unwrap_err();
        assert!(matches!(err, SigningError::AuthorityUnavailable { .. }));
    }

    #[test]
    fn test_install_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("cert.pub");
        fs::write(&dest, "old").unwrap();
        install(&dest, "new").unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "new\n");

        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }
}
