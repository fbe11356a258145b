//! Type-safe identifier newtypes for vaultsign.
//!
//! These types keep the two kinds of identity that flow through the
//! certificate lifecycle apart: the per-attempt session and the
//! certificate identity shared by every process that targets the same
//! signed key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Unique identifier for one connection attempt.
///
/// Session IDs are attached to every lifecycle log line so that the
/// output of many concurrent worker processes can be told apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used in log fields
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a signed certificate.
///
/// Keyed by the signed-certificate path: every process that writes the
/// same file shares one identity, and therefore one lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertificateIdentity(PathBuf);

impl CertificateIdentity {
    pub fn new(signed_key_path: impl Into<PathBuf>) -> Self {
        Self(signed_key_path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Path of the lock marker guarding renewals of this certificate
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.0.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }
}

impl fmt::Display for CertificateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
