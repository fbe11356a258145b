//! Error types for certificate signing and the connection lifecycle.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::policy::Reason;

/// A precondition the signing client checks before calling the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    PublicKey,
    Destination,
    Endpoint,
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicKey => write!(f, "public key"),
            Self::Destination => write!(f, "signed certificate path"),
            Self::Endpoint => write!(f, "signing endpoint"),
        }
    }
}

/// Errors from requesting and installing a signed certificate
#[derive(Debug, Clone, Error)]
pub enum SigningError {
    #[error("{what} unavailable: {detail}")]
    PreconditionMissing { what: Precondition, detail: String },

    #[error(
        "signing request to '{endpoint}' failed (exit code {}): {}{}",
        fmt_code(.code),
        .stderr.trim(),
        fmt_stdout(.stdout)
    )]
    AuthorityRejected {
        endpoint: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("could not run '{program}': {detail}")]
    AuthorityUnavailable { program: String, detail: String },

    #[error("signing endpoint '{endpoint}' returned an empty certificate")]
    EmptyResult { endpoint: String },

    #[error("failed to install certificate at {}: {detail}", .path.display())]
    InstallFailed { path: PathBuf, detail: String },
}

fn fmt_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn fmt_stdout(stdout: &str) -> String {
    match stdout.trim() {
        "" => String::new(),
        out => format!(" (stdout: {out})"),
    }
}

/// Category of a lifecycle failure, as reported to the outer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Configuration,
    Authority,
    Install,
    RenewalIneffective,
    LockContended,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Authority => "authority",
            Self::Install => "install",
            Self::RenewalIneffective => "renewal-ineffective",
            Self::LockContended => "lock-contended",
        }
    }
}

/// Failure of the certificate lifecycle; aborts the connection attempt.
///
/// `Clone` so that a session can replay its stored outcome.
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Authority(SigningError),

    #[error(transparent)]
    Install(SigningError),

    #[error(
        "certificate at {} is still not fresh after renewal ({reason})",
        .path.display()
    )]
    RenewalIneffective { path: PathBuf, reason: Reason },

    #[error(
        "renewal lock {} still held after {attempts} attempts",
        .path.display()
    )]
    LockContended { path: PathBuf, attempts: u32 },
}

impl LifecycleError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Authority(_) => FailureKind::Authority,
            Self::Install(_) => FailureKind::Install,
            Self::RenewalIneffective { .. } => FailureKind::RenewalIneffective,
            Self::LockContended { .. } => FailureKind::LockContended,
        }
    }
}

impl From<SigningError> for LifecycleError {
    fn from(err: SigningError) -> Self {
        match err {
            SigningError::PreconditionMissing { .. } => Self::Configuration(err.to_string()),
            SigningError::InstallFailed { .. } => Self::Install(err),
            SigningError::AuthorityRejected { .. }
            | SigningError::AuthorityUnavailable { .. }
            | SigningError::EmptyResult { .. } => Self::Authority(err),
        }
    }
}
