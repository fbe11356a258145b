//! Certificate inspection.
//!
//! Reads the expiry of an OpenSSH certificate by parsing the human-readable
//! `ssh-keygen -L -f <cert>` listing. Inspection never fails: anything that
//! prevents an expiry from being read is reported as a status so that the
//! caller can treat it as "needs renewal".

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, trace, warn};
use vaultsign_common::Principals;

use crate::exec::CommandRunner;

const TIMESTAMP: &str = r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:Z|[+-]\d{2}:\d{2})?";

static VALID_TO_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(&format!(r"Valid:\s+.*?to\s+({TIMESTAMP})")).ok());
static NOT_AFTER_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(&format!(r"Not\s+after:\s*({TIMESTAMP})")).ok());

/// Outcome of inspecting a certificate file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum InspectionStatus {
    /// Expiry was read successfully
    Valid,
    /// No file at the configured path
    Absent,
    /// The file disappeared between the existence check and the read
    Vanished,
    /// The metadata tool failed or printed no recognisable expiry
    Unparsable { detail: String },
}

impl InspectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Absent => "absent",
            Self::Vanished => "vanished",
            Self::Unparsable { .. } => "unparsable",
        }
    }
}

/// Observed state of a signed certificate file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateRecord {
    pub file_path: PathBuf,
    /// Principals the certificate is requested for, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principals>,
    /// Signing endpoint that issues this certificate, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority_endpoint: Option<String>,
    #[serde(flatten)]
    pub status: InspectionStatus,
    pub expires_at: Option<DateTime<Utc>>,
    /// Seconds until expiry at inspection time; negative once expired
    pub remaining_ttl_seconds: Option<i64>,
}

impl CertificateRecord {
    fn without_expiry(file_path: &Path, status: InspectionStatus) -> Self {
        Self {
            file_path: file_path.to_path_buf(),
            principal: None,
            authority_endpoint: None,
            status,
            expires_at: None,
            remaining_ttl_seconds: None,
        }
    }

    fn with_expiry(file_path: &Path, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            file_path: file_path.to_path_buf(),
            principal: None,
            authority_endpoint: None,
            status: InspectionStatus::Valid,
            expires_at: Some(expires_at),
            remaining_ttl_seconds: Some((expires_at - now).num_seconds()),
        }
    }

    /// Attach the signing context this certificate belongs to
    pub fn with_authority(mut self, endpoint: impl Into<String>, principals: Principals) -> Self {
        self.authority_endpoint = Some(endpoint.into());
        self.principal = Some(principals);
        self
    }
}

/// Reads certificate expiry through the external metadata tool
#[derive(Clone)]
pub struct CertificateInspector {
    runner: Arc<dyn CommandRunner>,
    keygen: String,
}

impl CertificateInspector {
    pub fn new(runner: Arc<dyn CommandRunner>, keygen: impl Into<String>) -> Self {
        Self {
            runner,
            keygen: keygen.into(),
        }
    }

    /// Inspect the certificate at `path` against the current time
    pub fn inspect(&self, path: &Path) -> CertificateRecord {
        self.inspect_at(path, Utc::now())
    }

    /// Inspect the certificate at `path`, computing remaining TTL from `now`
    pub fn inspect_at(&self, path: &Path, now: DateTime<Utc>) -> CertificateRecord {
        if !path.exists() {
            debug!(path = %path.display(), "SSH certificate not found");
            return CertificateRecord::without_expiry(path, InspectionStatus::Absent);
        }

        let args = [
            OsString::from("-L"),
            OsString::from("-f"),
            path.as_os_str().to_os_string(),
        ];
        let output = match self.runner.run(&self.keygen, &args) {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    program = %self.keygen,
                    error = %e,
                    "Failed to run certificate metadata tool"
                );
                return unparsable(path, format!("failed to run {}: {e}", self.keygen));
            }
        };

        if !output.success() {
            if output.stderr.contains("No such file or directory") {
                debug!(
                    path = %path.display(),
                    "SSH certificate disappeared before it could be read"
                );
                return CertificateRecord::without_expiry(path, InspectionStatus::Vanished);
            }
            warn!(
                path = %path.display(),
                code = ?output.code,
                stderr = %output.stderr.trim(),
                "Failed to read SSH certificate metadata"
            );
            return unparsable(
                path,
                format!("{} exited with {:?}: {}", self.keygen, output.code, output.stderr.trim()),
            );
        }

        if output.stdout.trim().is_empty() {
            warn!(path = %path.display(), "Certificate metadata tool printed nothing");
            return unparsable(path, "empty metadata output".to_string());
        }

        let Some(raw) = find_expiry(&output.stdout) else {
            warn!(
                path = %path.display(),
                "Could not find an expiry timestamp in the certificate metadata"
            );
            return unparsable(path, "no expiry timestamp in metadata".to_string());
        };

        match parse_timestamp(raw) {
            Ok(expires_at) => {
                let record = CertificateRecord::with_expiry(path, expires_at, now);
                trace!(
                    path = %path.display(),
                    expires_at = %expires_at,
                    remaining_secs = ?record.remaining_ttl_seconds,
                    "Read SSH certificate expiry"
                );
                record
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    timestamp = %raw,
                    error = %e,
                    "Failed to parse certificate expiry timestamp"
                );
                unparsable(path, format!("invalid timestamp '{raw}': {e}"))
            }
        }
    }
}

impl std::fmt::Debug for CertificateInspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateInspector")
            .field("keygen", &self.keygen)
            .finish_non_exhaustive()
    }
}

fn unparsable(path: &Path, detail: String) -> CertificateRecord {
    CertificateRecord::without_expiry(path, InspectionStatus::Unparsable { detail })
}

/// Find the raw expiry timestamp in a certificate listing.
///
/// Lines are scanned in order; the first line carrying either a
/// `Valid: ... to <ts>` or `Not after: <ts>` label wins, with the
/// `Valid` form preferred when both appear on one line.
pub fn find_expiry(listing: &str) -> Option<&str> {
    let patterns: Vec<&Regex> = [&*VALID_TO_RE, &*NOT_AFTER_RE]
        .into_iter()
        .filter_map(Option::as_ref)
        .collect();

    listing.lines().map(str::trim).find_map(|line| {
        patterns
            .iter()
            .find_map(|re| re.captures(line))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    })
}

/// Parse an ISO-8601 timestamp; one without an offset is taken as UTC
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").map(|n| n.and_utc()),
    }
}
