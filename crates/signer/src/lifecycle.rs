//! Per-connection certificate lifecycle.
//!
//! ```text
//! Unchecked -> Evaluating -> Fresh -----------------------> Done
//!                        \-> Renewing -> Verified --------> Done
//!                                   \------------\-------> Failed
//! ```
//!
//! A [`ConnectionSession`] runs the lifecycle at most once; later calls
//! replay the stored outcome without touching the filesystem or the
//! authority.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};
use vaultsign_common::{CertificateIdentity, SessionId};
use vaultsign_config::ResolvedSettings;

use crate::coordinator::{Coordinated, RenewalCoordinator};
use crate::error::LifecycleError;
use crate::exec::CommandRunner;
use crate::inspect::{CertificateInspector, CertificateRecord};
use crate::policy::{self, Decision};
use crate::signing::{SigningClient, SigningRequest};

/// Where a session is in the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Unchecked,
    Evaluating,
    Fresh,
    Renewing,
    Verified,
    Done,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unchecked => "unchecked",
            Self::Evaluating => "evaluating",
            Self::Fresh => "fresh",
            Self::Renewing => "renewing",
            Self::Verified => "verified",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Successful end of a lifecycle run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnsureOutcome {
    /// Decision made on first evaluation
    pub decision: Decision,
    /// Whether a new certificate was installed by this session
    pub renewed: bool,
    /// Whether the renewal ran under the lock; `None` when no lock was needed
    pub exclusive: Option<bool>,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining_ttl_seconds: Option<i64>,
}

/// State of one connection attempt
#[derive(Debug)]
pub struct ConnectionSession {
    id: SessionId,
    state: LifecycleState,
    history: Vec<LifecycleState>,
    outcome: Option<Result<EnsureOutcome, LifecycleError>>,
}

impl ConnectionSession {
    pub fn new() -> Self {
        Self::with_id(SessionId::new())
    }

    pub fn with_id(id: SessionId) -> Self {
        Self {
            id,
            state: LifecycleState::Unchecked,
            history: Vec::new(),
            outcome: None,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// States entered so far, in order
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    pub fn outcome(&self) -> Option<&Result<EnsureOutcome, LifecycleError>> {
        self.outcome.as_ref()
    }

    fn transition(&mut self, next: LifecycleState) {
        trace!(session = %self.id.short(), from = %self.state, to = %next, "Lifecycle transition");
        self.state = next;
        self.history.push(next);
    }
}

impl Default for ConnectionSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks which hosts have already produced a user-visible renewal notice
/// in this process, so that repeated connections log it only once.
#[derive(Debug, Default)]
pub struct StatusLog {
    seen: Mutex<HashSet<String>>,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `key` is seen
    pub fn first_sighting(&self, key: &str) -> bool {
        self.seen.lock().insert(key.to_string())
    }
}

/// Ensures a fresh certificate exists before a connection proceeds
pub struct LifecycleManager {
    settings: ResolvedSettings,
    inspector: CertificateInspector,
    signer: SigningClient,
    coordinator: RenewalCoordinator,
    status_log: Arc<StatusLog>,
}

impl LifecycleManager {
    pub fn new(settings: ResolvedSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            inspector: CertificateInspector::new(Arc::clone(&runner), settings.keygen.clone()),
            signer: SigningClient::new(runner, settings.vault.clone()),
            coordinator: RenewalCoordinator::new(settings.lock.clone()),
            status_log: Arc::new(StatusLog::new()),
            settings,
        }
    }

    /// Share a status log with other managers in this process
    pub fn with_status_log(mut self, status_log: Arc<StatusLog>) -> Self {
        self.status_log = status_log;
        self
    }

    pub fn settings(&self) -> &ResolvedSettings {
        &self.settings
    }

    /// Inspect the configured certificate without acting on it
    pub fn inspect(&self) -> Option<CertificateRecord> {
        let path = self.settings.signed_key_path.as_deref()?;
        Some(self.inspect_path(path))
    }

    /// Current renewal decision for the configured certificate
    pub fn evaluate(&self) -> (Option<CertificateRecord>, Decision) {
        match self.inspect() {
            Some(record) => {
                let decision = policy::decide(
                    &record,
                    self.settings.min_ttl_seconds,
                    self.settings.force_refresh,
                );
                (Some(record), decision)
            }
            None => (None, policy::decide_unconfigured(self.settings.force_refresh)),
        }
    }

    /// Run the lifecycle for `session`, at most once.
    ///
    /// Returns `Ok` when a fresh certificate is in place and the connection
    /// may proceed.
    pub fn ensure_certificate(
        &self,
        session: &mut ConnectionSession,
    ) -> Result<EnsureOutcome, LifecycleError> {
        if let Some(outcome) = &session.outcome {
            trace!(session = %session.id.short(), "Certificate lifecycle already ran for this session");
            return outcome.clone();
        }

        session.transition(LifecycleState::Evaluating);
        let result = self.run(session);
        match &result {
            Ok(_) => session.transition(LifecycleState::Done),
            Err(e) => {
                session.transition(LifecycleState::Failed);
                error!(
                    session = %session.id.short(),
                    host = %self.host(),
                    kind = e.kind().as_str(),
                    error = %e,
                    "SSH certificate lifecycle failed"
                );
            }
        }
        session.outcome = Some(result.clone());
        result
    }

    fn run(&self, session: &mut ConnectionSession) -> Result<EnsureOutcome, LifecycleError> {
        let (record, decision) = self.evaluate();
        let first_notice = self.status_log.first_sighting(&self.notice_key());

        if !decision.needs_renewal() {
            session.transition(LifecycleState::Fresh);
            debug!(
                session = %session.id.short(),
                host = %self.host(),
                remaining_secs = ?record.as_ref().and_then(|r| r.remaining_ttl_seconds),
                "SSH certificate is fresh"
            );
            return Ok(EnsureOutcome {
                decision,
                renewed: false,
                exclusive: None,
                expires_at: record.as_ref().and_then(|r| r.expires_at),
                remaining_ttl_seconds: record.as_ref().and_then(|r| r.remaining_ttl_seconds),
            });
        }

        if first_notice {
            info!(
                host = %self.host(),
                reason = %decision.reason,
                "SSH certificate needs renewal"
            );
        } else {
            debug!(
                session = %session.id.short(),
                host = %self.host(),
                reason = %decision.reason,
                "SSH certificate needs renewal"
            );
        }

        session.transition(LifecycleState::Renewing);
        let (public_key, signed_key) = self.required_paths()?;

        let request = SigningRequest {
            authority_endpoint: self.settings.sign_path.clone(),
            public_key_path: public_key.to_path_buf(),
            principals: self.settings.principals.clone(),
        };
        let identity = CertificateIdentity::new(signed_key);

        let coordinated = self.coordinator.run_exclusive(
            &identity.lock_path(),
            || {
                let record = self.inspect_path(signed_key);
                policy::decide(
                    &record,
                    self.settings.min_ttl_seconds,
                    self.settings.force_refresh,
                )
            },
            || {
                self.signer
                    .request_and_install(&request, Some(signed_key))
                    .map_err(LifecycleError::from)
            },
        )?;

        let renewed = matches!(coordinated, Coordinated::Performed { .. });
        let exclusive = coordinated.exclusive();
        session.transition(LifecycleState::Verified);

        // Verification ignores the force flag: only freshness matters now.
        let record = self.inspect_path(signed_key);
        let verification = policy::decide(&record, self.settings.min_ttl_seconds, false);
        if verification.needs_renewal() {
            return Err(LifecycleError::RenewalIneffective {
                path: signed_key.to_path_buf(),
                reason: verification.reason,
            });
        }

        if renewed {
            info!(
                host = %self.host(),
                path = %signed_key.display(),
                expires_at = ?record.expires_at,
                exclusive,
                "Renewed SSH certificate"
            );
        } else {
            debug!(
                session = %session.id.short(),
                host = %self.host(),
                "SSH certificate was renewed concurrently"
            );
        }

        Ok(EnsureOutcome {
            decision,
            renewed,
            exclusive: Some(exclusive),
            expires_at: record.expires_at,
            remaining_ttl_seconds: record.remaining_ttl_seconds,
        })
    }

    fn inspect_path(&self, path: &Path) -> CertificateRecord {
        self.inspector
            .inspect(path)
            .with_authority(self.settings.sign_path.clone(), self.settings.principals.clone())
    }

    fn required_paths(&self) -> Result<(&Path, &Path), LifecycleError> {
        let public_key = self.settings.public_key_path.as_deref();
        let signed_key = self.settings.signed_key_path.as_deref();
        match (public_key, signed_key) {
            (Some(public_key), Some(signed_key)) => Ok((public_key, signed_key)),
            _ => {
                let missing: Vec<&str> = [
                    public_key.is_none().then_some("public key path"),
                    signed_key.is_none().then_some("signed key path"),
                ]
                .into_iter()
                .flatten()
                .collect();
                warn!(host = %self.host(), missing = ?missing, "Required certificate paths not configured");
                Err(LifecycleError::Configuration(format!(
                    "{} not configured",
                    missing.join(" and ")
                )))
            }
        }
    }

    fn host(&self) -> &str {
        self.settings.host.as_deref().unwrap_or("-")
    }

    fn notice_key(&self) -> String {
        match (&self.settings.host, &self.settings.signed_key_path) {
            (Some(host), _) => host.clone(),
            (None, Some(path)) => path.display().to_string(),
            (None, None) => "-".to_string(),
        }
    }
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("host", &self.settings.host)
            .field("signed_key_path", &self.settings.signed_key_path)
            .field("sign_path", &self.settings.sign_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_log_first_sighting() {
        let log = StatusLog::new();
        assert!(log.first_sighting("db1"));
        assert!(!log.first_sighting("db1"));
        assert!(log.first_sighting("db2"));
    }

    #[test]
    fn test_new_session_is_unchecked() {
        let session = ConnectionSession::with_id(SessionId::from_string("s-1"));
        assert_eq!(session.state(), LifecycleState::Unchecked);
        assert!(session.history().is_empty());
        assert!(session.outcome().is_none());
        assert_eq!(session.id().as_str(), "s-1");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::Verified.to_string(), "verified");
        assert_eq!(
            serde_json::to_string(&LifecycleState::Failed).unwrap(),
            "\"failed\""
        );
    }
}
