//! Renewal policy.
//!
//! A pure function of the inspection result, the configured minimum TTL
//! and the force flag.

use std::fmt;

use serde::Serialize;

use crate::inspect::{CertificateRecord, InspectionStatus};

/// Whether a certificate must be renewed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Skip,
    Renew,
}

/// Why the decision was made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    Forced,
    Absent,
    Vanished,
    Unparsable,
    ExpiringSoon,
    Fresh,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forced => "forced",
            Self::Absent => "absent",
            Self::Vanished => "vanished",
            Self::Unparsable => "unparsable",
            Self::ExpiringSoon => "expiring-soon",
            Self::Fresh => "fresh",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub action: Action,
    pub reason: Reason,
}

impl Decision {
    pub fn skip(reason: Reason) -> Self {
        Self {
            action: Action::Skip,
            reason,
        }
    }

    pub fn renew(reason: Reason) -> Self {
        Self {
            action: Action::Renew,
            reason,
        }
    }

    pub fn needs_renewal(&self) -> bool {
        self.action == Action::Renew
    }
}

/// Decide whether the certificate described by `record` must be renewed.
///
/// A certificate with exactly `min_ttl_seconds` left is fresh; renewal only
/// happens once strictly less remains.
pub fn decide(record: &CertificateRecord, min_ttl_seconds: i64, force_refresh: bool) -> Decision {
    if force_refresh {
        return Decision::renew(Reason::Forced);
    }

    let Some(remaining) = record.remaining_ttl_seconds else {
        return Decision::renew(missing_expiry_reason(&record.status));
    };

    if remaining < min_ttl_seconds {
        Decision::renew(Reason::ExpiringSoon)
    } else {
        Decision::skip(Reason::Fresh)
    }
}

/// Decision for a certificate whose path is not configured at all
pub fn decide_unconfigured(force_refresh: bool) -> Decision {
    if force_refresh {
        Decision::renew(Reason::Forced)
    } else {
        Decision::renew(Reason::Absent)
    }
}

fn missing_expiry_reason(status: &InspectionStatus) -> Reason {
    match status {
        InspectionStatus::Absent => Reason::Absent,
        InspectionStatus::Vanished => Reason::Vanished,
        InspectionStatus::Valid | InspectionStatus::Unparsable { .. } => Reason::Unparsable,
    }
}
