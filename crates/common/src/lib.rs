//! Common utilities and types for vaultsign.
//!
//! Shared between the configuration crate and the signer so that both
//! speak the same identifiers and principal representation.

pub mod ids;
pub mod observe;
pub mod types;

pub use ids::{CertificateIdentity, SessionId};
pub use observe::{level_for_verbosity, LogFormat, ObserveError};
pub use types::Principals;

#[cfg(feature = "runtime")]
pub use observe::init_tracing;
