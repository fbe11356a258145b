//! Short-lived SSH certificates from a Vault SSH signing endpoint.
//!
//! Before a connection is opened, the lifecycle makes sure a signed
//! certificate with enough remaining validity is on disk:
//!
//! - [`inspect`] reads the current certificate's expiry via `ssh-keygen -L`
//! - [`policy`] decides whether it must be renewed
//! - [`coordinator`] serializes renewal across processes with a lock file
//! - [`signing`] requests a new certificate via `vault write` and installs it
//! - [`lifecycle`] drives one connection attempt through those steps
//! - [`transport`] composes the lifecycle in front of a real connection
//!
//! All external programs run through [`exec::CommandRunner`].

pub mod coordinator;
pub mod error;
pub mod exec;
pub mod inspect;
pub mod lifecycle;
pub mod policy;
pub mod signing;
pub mod ssh;
pub mod transport;

pub use coordinator::{Coordinated, LockAcquisition, LockGuard, RenewalCoordinator};
pub use error::{FailureKind, LifecycleError, Precondition, SigningError};
pub use exec::{CommandOutput, CommandRunner, SystemRunner};
pub use inspect::{CertificateInspector, CertificateRecord, InspectionStatus};
pub use lifecycle::{
    ConnectionSession, EnsureOutcome, LifecycleManager, LifecycleState, StatusLog,
};
pub use policy::{decide, Action, Decision, Reason};
pub use signing::{InstalledCertificate, SigningClient, SigningRequest};
pub use ssh::{SshTarget, SshTransport};
pub use transport::{CertifiedTransport, ConnectError, Transport};
