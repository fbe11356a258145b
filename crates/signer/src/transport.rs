//! Transport composition.
//!
//! [`CertifiedTransport`] wraps any [`Transport`] and runs the certificate
//! lifecycle once per connection attempt before delegating. A lifecycle
//! failure aborts the attempt; the inner transport is never reached.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::error::LifecycleError;
use crate::lifecycle::{ConnectionSession, EnsureOutcome, LifecycleManager};

/// Something that can open a connection
pub trait Transport {
    type Connection;
    type Error: std::error::Error + Send + Sync + 'static;

    fn connect(&mut self) -> Result<Self::Connection, Self::Error>;
}

#[derive(Debug, Error)]
pub enum ConnectError<E: std::error::Error + 'static> {
    #[error("certificate lifecycle failed: {0}")]
    Certificate(#[source] LifecycleError),

    #[error("connection failed: {0}")]
    Transport(#[source] E),
}

/// A transport that holds a fresh certificate before connecting
#[derive(Debug)]
pub struct CertifiedTransport<T> {
    manager: Arc<LifecycleManager>,
    session: ConnectionSession,
    inner: T,
}

impl<T: Transport> CertifiedTransport<T> {
    pub fn new(manager: Arc<LifecycleManager>, inner: T) -> Self {
        Self::with_session(manager, ConnectionSession::new(), inner)
    }

    pub fn with_session(manager: Arc<LifecycleManager>, session: ConnectionSession, inner: T) -> Self {
        Self {
            manager,
            session,
            inner,
        }
    }

    /// Ensure the certificate, then connect.
    ///
    /// Calling this again on the same value reuses the lifecycle outcome of
    /// the first call.
    pub fn connect(&mut self) -> Result<T::Connection, ConnectError<T::Error>> {
        let outcome = self.ensure()?;
        debug!(
            session = %self.session.id().short(),
            renewed = outcome.renewed,
            "Certificate ready, connecting"
        );
        self.inner.connect().map_err(ConnectError::Transport)
    }

    /// Run the lifecycle only
    pub fn ensure(&mut self) -> Result<EnsureOutcome, ConnectError<T::Error>> {
        self.manager
            .ensure_certificate(&mut self.session)
            .map_err(ConnectError::Certificate)
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}
