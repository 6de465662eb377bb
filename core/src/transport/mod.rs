//! Transport capability traits for pluggable link backends
//!
//! The core never touches sockets. A backend supplies a [`Listener`] for the
//! inbound side, a [`Dialer`] for the outbound side, and [`Connection`]s for
//! established streams. Closing a handle is the only way the core cancels a
//! blocked call, so every `close` must make pending calls on that handle
//! return promptly.

pub mod mock;

use crate::error::TransportError;
use crate::state::{Profile, RemoteIdentity};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// An open bidirectional byte stream to one peer
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Read up to `max_bytes`. An empty result means the peer closed the stream.
    async fn read(&self, max_bytes: usize) -> Result<Bytes, TransportError>;

    /// Write all of `bytes`
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Close the stream, unblocking any pending read or write
    async fn close(&self);

    fn remote_identity(&self) -> RemoteIdentity;
}

/// A listening endpoint opened for one profile
#[async_trait]
pub trait ListenEndpoint: Send + Sync + 'static {
    /// Wait for the next inbound peer
    async fn accept(&self) -> Result<(Arc<dyn Connection>, RemoteIdentity), TransportError>;

    /// Stop listening; a pending `accept` returns an error
    async fn close(&self);
}

/// Factory for listening endpoints
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn open(&self, profile: Profile) -> Result<Arc<dyn ListenEndpoint>, TransportError>;
}

/// Factory for outbound connections
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Hint that any device discovery in progress should stop.
    /// Discovery slows connection setup on most radios.
    async fn cancel_discovery(&self);

    /// Connect to `remote` under `profile`.
    ///
    /// Dropping the returned future abandons the attempt and must release
    /// any half-open handle.
    async fn connect(
        &self,
        remote: &RemoteIdentity,
        profile: Profile,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}
