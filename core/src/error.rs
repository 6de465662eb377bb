//! Error types for transports and the public link API

use std::io;
use thiserror::Error;

/// Errors reported by transport capabilities.
///
/// Workers convert these into coordinator events; they never cross the
/// worker/coordinator boundary as panics or propagated errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to open listening endpoint: {0}")]
    Open(#[source] io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("connect to {address} failed: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("transport handle closed")]
    Closed,
}

/// Errors returned by [`ConnectionManager`](crate::ConnectionManager) calls
#[derive(Error, Debug)]
pub enum LinkError {
    /// A write was requested while no session is connected; nothing was sent
    #[error("not connected")]
    NotConnected,

    /// The session's transport rejected the write
    #[error(transparent)]
    Write(TransportError),

    #[error("connection manager has shut down")]
    ManagerClosed,
}
