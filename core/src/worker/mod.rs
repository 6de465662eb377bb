//! Worker roles driven by the connection manager
//!
//! Each worker runs on its own task and performs exactly one kind of blocking
//! transport call:
//! - [`ListenWorker`]: accept loop on a listening endpoint
//! - [`DialWorker`]: one outbound connect
//! - [`SessionWorker`]: read loop on an established connection
//!
//! Workers report back through [`WorkerEvent`]s tagged with their
//! [`WorkerId`]. The manager ignores events from workers it has already
//! replaced.

mod dial;
mod listen;
mod session;

pub(crate) use dial::DialWorker;
pub(crate) use listen::ListenWorker;
pub(crate) use session::{SessionHandle, SessionWorker};

use crate::error::TransportError;
use crate::state::RemoteIdentity;
use crate::transport::Connection;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identity of one spawned worker, unique for the manager's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct WorkerId(pub(crate) u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Completion events posted by workers to the manager
pub(crate) enum WorkerEvent {
    /// A listener accepted an inbound peer
    Accepted {
        worker: WorkerId,
        connection: Arc<dyn Connection>,
        remote: RemoteIdentity,
    },
    /// A listener could not open its endpoint, or its accept failed
    ListenFailed {
        worker: WorkerId,
        error: TransportError,
    },
    Dialed {
        worker: WorkerId,
        connection: Arc<dyn Connection>,
    },
    DialFailed {
        worker: WorkerId,
        error: TransportError,
    },
    /// A session read failed or the peer closed the stream
    ReadFailed {
        worker: WorkerId,
        error: TransportError,
    },
}

pub(crate) type EventSender = mpsc::UnboundedSender<WorkerEvent>;
