//! Notifications from the link to the application

use crate::error::TransportError;
use crate::state::{ConnectionState, RemoteIdentity};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Receives link notifications.
///
/// Callbacks run on the coordinator or session task that produced them and
/// must not block. Every method has a no-op default.
pub trait Observer: Send + Sync + 'static {
    fn on_state_changed(&self, _state: ConnectionState) {}

    /// A session was established with this peer
    fn on_device_identified(&self, _identity: &RemoteIdentity) {}

    fn on_frame_received(&self, _frame: Bytes) {}

    fn on_bytes_written(&self, _bytes: Bytes) {}

    /// An outbound dial failed; listening restarts automatically
    fn on_connection_failed(&self) {}

    /// An established session dropped; listening restarts automatically
    fn on_connection_lost(&self) {}

    /// A session write failed. The session stays up.
    fn on_write_failed(&self, _error: &TransportError) {}

    /// The listening endpoint could not be opened or stopped accepting.
    /// The link falls back to idle.
    fn on_listen_failed(&self, _error: &TransportError) {}
}

/// Owned form of each [`Observer`] callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StateChanged(ConnectionState),
    DeviceIdentified(RemoteIdentity),
    FrameReceived(Bytes),
    BytesWritten(Bytes),
    ConnectionFailed,
    ConnectionLost,
    WriteFailed { reason: String },
    ListenFailed { reason: String },
}

/// Observer that forwards every callback over a channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    event_tx: mpsc::UnboundedSender<LinkEvent>,
}

impl ChannelObserver {
    /// Create the observer and the receiving end of its events
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self { event_tx }, event_rx)
    }

    fn emit(&self, event: LinkEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.event_tx.send(event);
    }
}

impl Observer for ChannelObserver {
    fn on_state_changed(&self, state: ConnectionState) {
        self.emit(LinkEvent::StateChanged(state));
    }

    fn on_device_identified(&self, identity: &RemoteIdentity) {
        self.emit(LinkEvent::DeviceIdentified(identity.clone()));
    }

    fn on_frame_received(&self, frame: Bytes) {
        self.emit(LinkEvent::FrameReceived(frame));
    }

    fn on_bytes_written(&self, bytes: Bytes) {
        self.emit(LinkEvent::BytesWritten(bytes));
    }

    fn on_connection_failed(&self) {
        self.emit(LinkEvent::ConnectionFailed);
    }

    fn on_connection_lost(&self) {
        self.emit(LinkEvent::ConnectionLost);
    }

    fn on_write_failed(&self, error: &TransportError) {
        self.emit(LinkEvent::WriteFailed {
            reason: error.to_string(),
        });
    }

    fn on_listen_failed(&self, error: &TransportError) {
        self.emit(LinkEvent::ListenFailed {
            reason: error.to_string(),
        });
    }
}
