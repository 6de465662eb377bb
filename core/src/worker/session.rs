//! Established session: read loop and writes

use super::{EventSender, WorkerEvent, WorkerId};
use crate::error::TransportError;
use crate::framing::Framing;
use crate::observer::Observer;
use crate::transport::Connection;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Owns one connection: reads, decodes and delivers frames
pub(crate) struct SessionWorker {
    id: WorkerId,
    connection: Arc<dyn Connection>,
    observer: Arc<dyn Observer>,
}

impl SessionWorker {
    pub(crate) fn spawn(
        id: WorkerId,
        connection: Arc<dyn Connection>,
        framing: &Framing,
        read_buffer_size: usize,
        observer: Arc<dyn Observer>,
        events: EventSender,
    ) -> Self {
        let mut decoder = framing.decoder();
        let reader = connection.clone();
        let frames = observer.clone();

        tokio::spawn(async move {
            loop {
                let error = match reader.read(read_buffer_size).await {
                    Ok(chunk) if chunk.is_empty() => TransportError::Closed,
                    Ok(chunk) => {
                        trace!("session {} read {} bytes", id, chunk.len());
                        decoder.extend(&chunk);
                        while let Some(frame) = decoder.decode_next() {
                            frames.on_frame_received(frame);
                        }
                        continue;
                    }
                    Err(error) => error,
                };

                debug!("session {} read ended: {}", id, error);
                let _ = events.send(WorkerEvent::ReadFailed { worker: id, error });
                break;
            }
        });

        Self {
            id,
            connection,
            observer,
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    /// Handle for writing outside the manager
    pub(crate) fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            connection: self.connection.clone(),
            observer: self.observer.clone(),
        }
    }

    /// Close the connection, unblocking the read loop and pending writes
    pub(crate) async fn cancel(&self) {
        self.connection.close().await;
    }
}

/// Write access to a session, usable without holding the manager
#[derive(Clone)]
pub(crate) struct SessionHandle {
    id: WorkerId,
    connection: Arc<dyn Connection>,
    observer: Arc<dyn Observer>,
}

impl SessionHandle {
    /// Write `bytes` to the peer. Failures are reported to the observer and
    /// returned; they never tear the session down.
    ///
    /// A write that lands after the session was closed locally (a racing
    /// `stop` or replacement) returns [`TransportError::Closed`] without
    /// notifying the observer.
    pub(crate) async fn write(&self, bytes: Bytes) -> Result<(), TransportError> {
        match self.connection.write(&bytes).await {
            Ok(()) => {
                self.observer.on_bytes_written(bytes);
                Ok(())
            }
            Err(TransportError::Closed) => {
                debug!("session {} write after close", self.id);
                Err(TransportError::Closed)
            }
            Err(error) => {
                warn!("session {} write failed: {}", self.id, error);
                self.observer.on_write_failed(&error);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{ChannelObserver, LinkEvent};
    use crate::state::RemoteIdentity;
    use crate::transport::mock::MockConnection;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_frames_delivered_in_order() {
        let (connection, peer) = MockConnection::pair(RemoteIdentity::new("peer"));
        let (observer, mut link_events) = ChannelObserver::new();
        let (events, _rx) = mpsc::unbounded_channel();
        let _session = SessionWorker::spawn(
            WorkerId(1),
            connection,
            &Framing::DelimitedLine,
            2048,
            Arc::new(observer),
            events,
        );

        peer.send(Bytes::from_static(b"one\r\ntw"));
        peer.send(Bytes::from_static(b"o\r"));

        assert_eq!(
            link_events.recv().await,
            Some(LinkEvent::FrameReceived(Bytes::from_static(b"one")))
        );
        assert_eq!(
            link_events.recv().await,
            Some(LinkEvent::FrameReceived(Bytes::from_static(b"two")))
        );
    }

    #[tokio::test]
    async fn test_hang_up_reports_read_failure() {
        let (connection, peer) = MockConnection::pair(RemoteIdentity::new("peer"));
        let (observer, _link_events) = ChannelObserver::new();
        let (events, mut rx) = mpsc::unbounded_channel();
        let _session = SessionWorker::spawn(
            WorkerId(9),
            connection,
            &Framing::RawChunk,
            2048,
            Arc::new(observer),
            events,
        );

        peer.hang_up();

        assert!(matches!(
            rx.recv().await,
            Some(WorkerEvent::ReadFailed {
                worker: WorkerId(9),
                error: TransportError::Closed
            })
        ));
        // The worker stops after reporting
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_write_failure_notifies_observer() {
        let (connection, _peer) = MockConnection::pair(RemoteIdentity::new("peer"));
        let (observer, mut link_events) = ChannelObserver::new();
        let (events, _rx) = mpsc::unbounded_channel();
        let session = SessionWorker::spawn(
            WorkerId(2),
            connection.clone(),
            &Framing::RawChunk,
            2048,
            Arc::new(observer),
            events,
        );
        let handle = session.handle();

        handle.write(Bytes::from_static(b"ok")).await.unwrap();
        connection.fail_writes(true);
        assert!(handle.write(Bytes::from_static(b"no")).await.is_err());

        assert_eq!(
            link_events.recv().await,
            Some(LinkEvent::BytesWritten(Bytes::from_static(b"ok")))
        );
        assert!(matches!(
            link_events.recv().await,
            Some(LinkEvent::WriteFailed { .. })
        ));
        assert_eq!(connection.written(), vec![Bytes::from_static(b"ok")]);
    }

    #[tokio::test]
    async fn test_write_after_close_is_quiet() {
        let (connection, _peer) = MockConnection::pair(RemoteIdentity::new("peer"));
        let (observer, mut link_events) = ChannelObserver::new();
        let (events, _rx) = mpsc::unbounded_channel();
        let session = SessionWorker::spawn(
            WorkerId(4),
            connection,
            &Framing::RawChunk,
            2048,
            Arc::new(observer),
            events,
        );
        let handle = session.handle();

        session.cancel().await;

        assert!(matches!(
            handle.write(Bytes::from_static(b"late")).await,
            Err(TransportError::Closed)
        ));
        assert!(link_events.try_recv().is_err());
    }
}
