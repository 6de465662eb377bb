//! Inbound accept loop

use super::{EventSender, WorkerEvent, WorkerId};
use crate::state::Profile;
use crate::transport::{ListenEndpoint, Listener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

enum EndpointSlot {
    /// `open` has not returned yet
    Opening,
    Open(Arc<dyn ListenEndpoint>),
    /// Cancelled; whatever gets opened later is closed immediately
    Closed,
}

struct ListenControl {
    endpoint: Mutex<EndpointSlot>,
    killed: AtomicBool,
}

impl ListenControl {
    async fn is_cancelled(&self) -> bool {
        matches!(*self.endpoint.lock().await, EndpointSlot::Closed)
    }
}

/// Accepts inbound peers on one profile until cancelled
pub(crate) struct ListenWorker {
    id: WorkerId,
    profile: Profile,
    control: Arc<ListenControl>,
}

impl ListenWorker {
    pub(crate) fn spawn(
        id: WorkerId,
        profile: Profile,
        listener: Arc<dyn Listener>,
        events: EventSender,
    ) -> Self {
        let control = Arc::new(ListenControl {
            endpoint: Mutex::new(EndpointSlot::Opening),
            killed: AtomicBool::new(false),
        });
        tokio::spawn(accept_loop(id, profile, listener, control.clone(), events));
        Self {
            id,
            profile,
            control,
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn profile(&self) -> Profile {
        self.profile
    }

    /// Close the listening endpoint, unblocking a pending accept
    pub(crate) async fn cancel(&self) {
        let endpoint = {
            let mut slot = self.control.endpoint.lock().await;
            match std::mem::replace(&mut *slot, EndpointSlot::Closed) {
                EndpointSlot::Open(endpoint) => Some(endpoint),
                EndpointSlot::Opening | EndpointSlot::Closed => None,
            }
        };
        if let Some(endpoint) = endpoint {
            endpoint.close().await;
        }
    }

    /// Never run another accept cycle, even if one is already returning
    pub(crate) fn kill(&self) {
        self.control.killed.store(true, Ordering::SeqCst);
    }
}

async fn accept_loop(
    id: WorkerId,
    profile: Profile,
    listener: Arc<dyn Listener>,
    control: Arc<ListenControl>,
    events: EventSender,
) {
    let endpoint = match listener.open(profile).await {
        Ok(endpoint) => endpoint,
        Err(error) => {
            warn!("listener {} could not open {} endpoint: {}", id, profile, error);
            let _ = events.send(WorkerEvent::ListenFailed { worker: id, error });
            return;
        }
    };

    {
        let mut slot = control.endpoint.lock().await;
        if matches!(*slot, EndpointSlot::Closed) {
            drop(slot);
            endpoint.close().await;
            return;
        }
        *slot = EndpointSlot::Open(endpoint.clone());
    }
    debug!("listener {} waiting for {} peers", id, profile);

    while !control.killed.load(Ordering::SeqCst) {
        match endpoint.accept().await {
            Ok((connection, remote)) => {
                debug!("listener {} accepted {}", id, remote);
                let accepted = WorkerEvent::Accepted {
                    worker: id,
                    connection: connection.clone(),
                    remote,
                };
                if events.send(accepted).is_err() {
                    connection.close().await;
                    break;
                }
            }
            Err(error) => {
                if control.is_cancelled().await {
                    debug!("listener {} closed", id);
                } else {
                    warn!("listener {} stopped accepting: {}", id, error);
                    let _ = events.send(WorkerEvent::ListenFailed { worker: id, error });
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::state::RemoteIdentity;
    use crate::transport::mock::{MockConnection, MockListener};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_reports_accepted_peer() {
        let listener = Arc::new(MockListener::new());
        let (events, mut rx) = mpsc::unbounded_channel();
        let worker = ListenWorker::spawn(WorkerId(7), Profile::SerialPort, listener.clone(), events);

        let (connection, _peer) = MockConnection::pair(RemoteIdentity::new("aa"));
        listener.offer(connection);

        match rx.recv().await {
            Some(WorkerEvent::Accepted { worker, remote, .. }) => {
                assert_eq!(worker, WorkerId(7));
                assert_eq!(remote.address, "aa");
            }
            _ => panic!("expected an accepted peer"),
        }
        assert_eq!(listener.opened_profiles(), vec![Profile::SerialPort]);
        worker.cancel().await;
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let listener = Arc::new(MockListener::new());
        listener.fail_open(true);
        let (events, mut rx) = mpsc::unbounded_channel();
        let _worker = ListenWorker::spawn(WorkerId(1), Profile::Peer, listener, events);

        assert!(matches!(
            rx.recv().await,
            Some(WorkerEvent::ListenFailed {
                error: TransportError::Open(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_accept_failure_is_reported() {
        let listener = Arc::new(MockListener::new());
        let (events, mut rx) = mpsc::unbounded_channel();
        let _worker = ListenWorker::spawn(WorkerId(3), Profile::Peer, listener.clone(), events);

        listener.fail_next_accept();

        assert!(matches!(
            rx.recv().await,
            Some(WorkerEvent::ListenFailed {
                worker: WorkerId(3),
                error: TransportError::Accept(_),
            })
        ));
        // The loop ends after the failure
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_quietly() {
        let listener = Arc::new(MockListener::new());
        let (events, mut rx) = mpsc::unbounded_channel();
        let worker = ListenWorker::spawn(WorkerId(2), Profile::Peer, listener.clone(), events);

        while listener.active_accepts() == 0 {
            tokio::task::yield_now().await;
        }
        worker.cancel().await;

        while listener.active_accepts() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(listener.open_endpoints(), 0);
        drop(worker);
        // The task exits without reporting a failure
        assert!(rx.recv().await.is_none());
    }
}
