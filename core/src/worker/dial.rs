//! Outbound connect attempt

use super::{EventSender, WorkerEvent, WorkerId};
use crate::state::{Profile, RemoteIdentity};
use crate::transport::Dialer;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Runs one connect call against a remote peer
pub(crate) struct DialWorker {
    id: WorkerId,
    remote: RemoteIdentity,
    task: JoinHandle<()>,
}

impl DialWorker {
    pub(crate) fn spawn(
        id: WorkerId,
        remote: RemoteIdentity,
        profile: Profile,
        dialer: Arc<dyn Dialer>,
        events: EventSender,
    ) -> Self {
        let target = remote.clone();
        let task = tokio::spawn(async move {
            dialer.cancel_discovery().await;

            match dialer.connect(&target, profile).await {
                Ok(connection) => {
                    debug!("dial {} reached {}", id, target);
                    let dialed = WorkerEvent::Dialed {
                        worker: id,
                        connection: connection.clone(),
                    };
                    if events.send(dialed).is_err() {
                        connection.close().await;
                    }
                }
                Err(error) => {
                    warn!("dial {} to {} failed: {}", id, target, error);
                    let _ = events.send(WorkerEvent::DialFailed { worker: id, error });
                }
            }
        });

        Self { id, remote, task }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn remote(&self) -> &RemoteIdentity {
        &self.remote
    }

    /// Abandon the attempt. Dropping the in-flight connect releases its
    /// half-open handle; a result already posted is discarded by the manager.
    pub(crate) fn cancel(&self) {
        self.task.abort();
    }
}
