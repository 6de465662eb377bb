//! Connection manager: the single owner of link state
//!
//! The manager runs as one task that receives application commands and
//! worker completion events and applies them one at a time. That task is the
//! only place state and worker handles change, so every transition is a
//! single critical section and a failing worker never re-enters the
//! coordinator from its own task.
//!
//! ```text
//!   start ──────────► LISTENING ◄──── dial failed / session lost
//!   connect ────────► CONNECTING
//!   accepted / dialed ─► CONNECTED (promotion)
//!   stop ───────────► IDLE
//! ```

use crate::error::LinkError;
use crate::framing::Framing;
use crate::observer::Observer;
use crate::state::{ConnectionState, Profile, RemoteIdentity};
use crate::transport::{Connection, Dialer, Listener};
use crate::worker::{
    DialWorker, EventSender, ListenWorker, SessionHandle, SessionWorker, WorkerEvent, WorkerId,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Read size used by sessions unless configured otherwise
pub const DEFAULT_READ_BUFFER_SIZE: usize = 2048;

/// Configuration for a connection manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How session bytes are split into frames
    pub framing: Framing,
    /// Maximum bytes requested per session read; 0 is treated as 1
    pub read_buffer_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            framing: Framing::RawChunk,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

enum Command {
    Start {
        profile: Profile,
        done: oneshot::Sender<()>,
    },
    Connect {
        remote: RemoteIdentity,
        profile: Profile,
        done: oneshot::Sender<()>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
    /// Sample the current session for a write
    Session {
        reply: oneshot::Sender<Option<SessionHandle>>,
    },
}

/// Handle to a running link coordinator.
///
/// Cloning is cheap; all clones drive the same link. When the last clone is
/// dropped the coordinator stops every worker and exits.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Create a manager in the idle state and spawn its coordinator task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        listener: Arc<dyn Listener>,
        dialer: Arc<dyn Dialer>,
        observer: Arc<dyn Observer>,
        mut config: ManagerConfig,
    ) -> Self {
        if config.read_buffer_size == 0 {
            // A zero-byte read is indistinguishable from the peer hanging up
            warn!("read_buffer_size of 0 raised to 1");
            config.read_buffer_size = 1;
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let coordinator = Coordinator::new(listener, dialer, observer, config, event_tx, state_tx);
        tokio::spawn(coordinator.run(command_rx, event_rx));

        Self {
            commands: command_tx,
            state: state_rx,
        }
    }

    /// Listen for an inbound peer under `profile`.
    /// Any dial or session in progress is dropped.
    pub async fn start(&self, profile: Profile) -> Result<(), LinkError> {
        self.request(|done| Command::Start { profile, done }).await
    }

    /// Dial `remote` under `profile`, replacing any dial, session or
    /// listener in progress.
    pub async fn connect(&self, remote: RemoteIdentity, profile: Profile) -> Result<(), LinkError> {
        self.request(|done| Command::Connect {
            remote,
            profile,
            done,
        })
        .await
    }

    /// Stop every worker and go idle. No restart follows.
    pub async fn stop(&self) -> Result<(), LinkError> {
        self.request(|done| Command::Stop { done }).await
    }

    /// Send bytes to the connected peer.
    ///
    /// Returns [`LinkError::NotConnected`] without touching the transport
    /// when no session is up. The write itself runs outside the coordinator,
    /// so a slow peer never delays other transitions.
    pub async fn write(&self, bytes: impl Into<Bytes>) -> Result<(), LinkError> {
        let session = self
            .request(|reply| Command::Session { reply })
            .await?
            .ok_or(LinkError::NotConnected)?;
        session.write(bytes.into()).await.map_err(LinkError::Write)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .map_err(|_| LinkError::ManagerClosed)?;
        reply_rx.await.map_err(|_| LinkError::ManagerClosed)
    }
}

/// Owns state and worker handles; runs on the manager task
struct Coordinator {
    listener: Arc<dyn Listener>,
    dialer: Arc<dyn Dialer>,
    observer: Arc<dyn Observer>,
    config: ManagerConfig,
    events: EventSender,
    state: watch::Sender<ConnectionState>,
    /// Profile of the last start/connect, reused by restarts
    profile: Profile,
    next_id: u64,
    listen: Option<ListenWorker>,
    /// Listener retired by `connect`; an accept it already produced may
    /// still be promoted while connecting
    retired_listener: Option<WorkerId>,
    dial: Option<DialWorker>,
    session: Option<SessionWorker>,
}

impl Coordinator {
    fn new(
        listener: Arc<dyn Listener>,
        dialer: Arc<dyn Dialer>,
        observer: Arc<dyn Observer>,
        config: ManagerConfig,
        events: EventSender,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            listener,
            dialer,
            observer,
            config,
            events,
            state,
            profile: Profile::default(),
            next_id: 0,
            listen: None,
            retired_listener: None,
            dial: None,
            session: None,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        self.stop().await;
        debug!("connection manager shut down");
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn next_worker_id(&mut self) -> WorkerId {
        self.next_id += 1;
        WorkerId(self.next_id)
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        debug!("state {} -> {}", previous, next);
        self.observer.on_state_changed(next);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { profile, done } => {
                self.start(profile).await;
                let _ = done.send(());
            }
            Command::Connect {
                remote,
                profile,
                done,
            } => {
                self.connect(remote, profile).await;
                let _ = done.send(());
            }
            Command::Stop { done } => {
                self.stop().await;
                let _ = done.send(());
            }
            Command::Session { reply } => {
                let session = match self.current() {
                    ConnectionState::Connected => self.session.as_ref().map(SessionWorker::handle),
                    _ => None,
                };
                let _ = reply.send(session);
            }
        }
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Accepted {
                worker,
                connection,
                remote,
            } => {
                let from_listener = self.listen.as_ref().map(ListenWorker::id) == Some(worker)
                    || self.retired_listener == Some(worker);
                let state = self.current();
                match state {
                    ConnectionState::Listening | ConnectionState::Connecting if from_listener => {
                        self.promote(connection, remote).await;
                    }
                    _ => {
                        debug!(
                            "dropping peer {} accepted by listener {} while {}",
                            remote, worker, state
                        );
                        connection.close().await;
                    }
                }
            }

            WorkerEvent::ListenFailed { worker, error } => {
                if self.listen.as_ref().map(ListenWorker::id) != Some(worker) {
                    debug!("ignoring failure of replaced listener {}", worker);
                    return;
                }
                if let Some(listen) = self.listen.take() {
                    listen.cancel().await;
                }
                warn!("listening on {} failed: {}", self.profile, error);
                self.observer.on_listen_failed(&error);
                if self.current() == ConnectionState::Listening {
                    self.set_state(ConnectionState::Idle);
                }
            }

            WorkerEvent::Dialed { worker, connection } => {
                let current = self.dial.as_ref().map(DialWorker::id) == Some(worker);
                if current && self.current() == ConnectionState::Connecting {
                    // Retire the dial before promotion so the connection it
                    // produced is never treated as an attempt in flight
                    self.cancel_dial();
                    let remote = connection.remote_identity();
                    self.promote(connection, remote).await;
                } else {
                    debug!("closing connection from superseded dial {}", worker);
                    connection.close().await;
                }
            }

            WorkerEvent::DialFailed { worker, error } => {
                let current = self.dial.as_ref().map(DialWorker::id) == Some(worker);
                if !current || self.current() != ConnectionState::Connecting {
                    debug!("ignoring failure of superseded dial {}", worker);
                    return;
                }
                self.cancel_dial();
                warn!("connection failed: {}", error);
                self.observer.on_connection_failed();
                self.start(self.profile).await;
            }

            WorkerEvent::ReadFailed { worker, error } => {
                let current = self.session.as_ref().map(SessionWorker::id) == Some(worker);
                if !current || self.current() != ConnectionState::Connected {
                    debug!("ignoring end of replaced session {}", worker);
                    return;
                }
                if let Some(session) = self.session.take() {
                    session.cancel().await;
                }
                warn!("connection lost: {}", error);
                self.observer.on_connection_lost();
                self.start(self.profile).await;
            }
        }
    }

    async fn start(&mut self, profile: Profile) {
        self.cancel_dial();
        self.cancel_session().await;
        self.retired_listener = None;
        self.profile = profile;

        self.set_state(ConnectionState::Listening);

        let reusable = matches!(&self.listen, Some(listen) if listen.profile() == profile);
        if !reusable {
            if let Some(listen) = self.listen.take() {
                listen.cancel().await;
            }
            let id = self.next_worker_id();
            debug!("spawning listener {} for {}", id, profile);
            self.listen = Some(ListenWorker::spawn(
                id,
                profile,
                self.listener.clone(),
                self.events.clone(),
            ));
        }
    }

    async fn connect(&mut self, remote: RemoteIdentity, profile: Profile) {
        self.cancel_dial();
        self.cancel_session().await;
        if let Some(listen) = self.listen.take() {
            self.retired_listener = Some(listen.id());
            listen.cancel().await;
        }
        self.profile = profile;

        let id = self.next_worker_id();
        let dial = DialWorker::spawn(
            id,
            remote,
            profile,
            self.dialer.clone(),
            self.events.clone(),
        );
        info!("dialing {} ({}) as {}", dial.remote(), profile, id);
        self.dial = Some(dial);

        self.set_state(ConnectionState::Connecting);
    }

    async fn stop(&mut self) {
        self.cancel_dial();
        self.cancel_session().await;
        if let Some(listen) = self.listen.take() {
            listen.cancel().await;
            listen.kill();
        }
        self.retired_listener = None;

        self.set_state(ConnectionState::Idle);
    }

    /// Install `connection` as the one active session
    async fn promote(&mut self, connection: Arc<dyn Connection>, remote: RemoteIdentity) {
        self.cancel_dial();
        self.cancel_session().await;
        // Only one connection is allowed, so listening ends here
        if let Some(listen) = self.listen.take() {
            listen.cancel().await;
        }
        self.retired_listener = None;

        let id = self.next_worker_id();
        info!("connected to {} as session {}", remote, id);
        self.session = Some(SessionWorker::spawn(
            id,
            connection,
            &self.config.framing,
            self.config.read_buffer_size,
            self.observer.clone(),
            self.events.clone(),
        ));

        self.observer.on_device_identified(&remote);
        self.set_state(ConnectionState::Connected);
    }

    fn cancel_dial(&mut self) {
        if let Some(dial) = self.dial.take() {
            debug!("cancelling dial {}", dial.id());
            dial.cancel();
        }
    }

    async fn cancel_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("closing session {}", session.id());
            session.cancel().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::observer::{ChannelObserver, LinkEvent};
    use crate::transport::mock::{MockConnection, MockDialer, MockListener};

    struct Harness {
        coordinator: Coordinator,
        listener: Arc<MockListener>,
        dialer: Arc<MockDialer>,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        _worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    }

    fn harness() -> Harness {
        let listener = Arc::new(MockListener::new());
        let dialer = Arc::new(MockDialer::new());
        let (observer, link_events) = ChannelObserver::new();
        let (event_tx, worker_events) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let coordinator = Coordinator::new(
            listener.clone(),
            dialer.clone(),
            Arc::new(observer),
            ManagerConfig::default(),
            event_tx,
            state_tx,
        );
        Harness {
            coordinator,
            listener,
            dialer,
            link_events,
            _worker_events: worker_events,
        }
    }

    fn connection(address: &str) -> Arc<MockConnection> {
        MockConnection::pair(RemoteIdentity::new(address)).0
    }

    /// The mutual-exclusion invariant plus its agreement with the state
    fn assert_invariant(c: &Coordinator) {
        assert!(
            !(c.listen.is_some() && c.dial.is_some()),
            "listener and dialer active together"
        );
        match c.current() {
            ConnectionState::Idle => {
                assert!(c.listen.is_none() && c.dial.is_none() && c.session.is_none());
            }
            ConnectionState::Listening => {
                assert!(c.dial.is_none() && c.session.is_none());
            }
            ConnectionState::Connecting => {
                assert!(c.dial.is_some() && c.listen.is_none() && c.session.is_none());
            }
            ConnectionState::Connected => {
                assert!(c.session.is_some() && c.listen.is_none() && c.dial.is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_stale_dial_success_is_closed() {
        let mut h = harness();
        let c = &mut h.coordinator;

        c.connect(RemoteIdentity::new("first"), Profile::Peer).await;
        let first = c.dial.as_ref().unwrap().id();
        c.connect(RemoteIdentity::new("second"), Profile::Peer).await;

        let late = connection("first");
        c.handle_event(WorkerEvent::Dialed {
            worker: first,
            connection: late.clone(),
        })
        .await;

        assert!(late.is_closed());
        assert_eq!(c.current(), ConnectionState::Connecting);
        assert_eq!(c.dial.as_ref().unwrap().remote().address, "second");
        assert_invariant(c);
    }

    #[tokio::test]
    async fn test_current_dial_success_promotes() {
        let mut h = harness();
        let c = &mut h.coordinator;

        c.connect(RemoteIdentity::new("peer"), Profile::SerialPort).await;
        let dial = c.dial.as_ref().unwrap().id();
        let conn = connection("peer");
        c.handle_event(WorkerEvent::Dialed {
            worker: dial,
            connection: conn.clone(),
        })
        .await;

        assert_eq!(c.current(), ConnectionState::Connected);
        assert!(!conn.is_closed());
        assert_invariant(c);
    }

    #[tokio::test]
    async fn test_accept_while_idle_is_closed() {
        let mut h = harness();
        let c = &mut h.coordinator;

        c.start(Profile::Peer).await;
        let listener = c.listen.as_ref().unwrap().id();
        c.stop().await;

        let conn = connection("late");
        c.handle_event(WorkerEvent::Accepted {
            worker: listener,
            connection: conn.clone(),
            remote: RemoteIdentity::new("late"),
        })
        .await;

        assert!(conn.is_closed());
        assert_eq!(c.current(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_accept_from_replaced_profile_is_closed() {
        let mut h = harness();
        let c = &mut h.coordinator;

        c.start(Profile::Peer).await;
        let old = c.listen.as_ref().unwrap().id();
        c.start(Profile::SerialPort).await;
        assert_ne!(c.listen.as_ref().unwrap().id(), old);

        let conn = connection("old-profile");
        c.handle_event(WorkerEvent::Accepted {
            worker: old,
            connection: conn.clone(),
            remote: RemoteIdentity::new("old-profile"),
        })
        .await;

        assert!(conn.is_closed());
        assert_eq!(c.current(), ConnectionState::Listening);
    }

    #[tokio::test]
    async fn test_accept_racing_connect_is_promoted() {
        let mut h = harness();
        let c = &mut h.coordinator;

        c.start(Profile::Peer).await;
        let listener = c.listen.as_ref().unwrap().id();
        c.connect(RemoteIdentity::new("outbound"), Profile::Peer).await;

        let conn = connection("inbound");
        c.handle_event(WorkerEvent::Accepted {
            worker: listener,
            connection: conn.clone(),
            remote: RemoteIdentity::new("inbound"),
        })
        .await;

        assert_eq!(c.current(), ConnectionState::Connected);
        assert!(c.dial.is_none());
        assert_invariant(c);
    }

    #[tokio::test]
    async fn test_same_profile_start_keeps_listener() {
        let mut h = harness();
        let c = &mut h.coordinator;

        c.start(Profile::Peer).await;
        let first = c.listen.as_ref().unwrap().id();
        c.start(Profile::Peer).await;

        assert_eq!(c.listen.as_ref().unwrap().id(), first);
    }

    #[tokio::test]
    async fn test_listen_failure_goes_idle() {
        let mut h = harness();
        let c = &mut h.coordinator;

        c.start(Profile::Peer).await;
        let listener = c.listen.as_ref().unwrap().id();
        c.handle_event(WorkerEvent::ListenFailed {
            worker: listener,
            error: TransportError::Closed,
        })
        .await;

        assert_eq!(c.current(), ConnectionState::Idle);
        assert_invariant(c);

        let mut saw_failure = false;
        while let Ok(event) = h.link_events.try_recv() {
            saw_failure |= matches!(event, LinkEvent::ListenFailed { .. });
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_read_failure_restarts_with_last_profile() {
        let mut h = harness();
        let c = &mut h.coordinator;

        c.connect(RemoteIdentity::new("peer"), Profile::SerialPort).await;
        let dial = c.dial.as_ref().unwrap().id();
        let conn = connection("peer");
        c.handle_event(WorkerEvent::Dialed {
            worker: dial,
            connection: conn.clone(),
        })
        .await;
        let session = c.session.as_ref().unwrap().id();

        c.handle_event(WorkerEvent::ReadFailed {
            worker: session,
            error: TransportError::Closed,
        })
        .await;

        assert!(conn.is_closed());
        assert_eq!(c.current(), ConnectionState::Listening);
        assert_eq!(c.listen.as_ref().unwrap().profile(), Profile::SerialPort);
        assert_invariant(c);
    }

    /// xorshift64*, enough to shuffle operation order reproducibly
    struct Rng(u64);

    impl Rng {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 ^= self.0 >> 12;
            self.0 ^= self.0 << 25;
            self.0 ^= self.0 >> 27;
            self.0.wrapping_mul(0x2545_f491_4f6c_dd1d) % bound
        }
    }

    #[tokio::test]
    async fn test_random_interleavings_keep_invariant() {
        for seed in 1..=40u64 {
            let mut h = harness();
            let mut rng = Rng(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15));
            // Every worker id handed out so far, for injecting stale events
            let mut seen: Vec<WorkerId> = Vec::new();

            for _ in 0..60 {
                let c = &mut h.coordinator;
                for id in [
                    c.listen.as_ref().map(ListenWorker::id),
                    c.dial.as_ref().map(DialWorker::id),
                    c.session.as_ref().map(SessionWorker::id),
                ]
                .into_iter()
                .flatten()
                {
                    if !seen.contains(&id) {
                        seen.push(id);
                    }
                }
                let pick = |rng: &mut Rng, current: Option<WorkerId>| match current {
                    Some(id) if rng.next(3) > 0 => id,
                    _ if !seen.is_empty() => seen[rng.next(seen.len() as u64) as usize],
                    _ => WorkerId(0),
                };
                let profile = Profile::ALL[rng.next(2) as usize];

                match rng.next(8) {
                    0 => c.start(profile).await,
                    1 => c.connect(RemoteIdentity::new("remote"), profile).await,
                    2 => c.stop().await,
                    3 => {
                        let worker = pick(&mut rng, c.listen.as_ref().map(ListenWorker::id));
                        c.handle_event(WorkerEvent::Accepted {
                            worker,
                            connection: connection("in"),
                            remote: RemoteIdentity::new("in"),
                        })
                        .await
                    }
                    4 => {
                        let worker = pick(&mut rng, c.dial.as_ref().map(DialWorker::id));
                        c.handle_event(WorkerEvent::Dialed {
                            worker,
                            connection: connection("out"),
                        })
                        .await
                    }
                    5 => {
                        let worker = pick(&mut rng, c.dial.as_ref().map(DialWorker::id));
                        c.handle_event(WorkerEvent::DialFailed {
                            worker,
                            error: TransportError::Closed,
                        })
                        .await
                    }
                    6 => {
                        let worker = pick(&mut rng, c.session.as_ref().map(SessionWorker::id));
                        c.handle_event(WorkerEvent::ReadFailed {
                            worker,
                            error: TransportError::Closed,
                        })
                        .await
                    }
                    _ => {
                        let worker = pick(&mut rng, c.listen.as_ref().map(ListenWorker::id));
                        c.handle_event(WorkerEvent::ListenFailed {
                            worker,
                            error: TransportError::Closed,
                        })
                        .await
                    }
                }

                assert_invariant(c);
            }

            h.coordinator.stop().await;
            assert_invariant(&h.coordinator);
            // Drain so stale dial attempts do not pile up across seeds
            while h.dialer.active_dials() > 0 || h.listener.active_accepts() > 0 {
                tokio::task::yield_now().await;
            }
        }
    }
}
