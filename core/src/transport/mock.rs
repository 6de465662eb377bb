//! In-memory transport for tests and demos.
//!
//! Every blocking call is driven by the test: inbound peers are offered with
//! [`MockListener::offer`], dial attempts are answered through
//! [`MockDialer::next_request`], and session bytes are pushed with
//! [`MockPeer::send`]. Live blocking calls are counted so tests can check that
//! cancelled workers really went away.

use super::{Connection, Dialer, ListenEndpoint, Listener};
use crate::error::TransportError;
use crate::state::{Profile, RemoteIdentity};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

type Incoming = (Arc<dyn Connection>, RemoteIdentity);
type IncomingResult = Result<Incoming, TransportError>;

/// Counts one in-flight call for as long as it lives
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn wait_closed(closed: &watch::Sender<bool>) {
    let mut rx = closed.subscribe();
    // The sender lives as long as `closed` is borrowed
    let _ = rx.wait_for(|closed| *closed).await;
}

fn broken_pipe(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, message.to_string())
}

struct Inbound {
    rx: mpsc::UnboundedReceiver<Result<Bytes, TransportError>>,
    /// Rest of a chunk larger than the caller's read size
    leftover: Bytes,
}

/// One end of an in-memory stream; the other end is a [`MockPeer`]
pub struct MockConnection {
    remote: RemoteIdentity,
    inbound: Mutex<Inbound>,
    closed: watch::Sender<bool>,
    written: std::sync::Mutex<Vec<Bytes>>,
    write_calls: AtomicUsize,
    fail_writes: AtomicBool,
    active_reads: AtomicUsize,
}

/// Test-side handle feeding a [`MockConnection`]
pub struct MockPeer {
    inbound_tx: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
    connection: Arc<MockConnection>,
}

impl MockConnection {
    /// Create a connection to `remote` and the peer that drives it
    pub fn pair(remote: RemoteIdentity) -> (Arc<Self>, MockPeer) {
        let (inbound_tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let connection = Arc::new(Self {
            remote,
            inbound: Mutex::new(Inbound {
                rx,
                leftover: Bytes::new(),
            }),
            closed,
            written: std::sync::Mutex::new(Vec::new()),
            write_calls: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            active_reads: AtomicUsize::new(0),
        });
        let peer = MockPeer {
            inbound_tx,
            connection: connection.clone(),
        };
        (connection, peer)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Every successful write, in order
    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().expect("lock poisoned").clone()
    }

    /// Number of times `write` was invoked, successful or not
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Reads currently blocked on this connection
    pub fn active_reads(&self) -> usize {
        self.active_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn read(&self, max_bytes: usize) -> Result<Bytes, TransportError> {
        let _in_flight = InFlight::enter(&self.active_reads);
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            biased;
            _ = wait_closed(&self.closed) => Err(TransportError::Closed),
            result = async {
                let mut inbound = self.inbound.lock().await;
                if inbound.leftover.is_empty() {
                    match inbound.rx.recv().await {
                        Some(Ok(chunk)) => inbound.leftover = chunk,
                        Some(Err(error)) => return Err(error),
                        None => return Err(TransportError::Closed),
                    }
                }
                let take = inbound.leftover.len().min(max_bytes);
                Ok(inbound.leftover.split_to(take))
            } => result,
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Write(broken_pipe("mock write failure")));
        }
        self.written
            .lock()
            .expect("lock poisoned")
            .push(Bytes::copy_from_slice(bytes));
        Ok(())
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    fn remote_identity(&self) -> RemoteIdentity {
        self.remote.clone()
    }
}

impl MockPeer {
    /// Deliver bytes as the result of one read
    pub fn send(&self, bytes: impl Into<Bytes>) {
        let _ = self.inbound_tx.send(Ok(bytes.into()));
    }

    /// Make the next read fail
    pub fn fail_read(&self) {
        let _ = self
            .inbound_tx
            .send(Err(TransportError::Read(broken_pipe("mock read failure"))));
    }

    /// End the stream cleanly (the next read returns no bytes)
    pub fn hang_up(&self) {
        let _ = self.inbound_tx.send(Ok(Bytes::new()));
    }

    pub fn connection(&self) -> &Arc<MockConnection> {
        &self.connection
    }
}

/// Listener whose endpoints accept connections offered by the test
pub struct MockListener {
    incoming_tx: mpsc::UnboundedSender<IncomingResult>,
    incoming: Arc<Mutex<mpsc::UnboundedReceiver<IncomingResult>>>,
    opened: std::sync::Mutex<Vec<Profile>>,
    fail_open: AtomicBool,
    active_accepts: Arc<AtomicUsize>,
    open_endpoints: Arc<AtomicUsize>,
}

impl MockListener {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            incoming_tx,
            incoming: Arc::new(Mutex::new(incoming_rx)),
            opened: std::sync::Mutex::new(Vec::new()),
            fail_open: AtomicBool::new(false),
            active_accepts: Arc::new(AtomicUsize::new(0)),
            open_endpoints: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue an inbound peer for the next `accept`
    pub fn offer(&self, connection: Arc<MockConnection>) {
        let remote = connection.remote_identity();
        let _ = self.incoming_tx.send(Ok((connection, remote)));
    }

    /// Make the next `accept` fail as if the endpoint broke
    pub fn fail_next_accept(&self) {
        let error = TransportError::Accept(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "mock accept failure",
        ));
        let _ = self.incoming_tx.send(Err(error));
    }

    /// Profiles passed to `open`, in call order
    pub fn opened_profiles(&self) -> Vec<Profile> {
        self.opened.lock().expect("lock poisoned").clone()
    }

    /// Make subsequent `open` calls fail
    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn active_accepts(&self) -> usize {
        self.active_accepts.load(Ordering::SeqCst)
    }

    /// Endpoints opened and not yet closed
    pub fn open_endpoints(&self) -> usize {
        self.open_endpoints.load(Ordering::SeqCst)
    }
}

impl Default for MockListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Listener for MockListener {
    async fn open(&self, profile: Profile) -> Result<Arc<dyn ListenEndpoint>, TransportError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::Open(io::Error::new(
                io::ErrorKind::AddrInUse,
                "mock listener unavailable",
            )));
        }
        self.opened.lock().expect("lock poisoned").push(profile);
        self.open_endpoints.fetch_add(1, Ordering::SeqCst);

        let (closed, _) = watch::channel(false);
        Ok(Arc::new(MockEndpoint {
            incoming: self.incoming.clone(),
            closed,
            active_accepts: self.active_accepts.clone(),
            open_endpoints: self.open_endpoints.clone(),
        }))
    }
}

struct MockEndpoint {
    incoming: Arc<Mutex<mpsc::UnboundedReceiver<IncomingResult>>>,
    closed: watch::Sender<bool>,
    active_accepts: Arc<AtomicUsize>,
    open_endpoints: Arc<AtomicUsize>,
}

#[async_trait]
impl ListenEndpoint for MockEndpoint {
    async fn accept(&self) -> Result<Incoming, TransportError> {
        let _in_flight = InFlight::enter(&self.active_accepts);
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            biased;
            _ = wait_closed(&self.closed) => Err(TransportError::Closed),
            incoming = async { self.incoming.lock().await.recv().await } => {
                incoming.unwrap_or(Err(TransportError::Closed))
            }
        }
    }

    async fn close(&self) {
        if !self.closed.send_replace(true) {
            self.open_endpoints.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A dial attempt waiting for the test to decide its outcome
pub struct DialRequest {
    pub remote: RemoteIdentity,
    pub profile: Profile,
    reply: oneshot::Sender<Result<Arc<dyn Connection>, TransportError>>,
}

impl DialRequest {
    /// Complete the dial with `connection`.
    /// Returns false if the attempt was already abandoned.
    pub fn succeed(self, connection: Arc<MockConnection>) -> bool {
        self.reply.send(Ok(connection)).is_ok()
    }

    /// Fail the dial. Returns false if the attempt was already abandoned.
    pub fn fail(self) -> bool {
        let error = TransportError::Dial {
            address: self.remote.address.clone(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "mock dial refused"),
        };
        self.reply.send(Err(error)).is_ok()
    }
}

/// Dialer whose attempts block until the test answers them
pub struct MockDialer {
    requests_tx: mpsc::UnboundedSender<DialRequest>,
    requests: Mutex<mpsc::UnboundedReceiver<DialRequest>>,
    active_dials: AtomicUsize,
    discovery_cancels: AtomicUsize,
}

impl MockDialer {
    pub fn new() -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            requests_tx,
            requests: Mutex::new(requests_rx),
            active_dials: AtomicUsize::new(0),
            discovery_cancels: AtomicUsize::new(0),
        }
    }

    /// Wait for the next dial attempt
    pub async fn next_request(&self) -> Option<DialRequest> {
        self.requests.lock().await.recv().await
    }

    /// Dials currently blocked in `connect`
    pub fn active_dials(&self) -> usize {
        self.active_dials.load(Ordering::SeqCst)
    }

    pub fn discovery_cancels(&self) -> usize {
        self.discovery_cancels.load(Ordering::SeqCst)
    }
}

impl Default for MockDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn cancel_discovery(&self) {
        self.discovery_cancels.fetch_add(1, Ordering::SeqCst);
    }

    async fn connect(
        &self,
        remote: &RemoteIdentity,
        profile: Profile,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let _in_flight = InFlight::enter(&self.active_dials);
        let (reply, outcome) = oneshot::channel();
        let request = DialRequest {
            remote: remote.clone(),
            profile,
            reply,
        };
        if self.requests_tx.send(request).is_err() {
            return Err(TransportError::Closed);
        }

        outcome.await.unwrap_or_else(|_| {
            Err(TransportError::Dial {
                address: remote.address.clone(),
                source: io::Error::new(io::ErrorKind::ConnectionAborted, "dial request dropped"),
            })
        })
    }
}
