//! Adapter from any async byte stream to a closeable link connection

use async_trait::async_trait;
use bytes::Bytes;
use spp_core::{Connection, RemoteIdentity, TransportError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};

/// One-way latch that wakes everything waiting on a closed handle
pub struct CloseSignal {
    closed: watch::Sender<bool>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self { closed }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Trip the latch. Returns true only for the first call.
    pub fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Split stream whose pending reads and writes return once it is closed
pub struct StreamConnection<S> {
    remote: RemoteIdentity,
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    signal: CloseSignal,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, remote: RemoteIdentity) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            remote,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            signal: CloseSignal::new(),
        }
    }
}

#[async_trait]
impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, max_bytes: usize) -> Result<Bytes, TransportError> {
        if self.signal.is_closed() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.signal.closed() => Err(TransportError::Closed),
            result = async {
                let mut reader = self.reader.lock().await;
                let mut buf = vec![0u8; max_bytes];
                let n = reader.read(&mut buf).await.map_err(TransportError::Read)?;
                buf.truncate(n);
                Ok(Bytes::from(buf))
            } => result,
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.signal.is_closed() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.signal.closed() => Err(TransportError::Closed),
            result = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(bytes).await?;
                writer.flush().await
            } => result.map_err(TransportError::Write),
        }
    }

    async fn close(&self) {
        if !self.signal.close() {
            return;
        }
        // Pending writes released the lock when the signal tripped
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn remote_identity(&self) -> RemoteIdentity {
        self.remote.clone()
    }
}
