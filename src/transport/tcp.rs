//! TCP transport for running the link without a radio.
//!
//! Each profile maps to its own port so two instances on one machine can
//! listen and dial exactly as they would over RFCOMM.

use crate::transport::stream::{CloseSignal, StreamConnection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spp_core::{
    Connection, Dialer, ListenEndpoint, Listener, Profile, RemoteIdentity, TransportError,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::debug;

/// Configuration for the TCP simulation transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Address listening endpoints bind to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Port of the peer profile; the serial port profile uses the next one
    #[serde(default = "default_base_port")]
    pub base_port: u16,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_base_port() -> u16 {
    9000
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            base_port: default_base_port(),
        }
    }
}

impl TcpConfig {
    pub fn port_for(&self, profile: Profile) -> u16 {
        match profile {
            Profile::Peer => self.base_port,
            Profile::SerialPort => self.base_port.wrapping_add(1),
        }
    }
}

/// Listens and dials over loopback or LAN TCP
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    /// Bind the endpoint for `profile`
    pub async fn bind(&self, profile: Profile) -> Result<TcpEndpoint, TransportError> {
        let address = (self.config.bind_host.as_str(), self.config.port_for(profile));
        let listener = TcpListener::bind(address)
            .await
            .map_err(TransportError::Open)?;
        debug!(
            "tcp {} endpoint bound to {:?}",
            profile,
            listener.local_addr().ok()
        );
        Ok(TcpEndpoint {
            listener: Mutex::new(Some(listener)),
            signal: CloseSignal::new(),
        })
    }

    /// Resolve a peer address. A bare host gets the profile's port.
    fn target(&self, remote: &RemoteIdentity, profile: Profile) -> String {
        if remote.address.parse::<SocketAddr>().is_ok() {
            remote.address.clone()
        } else {
            format!("{}:{}", remote.address, self.config.port_for(profile))
        }
    }
}

#[async_trait]
impl Listener for TcpTransport {
    async fn open(&self, profile: Profile) -> Result<Arc<dyn ListenEndpoint>, TransportError> {
        Ok(Arc::new(self.bind(profile).await?))
    }
}

#[async_trait]
impl Dialer for TcpTransport {
    async fn cancel_discovery(&self) {}

    async fn connect(
        &self,
        remote: &RemoteIdentity,
        profile: Profile,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let target = self.target(remote, profile);
        let stream = TcpStream::connect(&target)
            .await
            .map_err(|source| TransportError::Dial {
                address: target.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Arc::new(StreamConnection::new(stream, remote.clone())))
    }
}

/// A bound TCP listening socket
pub struct TcpEndpoint {
    /// Dropped on close so the port is free for the next endpoint
    listener: Mutex<Option<TcpListener>>,
    signal: CloseSignal,
}

impl TcpEndpoint {
    pub async fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.listener.lock().await.as_ref() {
            Some(listener) => listener.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint closed")),
        }
    }
}

#[async_trait]
impl ListenEndpoint for TcpEndpoint {
    async fn accept(&self) -> Result<(Arc<dyn Connection>, RemoteIdentity), TransportError> {
        if self.signal.is_closed() {
            return Err(TransportError::Closed);
        }

        let (stream, peer) = tokio::select! {
            biased;
            _ = self.signal.closed() => return Err(TransportError::Closed),
            accepted = async {
                match self.listener.lock().await.as_ref() {
                    Some(listener) => listener.accept().await.map_err(TransportError::Accept),
                    None => Err(TransportError::Closed),
                }
            } => accepted?,
        };

        let _ = stream.set_nodelay(true);
        let remote = RemoteIdentity::new(peer.to_string());
        let connection: Arc<dyn Connection> =
            Arc::new(StreamConnection::new(stream, remote.clone()));
        Ok((connection, remote))
    }

    async fn close(&self) {
        self.signal.close();
        // A pending accept gives up the lock as soon as the signal trips
        self.listener.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn loopback() -> TcpTransport {
        TcpTransport::new(TcpConfig {
            bind_host: "127.0.0.1".into(),
            base_port: 0,
        })
    }

    #[test]
    fn test_profiles_use_adjacent_ports() {
        let config = TcpConfig::default();
        assert_eq!(config.port_for(Profile::Peer), 9000);
        assert_eq!(config.port_for(Profile::SerialPort), 9001);
    }

    #[test]
    fn test_bare_host_gets_profile_port() {
        let transport = TcpTransport::new(TcpConfig::default());
        assert_eq!(
            transport.target(&RemoteIdentity::new("10.0.0.7"), Profile::SerialPort),
            "10.0.0.7:9001"
        );
        assert_eq!(
            transport.target(&RemoteIdentity::new("10.0.0.7:4000"), Profile::SerialPort),
            "10.0.0.7:4000"
        );
    }

    #[tokio::test]
    async fn test_loopback_dial_and_accept() {
        let transport = loopback();
        let endpoint = transport.bind(Profile::Peer).await.unwrap();
        let address = endpoint.local_addr().await.unwrap();

        let remote = RemoteIdentity::new(address.to_string()).with_name("loopback");
        let (dialed, accepted) = tokio::join!(
            transport.connect(&remote, Profile::Peer),
            endpoint.accept()
        );
        let dialed = dialed.unwrap();
        let (accepted, peer) = accepted.unwrap();

        assert_eq!(dialed.remote_identity().display_name(), "loopback");
        assert_eq!(accepted.remote_identity(), peer);

        dialed.write(b"AT\r").await.unwrap();
        assert_eq!(accepted.read(16).await.unwrap(), Bytes::from_static(b"AT\r"));
    }

    #[tokio::test]
    async fn test_close_unblocks_accept_and_releases_port() {
        let transport = loopback();
        let endpoint = Arc::new(transport.bind(Profile::Peer).await.unwrap());
        let address = endpoint.local_addr().await.unwrap();

        let waiting = endpoint.clone();
        let pending = tokio::spawn(async move { waiting.accept().await.map(|_| ()) });
        tokio::task::yield_now().await;
        endpoint.close().await;

        assert!(matches!(pending.await.unwrap(), Err(TransportError::Closed)));
        assert!(endpoint.local_addr().await.is_err());
        TcpListener::bind(address).await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused_names_target() {
        let transport = loopback();
        let endpoint = transport.bind(Profile::Peer).await.unwrap();
        let address = endpoint.local_addr().await.unwrap();
        endpoint.close().await;

        match transport
            .connect(&RemoteIdentity::new(address.to_string()), Profile::Peer)
            .await
        {
            Err(TransportError::Dial { address: target, .. }) => {
                assert_eq!(target, address.to_string())
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("dial to a closed port succeeded"),
        }
    }
}
