//! RFCOMM transport for Bluetooth serial links.
//!
//! Listening registers the profile's service record with BlueZ and takes
//! connections BlueZ hands over; dialing connects straight to the peer's
//! configured channel.

use crate::transport::discovery::BtDiscovery;
use crate::transport::stream::{CloseSignal, StreamConnection};
use anyhow::Result;
use async_trait::async_trait;
use bluer::rfcomm::{
    Profile as ServiceProfile, ProfileHandle, Role, SocketAddr as RfcommAddr,
    Stream as RfcommStream,
};
use bluer::{Adapter, Address, Session, Uuid};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use spp_core::{
    Connection, Dialer, ListenEndpoint, Listener, Profile, RemoteIdentity, TransportError,
};
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Default RFCOMM channel for the serial port profile
pub const DEFAULT_SERIAL_PORT_CHANNEL: u8 = 1;

/// Default RFCOMM channel for the app-to-app profile
pub const DEFAULT_PEER_CHANNEL: u8 = 3;

/// Channel assignment per profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfcommConfig {
    #[serde(default = "default_peer_channel")]
    pub peer_channel: u8,
    #[serde(default = "default_serial_port_channel")]
    pub serial_port_channel: u8,
}

fn default_peer_channel() -> u8 {
    DEFAULT_PEER_CHANNEL
}

fn default_serial_port_channel() -> u8 {
    DEFAULT_SERIAL_PORT_CHANNEL
}

impl Default for RfcommConfig {
    fn default() -> Self {
        Self {
            peer_channel: DEFAULT_PEER_CHANNEL,
            serial_port_channel: DEFAULT_SERIAL_PORT_CHANNEL,
        }
    }
}

impl RfcommConfig {
    pub fn channel_for(&self, profile: Profile) -> u8 {
        match profile {
            Profile::Peer => self.peer_channel,
            Profile::SerialPort => self.serial_port_channel,
        }
    }
}

fn bluez_error<E>(error: E) -> io::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    io::Error::new(io::ErrorKind::Other, error)
}

/// Identity of `address`, with its name when BlueZ knows one
async fn identify(adapter: &Adapter, address: Address) -> RemoteIdentity {
    let name = match adapter.device(address) {
        Ok(device) => device.name().await.ok().flatten(),
        Err(_) => None,
    };
    RemoteIdentity {
        name,
        address: address.to_string(),
    }
}

/// Listens and dials over the default Bluetooth adapter
pub struct RfcommTransport {
    config: RfcommConfig,
    session: Session,
    adapter: Adapter,
    discovery: Arc<BtDiscovery>,
}

impl RfcommTransport {
    /// Connect to BlueZ and power on the default adapter.
    ///
    /// The dialer's discovery hint stops scans running on `discovery`; share
    /// it with whatever scans in this process.
    pub async fn new(config: RfcommConfig, discovery: Arc<BtDiscovery>) -> Result<Self> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!(
            "[BT] Using adapter {} ({})",
            adapter.name(),
            adapter.address().await?
        );
        Ok(Self {
            config,
            session,
            adapter,
            discovery,
        })
    }
}

#[async_trait]
impl Listener for RfcommTransport {
    async fn open(&self, profile: Profile) -> Result<Arc<dyn ListenEndpoint>, TransportError> {
        let channel = self.config.channel_for(profile);
        let record = ServiceProfile {
            uuid: Uuid::from_u128(profile.service_uuid()),
            name: Some(profile.service_name().to_string()),
            role: Some(Role::Server),
            channel: Some(channel.into()),
            require_authentication: Some(true),
            ..Default::default()
        };
        let handle = self
            .session
            .register_profile(record)
            .await
            .map_err(|e| TransportError::Open(bluez_error(e)))?;
        info!("[BT] Listening for {} on channel {}", profile, channel);

        Ok(Arc::new(RfcommEndpoint {
            handle: Mutex::new(Some(handle)),
            adapter: self.adapter.clone(),
            signal: CloseSignal::new(),
        }))
    }
}

#[async_trait]
impl Dialer for RfcommTransport {
    async fn cancel_discovery(&self) {
        if self.discovery.is_scanning() {
            debug!("[BT] Stopping discovery before connecting");
        }
        self.discovery.cancel();
    }

    async fn connect(
        &self,
        remote: &RemoteIdentity,
        profile: Profile,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let dial_error = |source: io::Error| TransportError::Dial {
            address: remote.address.clone(),
            source,
        };
        let address = remote.address.parse::<Address>().map_err(|e| {
            dial_error(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
        })?;
        let channel = self.config.channel_for(profile);

        info!("[BT] Connecting to {} channel {}", address, channel);
        let stream = RfcommStream::connect(RfcommAddr::new(address, channel))
            .await
            .map_err(dial_error)?;
        info!("[BT] Connected to {}", address);

        let mut identity = identify(&self.adapter, address).await;
        if identity.name.is_none() {
            identity.name = remote.name.clone();
        }
        Ok(Arc::new(StreamConnection::new(stream, identity)))
    }
}

/// A registered service record accepting inbound connections
struct RfcommEndpoint {
    /// Dropping the handle unregisters the service record
    handle: Mutex<Option<ProfileHandle>>,
    adapter: Adapter,
    signal: CloseSignal,
}

impl RfcommEndpoint {
    async fn next_stream(&self) -> Result<(RfcommStream, Address), TransportError> {
        let mut handle = self.handle.lock().await;
        let handle = handle.as_mut().ok_or(TransportError::Closed)?;
        let request = handle.next().await.ok_or(TransportError::Closed)?;
        let address = request.device();
        let stream = request
            .accept()
            .map_err(|e| TransportError::Accept(bluez_error(e)))?;
        Ok((stream, address))
    }
}

#[async_trait]
impl ListenEndpoint for RfcommEndpoint {
    async fn accept(&self) -> Result<(Arc<dyn Connection>, RemoteIdentity), TransportError> {
        if self.signal.is_closed() {
            return Err(TransportError::Closed);
        }

        let (stream, address) = tokio::select! {
            biased;
            _ = self.signal.closed() => return Err(TransportError::Closed),
            accepted = self.next_stream() => accepted?,
        };

        let remote = identify(&self.adapter, address).await;
        info!("[BT] Accepted {}", remote);
        let connection: Arc<dyn Connection> =
            Arc::new(StreamConnection::new(stream, remote.clone()));
        Ok((connection, remote))
    }

    async fn close(&self) {
        self.signal.close();
        self.handle.lock().await.take();
    }
}
