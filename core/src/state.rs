//! Link lifecycle state, service profiles and peer identity

use serde::{Deserialize, Serialize};
use std::fmt;

/// SDP record name the listening side advertises under
pub const SERVICE_RECORD_NAME: &str = "Bluetooth Secure";

/// Lifecycle state of the link. Exactly one value holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No worker running
    #[default]
    Idle,
    /// Waiting for an inbound peer
    Listening,
    /// Dialing an outbound peer
    Connecting,
    /// A session is established
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "IDLE"),
            ConnectionState::Listening => write!(f, "LISTENING"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Named service identity used for listening and dialing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// App-to-app service between two instances of this software
    #[default]
    Peer,
    /// Standard serial port service, for talking to embedded modules
    SerialPort,
}

impl Profile {
    pub const ALL: [Profile; 2] = [Profile::Peer, Profile::SerialPort];

    /// 128-bit service class UUID
    pub fn service_uuid(self) -> u128 {
        match self {
            Profile::Peer => 0xfa87c0d0_afac_11de_8a39_0800200c9a66,
            Profile::SerialPort => 0x00001101_0000_1000_8000_00805f9b34fb,
        }
    }

    /// Service record name registered while listening
    pub fn service_name(self) -> &'static str {
        SERVICE_RECORD_NAME
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Peer => write!(f, "peer"),
            Profile::SerialPort => write!(f, "serial-port"),
        }
    }
}

/// Who is on the other end of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteIdentity {
    /// Human-readable device name, when the transport knows one
    pub name: Option<String>,
    /// Transport address (MAC for RFCOMM, `host:port` for TCP)
    pub address: String,
}

impl RemoteIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name if known, otherwise the address
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl fmt::Display for RemoteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
        assert_eq!(ConnectionState::Listening.to_string(), "LISTENING");
        assert_eq!(ConnectionState::Connected.to_string(), "CONNECTED");
    }

    #[test]
    fn test_profile_uuids_are_distinct() {
        assert_ne!(
            Profile::Peer.service_uuid(),
            Profile::SerialPort.service_uuid()
        );
        assert_eq!(
            format!("{:032x}", Profile::SerialPort.service_uuid()),
            "0000110100001000800000805f9b34fb"
        );
    }

    #[test]
    fn test_remote_identity_display() {
        let anonymous = RemoteIdentity::new("00:11:22:33:44:55");
        assert_eq!(anonymous.display_name(), "00:11:22:33:44:55");
        assert_eq!(anonymous.to_string(), "00:11:22:33:44:55");

        let named = anonymous.with_name("HC-05");
        assert_eq!(named.display_name(), "HC-05");
        assert_eq!(named.to_string(), "HC-05 (00:11:22:33:44:55)");
    }
}
