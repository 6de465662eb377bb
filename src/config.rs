//! TOML configuration for the link binary.
//!
//! Every field has a default, so running without a config file behaves like
//! an empty one:
//!
//! ```toml
//! mode = "rfcomm"
//! profile = "serial_port"
//! framing = "delimited_line"
//! peer = "00:11:22:33:44:55"
//!
//! [rfcomm]
//! serial_port_channel = 1
//!
//! [discovery]
//! scan_secs = 5
//! name_prefix = "HC-"
//! ```

use crate::transport::{DiscoveryConfig, RfcommConfig, TcpConfig};
use serde::{Deserialize, Serialize};
use spp_core::manager::DEFAULT_READ_BUFFER_SIZE;
use spp_core::{Framing, ManagerConfig, Profile};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the config file when no argument is given
pub const CONFIG_ENV: &str = "SPP_LINK_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which transport carries the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Bluetooth RFCOMM through BlueZ
    Rfcomm,
    /// TCP sockets, for development without a radio
    #[default]
    TcpSimulation,
}

/// How received bytes become frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingMode {
    /// Every read is one frame
    #[default]
    RawChunk,
    /// CR-terminated lines
    DelimitedLine,
}

impl FramingMode {
    pub fn framing(self) -> Framing {
        match self {
            FramingMode::RawChunk => Framing::RawChunk,
            FramingMode::DelimitedLine => Framing::DelimitedLine,
        }
    }

    /// Appended to each line typed on stdin before it is sent
    pub fn line_terminator(self) -> &'static [u8] {
        match self {
            FramingMode::RawChunk => b"\n",
            FramingMode::DelimitedLine => b"\r\n",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mode: TransportMode,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub framing: FramingMode,
    /// Address to dial at startup; listen when absent
    #[serde(default)]
    pub peer: Option<String>,
    /// Maximum bytes per session read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default)]
    pub rfcomm: RfcommConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            profile: Profile::default(),
            framing: FramingMode::default(),
            peer: None,
            read_buffer_size: default_read_buffer_size(),
            rfcomm: RfcommConfig::default(),
            tcp: TcpConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, or defaults when there is no file to read
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "read_buffer_size must be at least 1".into(),
            ));
        }
        if matches!(self.peer.as_deref(), Some(peer) if peer.trim().is_empty()) {
            return Err(ConfigError::Invalid("peer address is empty".into()));
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            framing: self.framing.framing(),
            read_buffer_size: self.read_buffer_size,
        }
    }
}
