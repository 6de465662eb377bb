//! Serial-profile link core
//!
//! This crate coordinates the lifecycle of a single point-to-point link over a
//! bidirectional byte stream: listening for an inbound peer, dialing an
//! outbound peer, and servicing the established session. At most one logical
//! connection exists at a time.
//!
//! The transport itself is abstract (see [`transport`]); the application is
//! notified through an [`Observer`]. Raw session bytes are turned into frames
//! by a pluggable [`FrameDecoder`].

pub mod error;
pub mod framing;
pub mod manager;
pub mod observer;
pub mod state;
pub mod transport;
mod worker;

pub use error::{LinkError, TransportError};
pub use framing::{DelimitedLineFramer, FrameDecoder, Framing, RawChunkFramer};
pub use manager::{ConnectionManager, ManagerConfig};
pub use observer::{ChannelObserver, LinkEvent, Observer};
pub use state::{ConnectionState, Profile, RemoteIdentity};
pub use transport::{Connection, Dialer, ListenEndpoint, Listener};
