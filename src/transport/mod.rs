pub mod discovery;
pub mod rfcomm;
pub mod stream;
pub mod tcp;

pub use discovery::{BtDiscovery, DiscoveryConfig};
pub use rfcomm::{RfcommConfig, RfcommTransport};
pub use tcp::{TcpConfig, TcpTransport};
