// Network module
//
// Peer-to-peer WebSocket transport: wire protocol, connection records and the
// transport that owns every socket.

pub mod connection;
pub mod protocol;
pub mod transport;

pub use connection::{Connection, ConnectionInfo};
pub use protocol::{Inbound, Message, MessageKind, Unhandled};
pub use transport::{DiscoveredPeer, Transport, TransportConfig, TransportError};
