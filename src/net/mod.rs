//! Networking: wire codec, connections and the three socket front ends

pub mod connection;
pub mod dos_protection;
pub mod framing;
pub mod master_link;
pub mod protocol;
pub mod tcp_server;
pub mod udp_server;

pub use connection::{ClientId, Connection, ConnectionTable, Role};
pub use master_link::{LinkEvent, MasterLink};
pub use protocol::{Decoder, ErrorCode, Message, MsgType, ProtocolError};
pub use tcp_server::{DisconnectReason, TcpEvent, TcpServer};
pub use udp_server::{UdpEvent, UdpRendezvous, UdpServer};
