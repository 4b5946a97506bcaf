//! UDP rendezvous
//!
//! A datagram does not say which authenticated player sent it. Every player
//! receives a random code over TCP and echoes it once in a `UdpEstablish`
//! datagram; the source address of that datagram is then bound to the
//! connection for good. Datagrams from addresses that never completed the
//! handshake are dropped without a trace.

use std::collections::hash_map::Entry;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{IpAddr, SocketAddr};

use rustc_hash::{FxHashMap, FxHasher};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::net::connection::{ClientId, ConnectionTable, Role};
use crate::net::protocol::{decode_one, Decoder, Message};

/// Receive buffer per datagram
pub const DATAGRAM_SIZE: usize = 1024;

/// Datagrams handled per tick before yielding to the rest of the loop
const MAX_DATAGRAMS_PER_TICK: usize = 4096;

/// Map a peer address to its binding key: `ip << 16 | port` for IPv4.
///
/// IPv6 peers are folded through FxHasher with the top bit set so they can
/// never collide with an IPv4 key.
pub fn address_key(addr: &SocketAddr) -> u64 {
    let v4 = match addr.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4,
            None => {
                let mut hasher = FxHasher::default();
                v6.hash(&mut hasher);
                addr.port().hash(&mut hasher);
                return hasher.finish() | (1 << 63);
            }
        },
    };
    (u64::from(u32::from(v4)) << 16) | u64::from(addr.port())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpEvent {
    /// The connection's UDP address is now bound
    Bound(ClientId),
    /// Records decoded from a bound address
    Messages(ClientId, Vec<Message>),
}

/// Address → connection bindings of one node
#[derive(Debug, Default)]
pub struct UdpRendezvous {
    bindings: FxHashMap<u64, ClientId>,
}

impl UdpRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn owner_of(&self, addr: &SocketAddr) -> Option<ClientId> {
        self.bindings.get(&address_key(addr)).copied()
    }

    /// Route one datagram. `None` means it was dropped.
    pub fn handle_datagram(
        &mut self,
        table: &mut ConnectionTable,
        from: SocketAddr,
        data: &[u8],
    ) -> Option<UdpEvent> {
        let key = address_key(&from);

        if let Some(&owner) = self.bindings.get(&key) {
            if !table.contains(owner) {
                self.bindings.remove(&key);
                return None;
            }
            // Decode until the first bad record; the rest of the datagram is lost
            let messages: Vec<Message> = Decoder::new(data).map_while(Result::ok).collect();
            if messages.is_empty() {
                return None;
            }
            return Some(UdpEvent::Messages(owner, messages));
        }

        let Ok((Message::UdpEstablish { client_id, code }, _)) = decode_one(data) else {
            trace!("Dropped datagram from unbound {}", from);
            return None;
        };

        let conn = table.get_mut(client_id)?;
        if conn.role() != Role::Player || conn.is_closing() || conn.udp_code != code {
            debug!("Rejected UDP establish for client {} from {}", client_id, from);
            return None;
        }
        let Entry::Vacant(slot) = self.bindings.entry(key) else {
            return None;
        };
        if !conn.bind_udp(from) {
            return None;
        }
        slot.insert(client_id);
        debug!("Client {} bound UDP address {}", client_id, from);
        Some(UdpEvent::Bound(client_id))
    }

    /// Forget the binding of a departed connection
    pub fn release(&mut self, addr: &SocketAddr) {
        self.bindings.remove(&address_key(addr));
    }
}

/// The node's UDP socket
pub struct UdpServer {
    socket: UdpSocket,
    recv_buf: Vec<u8>,
}

impl UdpServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("UDP socket bound on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            recv_buf: vec![0u8; DATAGRAM_SIZE],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Read every datagram already queued on the socket
    pub fn drain(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut out = Vec::new();
        while out.len() < MAX_DATAGRAMS_PER_TICK {
            match self.socket.try_recv_from(&mut self.recv_buf) {
                Ok((n, from)) => out.push((from, self.recv_buf[..n].to_vec())),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // ICMP unreachable surfaces here on some platforms
                    trace!("UDP receive error: {}", e);
                    break;
                }
            }
        }
        out
    }

    /// Send every queued datagram; returns the number sent
    pub fn flush(&mut self, table: &mut ConnectionTable) -> usize {
        let mut sent = 0;
        for conn in table.iter_mut() {
            let Some(addr) = conn.udp_addr() else {
                continue;
            };
            for datagram in conn.take_udp() {
                match self.socket.try_send_to(&datagram, addr) {
                    Ok(_) => sent += 1,
                    Err(e) => trace!("UDP send to {} failed: {}", addr, e),
                }
            }
        }
        sent
    }
}
