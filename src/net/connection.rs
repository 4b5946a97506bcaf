use std::net::SocketAddr;
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::net::dos_protection::FloodDetector;
use crate::net::protocol::Message;

/// Node-local connection id, unique for the node's lifetime
pub type ClientId = u32;

/// Authentication role of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connected, first message not yet accepted
    Unauthenticated,
    /// A slave node registered with this master
    SlaveNode,
    /// A game client
    Player,
}

/// One network peer
#[derive(Debug)]
pub struct Connection {
    pub id: ClientId,
    pub peer: SocketAddr,
    role: Role,
    /// Rendezvous code the peer must echo in its `UdpEstablish`
    pub udp_code: u16,
    udp_addr: Option<SocketAddr>,
    tcp_out: Vec<u8>,
    udp_out: Vec<Vec<u8>>,
    closing: bool,
    pub flood: FloodDetector,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
}

impl Connection {
    pub fn new(id: ClientId, peer: SocketAddr, udp_code: u16) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer,
            role: Role::Unauthenticated,
            udp_code,
            udp_addr: None,
            tcp_out: Vec::with_capacity(256),
            udp_out: Vec::new(),
            closing: false,
            flood: FloodDetector::new(),
            created_at: now,
            last_activity: now,
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_authenticated(&self) -> bool {
        self.role != Role::Unauthenticated
    }

    /// Promote an unauthenticated connection. Roles never change afterwards.
    pub fn authenticate(&mut self, role: Role) -> bool {
        if self.role != Role::Unauthenticated || role == Role::Unauthenticated {
            return false;
        }
        self.role = role;
        true
    }

    /// Queue a record on the TCP outbound buffer
    pub fn send(&mut self, msg: &Message) {
        if self.closing {
            return;
        }
        msg.encode_into(&mut self.tcp_out);
        self.messages_sent += 1;
    }

    /// Queue a datagram; dropped while the UDP address is unbound
    pub fn send_udp(&mut self, msg: &Message) {
        if self.udp_addr.is_none() || self.closing {
            return;
        }
        self.udp_out.push(msg.encode());
    }

    /// Bind the permanent UDP address. Only the first binding sticks.
    pub fn bind_udp(&mut self, addr: SocketAddr) -> bool {
        if self.udp_addr.is_some() {
            return false;
        }
        self.udp_addr = Some(addr);
        true
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn pending_tcp(&self) -> &[u8] {
        &self.tcp_out
    }

    pub fn has_pending_tcp(&self) -> bool {
        !self.tcp_out.is_empty()
    }

    /// Drop the first `n` bytes after a (partial) write
    pub fn consume_tcp(&mut self, n: usize) {
        let n = n.min(self.tcp_out.len());
        self.tcp_out.drain(..n);
        self.bytes_sent += n as u64;
    }

    /// Discard the outbound buffer after a hard write error
    pub fn drop_tcp(&mut self) {
        self.tcp_out.clear();
    }

    pub fn take_udp(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.udp_out)
    }

    pub fn record_received(&mut self, bytes: usize, now: Instant) {
        self.bytes_received += bytes as u64;
        self.last_activity = now;
    }

    /// Flush what is queued, then drop the socket
    pub fn close(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }
}

/// Owns every connection of one node, keyed by [`ClientId`]
#[derive(Debug)]
pub struct ConnectionTable {
    connections: FxHashMap<ClientId, Connection>,
    next_id: ClientId,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            connections: FxHashMap::default(),
            next_id: 1,
        }
    }

    /// Create a new connection with the next id and a random rendezvous code
    pub fn create(&mut self, peer: SocketAddr) -> ClientId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let code = rand::random::<u16>();
        self.connections.insert(id, Connection::new(id, peer, code));
        id
    }

    pub fn get(&self, id: ClientId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// Queue a TCP record for one connection; false if it is gone
    pub fn send(&mut self, id: ClientId, msg: &Message) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.send(msg);
                true
            }
            None => false,
        }
    }

    /// Queue a TCP record for each listed connection
    pub fn send_many(&mut self, ids: &[ClientId], msg: &Message) {
        let encoded = msg.encode();
        for id in ids {
            if let Some(conn) = self.connections.get_mut(id) {
                if !conn.closing {
                    conn.tcp_out.extend_from_slice(&encoded);
                    conn.messages_sent += 1;
                }
            }
        }
    }

    pub fn send_udp(&mut self, id: ClientId, msg: &Message) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.send_udp(msg);
        }
    }

    pub fn send_udp_many(&mut self, ids: &[ClientId], msg: &Message) {
        for id in ids {
            self.send_udp(*id, msg);
        }
    }

    pub fn close(&mut self, id: ClientId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.close();
        }
    }

    /// Ids of connections marked closing
    pub fn closing_ids(&self) -> Vec<ClientId> {
        self.connections
            .values()
            .filter(|c| c.closing)
            .map(|c| c.id)
            .collect()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
