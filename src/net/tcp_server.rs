//! Non-blocking TCP listener
//!
//! One `poll` per tick: wait up to the poll timeout for a new connection,
//! drain any further pending accepts, then read at most one chunk from every
//! client socket. Results are returned as [`TcpEvent`]s for the owning node.
//! Outbound data is never written mid-dispatch; `flush` drains every
//! connection's buffer once per tick.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::net::connection::{ClientId, ConnectionTable};
use crate::net::dos_protection::{DoSConfig, DoSError, DoSProtection};

/// Upper bound on accepts handled in one tick
const MAX_ACCEPTS_PER_TICK: usize = 64;

/// Why a connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the socket
    Closed,
    /// Read failed
    ReadError,
    /// Overflow or flood; the peer IP is now blocked
    Abuse(DoSError),
}

/// Delivered to the node that owns the listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpEvent {
    Connected(ClientId),
    Data(ClientId, Vec<u8>),
    Disconnected(ClientId, DisconnectReason),
}

pub struct TcpServer {
    listener: TcpListener,
    streams: FxHashMap<ClientId, TcpStream>,
    dos: DoSProtection,
    poll_timeout: Duration,
    read_buf: Vec<u8>,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr, dos: DoSConfig, poll_timeout: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("TCP listener bound on {}", listener.local_addr()?);
        let chunk = dos.read_chunk_size;
        Ok(Self {
            listener,
            streams: FxHashMap::default(),
            dos: DoSProtection::new(dos),
            poll_timeout,
            read_buf: vec![0u8; chunk],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn dos(&self) -> &DoSProtection {
        &self.dos
    }

    pub fn socket_count(&self) -> usize {
        self.streams.len()
    }

    /// Accept, read and police one tick's worth of traffic
    pub async fn poll(&mut self, table: &mut ConnectionTable, now: Instant) -> Vec<TcpEvent> {
        self.dos.tick();
        let mut events = Vec::new();

        match tokio::time::timeout(self.poll_timeout, self.listener.accept()).await {
            Ok(Ok((stream, peer))) => self.admit(stream, peer, table, &mut events),
            Ok(Err(e)) => warn!("Accept failed: {}", e),
            Err(_) => {}
        }
        for _ in 1..MAX_ACCEPTS_PER_TICK {
            match tokio::time::timeout(Duration::ZERO, self.listener.accept()).await {
                Ok(Ok((stream, peer))) => self.admit(stream, peer, table, &mut events),
                Ok(Err(e)) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        self.read_all(table, now, &mut events);
        events
    }

    fn admit(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        table: &mut ConnectionTable,
        events: &mut Vec<TcpEvent>,
    ) {
        if let Err(e) = self.dos.check_connection(peer.ip(), self.streams.len()) {
            debug!("Rejected connection from {}: {}", peer, e);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer, e);
        }
        let id = table.create(peer);
        self.streams.insert(id, stream);
        debug!("Client {} connected from {}", id, peer);
        events.push(TcpEvent::Connected(id));
    }

    fn read_all(&mut self, table: &mut ConnectionTable, now: Instant, events: &mut Vec<TcpEvent>) {
        let mut dropped: Vec<(ClientId, DisconnectReason)> = Vec::new();

        for (&id, stream) in &self.streams {
            let Some(conn) = table.get_mut(id) else {
                dropped.push((id, DisconnectReason::Closed));
                continue;
            };
            if conn.is_closing() {
                continue;
            }

            match stream.try_read(&mut self.read_buf) {
                Ok(0) => dropped.push((id, DisconnectReason::Closed)),
                Ok(n) => {
                    conn.record_received(n, now);
                    match self.dos.check_read(&mut conn.flood, n, now) {
                        Ok(()) => events.push(TcpEvent::Data(id, self.read_buf[..n].to_vec())),
                        Err(e) => dropped.push((id, DisconnectReason::Abuse(e))),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("Read error on client {}: {}", id, e);
                    dropped.push((id, DisconnectReason::ReadError));
                }
            }
        }

        for (id, reason) in dropped {
            self.streams.remove(&id);
            if let DisconnectReason::Abuse(ref e) = reason {
                if let Some(conn) = table.get(id) {
                    warn!("Dropping client {} ({}): {}", id, conn.peer, e);
                    self.dos.block_ip(conn.peer.ip());
                }
            }
            events.push(TcpEvent::Disconnected(id, reason));
        }
    }

    /// Write every pending outbound buffer; returns bytes written
    pub fn flush(&mut self, table: &mut ConnectionTable) -> usize {
        let mut written = 0;
        for conn in table.iter_mut() {
            if !conn.has_pending_tcp() {
                continue;
            }
            let Some(stream) = self.streams.get(&conn.id) else {
                conn.drop_tcp();
                continue;
            };
            loop {
                match stream.try_write(conn.pending_tcp()) {
                    Ok(0) => {
                        conn.drop_tcp();
                        break;
                    }
                    Ok(n) => {
                        written += n;
                        conn.consume_tcp(n);
                        if !conn.has_pending_tcp() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("Write error on client {}: {}", conn.id, e);
                        conn.drop_tcp();
                        break;
                    }
                }
            }
        }
        written
    }

    /// Drop the sockets of connections the node has closed
    pub fn drop_closed(&mut self, table: &ConnectionTable) {
        for id in table.closing_ids() {
            if self.streams.remove(&id).is_some() {
                debug!("Closed client {}", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::{Message, SuccessKind};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn server() -> TcpServer {
        TcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            DoSConfig::default(),
            Duration::from_millis(1),
        )
        .await
        .unwrap()
    }

    async fn poll_until<F>(server: &mut TcpServer, table: &mut ConnectionTable, mut pred: F) -> Vec<TcpEvent>
    where
        F: FnMut(&TcpEvent) -> bool,
    {
        let mut seen = Vec::new();
        for _ in 0..500 {
            let events = server.poll(table, Instant::now()).await;
            let hit = events.iter().any(&mut pred);
            seen.extend(events);
            if hit {
                return seen;
            }
        }
        panic!("condition not reached, saw {:?}", seen);
    }

    #[tokio::test]
    async fn test_accept_read_and_flush() {
        let mut server = server().await;
        let mut table = ConnectionTable::new();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let events = poll_until(&mut server, &mut table, |e| matches!(e, TcpEvent::Connected(_))).await;
        let TcpEvent::Connected(id) = events[0] else { panic!("expected connect") };

        client.write_all(&[16]).await.unwrap();
        let events = poll_until(&mut server, &mut table, |e| matches!(e, TcpEvent::Data(..))).await;
        assert!(events.contains(&TcpEvent::Data(id, vec![16])));

        table.send(id, &Message::Success(SuccessKind::Authenticated));
        assert_eq!(server.flush(&mut table), 2);

        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 1]);
    }

    #[tokio::test]
    async fn test_overflow_blocks_ip() {
        let mut server = server().await;
        let mut table = ConnectionTable::new();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        poll_until(&mut server, &mut table, |e| matches!(e, TcpEvent::Connected(_))).await;

        client.write_all(&vec![0u8; 4096]).await.unwrap();
        let events = poll_until(&mut server, &mut table, |e| {
            matches!(e, TcpEvent::Disconnected(_, DisconnectReason::Abuse(_)))
        })
        .await;
        assert!(events.iter().any(|e| matches!(
            e,
            TcpEvent::Disconnected(_, DisconnectReason::Abuse(DoSError::BufferOverflow(_)))
        )));
        assert!(server.dos().is_blocked(addr.ip()));

        // A blocked peer is dropped at accept and never reported
        let _second = TcpStream::connect(addr).await.unwrap();
        for _ in 0..20 {
            let events = server.poll(&mut table, Instant::now()).await;
            assert!(!events.iter().any(|e| matches!(e, TcpEvent::Connected(_))));
        }
    }
}
