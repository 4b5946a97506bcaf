//! Slave → master control channel
//!
//! The connect runs in a spawned task so the tick loop never waits on it;
//! `poll` checks on it once per tick and starts a new attempt whenever the
//! link is down. There is no backoff.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const LINK_READ_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Data(Vec<u8>),
    Disconnected,
}

enum LinkState {
    Idle,
    Connecting(JoinHandle<io::Result<TcpStream>>),
    Connected(TcpStream),
    /// A write failed; reported as `Disconnected` on the next poll
    Lost,
}

pub struct MasterLink {
    addr: String,
    state: LinkState,
    read_buf: Vec<u8>,
    attempts: u64,
}

impl MasterLink {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            state: LinkState::Idle,
            read_buf: vec![0u8; LINK_READ_SIZE],
            attempts: 0,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Connected(_))
    }

    /// Connect attempts made so far
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub async fn poll(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();

        match std::mem::replace(&mut self.state, LinkState::Idle) {
            LinkState::Idle => self.start_connect(),
            LinkState::Lost => events.push(LinkEvent::Disconnected),
            LinkState::Connecting(handle) if !handle.is_finished() => {
                self.state = LinkState::Connecting(handle);
            }
            LinkState::Connecting(handle) => match handle.await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed on master link: {}", e);
                    }
                    info!("Connected to master at {}", self.addr);
                    self.state = LinkState::Connected(stream);
                    events.push(LinkEvent::Connected);
                }
                Ok(Err(e)) => debug!("Master connect to {} failed: {}", self.addr, e),
                Err(e) => warn!("Master connect task failed: {}", e),
            },
            LinkState::Connected(stream) => {
                if self.read(&stream, &mut events) {
                    self.state = LinkState::Connected(stream);
                } else {
                    warn!("Lost connection to master at {}", self.addr);
                    events.push(LinkEvent::Disconnected);
                }
            }
        }

        events
    }

    fn start_connect(&mut self) {
        self.attempts += 1;
        let addr = self.addr.clone();
        self.state = LinkState::Connecting(tokio::spawn(async move {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            }
        }));
    }

    /// Drain the socket; false once the link is gone
    fn read(&mut self, stream: &TcpStream, events: &mut Vec<LinkEvent>) -> bool {
        loop {
            match stream.try_read(&mut self.read_buf) {
                Ok(0) => return false,
                Ok(n) => events.push(LinkEvent::Data(self.read_buf[..n].to_vec())),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) => {
                    debug!("Master link read error: {}", e);
                    return false;
                }
            }
        }
    }

    /// Write as much of `out` as the socket takes; the rest stays queued
    pub fn flush(&mut self, out: &mut Vec<u8>) -> usize {
        let LinkState::Connected(stream) = &self.state else {
            return 0;
        };
        let mut written = 0;
        let mut lost = false;
        while written < out.len() {
            match stream.try_write(&out[written..]) {
                Ok(0) => {
                    lost = true;
                    break;
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Master link write error: {}", e);
                    lost = true;
                    break;
                }
            }
        }
        if lost {
            self.state = LinkState::Lost;
        }
        out.drain(..written);
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn poll_for(link: &mut MasterLink, want: &LinkEvent) -> Vec<LinkEvent> {
        let mut seen = Vec::new();
        for _ in 0..400 {
            seen.extend(link.poll().await);
            if seen.contains(want) {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never saw {:?}, got {:?}", want, seen);
    }

    #[tokio::test]
    async fn test_connect_exchange_and_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut link = MasterLink::new("127.0.0.1", port);

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        poll_for(&mut link, &LinkEvent::Connected).await;
        assert!(link.is_connected());
        let mut master_side = accept.await.unwrap();

        let mut out = vec![3, 1, 2];
        assert_eq!(link.flush(&mut out), 3);
        assert!(out.is_empty());
        let mut buf = [0u8; 3];
        master_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [3, 1, 2]);

        master_side.write_all(&[7, 1]).await.unwrap();
        poll_for(&mut link, &LinkEvent::Data(vec![7, 1])).await;

        drop(master_side);
        poll_for(&mut link, &LinkEvent::Disconnected).await;
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_retries_without_master() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut link = MasterLink::new("127.0.0.1", port);
        for _ in 0..50 {
            assert!(!link.poll().await.contains(&LinkEvent::Connected));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(link.attempts() > 1);
    }
}
