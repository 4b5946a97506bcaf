use std::net::IpAddr;
use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;

/// Bytes read from a client socket per poll; filling it is treated as abuse
pub const READ_CHUNK_SIZE: usize = 1024;

/// Configuration for DoS protection
#[derive(Debug, Clone)]
pub struct DoSConfig {
    /// Maximum total concurrent connections
    pub max_connections_total: usize,
    /// Size of a single socket read; a read that fills it is an overflow attempt
    pub read_chunk_size: usize,
    /// Interarrival time below which a message counts as a flood strike
    pub flood_interval: Duration,
    /// Consecutive strikes that mark a connection abusive
    pub flood_strikes: u32,
    /// Ticks between block list clears
    pub block_clear_ticks: u32,
}

impl Default for DoSConfig {
    fn default() -> Self {
        Self {
            max_connections_total: 10_000,
            read_chunk_size: READ_CHUNK_SIZE,
            flood_interval: Duration::from_millis(33),
            flood_strikes: 20,
            block_clear_ticks: 100,
        }
    }
}

/// Per-connection flood clock
#[derive(Debug, Default, Clone)]
pub struct FloodDetector {
    last_message: Option<Instant>,
    strikes: u32,
}

impl FloodDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound message; returns false once the peer is flooding
    pub fn log_activity(&mut self, now: Instant, config: &DoSConfig) -> bool {
        if let Some(last) = self.last_message {
            if now.saturating_duration_since(last) < config.flood_interval {
                self.strikes += 1;
            } else {
                self.strikes = 0;
            }
        }
        self.last_message = Some(now);
        self.strikes < config.flood_strikes
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }
}

/// Temporary IP block list, wiped every `block_clear_ticks` ticks
#[derive(Debug, Default)]
pub struct BlockList {
    blocked: FxHashSet<IpAddr>,
    ticks_since_clear: u32,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one tick; returns true when the list was cleared
    pub fn tick(&mut self, clear_every: u32) -> bool {
        self.ticks_since_clear += 1;
        if self.ticks_since_clear > clear_every {
            self.ticks_since_clear = 0;
            let had_entries = !self.blocked.is_empty();
            self.blocked.clear();
            return had_entries;
        }
        false
    }

    pub fn block(&mut self, ip: IpAddr) {
        self.blocked.insert(ip);
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocked.contains(&ip)
    }

    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

/// DoS protection manager owned by a TCP listener
pub struct DoSProtection {
    config: DoSConfig,
    block_list: BlockList,
}

impl DoSProtection {
    pub fn new(config: DoSConfig) -> Self {
        Self {
            config,
            block_list: BlockList::new(),
        }
    }

    pub fn config(&self) -> &DoSConfig {
        &self.config
    }

    /// Called once per listener tick
    pub fn tick(&mut self) {
        if self.block_list.tick(self.config.block_clear_ticks) {
            tracing::debug!("Block list cleared");
        }
    }

    /// Check if a new connection from this IP is allowed
    pub fn check_connection(&self, ip: IpAddr, current: usize) -> Result<(), DoSError> {
        if self.block_list.is_blocked(ip) {
            return Err(DoSError::IpBlocked(ip));
        }
        if current >= self.config.max_connections_total {
            return Err(DoSError::TooManyConnections);
        }
        Ok(())
    }

    /// Check one socket read against the overflow and flood policies
    pub fn check_read(
        &self,
        detector: &mut FloodDetector,
        bytes: usize,
        now: Instant,
    ) -> Result<(), DoSError> {
        if bytes >= self.config.read_chunk_size {
            return Err(DoSError::BufferOverflow(bytes));
        }

        #[cfg(feature = "dos_ratelimit")]
        if !detector.log_activity(now, &self.config) {
            return Err(DoSError::Flooding);
        }
        #[cfg(not(feature = "dos_ratelimit"))]
        let _ = (detector, now);

        Ok(())
    }

    pub fn block_ip(&mut self, ip: IpAddr) {
        self.block_list.block(ip);
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.block_list.is_blocked(ip)
    }

    pub fn blocked_count(&self) -> usize {
        self.block_list.len()
    }
}

impl Default for DoSProtection {
    fn default() -> Self {
        Self::new(DoSConfig::default())
    }
}

/// Errors from DoS protection checks
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DoSError {
    #[error("IP is blocked: {0}")]
    IpBlocked(IpAddr),
    #[error("Too many total connections")]
    TooManyConnections,
    #[error("Read filled the whole buffer ({0} bytes)")]
    BufferOverflow(usize),
    #[error("Message flooding")]
    Flooding,
}

impl DoSError {
    /// Abuse errors block the peer IP in addition to dropping it
    pub fn blocks_ip(&self) -> bool {
        matches!(self, DoSError::BufferOverflow(_) | DoSError::Flooding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn test_flood_detector_trips_on_twenty_first_message() {
        let config = DoSConfig::default();
        let mut detector = FloodDetector::new();
        let start = Instant::now();

        for i in 0..20 {
            let now = start + Duration::from_millis(i * 10);
            assert!(detector.log_activity(now, &config), "message {} flagged early", i + 1);
        }
        let now = start + Duration::from_millis(200);
        assert!(!detector.log_activity(now, &config));
        assert_eq!(detector.strikes(), 20);
    }

    #[test]
    fn test_flood_detector_resets_on_slow_message() {
        let config = DoSConfig::default();
        let mut detector = FloodDetector::new();
        let mut now = Instant::now();

        for _ in 0..15 {
            now += Duration::from_millis(5);
            assert!(detector.log_activity(now, &config));
        }
        now += Duration::from_millis(100);
        assert!(detector.log_activity(now, &config));
        assert_eq!(detector.strikes(), 0);
    }

    #[test]
    fn test_block_list_clears_after_interval() {
        let mut list = BlockList::new();
        list.block(test_ip());

        for _ in 0..100 {
            assert!(!list.tick(100));
            assert!(list.is_blocked(test_ip()));
        }
        assert!(list.tick(100));
        assert!(!list.is_blocked(test_ip()));
    }

    #[test]
    fn test_check_connection() {
        let mut dos = DoSProtection::new(DoSConfig {
            max_connections_total: 2,
            ..Default::default()
        });

        assert!(dos.check_connection(test_ip(), 0).is_ok());
        assert_eq!(dos.check_connection(test_ip(), 2), Err(DoSError::TooManyConnections));

        dos.block_ip(test_ip());
        assert_eq!(dos.check_connection(test_ip(), 0), Err(DoSError::IpBlocked(test_ip())));
    }

    #[test]
    fn test_full_read_is_overflow() {
        let dos = DoSProtection::default();
        let mut detector = FloodDetector::new();

        let result = dos.check_read(&mut detector, READ_CHUNK_SIZE, Instant::now());
        assert_eq!(result, Err(DoSError::BufferOverflow(READ_CHUNK_SIZE)));
        assert!(result.unwrap_err().blocks_ip());
        assert!(dos.check_read(&mut detector, 100, Instant::now()).is_ok());
    }
}
