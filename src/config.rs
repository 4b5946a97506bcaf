use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::dos_protection::DoSConfig;
use crate::node::master::MasterSettings;
use crate::node::slave::SlaveSettings;
use crate::session::{PoolConfig, MAX_NODE_ID, MAX_SESSIONS_PER_NODE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Slave,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Slave => "slave",
        }
    }
}

/// Node configuration, read from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: NodeRole,
    pub node_id: u32,
    /// Hostname advertised to players; empty lets the master use the peer address
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    pub tcp_port: u16,
    /// UDP rendezvous port (slave)
    #[serde(default)]
    pub udp_port: u16,
    #[serde(default)]
    pub master_host: Option<String>,
    #[serde(default)]
    pub master_port: Option<u16>,
    /// Secret slaves present to the master
    pub master_password: u64,
    /// Secret players present to any node
    pub client_password: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_players")]
    pub max_players_per_session: u16,
    /// Ticks per second
    #[serde(default = "default_tick_rate")]
    pub tick_rate: u32,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Master only; falls back to `sync_interval_secs`
    #[serde(default)]
    pub health_poll_interval_secs: Option<u64>,
    #[serde(default = "default_start_countdown")]
    pub start_countdown_ms: u64,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_max_sessions() -> usize {
    64
}

fn default_max_players() -> u16 {
    8
}

fn default_tick_rate() -> u32 {
    60
}

fn default_sync_interval() -> u64 {
    5
}

fn default_start_countdown() -> u64 {
    5000
}

fn default_snapshot_interval() -> u64 {
    1000
}

fn default_max_connections() -> usize {
    10_000
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Read, apply environment overrides, validate
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Override ports and the master endpoint from the environment
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_port("TCP_PORT") {
            self.tcp_port = port;
        }
        if let Some(port) = env_port("UDP_PORT") {
            self.udp_port = port;
        }
        if let Some(port) = env_port("METRICS_PORT") {
            self.metrics_port = Some(port);
        }
        if let Some(port) = env_port("MASTER_PORT") {
            self.master_port = Some(port);
        }
        if let Ok(host) = std::env::var("MASTER_HOST") {
            if host.is_empty() {
                tracing::warn!("MASTER_HOST is empty, keeping configured value");
            } else {
                self.master_host = Some(host);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.tcp_port == 0 {
            return invalid("tcp_port cannot be 0");
        }
        if self.tick_rate == 0 {
            return invalid("tick_rate must be at least 1");
        }
        if self.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        if self.node_id > MAX_NODE_ID {
            return invalid("node_id must be at most 65535");
        }
        if self.role == NodeRole::Slave {
            if self.udp_port == 0 {
                return invalid("udp_port cannot be 0 on a slave");
            }
            if !(1..=MAX_SESSIONS_PER_NODE).contains(&self.max_sessions) {
                return invalid("max_sessions must be 1-65535");
            }
            if !(1..=255).contains(&self.max_players_per_session) {
                return invalid("max_players_per_session must be 1-255");
            }
            if self.master_host.as_deref().map_or(true, str::is_empty) {
                return invalid("slave requires master_host");
            }
            if self.master_port.map_or(true, |p| p == 0) {
                return invalid("slave requires a non-zero master_port");
            }
        }
        Ok(())
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.tcp_port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.udp_port)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn dos_config(&self) -> DoSConfig {
        DoSConfig {
            max_connections_total: self.max_connections,
            ..Default::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_sessions: self.max_sessions,
            max_players: self.max_players_per_session.clamp(1, 255) as u8,
            start_countdown: Duration::from_millis(self.start_countdown_ms),
            snapshot_interval: Duration::from_millis(self.snapshot_interval_ms),
        }
    }

    pub fn slave_settings(&self) -> SlaveSettings {
        SlaveSettings {
            node_id: self.node_id,
            hostname: self.hostname.clone(),
            tcp_port: self.tcp_port,
            udp_port: self.udp_port,
            master_password: self.master_password,
            client_password: self.client_password,
            sync_interval: Duration::from_secs(self.sync_interval_secs.max(1)),
            pool: self.pool_config(),
        }
    }

    pub fn master_settings(&self) -> MasterSettings {
        let poll = self.health_poll_interval_secs.unwrap_or(self.sync_interval_secs);
        MasterSettings {
            node_id: self.node_id,
            master_password: self.master_password,
            client_password: self.client_password,
            health_poll_interval: Duration::from_secs(poll.max(1)),
        }
    }
}

fn env_port(name: &str) -> Option<u16> {
    let value = std::env::var(name).ok()?;
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Some(port),
        Ok(_) => {
            tracing::warn!("{} must be > 0, using configured value", name);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using configured value", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLAVE: &str = r#"{
        "role": "slave",
        "node_id": 2,
        "tcp_port": 7000,
        "udp_port": 7001,
        "master_host": "127.0.0.1",
        "master_port": 6000,
        "master_password": 1234,
        "client_password": 5678
    }"#;

    #[test]
    fn test_defaults_fill_optional_fields() {
        let config = NodeConfig::from_json(SLAVE).unwrap();
        assert_eq!(config.role, NodeRole::Slave);
        assert_eq!(config.max_sessions, 64);
        assert_eq!(config.tick_rate, 60);
        assert_eq!(config.start_countdown_ms, 5000);
        assert!(config.validate().is_ok());

        let master = config.master_settings();
        assert_eq!(master.health_poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_required_field_is_an_error() {
        let result = NodeConfig::from_json(r#"{ "role": "master", "node_id": 0 }"#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validation_rules() {
        let mut config = NodeConfig::from_json(SLAVE).unwrap();
        config.max_players_per_session = 300;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = NodeConfig::from_json(SLAVE).unwrap();
        config.master_host = None;
        assert!(config.validate().is_err());

        // A master needs neither UDP nor a master endpoint
        let mut config = NodeConfig::from_json(SLAVE).unwrap();
        config.role = NodeRole::Master;
        config.udp_port = 0;
        config.master_host = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_node_id_must_fit_session_ids() {
        let mut config = NodeConfig::from_json(SLAVE).unwrap();
        config.node_id = MAX_NODE_ID;
        assert!(config.validate().is_ok());

        config.node_id = MAX_NODE_ID + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.role = NodeRole::Master;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_size_must_fit_session_ids() {
        let mut config = NodeConfig::from_json(SLAVE).unwrap();
        config.max_sessions = MAX_SESSIONS_PER_NODE;
        assert!(config.validate().is_ok());

        config.max_sessions = MAX_SESSIONS_PER_NODE + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.max_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = NodeConfig::from_file(Path::new("/nonexistent/node.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
