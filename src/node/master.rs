//! Master node controller
//!
//! Authenticates slaves and players on one listener, keeps the slave registry
//! current from `SlaveConfig`, `SyncSession` and `SlaveHealthReport`, and
//! routes players to the healthiest slave or to the slave owning a session.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::metrics::NodeMetrics;
use crate::net::connection::{ClientId, ConnectionTable, Role};
use crate::net::framing::{from_fixed, to_fixed};
use crate::net::protocol::{Decoder, ErrorCode, MasterCommand, Message, NodeEndpoint, SuccessKind};
use crate::net::tcp_server::{DisconnectReason, TcpEvent};
use crate::node::registry::SlaveRegistry;
use crate::session::session::hash_code;

#[derive(Debug, Clone)]
pub struct MasterSettings {
    pub node_id: u32,
    pub master_password: u64,
    pub client_password: u64,
    /// Period of the `ReportHealth` broadcast
    pub health_poll_interval: Duration,
}

pub struct MasterNode {
    settings: MasterSettings,
    connections: ConnectionTable,
    registry: SlaveRegistry,
    metrics: Arc<NodeMetrics>,
    last_health_poll: Option<Instant>,
}

impl MasterNode {
    pub fn new(settings: MasterSettings, metrics: Arc<NodeMetrics>) -> Self {
        Self {
            settings,
            connections: ConnectionTable::new(),
            registry: SlaveRegistry::new(),
            metrics,
            last_health_poll: None,
        }
    }

    pub fn settings(&self) -> &MasterSettings {
        &self.settings
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn connections_mut(&mut self) -> &mut ConnectionTable {
        &mut self.connections
    }

    pub fn registry(&self) -> &SlaveRegistry {
        &self.registry
    }

    pub fn handle_tcp_event(&mut self, event: TcpEvent, _now: Instant) {
        match event {
            TcpEvent::Connected(_) => NodeMetrics::add(&self.metrics.connections_accepted, 1),
            TcpEvent::Data(id, data) => self.handle_data(id, &data),
            TcpEvent::Disconnected(id, reason) => {
                if let DisconnectReason::Abuse(e) = &reason {
                    NodeMetrics::add(&self.metrics.abuse_disconnects, 1);
                    debug!("Client {} dropped for abuse: {}", id, e);
                }
                self.drop_client(id);
            }
        }
    }

    fn handle_data(&mut self, id: ClientId, data: &[u8]) {
        for record in Decoder::new(data) {
            match record {
                Ok(msg) => {
                    NodeMetrics::add(&self.metrics.messages_received, 1);
                    self.dispatch(id, msg);
                }
                Err(e) => {
                    warn!("Closing client {}: {}", id, e);
                    self.connections.close(id);
                }
            }
            if self.connections.get(id).map_or(true, |c| c.is_closing()) {
                break;
            }
        }
    }

    fn dispatch(&mut self, id: ClientId, msg: Message) {
        let Some(role) = self.connections.get(id).map(|c| c.role()) else {
            return;
        };
        match role {
            Role::Unauthenticated => self.authenticate(id, msg),
            Role::SlaveNode => self.handle_slave(id, msg),
            Role::Player => self.handle_player(id, msg),
        }
    }

    fn authenticate(&mut self, id: ClientId, msg: Message) {
        let (role, accepted) = match msg {
            Message::AuthenticateSlave { password, .. } => {
                (Role::SlaveNode, password == self.settings.master_password)
            }
            Message::AuthenticatePlayer { password, .. } => {
                (Role::Player, password == self.settings.client_password)
            }
            other => {
                debug!("Client {} sent {:?} before authenticating", id, other.msg_type());
                NodeMetrics::add(&self.metrics.connections_rejected, 1);
                self.connections.close(id);
                return;
            }
        };

        if !accepted {
            warn!("Client {} failed {:?} authentication", id, role);
            NodeMetrics::add(&self.metrics.auth_failures, 1);
            self.connections.send(id, &Message::Error(ErrorCode::InvalidPassword));
            self.connections.close(id);
            return;
        }

        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        conn.authenticate(role);
        conn.send(&Message::Success(SuccessKind::Authenticated));

        if let (Role::SlaveNode, Message::AuthenticateSlave { slave_id, .. }) = (role, msg) {
            if let Some(stale) = self.registry.register(slave_id, id) {
                warn!("Slave {} re-registered; closing stale connection {}", slave_id, stale);
                self.connections.close(stale);
            }
            info!("Slave {} registered on connection {}", slave_id, id);
            // First rating request; later ones follow the poll interval
            self.connections
                .send(id, &Message::MasterToSlaveCommand(MasterCommand::ReportHealth));
        } else {
            debug!("Player {} authenticated", id);
        }
    }

    fn handle_slave(&mut self, id: ClientId, msg: Message) {
        match msg {
            Message::SlaveConfig(mut endpoint) => {
                if endpoint.hostname[0] == 0 {
                    if let Some(conn) = self.connections.get(id) {
                        endpoint.hostname = to_fixed(&peer_host(conn.peer.ip()));
                    }
                }
                debug!(
                    "Slave {} listens on {}:{}/{}",
                    endpoint.node_id,
                    from_fixed(&endpoint.hostname),
                    endpoint.tcp_port,
                    endpoint.udp_port
                );
                self.registry.set_endpoint(id, endpoint);
            }
            Message::SyncSession(sync) => {
                self.registry.sync_session(id, sync);
            }
            Message::SlaveHealthReport(report) => {
                let best_before = self.registry.best().map(|e| e.slave_id);
                if let Some(rating) = self.registry.update_health(id, report) {
                    debug!("Slave on connection {} rated {:.0}", id, rating);
                }
                let best_after = self.registry.best().map(|e| e.slave_id);
                if best_before != best_after {
                    info!("Preferred slave is now {:?}", best_after);
                }
            }
            other => debug!("Ignoring {:?} from slave connection {}", other.msg_type(), id),
        }
    }

    fn handle_player(&mut self, id: ClientId, msg: Message) {
        let reply = match msg {
            Message::PlayerSlaveNodeRequest => self.route(
                self.registry.best().and_then(|e| e.endpoint),
                ErrorCode::NoSlavesAvailable,
            ),
            Message::JoinPrivateSessionRequest { code } => {
                let hash = hash_code(&from_fixed(&code));
                self.route(
                    self.registry.find_by_code(hash).and_then(|e| e.endpoint),
                    ErrorCode::SessionNotFound,
                )
            }
            Message::JoinPublicSessionRequest { session_id } => self.route(
                self.registry.find_by_session(session_id).and_then(|e| e.endpoint),
                ErrorCode::SessionNotFound,
            ),
            Message::ListSessionsRequest => {
                let list = self.registry.list_public();
                if list.is_empty() {
                    Message::Error(ErrorCode::NoSessionsToList)
                } else {
                    Message::ListSessionsResponse(list)
                }
            }
            other => {
                debug!("Ignoring {:?} from player {}", other.msg_type(), id);
                return;
            }
        };
        self.connections.send(id, &reply);
    }

    fn route(&self, endpoint: Option<NodeEndpoint>, missing: ErrorCode) -> Message {
        match endpoint {
            Some(endpoint) => Message::PlayerSlaveNodeResponse(endpoint),
            None => Message::Error(missing),
        }
    }

    pub fn tick(&mut self, now: Instant) {
        let due = self
            .last_health_poll
            .map_or(true, |last| now.saturating_duration_since(last) >= self.settings.health_poll_interval);
        if due {
            self.last_health_poll = Some(now);
            let slaves = self.registry.slave_clients();
            if !slaves.is_empty() {
                debug!("Requesting health from {} slaves", slaves.len());
                self.connections
                    .send_many(&slaves, &Message::MasterToSlaveCommand(MasterCommand::ReportHealth));
            }
        }

        NodeMetrics::set(&self.metrics.connections_active, self.connections.len() as u64);
        NodeMetrics::set(&self.metrics.slaves_registered, self.registry.len() as u64);
        NodeMetrics::set(&self.metrics.sessions_active, self.registry.session_count() as u64);
    }

    /// Remove connections closed during this tick, after their final flush
    pub fn reap_closed(&mut self) {
        for id in self.connections.closing_ids() {
            self.drop_client(id);
        }
    }

    fn drop_client(&mut self, id: ClientId) {
        let Some(conn) = self.connections.remove(id) else {
            return;
        };
        if let Some(slave_id) = self.registry.remove_client(id) {
            warn!("Slave {} disconnected", slave_id);
        }
        NodeMetrics::add(&self.metrics.bytes_sent, conn.bytes_sent);
        NodeMetrics::add(&self.metrics.bytes_received, conn.bytes_received);
        NodeMetrics::add(&self.metrics.messages_sent, conn.messages_sent);
    }
}

fn peer_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or_else(|| v6.to_string(), |v4| v4.to_string()),
        ip => ip.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::{HealthReport, SessionSync};

    fn master() -> MasterNode {
        MasterNode::new(
            MasterSettings {
                node_id: 0,
                master_password: 11,
                client_password: 22,
                health_poll_interval: Duration::from_secs(5),
            },
            Arc::new(NodeMetrics::new("master")),
        )
    }

    fn sent(master: &mut MasterNode, id: ClientId) -> Vec<Message> {
        let conn = master.connections_mut().get_mut(id).unwrap();
        let out: Vec<Message> = Decoder::new(conn.pending_tcp()).map(|m| m.unwrap()).collect();
        let n = conn.pending_tcp().len();
        conn.consume_tcp(n);
        out
    }

    fn feed(master: &mut MasterNode, id: ClientId, msg: Message) {
        master.handle_tcp_event(TcpEvent::Data(id, msg.encode()), Instant::now());
    }

    fn slave(master: &mut MasterNode, slave_id: u32) -> ClientId {
        let id = master.connections_mut().create("10.1.1.1:5000".parse().unwrap());
        feed(master, id, Message::AuthenticateSlave { slave_id, password: 11 });
        feed(
            master,
            id,
            Message::SlaveConfig(NodeEndpoint {
                node_id: slave_id,
                tcp_port: 7000,
                udp_port: 7001,
                hostname: [0; 64],
            }),
        );
        sent(master, id);
        id
    }

    fn player(master: &mut MasterNode) -> ClientId {
        let id = master.connections_mut().create("10.2.2.2:6000".parse().unwrap());
        feed(master, id, Message::AuthenticatePlayer { password: 22, username: to_fixed("p") });
        sent(master, id);
        id
    }

    #[test]
    fn test_slave_registration_requests_health() {
        let mut master = master();
        let id = master.connections_mut().create("10.1.1.1:5000".parse().unwrap());
        feed(&mut master, id, Message::AuthenticateSlave { slave_id: 4, password: 11 });

        assert_eq!(
            sent(&mut master, id),
            vec![
                Message::Success(SuccessKind::Authenticated),
                Message::MasterToSlaveCommand(MasterCommand::ReportHealth),
            ]
        );
        assert_eq!(master.registry().by_client(id).unwrap().slave_id, 4);
    }

    #[test]
    fn test_wrong_slave_password_is_rejected() {
        let mut master = master();
        let id = master.connections_mut().create("10.1.1.1:5000".parse().unwrap());
        feed(&mut master, id, Message::AuthenticateSlave { slave_id: 4, password: 12 });

        assert_eq!(sent(&mut master, id), vec![Message::Error(ErrorCode::InvalidPassword)]);
        assert!(master.connections().get(id).unwrap().is_closing());
        assert!(master.registry().is_empty());
    }

    #[test]
    fn test_empty_hostname_uses_peer_address() {
        let mut master = master();
        let id = slave(&mut master, 3);
        let endpoint = master.registry().by_client(id).unwrap().endpoint.unwrap();
        assert_eq!(from_fixed(&endpoint.hostname), "10.1.1.1");
    }

    #[test]
    fn test_player_routed_to_best_slave() {
        let mut master = master();
        let p = player(&mut master);
        feed(&mut master, p, Message::PlayerSlaveNodeRequest);
        assert_eq!(sent(&mut master, p), vec![Message::Error(ErrorCode::NoSlavesAvailable)]);

        let a = slave(&mut master, 1);
        let b = slave(&mut master, 2);
        let report = |idle| HealthReport { avg_tick_idle_us: idle, num_good_ticks: 10, ..Default::default() };
        feed(&mut master, a, Message::SlaveHealthReport(report(100)));
        feed(&mut master, b, Message::SlaveHealthReport(report(900)));

        feed(&mut master, p, Message::PlayerSlaveNodeRequest);
        let reply = sent(&mut master, p);
        assert!(matches!(reply[..], [Message::PlayerSlaveNodeResponse(e)] if e.node_id == 2));
    }

    #[test]
    fn test_private_join_routing() {
        let mut master = master();
        let s = slave(&mut master, 1);
        feed(
            &mut master,
            s,
            Message::SyncSession(SessionSync {
                session_id: 0x1_0001,
                code_hash: hash_code("ABCDEFGH"),
                num_players: 1,
                max_players: 8,
                is_private: true,
                state: 0,
            }),
        );

        let p = player(&mut master);
        feed(&mut master, p, Message::JoinPrivateSessionRequest { code: to_fixed("abcdefgh") });
        assert!(matches!(sent(&mut master, p)[..], [Message::PlayerSlaveNodeResponse(e)] if e.node_id == 1));

        feed(&mut master, p, Message::JoinPrivateSessionRequest { code: to_fixed("ZZZZZZZZ") });
        assert_eq!(sent(&mut master, p), vec![Message::Error(ErrorCode::SessionNotFound)]);
    }

    #[test]
    fn test_health_poll_broadcast() {
        let mut master = master();
        let a = slave(&mut master, 1);
        let b = slave(&mut master, 2);
        let now = Instant::now();

        master.tick(now);
        assert_eq!(sent(&mut master, a), vec![Message::MasterToSlaveCommand(MasterCommand::ReportHealth)]);
        assert_eq!(sent(&mut master, b).len(), 1);

        master.tick(now + Duration::from_secs(1));
        assert!(sent(&mut master, a).is_empty());
        master.tick(now + Duration::from_secs(5));
        assert_eq!(sent(&mut master, a).len(), 1);
    }

    #[test]
    fn test_slave_disconnect_forgets_sessions() {
        let mut master = master();
        let s = slave(&mut master, 1);
        master.handle_tcp_event(TcpEvent::Disconnected(s, DisconnectReason::Closed), Instant::now());
        assert!(master.registry().is_empty());
        assert!(master.connections().get(s).is_none());
    }
}
