//! Slave node controller
//!
//! Owns the player connections, the session pool and the UDP bindings of one
//! worker node, plus the outbound control channel to the master. All entry
//! points are synchronous and driven by the tick loop in `runtime`; nothing
//! here touches a socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::metrics::NodeMetrics;
use crate::net::connection::{ClientId, ConnectionTable, Role};
use crate::net::framing::{from_fixed, to_fixed, FramingError};
use crate::net::protocol::{
    decode_one, Decoder, ErrorCode, JoinAccepted, MasterCommand, Message, NodeEndpoint, ProtocolError,
    SuccessKind, TRANSFORM_LEN, USERNAME_LEN,
};
use crate::net::tcp_server::{DisconnectReason, TcpEvent};
use crate::net::udp_server::{UdpEvent, UdpRendezvous};
use crate::node::stats::HealthSource;
use crate::session::pool::Joined;
use crate::session::session::hash_code;
use crate::session::{
    GameState, PlayerRecord, PoolConfig, SessionError, SessionEvent, SessionId,
    SessionIdAllocator, SessionPool,
};

/// Everything a slave needs to know about itself
#[derive(Debug, Clone)]
pub struct SlaveSettings {
    pub node_id: u32,
    /// Advertised to players through the master
    pub hostname: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub master_password: u64,
    pub client_password: u64,
    /// Period of the full `SyncSession` keepalive
    pub sync_interval: Duration,
    pub pool: PoolConfig,
}

pub struct SlaveNode {
    settings: SlaveSettings,
    connections: ConnectionTable,
    players: FxHashMap<ClientId, PlayerRecord>,
    pool: SessionPool,
    udp: UdpRendezvous,
    health: Box<dyn HealthSource>,
    metrics: Arc<NodeMetrics>,

    master_connected: bool,
    master_out: Vec<u8>,
    /// Partial record carried over between master reads
    master_in: Vec<u8>,
    /// Sessions whose summary changed since the last sync
    dirty: FxHashSet<SessionId>,
    last_full_sync: Option<Instant>,
}

impl SlaveNode {
    pub fn new(settings: SlaveSettings, health: Box<dyn HealthSource>, metrics: Arc<NodeMetrics>) -> Self {
        let mut ids = SessionIdAllocator::new(settings.node_id);
        let pool = SessionPool::new(&settings.pool, &mut ids);
        info!(
            "Slave {} ready with {} sessions of {} players",
            settings.node_id,
            pool.capacity(),
            settings.pool.max_players
        );
        Self {
            settings,
            connections: ConnectionTable::new(),
            players: FxHashMap::default(),
            pool,
            udp: UdpRendezvous::new(),
            health,
            metrics,
            master_connected: false,
            master_out: Vec::new(),
            master_in: Vec::new(),
            dirty: FxHashSet::default(),
            last_full_sync: None,
        }
    }

    pub fn settings(&self) -> &SlaveSettings {
        &self.settings
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn connections_mut(&mut self) -> &mut ConnectionTable {
        &mut self.connections
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn player(&self, client_id: ClientId) -> Option<&PlayerRecord> {
        self.players.get(&client_id)
    }

    pub fn is_master_connected(&self) -> bool {
        self.master_connected
    }

    /// Bytes waiting for the master link
    pub fn master_out_mut(&mut self) -> &mut Vec<u8> {
        &mut self.master_out
    }

    pub fn endpoint(&self) -> NodeEndpoint {
        NodeEndpoint {
            node_id: self.settings.node_id,
            tcp_port: self.settings.tcp_port,
            udp_port: self.settings.udp_port,
            hostname: to_fixed(&self.settings.hostname),
        }
    }

    // ---- player TCP ----

    pub fn handle_tcp_event(&mut self, event: TcpEvent, now: Instant) {
        match event {
            TcpEvent::Connected(_) => NodeMetrics::add(&self.metrics.connections_accepted, 1),
            TcpEvent::Data(id, data) => self.handle_player_data(id, &data, now),
            TcpEvent::Disconnected(id, reason) => {
                if let DisconnectReason::Abuse(_) = reason {
                    NodeMetrics::add(&self.metrics.abuse_disconnects, 1);
                }
                self.drop_client(id);
            }
        }
    }

    fn handle_player_data(&mut self, id: ClientId, data: &[u8], now: Instant) {
        for record in Decoder::new(data) {
            match record {
                Ok(msg) => {
                    NodeMetrics::add(&self.metrics.messages_received, 1);
                    self.dispatch(id, msg, now);
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

    fn dispatch(&mut self, id: ClientId, msg: Message, now: Instant) {
        let Some(role) = self.connections.get(id).map(|c| c.role()) else {
            return;
        };
        match role {
            Role::Unauthenticated => self.authenticate(id, msg),
            Role::Player => self.handle_player(id, msg, now),
            Role::SlaveNode => self.connections.close(id),
        }
    }

    fn authenticate(&mut self, id: ClientId, msg: Message) {
        let Message::AuthenticatePlayer { password, username } = msg else {
            debug!("Client {} sent {:?} before authenticating", id, msg.msg_type());
            NodeMetrics::add(&self.metrics.connections_rejected, 1);
            self.connections.close(id);
            return;
        };
        if password != self.settings.client_password {
            warn!("Client {} failed player authentication", id);
            NodeMetrics::add(&self.metrics.auth_failures, 1);
            self.connections.send(id, &Message::Error(ErrorCode::InvalidPassword));
            self.connections.close(id);
            return;
        }

        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        conn.authenticate(Role::Player);
        let code = conn.udp_code;
        conn.send(&Message::Success(SuccessKind::Authenticated));
        conn.send(&Message::UdpClientConnectionInfo {
            client_id: id,
            code,
            udp_port: self.settings.udp_port,
        });

        let record = PlayerRecord::new(id, username);
        info!("Player {} authenticated as {}", id, record.display_name());
        self.players.insert(id, record);
    }

    fn handle_player(&mut self, id: ClientId, msg: Message, now: Instant) {
        match msg {
            Message::HostSessionRequest { is_private } => self.host(id, is_private),
            Message::JoinPrivateSessionRequest { code } => {
                let hash = hash_code(&from_fixed(&code));
                let username = self.username(id);
                let result = self.pool.join_by_code(id, username, hash);
                self.finish_join(id, result, true);
            }
            Message::JoinPublicSessionRequest { session_id } => {
                let username = self.username(id);
                let result = self.pool.join_by_id(id, username, session_id);
                self.finish_join(id, result, false);
            }
            Message::ListSessionsRequest => {
                let list = self.pool.list_public();
                if list.is_empty() {
                    self.reply_error(id, SessionError::NothingToList);
                } else {
                    self.connections.send(id, &Message::ListSessionsResponse(list));
                }
            }
            Message::LeaveSessionRequest { session_id } => match self.pool.leave(id, session_id) {
                Ok(left) => {
                    self.connections.send(id, &Message::Success(SuccessKind::LeftSession));
                    self.connections.send_many(
                        &left.remaining,
                        &Message::PlayerHasLeftSession { player_index: left.player_index, client_id: id },
                    );
                    self.dirty.insert(left.session_id);
                    debug!("Player {} left session {:#x}", id, left.session_id);
                }
                Err(e) => self.reply_error(id, e),
            },
            Message::StartGameRequest => self.start_game(id, now),
            Message::SetGameRuleInt { rule, value } => self.set_rule(id, rule, value),
            Message::SetItemState { item_id, state } => {
                let Some(session) = self.pool.session_of(id).and_then(|s| self.pool.get(s)) else {
                    return;
                };
                if session.state() == GameState::Running {
                    let others = session.members_except(id);
                    self.connections
                        .send_many(&others, &Message::SetItemState { item_id, state });
                }
            }
            Message::PlayerSyncTimeRequest { client_time_ms } => {
                let reply = self.time_sync(id, client_time_ms, now);
                self.connections.send(id, &reply);
            }
            Message::PlayerPos { transform, .. } => self.update_position(id, transform),
            other => debug!("Ignoring {:?} from player {}", other.msg_type(), id),
        }
    }

    fn username(&self, id: ClientId) -> [u8; USERNAME_LEN] {
        self.players.get(&id).map_or([0; USERNAME_LEN], |p| p.username)
    }

    fn reply_error(&mut self, id: ClientId, error: SessionError) {
        debug!("Player {} request failed: {}", id, error);
        self.connections.send(id, &Message::Error(error.error_code()));
    }

    fn host(&mut self, id: ClientId, is_private: bool) {
        let username = self.username(id);
        match self.pool.host(id, username, is_private) {
            Ok(hosted) => {
                info!(
                    "Player {} hosted {} session {:#x}",
                    id,
                    if is_private { "private" } else { "public" },
                    hosted.session_id
                );
                self.connections.send(
                    id,
                    &Message::HostSessionResponse {
                        session_id: hosted.session_id,
                        code: to_fixed(&hosted.code),
                        max_players: hosted.max_players,
                    },
                );
                self.send_rules(id, hosted.session_id);
                self.dirty.insert(hosted.session_id);
            }
            Err(e) => self.reply_error(id, e),
        }
    }

    fn finish_join(&mut self, id: ClientId, result: Result<Joined, SessionError>, private: bool) {
        let joined = match result {
            Ok(joined) => joined,
            Err(e) => return self.reply_error(id, e),
        };
        let accepted = JoinAccepted {
            session_id: joined.session_id,
            player_index: joined.player_index,
            num_players: joined.num_players,
            max_players: joined.max_players,
        };
        let response = if private {
            Message::JoinPrivateSessionResponse(accepted)
        } else {
            Message::JoinPublicSessionResponse(accepted)
        };
        self.connections.send(id, &response);

        let username = self.username(id);
        self.connections.send_many(
            &joined.existing,
            &Message::PlayerHasJoinedSession { player_index: joined.player_index, client_id: id, username },
        );

        // Current roster, then the rule set
        if let Some(session) = self.pool.get(joined.session_id) {
            let roster: Vec<Message> = session
                .slots()
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.client_id != id)
                .map(|(i, slot)| Message::PlayerHasJoinedSession {
                    player_index: i as u8,
                    client_id: slot.client_id,
                    username: slot.username,
                })
                .collect();
            for msg in &roster {
                self.connections.send(id, msg);
            }
        }
        self.send_rules(id, joined.session_id);

        info!("Player {} joined session {:#x} as {}", id, joined.session_id, joined.player_index);
        self.dirty.insert(joined.session_id);
    }

    fn send_rules(&mut self, id: ClientId, session_id: SessionId) {
        let Some(session) = self.pool.get(session_id) else {
            return;
        };
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        for (rule, value) in session.rules().iter() {
            conn.send(&Message::GameRuleUpdated { rule: rule.index(), value });
        }
    }

    fn start_game(&mut self, id: ClientId, now: Instant) {
        let Some(session_id) = self.pool.session_of(id) else {
            return self.reply_error(id, SessionError::NotInSession);
        };
        let Some(session) = self.pool.get_mut(session_id) else {
            return self.reply_error(id, SessionError::NotFound);
        };
        match session.request_start(id, now) {
            Ok(countdown) => {
                let members = session.members();
                info!("Session {:#x} starting in {:?}", session_id, countdown);
                self.connections.send_many(
                    &members,
                    &Message::GameSessionWillStart { countdown_ms: countdown.as_millis() as u32 },
                );
                self.dirty.insert(session_id);
            }
            Err(e) => self.reply_error(id, e),
        }
    }

    fn set_rule(&mut self, id: ClientId, rule: u16, value: i32) {
        let Some(session_id) = self.pool.session_of(id) else {
            return self.reply_error(id, SessionError::NotInSession);
        };
        let Some(session) = self.pool.get_mut(session_id) else {
            return self.reply_error(id, SessionError::NotFound);
        };
        match session.set_rule(id, rule, value) {
            Ok(rule) => {
                let members = session.members();
                debug!("Session {:#x} rule {:?} = {}", session_id, rule, value);
                self.connections.send(id, &Message::Success(SuccessKind::RuleSet));
                self.connections.send_many(
                    &members,
                    &Message::GameRuleUpdated { rule: rule.index(), value },
                );
            }
            Err(e) => self.reply_error(id, e),
        }
    }

    fn time_sync(&mut self, id: ClientId, client_time_ms: u64, now: Instant) -> Message {
        if let Some(player) = self.players.get_mut(&id) {
            player.last_client_time_ms = Some(client_time_ms);
        }
        let session_time_ms = self
            .pool
            .session_of(id)
            .and_then(|s| self.pool.get(s))
            .map_or(0, |s| s.session_time_ms(now));
        Message::PlayerSyncTimeResponse { client_time_ms, session_time_ms }
    }

    fn update_position(&mut self, id: ClientId, transform: [u8; TRANSFORM_LEN]) {
        if let Some(session) = self.pool.session_of(id).and_then(|s| self.pool.get_mut(s)) {
            session.update_position(id, transform);
        }
    }

    // ---- player UDP ----

    pub fn handle_datagram(&mut self, from: std::net::SocketAddr, data: &[u8], now: Instant) {
        NodeMetrics::add(&self.metrics.datagrams_received, 1);
        match self.udp.handle_datagram(&mut self.connections, from, data) {
            Some(UdpEvent::Bound(id)) => debug!("Player {} completed UDP rendezvous", id),
            Some(UdpEvent::Messages(id, messages)) => {
                for msg in messages {
                    match msg {
                        Message::PlayerPos { transform, .. } => self.update_position(id, transform),
                        Message::PlayerSyncTimeRequest { client_time_ms } => {
                            let reply = self.time_sync(id, client_time_ms, now);
                            self.connections.send_udp(id, &reply);
                        }
                        other => debug!("Ignoring {:?} datagram from player {}", other.msg_type(), id),
                    }
                }
            }
            None => {}
        }
    }

    // ---- master link ----

    /// Start (or restart) the handshake on a fresh master connection
    pub fn on_master_connected(&mut self, now: Instant) {
        self.master_connected = true;
        self.master_out.clear();
        self.master_in.clear();
        NodeMetrics::set(&self.metrics.master_connected, 1);

        self.queue_master(&Message::AuthenticateSlave {
            slave_id: self.settings.node_id,
            password: self.settings.master_password,
        });
        self.queue_master(&Message::SlaveConfig(self.endpoint()));
        self.sync_all();
        self.last_full_sync = Some(now);
        info!("Sent handshake to master with {} active sessions", self.pool.active_count());
    }

    pub fn on_master_disconnected(&mut self) {
        if self.master_connected {
            warn!("Master link down; will re-handshake on reconnect");
        }
        self.master_connected = false;
        self.master_out.clear();
        self.master_in.clear();
        NodeMetrics::set(&self.metrics.master_connected, 0);
    }

    pub fn on_master_data(&mut self, data: &[u8]) {
        self.master_in.extend_from_slice(data);
        let mut offset = 0;
        while offset < self.master_in.len() {
            match decode_one(&self.master_in[offset..]) {
                Ok((msg, used)) => {
                    offset += used;
                    self.handle_master(msg);
                }
                Err(ProtocolError::Framing(FramingError::Truncated { .. })) => break,
                Err(e) => {
                    warn!("Discarding master data: {}", e);
                    offset = self.master_in.len();
                }
            }
        }
        self.master_in.drain(..offset);
    }

    fn handle_master(&mut self, msg: Message) {
        match msg {
            Message::MasterToSlaveCommand(MasterCommand::ReportHealth) => {
                let snapshot = self.health.gather();
                let report = snapshot.to_report(self.pool.player_count() as u32);
                debug!(
                    "Health report: idle {}us, {} good / {} lag ticks",
                    report.avg_tick_idle_us, report.num_good_ticks, report.num_lag_ticks
                );
                self.queue_master(&Message::SlaveHealthReport(report));
            }
            Message::Error(code) => warn!("Master replied with error {:?}", code),
            Message::Success(kind) => debug!("Master acknowledged: {:?}", kind),
            other => debug!("Ignoring {:?} from master", other.msg_type()),
        }
    }

    fn queue_master(&mut self, msg: &Message) {
        if self.master_connected {
            msg.encode_into(&mut self.master_out);
        }
    }

    fn sync_all(&mut self) {
        let syncs: Vec<Message> = self.pool.occupied().map(|s| Message::SyncSession(s.sync())).collect();
        for msg in &syncs {
            self.queue_master(msg);
        }
        self.dirty.clear();
    }

    // ---- tick ----

    pub fn tick(&mut self, now: Instant) {
        for event in self.pool.tick(now) {
            match event.event {
                SessionEvent::Started { duration_ms } => {
                    info!("Session {:#x} started", event.session_id);
                    self.connections
                        .send_many(&event.members, &Message::GameSessionHasStarted { duration_ms });
                    self.dirty.insert(event.session_id);
                }
                SessionEvent::Snapshot { game_time_ms, entries } => {
                    let snapshot = Message::SessionSnapshot {
                        session_id: event.session_id,
                        game_time_ms,
                        entries,
                    };
                    self.connections.send_udp_many(&event.members, &snapshot);
                }
                SessionEvent::Ended { elapsed_ms } => {
                    info!("Session {:#x} ended after {}ms", event.session_id, elapsed_ms);
                    self.connections
                        .send_many(&event.members, &Message::GameSessionHasEnded { elapsed_ms });
                    self.dirty.insert(event.session_id);
                }
            }
        }

        let keepalive_due = self
            .last_full_sync
            .map_or(true, |last| now.saturating_duration_since(last) >= self.settings.sync_interval);
        if self.master_connected && keepalive_due {
            self.sync_all();
            self.last_full_sync = Some(now);
        }

        let dirty: Vec<SessionId> = self.dirty.drain().collect();
        for session_id in dirty {
            if let Some(sync) = self.pool.get(session_id).map(|s| s.sync()) {
                self.queue_master(&Message::SyncSession(sync));
            }
        }

        NodeMetrics::set(&self.metrics.connections_active, self.connections.len() as u64);
        NodeMetrics::set(&self.metrics.sessions_active, self.pool.active_count() as u64);
        NodeMetrics::set(&self.metrics.players, self.pool.player_count() as u64);
    }

    pub fn record_tick_idle(&mut self, idle_us: i64) {
        self.health.record_tick_idle(idle_us);
    }

    // ---- teardown ----

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
        if let Some(addr) = conn.udp_addr() {
            self.udp.release(&addr);
        }
        self.players.remove(&id);

        if let Some(left) = self.pool.leave_any(id) {
            self.connections.send_many(
                &left.remaining,
                &Message::PlayerHasLeftSession { player_index: left.player_index, client_id: id },
            );
            self.dirty.insert(left.session_id);
        }
        NodeMetrics::add(&self.metrics.bytes_sent, conn.bytes_sent);
        NodeMetrics::add(&self.metrics.bytes_received, conn.bytes_received);
        NodeMetrics::add(&self.metrics.messages_sent, conn.messages_sent);
        debug!("Client {} removed", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::stats::ProcessStats;

    fn settings() -> SlaveSettings {
        SlaveSettings {
            node_id: 1,
            hostname: "slave-1".into(),
            tcp_port: 7000,
            udp_port: 7001,
            master_password: 11,
            client_password: 22,
            sync_interval: Duration::from_secs(10),
            pool: PoolConfig {
                max_sessions: 2,
                max_players: 4,
                start_countdown: Duration::from_secs(5),
                snapshot_interval: Duration::from_secs(1),
            },
        }
    }

    fn node() -> SlaveNode {
        SlaveNode::new(settings(), Box::new(ProcessStats::new()), Arc::new(NodeMetrics::new("slave")))
    }

    fn sent(node: &mut SlaveNode, id: ClientId) -> Vec<Message> {
        let conn = node.connections_mut().get_mut(id).unwrap();
        let out: Vec<Message> = Decoder::new(conn.pending_tcp()).map(|m| m.unwrap()).collect();
        let n = conn.pending_tcp().len();
        conn.consume_tcp(n);
        out
    }

    fn connect(node: &mut SlaveNode, password: u64) -> ClientId {
        let id = node.connections_mut().create("127.0.0.1:4000".parse().unwrap());
        let now = Instant::now();
        node.handle_tcp_event(TcpEvent::Connected(id), now);
        let auth = Message::AuthenticatePlayer { password, username: to_fixed("p") }.encode();
        node.handle_tcp_event(TcpEvent::Data(id, auth), now);
        id
    }

    #[test]
    fn test_authentication_sends_rendezvous_info() {
        let mut node = node();
        let id = connect(&mut node, 22);
        let code = node.connections().get(id).unwrap().udp_code;

        assert_eq!(
            sent(&mut node, id),
            vec![
                Message::Success(SuccessKind::Authenticated),
                Message::UdpClientConnectionInfo { client_id: id, code, udp_port: 7001 },
            ]
        );
        assert!(node.player(id).is_some());
    }

    #[test]
    fn test_non_auth_first_message_closes_silently() {
        let mut node = node();
        let id = node.connections_mut().create("127.0.0.1:4000".parse().unwrap());
        node.handle_tcp_event(TcpEvent::Data(id, Message::ListSessionsRequest.encode()), Instant::now());

        assert!(node.connections().get(id).unwrap().is_closing());
        assert!(sent(&mut node, id).is_empty());
    }

    #[test]
    fn test_truncated_record_closes_connection() {
        let mut node = node();
        let id = connect(&mut node, 22);
        sent(&mut node, id);

        let mut data = Message::ListSessionsRequest.encode();
        data.extend_from_slice(&[18, 1]);
        node.handle_tcp_event(TcpEvent::Data(id, data), Instant::now());

        assert!(node.connections().get(id).unwrap().is_closing());
    }

    #[test]
    fn test_master_handshake_and_health_report() {
        let mut node = node();
        let host = connect(&mut node, 22);
        node.handle_tcp_event(TcpEvent::Data(host, Message::HostSessionRequest { is_private: true }.encode()), Instant::now());

        node.on_master_connected(Instant::now());
        let queued: Vec<Message> = Decoder::new(node.master_out_mut()).map(|m| m.unwrap()).collect();
        assert_eq!(queued[0], Message::AuthenticateSlave { slave_id: 1, password: 11 });
        assert_eq!(queued[1], Message::SlaveConfig(node.endpoint()));
        assert!(matches!(queued[2], Message::SyncSession(s) if s.num_players == 1 && s.is_private));
        node.master_out_mut().clear();

        // Command split across two reads
        let cmd = Message::MasterToSlaveCommand(MasterCommand::ReportHealth).encode();
        node.on_master_data(&cmd[..1]);
        assert!(node.master_out_mut().is_empty());
        node.on_master_data(&cmd[1..]);

        let queued: Vec<Message> = Decoder::new(node.master_out_mut()).map(|m| m.unwrap()).collect();
        assert!(matches!(queued[..], [Message::SlaveHealthReport(r)] if r.num_players == 1));
    }

    #[test]
    fn test_repeated_health_requests_keep_tick_totals() {
        let mut node = node();
        node.on_master_connected(Instant::now());
        node.master_out_mut().clear();
        for idle_us in [4000, 2500, -300, 1200] {
            node.record_tick_idle(idle_us);
        }

        // Both commands in one read, no traffic in between
        let mut cmds = Message::MasterToSlaveCommand(MasterCommand::ReportHealth).encode();
        Message::MasterToSlaveCommand(MasterCommand::ReportHealth).encode_into(&mut cmds);
        node.on_master_data(&cmds);

        let reports: Vec<_> = Decoder::new(node.master_out_mut())
            .map(|m| match m.unwrap() {
                Message::SlaveHealthReport(r) => r,
                other => panic!("expected a health report, got {:?}", other),
            })
            .collect();
        assert_eq!(reports.len(), 2);
        let totals: Vec<u64> = reports.iter().map(|r| r.num_good_ticks + r.num_lag_ticks).collect();
        assert_eq!(totals[0], 4);
        assert!(totals[1] >= totals[0]);
        assert_eq!(reports[0].avg_tick_idle_us, reports[1].avg_tick_idle_us);
        assert_eq!(reports[0].num_lag_ticks, 1);
    }

    #[test]
    fn test_disconnect_leaves_session_and_notifies() {
        let mut node = node();
        let now = Instant::now();
        let a = connect(&mut node, 22);
        let b = connect(&mut node, 22);
        node.handle_tcp_event(TcpEvent::Data(a, Message::HostSessionRequest { is_private: false }.encode()), now);
        let session_id = node.pool().session_of(a).unwrap();
        node.handle_tcp_event(TcpEvent::Data(b, Message::JoinPublicSessionRequest { session_id }.encode()), now);
        sent(&mut node, b);

        node.handle_tcp_event(TcpEvent::Disconnected(a, DisconnectReason::Closed), now);
        assert!(node.connections().get(a).is_none());
        assert_eq!(
            sent(&mut node, b),
            vec![Message::PlayerHasLeftSession { player_index: 0, client_id: a }]
        );
        assert_eq!(node.pool().get(session_id).unwrap().owner(), Some(b));
    }
}
