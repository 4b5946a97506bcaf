//! Wire protocol shared by master, slave and player roles
//!
//! Every record starts with a one-byte [`MsgType`] followed by a packed,
//! little-endian body whose size is implied by the type. The only
//! variable-sized records are the two list packets, which carry their own
//! entry count. There is no per-message length prefix, so a receiver that
//! meets an unknown type byte or a short record cannot resynchronise and
//! must stop reading the buffer.

use crate::net::framing::{FrameBuilder, FrameReader, FramingError};

pub const USERNAME_LEN: usize = 64;
pub const HOSTNAME_LEN: usize = 64;
pub const SESSION_CODE_LEN: usize = 16;
pub const TRANSFORM_LEN: usize = 13;
/// Largest entry count a list record can describe
pub const MAX_LIST_ENTRIES: usize = u8::MAX as usize;

/// One-byte type discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Success = 0,
    Error = 1,
    AuthenticatePlayer = 2,
    AuthenticateSlave = 3,
    SlaveConfig = 4,
    SyncSession = 5,
    SlaveHealthReport = 6,
    MasterToSlaveCommand = 7,
    PlayerSlaveNodeRequest = 8,
    PlayerSlaveNodeResponse = 9,
    HostSessionRequest = 10,
    HostSessionResponse = 11,
    JoinPrivateSessionRequest = 12,
    JoinPrivateSessionResponse = 13,
    JoinPublicSessionRequest = 14,
    JoinPublicSessionResponse = 15,
    ListSessionsRequest = 16,
    ListSessionsResponse = 17,
    LeaveSessionRequest = 18,
    PlayerHasJoinedSession = 19,
    PlayerHasLeftSession = 20,
    UdpEstablish = 21,
    UdpClientConnectionInfo = 22,
    PlayerPos = 23,
    PlayerSyncTimeRequest = 24,
    PlayerSyncTimeResponse = 25,
    StartGameRequest = 26,
    GameSessionWillStart = 27,
    GameSessionHasStarted = 28,
    GameSessionHasEnded = 29,
    SessionSnapshot = 30,
    SetItemState = 31,
    SetGameRuleInt = 32,
    GameRuleUpdated = 33,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use MsgType::*;
        Some(match value {
            0 => Success,
            1 => Error,
            2 => AuthenticatePlayer,
            3 => AuthenticateSlave,
            4 => SlaveConfig,
            5 => SyncSession,
            6 => SlaveHealthReport,
            7 => MasterToSlaveCommand,
            8 => PlayerSlaveNodeRequest,
            9 => PlayerSlaveNodeResponse,
            10 => HostSessionRequest,
            11 => HostSessionResponse,
            12 => JoinPrivateSessionRequest,
            13 => JoinPrivateSessionResponse,
            14 => JoinPublicSessionRequest,
            15 => JoinPublicSessionResponse,
            16 => ListSessionsRequest,
            17 => ListSessionsResponse,
            18 => LeaveSessionRequest,
            19 => PlayerHasJoinedSession,
            20 => PlayerHasLeftSession,
            21 => UdpEstablish,
            22 => UdpClientConnectionInfo,
            23 => PlayerPos,
            24 => PlayerSyncTimeRequest,
            25 => PlayerSyncTimeResponse,
            26 => StartGameRequest,
            27 => GameSessionWillStart,
            28 => GameSessionHasStarted,
            29 => GameSessionHasEnded,
            30 => SessionSnapshot,
            31 => SetItemState,
            32 => SetGameRuleInt,
            33 => GameRuleUpdated,
            _ => return None,
        })
    }

    /// Body size after the type byte, `None` for self-describing lists
    pub fn body_size(self) -> Option<usize> {
        use MsgType::*;
        Some(match self {
            Success | Error | MasterToSlaveCommand | HostSessionRequest => 1,
            AuthenticatePlayer => 8 + USERNAME_LEN,
            AuthenticateSlave => 4 + 8,
            SlaveConfig | PlayerSlaveNodeResponse => 4 + 2 + 2 + HOSTNAME_LEN,
            SyncSession => 4 + 8 + 4,
            SlaveHealthReport => 2 + 2 + 8 + 2 + 8 + 8 + 4,
            PlayerSlaveNodeRequest | ListSessionsRequest | StartGameRequest => 0,
            HostSessionResponse => 4 + SESSION_CODE_LEN + 1,
            JoinPrivateSessionRequest => SESSION_CODE_LEN,
            JoinPrivateSessionResponse | JoinPublicSessionResponse => 4 + 3,
            JoinPublicSessionRequest | LeaveSessionRequest => 4,
            PlayerHasJoinedSession => 1 + 4 + USERNAME_LEN,
            PlayerHasLeftSession => 1 + 4,
            UdpEstablish => 4 + 2,
            UdpClientConnectionInfo => 4 + 2 + 2,
            PlayerPos => 1 + TRANSFORM_LEN,
            PlayerSyncTimeRequest => 8,
            PlayerSyncTimeResponse => 16,
            GameSessionWillStart | GameSessionHasStarted | GameSessionHasEnded => 4,
            SetItemState => 3,
            SetGameRuleInt | GameRuleUpdated => 6,
            ListSessionsResponse | SessionSnapshot => return None,
        })
    }
}

/// Sub-code carried by an `Error` record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    SessionNotFound = 1,
    SessionIsFull = 2,
    NoAvailableSessions = 3,
    AlreadyHaveSession = 4,
    NoSlavesAvailable = 5,
    NoSessionsToList = 6,
    InvalidPassword = 7,
    NotInSession = 8,
    NotSessionOwner = 9,
    NotEnoughPlayers = 10,
    GameInProgress = 11,
    InvalidRule = 12,
}

impl ErrorCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        use ErrorCode::*;
        Some(match value {
            1 => SessionNotFound,
            2 => SessionIsFull,
            3 => NoAvailableSessions,
            4 => AlreadyHaveSession,
            5 => NoSlavesAvailable,
            6 => NoSessionsToList,
            7 => InvalidPassword,
            8 => NotInSession,
            9 => NotSessionOwner,
            10 => NotEnoughPlayers,
            11 => GameInProgress,
            12 => InvalidRule,
            _ => return None,
        })
    }
}

/// What a `Success` record acknowledges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SuccessKind {
    Authenticated = 1,
    LeftSession = 2,
    RuleSet = 3,
}

impl SuccessKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Authenticated),
            2 => Some(Self::LeftSession),
            3 => Some(Self::RuleSet),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MasterCommand {
    ReportHealth = 1,
}

impl MasterCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ReportHealth),
            _ => None,
        }
    }
}

/// Reachable address of a slave node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEndpoint {
    pub node_id: u32,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub hostname: [u8; HOSTNAME_LEN],
}

/// Session summary a slave keeps the master informed of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSync {
    pub session_id: u32,
    pub code_hash: u64,
    pub num_players: u8,
    pub max_players: u8,
    pub is_private: bool,
    pub state: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthReport {
    pub pct_ram_used: u16,
    /// Share of ticks that overran their budget, in percent
    pub pct_lag_ticks: u16,
    pub avg_tick_idle_us: i64,
    pub pct_cpu: u16,
    pub num_good_ticks: u64,
    pub num_lag_ticks: u64,
    pub num_players: u32,
}

/// Shared body of both join responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinAccepted {
    pub session_id: u32,
    pub player_index: u8,
    pub num_players: u8,
    pub max_players: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionListEntry {
    pub session_id: u32,
    pub num_players: u8,
    pub max_players: u8,
    pub state: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub player_index: u8,
    pub transform: [u8; TRANSFORM_LEN],
}

/// Every record understood by the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Success(SuccessKind),
    Error(ErrorCode),
    AuthenticatePlayer { password: u64, username: [u8; USERNAME_LEN] },
    AuthenticateSlave { slave_id: u32, password: u64 },
    SlaveConfig(NodeEndpoint),
    SyncSession(SessionSync),
    SlaveHealthReport(HealthReport),
    MasterToSlaveCommand(MasterCommand),
    PlayerSlaveNodeRequest,
    PlayerSlaveNodeResponse(NodeEndpoint),
    HostSessionRequest { is_private: bool },
    HostSessionResponse { session_id: u32, code: [u8; SESSION_CODE_LEN], max_players: u8 },
    JoinPrivateSessionRequest { code: [u8; SESSION_CODE_LEN] },
    JoinPrivateSessionResponse(JoinAccepted),
    JoinPublicSessionRequest { session_id: u32 },
    JoinPublicSessionResponse(JoinAccepted),
    ListSessionsRequest,
    /// Encoded with at most [`MAX_LIST_ENTRIES`] entries
    ListSessionsResponse(Vec<SessionListEntry>),
    LeaveSessionRequest { session_id: u32 },
    PlayerHasJoinedSession { player_index: u8, client_id: u32, username: [u8; USERNAME_LEN] },
    PlayerHasLeftSession { player_index: u8, client_id: u32 },
    UdpEstablish { client_id: u32, code: u16 },
    UdpClientConnectionInfo { client_id: u32, code: u16, udp_port: u16 },
    PlayerPos { player_index: u8, transform: [u8; TRANSFORM_LEN] },
    PlayerSyncTimeRequest { client_time_ms: u64 },
    PlayerSyncTimeResponse { client_time_ms: u64, session_time_ms: u64 },
    StartGameRequest,
    GameSessionWillStart { countdown_ms: u32 },
    GameSessionHasStarted { duration_ms: u32 },
    GameSessionHasEnded { elapsed_ms: u32 },
    /// Encoded with at most [`MAX_LIST_ENTRIES`] entries
    SessionSnapshot { session_id: u32, game_time_ms: u32, entries: Vec<SnapshotEntry> },
    SetItemState { item_id: u16, state: u8 },
    SetGameRuleInt { rule: u16, value: i32 },
    GameRuleUpdated { rule: u16, value: i32 },
}

/// Errors that can occur while decoding a record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownType(u8),
    #[error("Invalid {field} value: {value}")]
    InvalidField { field: &'static str, value: u8 },
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),
}

fn write_endpoint(b: FrameBuilder, ep: &NodeEndpoint) -> FrameBuilder {
    b.write_u32(ep.node_id)
        .write_u16(ep.tcp_port)
        .write_u16(ep.udp_port)
        .write(&ep.hostname)
}

fn read_endpoint(r: &mut FrameReader<'_>) -> Result<NodeEndpoint, FramingError> {
    Ok(NodeEndpoint {
        node_id: r.read_u32()?,
        tcp_port: r.read_u16()?,
        udp_port: r.read_u16()?,
        hostname: r.read_array()?,
    })
}

fn write_join(b: FrameBuilder, join: &JoinAccepted) -> FrameBuilder {
    b.write_u32(join.session_id)
        .write_u8(join.player_index)
        .write_u8(join.num_players)
        .write_u8(join.max_players)
}

fn read_join(r: &mut FrameReader<'_>) -> Result<JoinAccepted, FramingError> {
    Ok(JoinAccepted {
        session_id: r.read_u32()?,
        player_index: r.read_u8()?,
        num_players: r.read_u8()?,
        max_players: r.read_u8()?,
    })
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Success(_) => MsgType::Success,
            Message::Error(_) => MsgType::Error,
            Message::AuthenticatePlayer { .. } => MsgType::AuthenticatePlayer,
            Message::AuthenticateSlave { .. } => MsgType::AuthenticateSlave,
            Message::SlaveConfig(_) => MsgType::SlaveConfig,
            Message::SyncSession(_) => MsgType::SyncSession,
            Message::SlaveHealthReport(_) => MsgType::SlaveHealthReport,
            Message::MasterToSlaveCommand(_) => MsgType::MasterToSlaveCommand,
            Message::PlayerSlaveNodeRequest => MsgType::PlayerSlaveNodeRequest,
            Message::PlayerSlaveNodeResponse(_) => MsgType::PlayerSlaveNodeResponse,
            Message::HostSessionRequest { .. } => MsgType::HostSessionRequest,
            Message::HostSessionResponse { .. } => MsgType::HostSessionResponse,
            Message::JoinPrivateSessionRequest { .. } => MsgType::JoinPrivateSessionRequest,
            Message::JoinPrivateSessionResponse(_) => MsgType::JoinPrivateSessionResponse,
            Message::JoinPublicSessionRequest { .. } => MsgType::JoinPublicSessionRequest,
            Message::JoinPublicSessionResponse(_) => MsgType::JoinPublicSessionResponse,
            Message::ListSessionsRequest => MsgType::ListSessionsRequest,
            Message::ListSessionsResponse(_) => MsgType::ListSessionsResponse,
            Message::LeaveSessionRequest { .. } => MsgType::LeaveSessionRequest,
            Message::PlayerHasJoinedSession { .. } => MsgType::PlayerHasJoinedSession,
            Message::PlayerHasLeftSession { .. } => MsgType::PlayerHasLeftSession,
            Message::UdpEstablish { .. } => MsgType::UdpEstablish,
            Message::UdpClientConnectionInfo { .. } => MsgType::UdpClientConnectionInfo,
            Message::PlayerPos { .. } => MsgType::PlayerPos,
            Message::PlayerSyncTimeRequest { .. } => MsgType::PlayerSyncTimeRequest,
            Message::PlayerSyncTimeResponse { .. } => MsgType::PlayerSyncTimeResponse,
            Message::StartGameRequest => MsgType::StartGameRequest,
            Message::GameSessionWillStart { .. } => MsgType::GameSessionWillStart,
            Message::GameSessionHasStarted { .. } => MsgType::GameSessionHasStarted,
            Message::GameSessionHasEnded { .. } => MsgType::GameSessionHasEnded,
            Message::SessionSnapshot { .. } => MsgType::SessionSnapshot,
            Message::SetItemState { .. } => MsgType::SetItemState,
            Message::SetGameRuleInt { .. } => MsgType::SetGameRuleInt,
            Message::GameRuleUpdated { .. } => MsgType::GameRuleUpdated,
        }
    }

    /// Encoded size in bytes, type byte included
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            Message::ListSessionsResponse(entries) => 1 + 7 * entries.len().min(MAX_LIST_ENTRIES),
            Message::SessionSnapshot { entries, .. } => {
                4 + 4 + 1 + (1 + TRANSFORM_LEN) * entries.len().min(MAX_LIST_ENTRIES)
            }
            other => other.msg_type().body_size().unwrap_or(0),
        };
        1 + body
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Append the packed record to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let b = FrameBuilder::with_capacity(self.encoded_len()).write_u8(self.msg_type() as u8);
        let b = match self {
            Message::Success(kind) => b.write_u8(*kind as u8),
            Message::Error(code) => b.write_u8(*code as u8),
            Message::AuthenticatePlayer { password, username } => {
                b.write_u64(*password).write(username)
            }
            Message::AuthenticateSlave { slave_id, password } => {
                b.write_u32(*slave_id).write_u64(*password)
            }
            Message::SlaveConfig(ep) | Message::PlayerSlaveNodeResponse(ep) => write_endpoint(b, ep),
            Message::SyncSession(sync) => b
                .write_u32(sync.session_id)
                .write_u64(sync.code_hash)
                .write_u8(sync.num_players)
                .write_u8(sync.max_players)
                .write_u8(sync.is_private as u8)
                .write_u8(sync.state),
            Message::SlaveHealthReport(h) => b
                .write_u16(h.pct_ram_used)
                .write_u16(h.pct_lag_ticks)
                .write_i64(h.avg_tick_idle_us)
                .write_u16(h.pct_cpu)
                .write_u64(h.num_good_ticks)
                .write_u64(h.num_lag_ticks)
                .write_u32(h.num_players),
            Message::MasterToSlaveCommand(cmd) => b.write_u8(*cmd as u8),
            Message::PlayerSlaveNodeRequest
            | Message::ListSessionsRequest
            | Message::StartGameRequest => b,
            Message::HostSessionRequest { is_private } => b.write_u8(*is_private as u8),
            Message::HostSessionResponse { session_id, code, max_players } => {
                b.write_u32(*session_id).write(code).write_u8(*max_players)
            }
            Message::JoinPrivateSessionRequest { code } => b.write(code),
            Message::JoinPrivateSessionResponse(join) | Message::JoinPublicSessionResponse(join) => {
                write_join(b, join)
            }
            Message::JoinPublicSessionRequest { session_id }
            | Message::LeaveSessionRequest { session_id } => b.write_u32(*session_id),
            Message::ListSessionsResponse(entries) => {
                let count = entries.len().min(MAX_LIST_ENTRIES);
                let mut b = b.write_u8(count as u8);
                for e in &entries[..count] {
                    b = b
                        .write_u32(e.session_id)
                        .write_u8(e.num_players)
                        .write_u8(e.max_players)
                        .write_u8(e.state);
                }
                b
            }
            Message::PlayerHasJoinedSession { player_index, client_id, username } => b
                .write_u8(*player_index)
                .write_u32(*client_id)
                .write(username),
            Message::PlayerHasLeftSession { player_index, client_id } => {
                b.write_u8(*player_index).write_u32(*client_id)
            }
            Message::UdpEstablish { client_id, code } => b.write_u32(*client_id).write_u16(*code),
            Message::UdpClientConnectionInfo { client_id, code, udp_port } => b
                .write_u32(*client_id)
                .write_u16(*code)
                .write_u16(*udp_port),
            Message::PlayerPos { player_index, transform } => {
                b.write_u8(*player_index).write(transform)
            }
            Message::PlayerSyncTimeRequest { client_time_ms } => b.write_u64(*client_time_ms),
            Message::PlayerSyncTimeResponse { client_time_ms, session_time_ms } => {
                b.write_u64(*client_time_ms).write_u64(*session_time_ms)
            }
            Message::GameSessionWillStart { countdown_ms } => b.write_u32(*countdown_ms),
            Message::GameSessionHasStarted { duration_ms } => b.write_u32(*duration_ms),
            Message::GameSessionHasEnded { elapsed_ms } => b.write_u32(*elapsed_ms),
            Message::SessionSnapshot { session_id, game_time_ms, entries } => {
                let count = entries.len().min(MAX_LIST_ENTRIES);
                let mut b = b
                    .write_u32(*session_id)
                    .write_u32(*game_time_ms)
                    .write_u8(count as u8);
                for e in &entries[..count] {
                    b = b.write_u8(e.player_index).write(&e.transform);
                }
                b
            }
            Message::SetItemState { item_id, state } => b.write_u16(*item_id).write_u8(*state),
            Message::SetGameRuleInt { rule, value } | Message::GameRuleUpdated { rule, value } => {
                b.write_u16(*rule).write_i32(*value)
            }
        };
        b.build_into(out);
    }
}

/// Decode the first record in `data`, returning it and the bytes consumed
pub fn decode_one(data: &[u8]) -> Result<(Message, usize), ProtocolError> {
    let mut r = FrameReader::new(data);
    let tag = r.read_u8()?;
    let msg_type = MsgType::from_u8(tag).ok_or(ProtocolError::UnknownType(tag))?;

    let msg = match msg_type {
        MsgType::Success => {
            let v = r.read_u8()?;
            Message::Success(
                SuccessKind::from_u8(v)
                    .ok_or(ProtocolError::InvalidField { field: "success kind", value: v })?,
            )
        }
        MsgType::Error => {
            let v = r.read_u8()?;
            Message::Error(
                ErrorCode::from_u8(v)
                    .ok_or(ProtocolError::InvalidField { field: "error code", value: v })?,
            )
        }
        MsgType::AuthenticatePlayer => Message::AuthenticatePlayer {
            password: r.read_u64()?,
            username: r.read_array()?,
        },
        MsgType::AuthenticateSlave => Message::AuthenticateSlave {
            slave_id: r.read_u32()?,
            password: r.read_u64()?,
        },
        MsgType::SlaveConfig => Message::SlaveConfig(read_endpoint(&mut r)?),
        MsgType::SyncSession => Message::SyncSession(SessionSync {
            session_id: r.read_u32()?,
            code_hash: r.read_u64()?,
            num_players: r.read_u8()?,
            max_players: r.read_u8()?,
            is_private: r.read_u8()? != 0,
            state: r.read_u8()?,
        }),
        MsgType::SlaveHealthReport => Message::SlaveHealthReport(HealthReport {
            pct_ram_used: r.read_u16()?,
            pct_lag_ticks: r.read_u16()?,
            avg_tick_idle_us: r.read_i64()?,
            pct_cpu: r.read_u16()?,
            num_good_ticks: r.read_u64()?,
            num_lag_ticks: r.read_u64()?,
            num_players: r.read_u32()?,
        }),
        MsgType::MasterToSlaveCommand => {
            let v = r.read_u8()?;
            Message::MasterToSlaveCommand(
                MasterCommand::from_u8(v)
                    .ok_or(ProtocolError::InvalidField { field: "master command", value: v })?,
            )
        }
        MsgType::PlayerSlaveNodeRequest => Message::PlayerSlaveNodeRequest,
        MsgType::PlayerSlaveNodeResponse => Message::PlayerSlaveNodeResponse(read_endpoint(&mut r)?),
        MsgType::HostSessionRequest => Message::HostSessionRequest {
            is_private: r.read_u8()? != 0,
        },
        MsgType::HostSessionResponse => Message::HostSessionResponse {
            session_id: r.read_u32()?,
            code: r.read_array()?,
            max_players: r.read_u8()?,
        },
        MsgType::JoinPrivateSessionRequest => Message::JoinPrivateSessionRequest {
            code: r.read_array()?,
        },
        MsgType::JoinPrivateSessionResponse => Message::JoinPrivateSessionResponse(read_join(&mut r)?),
        MsgType::JoinPublicSessionRequest => Message::JoinPublicSessionRequest {
            session_id: r.read_u32()?,
        },
        MsgType::JoinPublicSessionResponse => Message::JoinPublicSessionResponse(read_join(&mut r)?),
        MsgType::ListSessionsRequest => Message::ListSessionsRequest,
        MsgType::ListSessionsResponse => {
            let count = r.read_u8()? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(SessionListEntry {
                    session_id: r.read_u32()?,
                    num_players: r.read_u8()?,
                    max_players: r.read_u8()?,
                    state: r.read_u8()?,
                });
            }
            Message::ListSessionsResponse(entries)
        }
        MsgType::LeaveSessionRequest => Message::LeaveSessionRequest {
            session_id: r.read_u32()?,
        },
        MsgType::PlayerHasJoinedSession => Message::PlayerHasJoinedSession {
            player_index: r.read_u8()?,
            client_id: r.read_u32()?,
            username: r.read_array()?,
        },
        MsgType::PlayerHasLeftSession => Message::PlayerHasLeftSession {
            player_index: r.read_u8()?,
            client_id: r.read_u32()?,
        },
        MsgType::UdpEstablish => Message::UdpEstablish {
            client_id: r.read_u32()?,
            code: r.read_u16()?,
        },
        MsgType::UdpClientConnectionInfo => Message::UdpClientConnectionInfo {
            client_id: r.read_u32()?,
            code: r.read_u16()?,
            udp_port: r.read_u16()?,
        },
        MsgType::PlayerPos => Message::PlayerPos {
            player_index: r.read_u8()?,
            transform: r.read_array()?,
        },
        MsgType::PlayerSyncTimeRequest => Message::PlayerSyncTimeRequest {
            client_time_ms: r.read_u64()?,
        },
        MsgType::PlayerSyncTimeResponse => Message::PlayerSyncTimeResponse {
            client_time_ms: r.read_u64()?,
            session_time_ms: r.read_u64()?,
        },
        MsgType::StartGameRequest => Message::StartGameRequest,
        MsgType::GameSessionWillStart => Message::GameSessionWillStart {
            countdown_ms: r.read_u32()?,
        },
        MsgType::GameSessionHasStarted => Message::GameSessionHasStarted {
            duration_ms: r.read_u32()?,
        },
        MsgType::GameSessionHasEnded => Message::GameSessionHasEnded {
            elapsed_ms: r.read_u32()?,
        },
        MsgType::SessionSnapshot => {
            let session_id = r.read_u32()?;
            let game_time_ms = r.read_u32()?;
            let count = r.read_u8()? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(SnapshotEntry {
                    player_index: r.read_u8()?,
                    transform: r.read_array()?,
                });
            }
            Message::SessionSnapshot { session_id, game_time_ms, entries }
        }
        MsgType::SetItemState => Message::SetItemState {
            item_id: r.read_u16()?,
            state: r.read_u8()?,
        },
        MsgType::SetGameRuleInt => Message::SetGameRuleInt {
            rule: r.read_u16()?,
            value: r.read_i32()?,
        },
        MsgType::GameRuleUpdated => Message::GameRuleUpdated {
            rule: r.read_u16()?,
            value: r.read_i32()?,
        },
    };

    Ok((msg, r.position()))
}

/// Iterates the records packed back to back in one buffer.
///
/// Yields at most one error and then stops: after a bad record the cursor
/// position of the next one is unknown.
pub struct Decoder<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0, failed: false }
    }

    /// Bytes consumed by successfully decoded records
    pub fn consumed(&self) -> usize {
        self.offset
    }
}

impl Iterator for Decoder<'_> {
    type Item = Result<Message, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        match decode_one(&self.data[self.offset..]) {
            Ok((msg, used)) => {
                self.offset += used;
                Some(Ok(msg))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::framing::to_fixed;

    fn endpoint() -> NodeEndpoint {
        NodeEndpoint {
            node_id: 7,
            tcp_port: 9000,
            udp_port: 9001,
            hostname: to_fixed("slave-7.local"),
        }
    }

    #[test]
    fn test_fixed_records_match_declared_size() {
        let samples = vec![
            Message::Success(SuccessKind::Authenticated),
            Message::Error(ErrorCode::SessionIsFull),
            Message::AuthenticatePlayer { password: 1, username: to_fixed("alice") },
            Message::AuthenticateSlave { slave_id: 3, password: 99 },
            Message::SlaveConfig(endpoint()),
            Message::SlaveHealthReport(HealthReport::default()),
            Message::PlayerSlaveNodeRequest,
            Message::HostSessionResponse { session_id: 1, code: to_fixed("ABCDEFGH"), max_players: 8 },
            Message::UdpClientConnectionInfo { client_id: 4, code: 77, udp_port: 9001 },
            Message::PlayerPos { player_index: 2, transform: [9; TRANSFORM_LEN] },
            Message::GameRuleUpdated { rule: 3, value: -40 },
        ];

        for msg in samples {
            let encoded = msg.encode();
            let body = msg.msg_type().body_size().unwrap();
            assert_eq!(encoded.len(), 1 + body, "{:?}", msg.msg_type());
            assert_eq!(encoded.len(), msg.encoded_len());
            assert_eq!(encoded[0], msg.msg_type() as u8);
        }
    }

    #[test]
    fn test_authenticate_slave_layout() {
        let encoded = Message::AuthenticateSlave { slave_id: 0x0102_0304, password: 5 }.encode();
        assert_eq!(encoded.len(), 13);
        assert_eq!(encoded[0], MsgType::AuthenticateSlave as u8);
        assert_eq!(&encoded[1..5], &[4, 3, 2, 1]);
        assert_eq!(encoded[5], 5);
    }

    #[test]
    fn test_list_response_roundtrip() {
        let msg = Message::ListSessionsResponse(vec![
            SessionListEntry { session_id: 1, num_players: 2, max_players: 8, state: 0 },
            SessionListEntry { session_id: 2, num_players: 0, max_players: 8, state: 0 },
        ]);
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 2 + 14);

        let (decoded, used) = decode_one(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(used, encoded.len());
    }

    #[test]
    fn test_list_response_clamped_to_count_byte() {
        let entry = SessionListEntry { session_id: 1, num_players: 0, max_players: 4, state: 0 };
        let msg = Message::ListSessionsResponse(vec![entry; 300]);
        let encoded = msg.encode();

        assert_eq!(encoded[1], 255);
        let (decoded, _) = decode_one(&encoded).unwrap();
        match decoded {
            Message::ListSessionsResponse(entries) => assert_eq!(entries.len(), 255),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(decode_one(&[200, 1, 2]), Err(ProtocolError::UnknownType(200)));
    }

    #[test]
    fn test_truncated_record() {
        let encoded = Message::JoinPublicSessionRequest { session_id: 12 }.encode();
        let result = decode_one(&encoded[..3]);
        assert!(matches!(result, Err(ProtocolError::Framing(FramingError::Truncated { .. }))));
    }

    #[test]
    fn test_invalid_error_code() {
        let result = decode_one(&[MsgType::Error as u8, 0]);
        assert_eq!(
            result,
            Err(ProtocolError::InvalidField { field: "error code", value: 0 })
        );
    }

    #[test]
    fn test_decoder_reads_back_to_back_records() {
        let mut buf = Vec::new();
        Message::ListSessionsRequest.encode_into(&mut buf);
        Message::LeaveSessionRequest { session_id: 9 }.encode_into(&mut buf);
        Message::StartGameRequest.encode_into(&mut buf);

        let messages: Vec<_> = Decoder::new(&buf).collect::<Result<_, _>>().unwrap();
        assert_eq!(
            messages,
            vec![
                Message::ListSessionsRequest,
                Message::LeaveSessionRequest { session_id: 9 },
                Message::StartGameRequest,
            ]
        );
    }

    #[test]
    fn test_decoder_stops_after_bad_record() {
        let mut buf = Vec::new();
        Message::ListSessionsRequest.encode_into(&mut buf);
        buf.push(250);
        Message::StartGameRequest.encode_into(&mut buf);

        let mut decoder = Decoder::new(&buf);
        assert_eq!(decoder.next(), Some(Ok(Message::ListSessionsRequest)));
        assert_eq!(decoder.next(), Some(Err(ProtocolError::UnknownType(250))));
        assert_eq!(decoder.next(), None);
        assert_eq!(decoder.consumed(), 1);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_bytes<const N: usize>() -> impl Strategy<Value = [u8; N]> {
        prop::collection::vec(any::<u8>(), N).prop_map(|v| {
            let mut out = [0u8; N];
            out.copy_from_slice(&v);
            out
        })
    }

    fn arb_endpoint() -> impl Strategy<Value = NodeEndpoint> {
        (any::<u32>(), any::<u16>(), any::<u16>(), arb_bytes::<HOSTNAME_LEN>()).prop_map(
            |(node_id, tcp_port, udp_port, hostname)| NodeEndpoint {
                node_id,
                tcp_port,
                udp_port,
                hostname,
            },
        )
    }

    fn arb_join() -> impl Strategy<Value = JoinAccepted> {
        (any::<u32>(), any::<u8>(), any::<u8>(), any::<u8>()).prop_map(
            |(session_id, player_index, num_players, max_players)| JoinAccepted {
                session_id,
                player_index,
                num_players,
                max_players,
            },
        )
    }

    fn arb_error_code() -> impl Strategy<Value = ErrorCode> {
        (1u8..=12).prop_map(|v| ErrorCode::from_u8(v).unwrap())
    }

    fn arb_success_kind() -> impl Strategy<Value = SuccessKind> {
        prop_oneof![
            Just(SuccessKind::Authenticated),
            Just(SuccessKind::LeftSession),
            Just(SuccessKind::RuleSet),
        ]
    }

    fn arb_health() -> impl Strategy<Value = HealthReport> {
        (
            any::<u16>(),
            any::<u16>(),
            any::<i64>(),
            any::<u16>(),
            any::<u64>(),
            any::<u64>(),
            any::<u32>(),
        )
            .prop_map(
                |(pct_ram_used, pct_lag_ticks, avg_tick_idle_us, pct_cpu, good, lag, players)| {
                    HealthReport {
                        pct_ram_used,
                        pct_lag_ticks,
                        avg_tick_idle_us,
                        pct_cpu,
                        num_good_ticks: good,
                        num_lag_ticks: lag,
                        num_players: players,
                    }
                },
            )
    }

    fn arb_lobby_requests() -> impl Strategy<Value = Message> {
        prop_oneof![
            any::<bool>().prop_map(|is_private| Message::HostSessionRequest { is_private }),
            arb_bytes::<SESSION_CODE_LEN>()
                .prop_map(|code| Message::JoinPrivateSessionRequest { code }),
            any::<u32>().prop_map(|session_id| Message::JoinPublicSessionRequest { session_id }),
            Just(Message::ListSessionsRequest),
            any::<u32>().prop_map(|session_id| Message::LeaveSessionRequest { session_id }),
            Just(Message::StartGameRequest),
        ]
    }

    fn arb_lobby_replies() -> impl Strategy<Value = Message> {
        prop_oneof![
            (any::<u32>(), arb_bytes::<SESSION_CODE_LEN>(), any::<u8>()).prop_map(
                |(session_id, code, max_players)| Message::HostSessionResponse {
                    session_id,
                    code,
                    max_players
                }
            ),
            arb_join().prop_map(Message::JoinPrivateSessionResponse),
            arb_join().prop_map(Message::JoinPublicSessionResponse),
            prop::collection::vec(
                (any::<u32>(), any::<u8>(), any::<u8>(), any::<u8>()).prop_map(
                    |(session_id, num_players, max_players, state)| SessionListEntry {
                        session_id,
                        num_players,
                        max_players,
                        state,
                    }
                ),
                0..20
            )
            .prop_map(Message::ListSessionsResponse),
            (any::<u8>(), any::<u32>(), arb_bytes::<USERNAME_LEN>()).prop_map(
                |(player_index, client_id, username)| Message::PlayerHasJoinedSession {
                    player_index,
                    client_id,
                    username
                }
            ),
            (any::<u8>(), any::<u32>()).prop_map(|(player_index, client_id)| {
                Message::PlayerHasLeftSession { player_index, client_id }
            }),
        ]
    }

    fn arb_auth_messages() -> impl Strategy<Value = Message> {
        prop_oneof![
            arb_success_kind().prop_map(Message::Success),
            arb_error_code().prop_map(Message::Error),
            (any::<u64>(), arb_bytes::<USERNAME_LEN>())
                .prop_map(|(password, username)| Message::AuthenticatePlayer { password, username }),
            (any::<u32>(), any::<u64>())
                .prop_map(|(slave_id, password)| Message::AuthenticateSlave { slave_id, password }),
            (any::<u32>(), any::<u16>())
                .prop_map(|(client_id, code)| Message::UdpEstablish { client_id, code }),
            (any::<u32>(), any::<u16>(), any::<u16>()).prop_map(|(client_id, code, udp_port)| {
                Message::UdpClientConnectionInfo { client_id, code, udp_port }
            }),
        ]
    }

    fn arb_node_messages() -> impl Strategy<Value = Message> {
        prop_oneof![
            arb_endpoint().prop_map(Message::SlaveConfig),
            (any::<u32>(), any::<u64>(), any::<u8>(), any::<u8>(), any::<bool>(), any::<u8>())
                .prop_map(|(session_id, code_hash, num_players, max_players, is_private, state)| {
                    Message::SyncSession(SessionSync {
                        session_id,
                        code_hash,
                        num_players,
                        max_players,
                        is_private,
                        state,
                    })
                }),
            arb_health().prop_map(Message::SlaveHealthReport),
            Just(Message::MasterToSlaveCommand(MasterCommand::ReportHealth)),
            Just(Message::PlayerSlaveNodeRequest),
            arb_endpoint().prop_map(Message::PlayerSlaveNodeResponse),
        ]
    }

    fn arb_game_messages() -> impl Strategy<Value = Message> {
        prop_oneof![
            (any::<u8>(), arb_bytes::<TRANSFORM_LEN>())
                .prop_map(|(player_index, transform)| Message::PlayerPos { player_index, transform }),
            any::<u64>().prop_map(|client_time_ms| Message::PlayerSyncTimeRequest { client_time_ms }),
            (any::<u64>(), any::<u64>()).prop_map(|(client_time_ms, session_time_ms)| {
                Message::PlayerSyncTimeResponse { client_time_ms, session_time_ms }
            }),
            any::<u32>().prop_map(|countdown_ms| Message::GameSessionWillStart { countdown_ms }),
            any::<u32>().prop_map(|duration_ms| Message::GameSessionHasStarted { duration_ms }),
            any::<u32>().prop_map(|elapsed_ms| Message::GameSessionHasEnded { elapsed_ms }),
            (
                any::<u32>(),
                any::<u32>(),
                prop::collection::vec(
                    (any::<u8>(), arb_bytes::<TRANSFORM_LEN>()).prop_map(
                        |(player_index, transform)| SnapshotEntry { player_index, transform }
                    ),
                    0..12
                )
            )
                .prop_map(|(session_id, game_time_ms, entries)| Message::SessionSnapshot {
                    session_id,
                    game_time_ms,
                    entries
                }),
            (any::<u16>(), any::<u8>())
                .prop_map(|(item_id, state)| Message::SetItemState { item_id, state }),
            (any::<u16>(), any::<i32>())
                .prop_map(|(rule, value)| Message::SetGameRuleInt { rule, value }),
            (any::<u16>(), any::<i32>())
                .prop_map(|(rule, value)| Message::GameRuleUpdated { rule, value }),
        ]
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            arb_lobby_requests(),
            arb_lobby_replies(),
            arb_auth_messages(),
            arb_node_messages(),
            arb_game_messages(),
        ]
    }

    proptest! {
        #[test]
        fn proptest_encode_decode_roundtrip(msg in arb_message()) {
            let encoded = msg.encode();
            let (decoded, used) = decode_one(&encoded).expect("decode must succeed");
            prop_assert_eq!(used, encoded.len(), "decoder must consume the whole record");
            prop_assert_eq!(msg, decoded, "roundtrip must preserve fields");
        }

        #[test]
        fn proptest_truncation_is_detected(msg in arb_message()) {
            let encoded = msg.encode();
            prop_assume!(encoded.len() > 1);
            let cut = encoded.len() - 1;
            prop_assert!(decode_one(&encoded[..cut]).is_err());
        }
    }
}
