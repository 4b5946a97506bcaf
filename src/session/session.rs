use std::time::{Duration, Instant};

use rand::Rng;
use smallvec::SmallVec;

use crate::net::connection::ClientId;
use crate::net::protocol::{
    ErrorCode, SessionListEntry, SessionSync, SnapshotEntry, TRANSFORM_LEN, USERNAME_LEN,
};
use crate::session::rules::{GameRule, RuleSet};

pub type SessionId = u32;

/// Length of a generated session code
pub const CODE_LENGTH: usize = 8;

/// Session game state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GameState {
    /// Lobby: open for hosting and joining
    Idle = 0,
    /// Start countdown armed
    Starting = 1,
    /// Match in progress
    Running = 2,
    /// Match over, about to be cleared
    Ended = 3,
}

/// One occupied player slot. A slot's index is its position in the session.
#[derive(Debug, Clone)]
pub struct PlayerSlot {
    pub client_id: ClientId,
    pub username: [u8; USERNAME_LEN],
    pub transform: Option<[u8; TRANSFORM_LEN]>,
}

/// Produced by [`Session::tick`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started { duration_ms: u32 },
    Snapshot { game_time_ms: u32, entries: Vec<SnapshotEntry> },
    Ended { elapsed_ms: u32 },
}

/// Generate a human-entry session code of uppercase letters
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CODE_LENGTH)
        .map(|_| rng.gen_range(b'A'..=b'Z') as char)
        .collect()
}

const FNV1A_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

/// Case-insensitive FNV-1a 64 hash of a session code. Master and slaves
/// compare these values, so the output must be identical on every build.
pub fn hash_code(code: &str) -> u64 {
    code.trim_end_matches('\0')
        .trim()
        .bytes()
        .fold(FNV1A_OFFSET_BASIS, |state, b| {
            (state ^ u64::from(b.to_ascii_uppercase())).wrapping_mul(FNV1A_PRIME)
        })
}

/// One bounded-capacity match container, reused across hosting cycles
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    code: String,
    code_hash: u64,
    is_private: bool,
    max_players: u8,
    slots: SmallVec<[PlayerSlot; 8]>,
    rules: RuleSet,
    state: GameState,
    countdown: Duration,
    snapshot_interval: Duration,
    start_at: Option<Instant>,
    started_at: Option<Instant>,
    ends_at: Option<Instant>,
    last_snapshot: Option<Instant>,
}

impl Session {
    pub fn new(id: SessionId, max_players: u8, countdown: Duration, snapshot_interval: Duration) -> Self {
        Self {
            id,
            code: String::new(),
            code_hash: 0,
            is_private: false,
            max_players: max_players.max(1),
            slots: SmallVec::new(),
            rules: RuleSet::new(),
            state: GameState::Idle,
            countdown,
            snapshot_interval,
            start_at: None,
            started_at: None,
            ends_at: None,
            last_snapshot: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn code_hash(&self) -> u64 {
        self.code_hash
    }

    pub fn is_private(&self) -> bool {
        self.is_private
    }

    pub fn max_players(&self) -> u8 {
        self.max_players
    }

    pub fn num_players(&self) -> u8 {
        self.slots.len() as u8
    }

    pub fn is_occupied(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.max_players as usize
    }

    pub fn state(&self) -> GameState {
        self.state
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Free for a new host
    pub fn is_available(&self) -> bool {
        self.state == GameState::Idle && self.slots.is_empty()
    }

    pub fn can_game_be_started(&self) -> bool {
        self.state == GameState::Idle && self.slots.len() > 2
    }

    /// Reset for a new hosting cycle with a fresh code
    pub fn open(&mut self, code: String, is_private: bool) {
        self.reset();
        self.code_hash = hash_code(&code);
        self.code = code;
        self.is_private = is_private;
    }

    /// Clear players, rules and timers; back to `Idle`
    pub fn reset(&mut self) {
        self.slots.clear();
        self.rules = RuleSet::new();
        self.state = GameState::Idle;
        self.start_at = None;
        self.started_at = None;
        self.ends_at = None;
        self.last_snapshot = None;
    }

    /// Add a player to the next free slot, returning its index
    pub fn add_player(
        &mut self,
        client_id: ClientId,
        username: [u8; USERNAME_LEN],
    ) -> Result<u8, SessionError> {
        if self.state != GameState::Idle {
            return Err(SessionError::GameInProgress);
        }
        if self.is_full() {
            return Err(SessionError::SessionFull);
        }
        if self.slot_of(client_id).is_some() {
            return Err(SessionError::AlreadyInSession);
        }
        self.slots.push(PlayerSlot {
            client_id,
            username,
            transform: None,
        });
        Ok((self.slots.len() - 1) as u8)
    }

    /// Remove a player and compact the slots behind it; returns the old index
    pub fn remove_player(&mut self, client_id: ClientId) -> Option<u8> {
        let index = self.slot_of(client_id)?;
        self.slots.remove(index as usize);
        if self.slots.is_empty() {
            self.reset();
        }
        Some(index)
    }

    pub fn slot_of(&self, client_id: ClientId) -> Option<u8> {
        self.slots
            .iter()
            .position(|s| s.client_id == client_id)
            .map(|i| i as u8)
    }

    pub fn slots(&self) -> &[PlayerSlot] {
        &self.slots
    }

    pub fn members(&self) -> SmallVec<[ClientId; 8]> {
        self.slots.iter().map(|s| s.client_id).collect()
    }

    /// Members except one, for relays
    pub fn members_except(&self, client_id: ClientId) -> SmallVec<[ClientId; 8]> {
        self.slots
            .iter()
            .filter(|s| s.client_id != client_id)
            .map(|s| s.client_id)
            .collect()
    }

    pub fn owner(&self) -> Option<ClientId> {
        self.slots.first().map(|s| s.client_id)
    }

    /// Arm the start countdown. Owner only, more than two players.
    pub fn request_start(&mut self, client_id: ClientId, now: Instant) -> Result<Duration, SessionError> {
        if self.owner() != Some(client_id) {
            return Err(if self.slot_of(client_id).is_some() {
                SessionError::NotOwner
            } else {
                SessionError::NotInSession
            });
        }
        if self.state != GameState::Idle {
            return Err(SessionError::GameInProgress);
        }
        if !self.can_game_be_started() {
            return Err(SessionError::NotEnoughPlayers);
        }
        self.state = GameState::Starting;
        self.start_at = Some(now + self.countdown);
        Ok(self.countdown)
    }

    /// Owner-only rule change while the session is in the lobby
    pub fn set_rule(&mut self, client_id: ClientId, rule: u16, value: i32) -> Result<GameRule, SessionError> {
        if self.owner() != Some(client_id) {
            return Err(SessionError::NotOwner);
        }
        if matches!(self.state, GameState::Starting | GameState::Running) {
            return Err(SessionError::GameInProgress);
        }
        let rule = GameRule::from_index(rule).ok_or(SessionError::InvalidRule(rule))?;
        self.rules.set(rule, value);
        Ok(rule)
    }

    /// Latest transform reported by a player
    pub fn update_position(&mut self, client_id: ClientId, transform: [u8; TRANSFORM_LEN]) -> bool {
        match self.slots.iter_mut().find(|s| s.client_id == client_id) {
            Some(slot) => {
                slot.transform = Some(transform);
                true
            }
            None => false,
        }
    }

    /// Milliseconds since the match started, zero outside a match
    pub fn session_time_ms(&self, now: Instant) -> u64 {
        match (self.state, self.started_at) {
            (GameState::Running, Some(started)) => {
                now.saturating_duration_since(started).as_millis() as u64
            }
            _ => 0,
        }
    }

    pub fn tick(&mut self, now: Instant) -> SmallVec<[SessionEvent; 2]> {
        let mut events = SmallVec::new();

        if self.state == GameState::Starting {
            match self.start_at {
                Some(at) if now >= at => {
                    let duration = self.rules.game_duration();
                    self.state = GameState::Running;
                    self.started_at = Some(now);
                    self.ends_at = Some(now + duration);
                    self.last_snapshot = Some(now);
                    events.push(SessionEvent::Started {
                        duration_ms: duration.as_millis().min(u32::MAX as u128) as u32,
                    });
                }
                _ => return events,
            }
        }

        if self.state != GameState::Running {
            return events;
        }

        let game_time_ms = self.session_time_ms(now).min(u32::MAX as u64) as u32;

        let snapshot_due = self
            .last_snapshot
            .map_or(true, |last| now.saturating_duration_since(last) >= self.snapshot_interval);
        if snapshot_due {
            self.last_snapshot = Some(now);
            let entries = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| {
                    s.transform.map(|transform| SnapshotEntry {
                        player_index: i as u8,
                        transform,
                    })
                })
                .collect();
            events.push(SessionEvent::Snapshot { game_time_ms, entries });
        }

        if self.ends_at.map_or(false, |end| now >= end) {
            self.state = GameState::Ended;
            events.push(SessionEvent::Ended { elapsed_ms: game_time_ms });
        }

        events
    }

    pub fn sync(&self) -> SessionSync {
        SessionSync {
            session_id: self.id,
            code_hash: self.code_hash,
            num_players: self.num_players(),
            max_players: self.max_players,
            is_private: self.is_private,
            state: self.state as u8,
        }
    }

    pub fn list_entry(&self) -> SessionListEntry {
        SessionListEntry {
            session_id: self.id,
            num_players: self.num_players(),
            max_players: self.max_players,
            state: self.state as u8,
        }
    }
}

/// Session errors, each surfaced to the player as an `Error` record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,
    #[error("Session is full")]
    SessionFull,
    #[error("No available sessions")]
    NoAvailableSessions,
    #[error("Player already has a session")]
    AlreadyInSession,
    #[error("No sessions to list")]
    NothingToList,
    #[error("Player is not in that session")]
    NotInSession,
    #[error("Only the session owner may do that")]
    NotOwner,
    #[error("Not enough players")]
    NotEnoughPlayers,
    #[error("Game already in progress")]
    GameInProgress,
    #[error("Unknown rule index {0}")]
    InvalidRule(u16),
}

impl SessionError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SessionError::NotFound => ErrorCode::SessionNotFound,
            SessionError::SessionFull => ErrorCode::SessionIsFull,
            SessionError::NoAvailableSessions => ErrorCode::NoAvailableSessions,
            SessionError::AlreadyInSession => ErrorCode::AlreadyHaveSession,
            SessionError::NothingToList => ErrorCode::NoSessionsToList,
            SessionError::NotInSession => ErrorCode::NotInSession,
            SessionError::NotOwner => ErrorCode::NotSessionOwner,
            SessionError::NotEnoughPlayers => ErrorCode::NotEnoughPlayers,
            SessionError::GameInProgress => ErrorCode::GameInProgress,
            SessionError::InvalidRule(_) => ErrorCode::InvalidRule,
        }
    }
}
