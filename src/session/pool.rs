use std::time::{Duration, Instant};

use rand::Rng;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::net::connection::ClientId;
use crate::net::protocol::{SessionListEntry, USERNAME_LEN};
use crate::session::session::{
    generate_code, hash_code, GameState, Session, SessionError, SessionEvent, SessionId,
};

/// Largest node id that fits the upper half of a session id
pub const MAX_NODE_ID: u32 = 0xFFFF;

/// Largest pool whose ids stay inside the node's lower half
pub const MAX_SESSIONS_PER_NODE: usize = 0xFFFF;

/// Hands out session ids. Ids carry the node id in their upper bits so they
/// stay unique in the master's tables across slaves, as long as the node id
/// and pool size are within [`MAX_NODE_ID`] and [`MAX_SESSIONS_PER_NODE`].
#[derive(Debug, Clone)]
pub struct SessionIdAllocator {
    next: SessionId,
}

impl SessionIdAllocator {
    pub fn new(node_id: u32) -> Self {
        Self {
            next: (node_id << 16) | 1,
        }
    }

    pub fn next_id(&mut self) -> SessionId {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// Pool sizing and timing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_sessions: usize,
    pub max_players: u8,
    pub start_countdown: Duration,
    pub snapshot_interval: Duration,
}

/// Result of hosting a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hosted {
    pub session_id: SessionId,
    pub code: String,
    pub max_players: u8,
}

/// Result of joining a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    pub session_id: SessionId,
    pub player_index: u8,
    pub num_players: u8,
    pub max_players: u8,
    /// Members before the join
    pub existing: SmallVec<[ClientId; 8]>,
}

/// Result of leaving a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Left {
    pub session_id: SessionId,
    pub player_index: u8,
    pub remaining: SmallVec<[ClientId; 8]>,
}

/// A session event together with the members it concerns
#[derive(Debug, Clone)]
pub struct PoolEvent {
    pub session_id: SessionId,
    pub members: SmallVec<[ClientId; 8]>,
    pub event: SessionEvent,
}

/// Fixed pool of reusable sessions plus the lookup tables over it
pub struct SessionPool {
    sessions: Vec<Session>,
    by_id: FxHashMap<SessionId, usize>,
    /// Code hash of private, occupied sessions
    by_code: FxHashMap<u64, usize>,
    player_sessions: FxHashMap<ClientId, SessionId>,
}

impl SessionPool {
    pub fn new(config: &PoolConfig, ids: &mut SessionIdAllocator) -> Self {
        let mut sessions = Vec::with_capacity(config.max_sessions);
        let mut by_id = FxHashMap::default();
        for index in 0..config.max_sessions {
            let id = ids.next_id();
            sessions.push(Session::new(
                id,
                config.max_players,
                config.start_countdown,
                config.snapshot_interval,
            ));
            by_id.insert(id, index);
        }
        Self {
            sessions,
            by_id,
            by_code: FxHashMap::default(),
            player_sessions: FxHashMap::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.sessions.len()
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.by_id.get(&id).map(|&i| &self.sessions[i])
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        match self.by_id.get(&id) {
            Some(&i) => Some(&mut self.sessions[i]),
            None => None,
        }
    }

    pub fn session_of(&self, client_id: ClientId) -> Option<SessionId> {
        self.player_sessions.get(&client_id).copied()
    }

    pub fn find_by_code(&self, code_hash: u64) -> Option<SessionId> {
        self.by_code.get(&code_hash).map(|&i| self.sessions[i].id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_occupied()).count()
    }

    pub fn player_count(&self) -> usize {
        self.player_sessions.len()
    }

    pub fn occupied(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().filter(|s| s.is_occupied())
    }

    /// True if any occupied session holds this code
    pub fn code_in_use(&self, code_hash: u64) -> bool {
        self.occupied().any(|s| s.code_hash() == code_hash)
    }

    /// Take the next free session, give it a fresh code and seat the host
    pub fn host(
        &mut self,
        client_id: ClientId,
        username: [u8; USERNAME_LEN],
        is_private: bool,
    ) -> Result<Hosted, SessionError> {
        self.host_with_rng(client_id, username, is_private, &mut rand::thread_rng())
    }

    /// [`host`](Self::host) with the code drawn from `rng`. The code is
    /// unique among all occupied sessions, public or private.
    pub fn host_with_rng<R: Rng + ?Sized>(
        &mut self,
        client_id: ClientId,
        username: [u8; USERNAME_LEN],
        is_private: bool,
        rng: &mut R,
    ) -> Result<Hosted, SessionError> {
        if self.player_sessions.contains_key(&client_id) {
            return Err(SessionError::AlreadyInSession);
        }
        let index = self
            .sessions
            .iter()
            .position(|s| s.is_available())
            .ok_or(SessionError::NoAvailableSessions)?;

        let mut code = generate_code(&mut *rng);
        while self.code_in_use(hash_code(&code)) {
            code = generate_code(&mut *rng);
        }

        let session = &mut self.sessions[index];
        session.open(code.clone(), is_private);
        session.add_player(client_id, username)?;
        let hosted = Hosted {
            session_id: session.id,
            code,
            max_players: session.max_players(),
        };

        self.player_sessions.insert(client_id, hosted.session_id);
        self.refresh_code_index(index);
        Ok(hosted)
    }

    /// Join by code; only private sessions are indexed by code
    pub fn join_by_code(
        &mut self,
        client_id: ClientId,
        username: [u8; USERNAME_LEN],
        code_hash: u64,
    ) -> Result<Joined, SessionError> {
        if self.player_sessions.contains_key(&client_id) {
            return Err(SessionError::AlreadyInSession);
        }
        let index = *self.by_code.get(&code_hash).ok_or(SessionError::NotFound)?;
        self.join_at(index, client_id, username)
    }

    /// Join an occupied public session by id
    pub fn join_by_id(
        &mut self,
        client_id: ClientId,
        username: [u8; USERNAME_LEN],
        session_id: SessionId,
    ) -> Result<Joined, SessionError> {
        if self.player_sessions.contains_key(&client_id) {
            return Err(SessionError::AlreadyInSession);
        }
        let index = *self.by_id.get(&session_id).ok_or(SessionError::NotFound)?;
        let session = &self.sessions[index];
        if session.is_private() || !session.is_occupied() {
            return Err(SessionError::NotFound);
        }
        self.join_at(index, client_id, username)
    }

    fn join_at(
        &mut self,
        index: usize,
        client_id: ClientId,
        username: [u8; USERNAME_LEN],
    ) -> Result<Joined, SessionError> {
        let session = &mut self.sessions[index];
        let existing = session.members();
        let player_index = session.add_player(client_id, username)?;
        let joined = Joined {
            session_id: session.id,
            player_index,
            num_players: session.num_players(),
            max_players: session.max_players(),
            existing,
        };
        self.player_sessions.insert(client_id, joined.session_id);
        Ok(joined)
    }

    /// Leave the given session
    pub fn leave(&mut self, client_id: ClientId, session_id: SessionId) -> Result<Left, SessionError> {
        if self.player_sessions.get(&client_id) != Some(&session_id) {
            return Err(SessionError::NotInSession);
        }
        let index = *self.by_id.get(&session_id).ok_or(SessionError::NotFound)?;
        let session = &mut self.sessions[index];
        let player_index = session
            .remove_player(client_id)
            .ok_or(SessionError::NotInSession)?;
        let remaining = session.members();

        self.player_sessions.remove(&client_id);
        self.refresh_code_index(index);
        Ok(Left {
            session_id,
            player_index,
            remaining,
        })
    }

    /// Leave whatever session the player is in, e.g. on disconnect
    pub fn leave_any(&mut self, client_id: ClientId) -> Option<Left> {
        let session_id = self.session_of(client_id)?;
        self.leave(client_id, session_id).ok()
    }

    /// Public lobby sessions that can be joined
    pub fn list_public(&self) -> Vec<SessionListEntry> {
        self.sessions
            .iter()
            .filter(|s| !s.is_private() && s.is_occupied() && s.state() == GameState::Idle)
            .map(|s| s.list_entry())
            .collect()
    }

    /// Advance every session. Ended sessions are emptied and returned to the pool.
    pub fn tick(&mut self, now: Instant) -> Vec<PoolEvent> {
        let mut out = Vec::new();
        for index in 0..self.sessions.len() {
            let session = &mut self.sessions[index];
            if !session.is_occupied() {
                continue;
            }
            let events = session.tick(now);
            if events.is_empty() {
                continue;
            }
            let members = session.members();
            let session_id = session.id;
            let ended = session.state() == GameState::Ended;

            for event in events {
                out.push(PoolEvent {
                    session_id,
                    members: members.clone(),
                    event,
                });
            }

            if ended {
                for client in &members {
                    self.player_sessions.remove(client);
                }
                self.sessions[index].reset();
                self.refresh_code_index(index);
            }
        }
        out
    }

    fn refresh_code_index(&mut self, index: usize) {
        let session = &self.sessions[index];
        let hash = session.code_hash();
        if session.is_private() && session.is_occupied() {
            self.by_code.insert(hash, index);
        } else if self.by_code.get(&hash) == Some(&index) {
            self.by_code.remove(&hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::framing::to_fixed;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pool(size: usize, max_players: u8) -> SessionPool {
        let config = PoolConfig {
            max_sessions: size,
            max_players,
            start_countdown: Duration::from_secs(5),
            snapshot_interval: Duration::from_secs(1),
        };
        SessionPool::new(&config, &mut SessionIdAllocator::new(0))
    }

    fn name() -> [u8; USERNAME_LEN] {
        to_fixed("player")
    }

    #[test]
    fn test_ids_are_node_scoped() {
        let mut ids = SessionIdAllocator::new(3);
        assert_eq!(ids.next_id(), (3 << 16) | 1);
        assert_eq!(ids.next_id(), (3 << 16) | 2);

        // Last id of the largest pool stays below the next node's range
        let mut ids = SessionIdAllocator::new(MAX_NODE_ID - 1);
        let last = (0..MAX_SESSIONS_PER_NODE).map(|_| ids.next_id()).last().unwrap();
        assert_eq!(last >> 16, MAX_NODE_ID - 1);
        assert_eq!(ids.next_id() >> 16, MAX_NODE_ID);

        let p = pool(2, 4);
        assert!(p.get(1).is_some());
        assert!(p.get(2).is_some());
        assert!(p.get(3).is_none());
    }

    #[test]
    fn test_host_and_already_have_session() {
        let mut p = pool(2, 4);
        let hosted = p.host(1, name(), true).unwrap();
        assert_eq!(hosted.session_id, 1);
        assert_eq!(hosted.code.len(), 8);

        assert_eq!(p.host(1, name(), false), Err(SessionError::AlreadyInSession));
    }

    #[test]
    fn test_public_codes_are_unique() {
        let mut p = pool(2, 4);
        let first = p
            .host_with_rng(1, name(), false, &mut StdRng::seed_from_u64(7))
            .unwrap();
        assert!(p.code_in_use(hash_code(&first.code)));

        // Same seed draws the same first code, which is taken
        let second = p
            .host_with_rng(2, name(), false, &mut StdRng::seed_from_u64(7))
            .unwrap();
        assert_ne!(first.code, second.code);
        assert!(p.find_by_code(hash_code(&first.code)).is_none());
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut p = pool(1, 4);
        p.host(1, name(), false).unwrap();
        assert_eq!(p.host(2, name(), false), Err(SessionError::NoAvailableSessions));
    }

    #[test]
    fn test_join_private_by_code() {
        let mut p = pool(2, 4);
        let hosted = p.host(1, name(), true).unwrap();

        let joined = p.join_by_code(2, name(), hash_code(&hosted.code)).unwrap();
        assert_eq!(joined.player_index, 1);
        assert_eq!(joined.num_players, 2);
        assert_eq!(joined.existing.as_slice(), &[1]);

        assert_eq!(
            p.join_by_code(3, name(), hash_code("NOPENOPE")),
            Err(SessionError::NotFound)
        );
    }

    #[test]
    fn test_private_session_hidden_from_public_join() {
        let mut p = pool(2, 4);
        let hosted = p.host(1, name(), true).unwrap();
        assert_eq!(p.join_by_id(2, name(), hosted.session_id), Err(SessionError::NotFound));
        assert!(p.list_public().is_empty());
    }

    #[test]
    fn test_public_join_and_list() {
        let mut p = pool(2, 4);
        let hosted = p.host(1, name(), false).unwrap();
        p.join_by_id(2, name(), hosted.session_id).unwrap();

        let list = p.list_public();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].num_players, 2);

        // Empty sessions are not joinable by id
        assert_eq!(p.join_by_id(3, name(), 2), Err(SessionError::NotFound));
    }

    #[test]
    fn test_leave_releases_code_and_session() {
        let mut p = pool(1, 4);
        let hosted = p.host(1, name(), true).unwrap();
        let hash = hash_code(&hosted.code);

        assert_eq!(p.leave(2, hosted.session_id), Err(SessionError::NotInSession));
        let left = p.leave(1, hosted.session_id).unwrap();
        assert_eq!(left.player_index, 0);
        assert!(left.remaining.is_empty());
        assert_eq!(p.find_by_code(hash), None);
        assert_eq!(p.session_of(1), None);

        // The slot is reusable with a fresh code
        assert!(p.host(3, name(), false).is_ok());
    }

    #[test]
    fn test_ended_match_returns_session() {
        let mut p = pool(1, 4);
        let t0 = Instant::now();
        let hosted = p.host(1, name(), false).unwrap();
        p.join_by_id(2, name(), hosted.session_id).unwrap();
        p.join_by_id(3, name(), hosted.session_id).unwrap();

        let session = p.get_mut(hosted.session_id).unwrap();
        session.set_rule(1, crate::session::rules::GameRule::GameTime as u16, 1).unwrap();
        session.request_start(1, t0).unwrap();

        p.tick(t0 + Duration::from_secs(5));
        let events = p.tick(t0 + Duration::from_secs(7));
        assert!(events
            .iter()
            .any(|e| matches!(e.event, SessionEvent::Ended { .. }) && e.members.len() == 3));

        assert_eq!(p.player_count(), 0);
        assert!(p.get(hosted.session_id).unwrap().is_available());
    }
}
