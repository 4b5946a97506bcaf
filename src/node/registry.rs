//! Master-side registry of slave nodes and the sessions they announced

use std::cmp::Ordering;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::net::connection::ClientId;
use crate::net::protocol::{HealthReport, NodeEndpoint, SessionListEntry, SessionSync, MAX_LIST_ENTRIES};
use crate::session::GameState;

/// Rating of a slave that has not reported yet
pub const UNRATED: f64 = -1.0;

/// Routing score of a health report; higher is healthier.
///
/// Average idle time per tick scaled by the share of ticks that finished
/// inside their budget.
pub fn health_rating(report: &HealthReport) -> f64 {
    let total = report.num_good_ticks + report.num_lag_ticks;
    let lag_fraction = if total == 0 {
        0.0
    } else {
        report.num_lag_ticks as f64 / total as f64
    };
    report.avg_tick_idle_us as f64 * (1.0 - lag_fraction) * 100.0
}

#[derive(Debug, Clone)]
pub struct SlaveEntry {
    pub slave_id: u32,
    pub client_id: ClientId,
    /// Set by `SlaveConfig`; a slave without one is never routed to
    pub endpoint: Option<NodeEndpoint>,
    pub health: Option<HealthReport>,
    pub rating: f64,
    sessions: FxHashSet<u32>,
}

impl SlaveEntry {
    fn new(slave_id: u32, client_id: ClientId) -> Self {
        Self {
            slave_id,
            client_id,
            endpoint: None,
            health: None,
            rating: UNRATED,
            sessions: FxHashSet::default(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct SessionRecord {
    slave_id: u32,
    sync: SessionSync,
}

#[derive(Debug, Default)]
pub struct SlaveRegistry {
    entries: FxHashMap<u32, SlaveEntry>,
    by_client: FxHashMap<ClientId, u32>,
    /// Slave ids by descending rating
    ranking: Vec<u32>,
    code_index: FxHashMap<u64, u32>,
    session_index: FxHashMap<u32, SessionRecord>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn session_count(&self) -> usize {
        self.session_index.len()
    }

    pub fn get(&self, slave_id: u32) -> Option<&SlaveEntry> {
        self.entries.get(&slave_id)
    }

    pub fn by_client(&self, client_id: ClientId) -> Option<&SlaveEntry> {
        self.by_client.get(&client_id).and_then(|id| self.entries.get(id))
    }

    pub fn is_slave(&self, client_id: ClientId) -> bool {
        self.by_client.contains_key(&client_id)
    }

    /// Connections of every registered slave
    pub fn slave_clients(&self) -> Vec<ClientId> {
        self.by_client.keys().copied().collect()
    }

    /// Slave ids from healthiest to least healthy
    pub fn ranking(&self) -> &[u32] {
        &self.ranking
    }

    /// Register a slave connection. An entry with the same id is replaced and
    /// its connection returned so the caller can close it.
    pub fn register(&mut self, slave_id: u32, client_id: ClientId) -> Option<ClientId> {
        let replaced = self.entries.get(&slave_id).map(|e| e.client_id);
        if let Some(old) = replaced {
            self.remove_client(old);
        }

        self.entries.insert(slave_id, SlaveEntry::new(slave_id, client_id));
        self.by_client.insert(client_id, slave_id);
        self.ranking.push(slave_id);
        self.sort_ranking();
        replaced
    }

    /// Drop the slave behind a connection and every session it announced
    pub fn remove_client(&mut self, client_id: ClientId) -> Option<u32> {
        let slave_id = self.by_client.remove(&client_id)?;
        if let Some(entry) = self.entries.remove(&slave_id) {
            for session_id in entry.sessions {
                self.forget_session(session_id);
            }
        }
        self.ranking.retain(|id| *id != slave_id);
        Some(slave_id)
    }

    pub fn set_endpoint(&mut self, client_id: ClientId, endpoint: NodeEndpoint) -> bool {
        let Some(entry) = self.by_client.get(&client_id).and_then(|id| self.entries.get_mut(id)) else {
            return false;
        };
        entry.endpoint = Some(endpoint);
        true
    }

    /// Apply a session summary. A summary with no players removes the session.
    pub fn sync_session(&mut self, client_id: ClientId, sync: SessionSync) -> bool {
        let Some(&slave_id) = self.by_client.get(&client_id) else {
            return false;
        };

        if let Some(previous) = self.session_index.get(&sync.session_id) {
            if previous.slave_id != slave_id {
                // Session ids are node scoped; a clash means a stale announcement
                return false;
            }
        }
        self.forget_session(sync.session_id);

        if sync.num_players == 0 {
            return true;
        }

        self.session_index.insert(sync.session_id, SessionRecord { slave_id, sync });
        if sync.is_private {
            self.code_index.insert(sync.code_hash, sync.session_id);
        }
        if let Some(entry) = self.entries.get_mut(&slave_id) {
            entry.sessions.insert(sync.session_id);
        }
        true
    }

    fn forget_session(&mut self, session_id: u32) {
        let Some(record) = self.session_index.remove(&session_id) else {
            return;
        };
        if record.sync.is_private && self.code_index.get(&record.sync.code_hash) == Some(&session_id) {
            self.code_index.remove(&record.sync.code_hash);
        }
        if let Some(entry) = self.entries.get_mut(&record.slave_id) {
            entry.sessions.remove(&session_id);
        }
    }

    /// Store a health report and re-rank; returns the new rating
    pub fn update_health(&mut self, client_id: ClientId, report: HealthReport) -> Option<f64> {
        let entry = self
            .by_client
            .get(&client_id)
            .and_then(|id| self.entries.get_mut(id))?;
        entry.rating = health_rating(&report);
        entry.health = Some(report);
        let rating = entry.rating;
        self.sort_ranking();
        Some(rating)
    }

    fn sort_ranking(&mut self) {
        let entries = &self.entries;
        let rating = |id: &u32| entries.get(id).map_or(f64::MIN, |e| e.rating);
        self.ranking.sort_by(|a, b| {
            rating(b)
                .partial_cmp(&rating(a))
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(b))
        });
    }

    /// Healthiest slave that has told us where it listens
    pub fn best(&self) -> Option<&SlaveEntry> {
        self.ranking
            .iter()
            .filter_map(|id| self.entries.get(id))
            .find(|e| e.endpoint.is_some())
    }

    pub fn find_by_code(&self, code_hash: u64) -> Option<&SlaveEntry> {
        let session_id = self.code_index.get(&code_hash)?;
        self.find_by_session(*session_id)
    }

    pub fn find_by_session(&self, session_id: u32) -> Option<&SlaveEntry> {
        let record = self.session_index.get(&session_id)?;
        self.entries.get(&record.slave_id).filter(|e| e.endpoint.is_some())
    }

    pub fn session(&self, session_id: u32) -> Option<&SessionSync> {
        self.session_index.get(&session_id).map(|r| &r.sync)
    }

    /// Joinable public sessions across all slaves, by session id
    pub fn list_public(&self) -> Vec<SessionListEntry> {
        let mut list: Vec<SessionListEntry> = self
            .session_index
            .values()
            .map(|r| r.sync)
            .filter(|s| !s.is_private && s.state == GameState::Idle as u8)
            .map(|s| SessionListEntry {
                session_id: s.session_id,
                num_players: s.num_players,
                max_players: s.max_players,
                state: s.state,
            })
            .collect();
        list.sort_by_key(|e| e.session_id);
        list.truncate(MAX_LIST_ENTRIES);
        list
    }
}
