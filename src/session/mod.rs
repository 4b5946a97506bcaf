pub mod player;
pub mod pool;
pub mod rules;
#[allow(clippy::module_inception)]
pub mod session;

pub use player::PlayerRecord;
pub use pool::{PoolConfig, SessionIdAllocator, SessionPool, MAX_NODE_ID, MAX_SESSIONS_PER_NODE};
pub use rules::{GameRule, RuleSet};
pub use session::{GameState, Session, SessionError, SessionEvent, SessionId};
