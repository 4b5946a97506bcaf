use std::time::Instant;

use crate::net::connection::ClientId;
use crate::net::framing::from_fixed;
use crate::net::protocol::USERNAME_LEN;

/// Authenticated player on a slave node
#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub client_id: ClientId,
    pub username: [u8; USERNAME_LEN],
    pub authenticated_at: Instant,
    /// Last client clock seen in a time sync request
    pub last_client_time_ms: Option<u64>,
}

impl PlayerRecord {
    pub fn new(client_id: ClientId, username: [u8; USERNAME_LEN]) -> Self {
        Self {
            client_id,
            username,
            authenticated_at: Instant::now(),
            last_client_time_ms: None,
        }
    }

    pub fn display_name(&self) -> String {
        from_fixed(&self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::framing::to_fixed;

    #[test]
    fn test_display_name() {
        let player = PlayerRecord::new(4, to_fixed("Ada"));
        assert_eq!(player.display_name(), "Ada");
        assert!(player.last_client_time_ms.is_none());
    }
}
