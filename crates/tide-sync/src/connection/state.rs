use std::collections::BTreeSet;
use std::time::SystemTime;

pub type TopicId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    /// Legal edges of the lifecycle state machine. `Connected` is only
    /// reachable from `Connecting`.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Error, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Error)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Error, Disconnected)
        )
    }

    pub fn is_live(self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Connected)
    }
}

/// Observable connection state. Only the connection manager writes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub last_connected_at: Option<SystemTime>,
    pub reconnect_attempts: u32,
    pub active_topics: BTreeSet<TopicId>,
    pub last_error: Option<String>,
    pub online: bool,
    pub visible: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_connected_at: None,
            reconnect_attempts: 0,
            active_topics: BTreeSet::new(),
            last_error: None,
            online: true,
            visible: true,
        }
    }
}
