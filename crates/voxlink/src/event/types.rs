use glam::{IVec3, Vec3};

use crate::error::SessionError;
use crate::net::ConnectionState;

#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// `disconnect()` was called locally.
    Requested,
    /// The server sent a disconnect notice.
    ServerClosed,
    Kicked(String),
    Failed(SessionError),
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::ServerClosed => "server_closed",
            Self::Kicked(_) => "kicked",
            Self::Failed(SessionError::PeerTimeout(_)) => "timeout",
            Self::Failed(SessionError::AuthenticationFailed { .. }) => "auth_failed",
            Self::Failed(SessionError::ConnectTimeout) => "connect_timeout",
        }
    }

    pub fn error(&self) -> Option<&SessionError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kicked(reason) => write!(f, "kicked: {reason}"),
            Self::Failed(err) => write!(f, "{err}"),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Inbound session events, in the order the session produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StateChanged(ConnectionState),
    Chat {
        sender: String,
        text: String,
    },
    BlockUpdate {
        pos: IVec3,
        node: String,
    },
    EntityState {
        entity_id: u32,
        position: Vec3,
        yaw: f32,
        pitch: f32,
    },
    EntityRemoved {
        entity_id: u32,
    },
    /// Emitted exactly once per session.
    Disconnected(DisconnectReason),
    /// The subscriber fell behind and `dropped` older events were discarded.
    Lagged {
        dropped: u64,
    },
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}
