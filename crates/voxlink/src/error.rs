use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::net::{Channel, RejectCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    RetransmitsExhausted { channel: Channel, sequence: u16 },
    KeepAliveExpired { idle: Duration },
}

impl std::fmt::Display for TimeoutCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetransmitsExhausted { channel, sequence } => {
                write!(f, "sequence {sequence} on {channel} was never acknowledged")
            }
            Self::KeepAliveExpired { idle } => {
                write!(f, "nothing received for {}ms", idle.as_millis())
            }
        }
    }
}

/// Fatal session failures. Each ends the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("peer timed out: {0}")]
    PeerTimeout(TimeoutCause),
    #[error("authentication failed: {code}: {reason}")]
    AuthenticationFailed { code: RejectCode, reason: String },
    #[error("handshake did not complete before the deadline")]
    ConnectTimeout,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("handshake did not complete before the deadline")]
    ConnectTimeout,
    #[error("authentication failed: {code}: {reason}")]
    AuthenticationFailed { code: RejectCode, reason: String },
    #[error("peer timed out during handshake: {0}")]
    PeerTimeout(TimeoutCause),
    #[error("server closed the session: {0}")]
    Disconnected(String),
    #[error("a session is already active")]
    AlreadyConnected,
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("network worker stopped unexpectedly")]
    WorkerStopped,
}

impl From<SessionError> for ConnectError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::PeerTimeout(cause) => Self::PeerTimeout(cause),
            SessionError::AuthenticationFailed { code, reason } => {
                Self::AuthenticationFailed { code, reason }
            }
            SessionError::ConnectTimeout => Self::ConnectTimeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("session is not connected")]
    NotConnected,
    #[error("the control channel is reserved for session traffic")]
    ReservedChannel,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown option `{0}`")]
    UnknownOption(String),
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config read error: {0}")]
    Io(#[from] io::Error),
}
