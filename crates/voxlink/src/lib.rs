pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod net;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{ConfigError, ConnectError, SendError, SessionError, TimeoutCause};
pub use event::{DisconnectReason, Event, EventStream};
pub use net::{
    Channel, Command, ConnectionState, Controls, NetworkStats, PeerSession, RejectCode,
    SessionStatus,
};
