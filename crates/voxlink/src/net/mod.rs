mod auth;
mod channel;
mod connection;
pub(crate) mod endpoint;
mod message;
mod protocol;
mod simulator;
mod stats;
mod tracking;

pub use auth::{PROOF_SIZE, auth_proof, verify_proof};
pub use channel::{Channel, ChannelMux};
pub use connection::{ConnectionState, PeerSession};
pub use endpoint::SessionStatus;
pub use message::{
    ClientMessage, Command, Controls, MAX_NAME_LEN, MAX_TEXT_LEN, RejectCode, ServerMessage,
    truncate_utf8,
};
pub use protocol::{
    DEFAULT_PORT, HEADER_SIZE, MAX_PACKET_SIZE, MalformedPacket, PEER_ID_SERVER,
    PEER_ID_UNASSIGNED, PROTOCOL_ID, PROTOCOL_VERSION, Packet, PacketBody, PacketHeader,
    PacketKind, sequence_greater_than,
};
pub use simulator::{LinkConditions, NetworkSimulator};
pub use stats::NetworkStats;
pub use tracking::{
    ACK_BITS, ReceiveError, ReceiveWindow, ReliabilitySettings, RetransmitsExhausted,
    RttEstimator, SendTracker, SequencedMessage,
};
