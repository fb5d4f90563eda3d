use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::auth::auth_proof;
use super::channel::{Channel, ChannelMux};
use super::message::{ClientMessage, Command, ServerMessage};
use super::protocol::{PEER_ID_SERVER, PEER_ID_UNASSIGNED, PROTOCOL_VERSION, Packet, PacketBody};
use super::stats::NetworkStats;
use crate::config::ClientConfig;
use crate::error::{SendError, SessionError, TimeoutCause};
use crate::event::{DisconnectReason, Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    /// Hello sent, waiting for a peer id.
    Connecting,
    /// Peer id assigned, waiting for the auth challenge.
    AwaitingPeerId,
    /// Proof sent, waiting for accept or reject.
    Authenticating,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingPeerId => "awaiting_peer_id",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        }
    }

    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AwaitingPeerId | Self::Authenticating
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client side of one session with a server.
///
/// Performs no I/O. Datagrams go in through [`handle_datagram`], time moves
/// through [`tick`], and outbound datagrams and events are pulled with
/// [`poll_transmit`] and [`poll_event`].
///
/// [`handle_datagram`]: PeerSession::handle_datagram
/// [`tick`]: PeerSession::tick
/// [`poll_transmit`]: PeerSession::poll_transmit
/// [`poll_event`]: PeerSession::poll_event
#[derive(Debug)]
pub struct PeerSession {
    username: String,
    password: String,
    keep_alive_interval: Duration,
    keep_alive_timeout: Duration,
    state: ConnectionState,
    peer_id: u16,
    entity_id: Option<u32>,
    mux: ChannelMux,
    started: Instant,
    connect_deadline: Option<Instant>,
    last_receive_time: Instant,
    last_send_time: Instant,
    events: VecDeque<Event>,
    stats: NetworkStats,
    closed: bool,
}

impl PeerSession {
    pub fn new(config: &ClientConfig, now: Instant) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
            keep_alive_interval: config.keep_alive_interval,
            keep_alive_timeout: config.keep_alive_timeout(),
            state: ConnectionState::Disconnected,
            peer_id: PEER_ID_UNASSIGNED,
            entity_id: None,
            mux: ChannelMux::new(&config.reliability()),
            started: now,
            connect_deadline: None,
            last_receive_time: now,
            last_send_time: now,
            events: VecDeque::new(),
            stats: NetworkStats::default(),
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_id(&self) -> u16 {
        self.peer_id
    }

    pub fn entity_id(&self) -> Option<u32> {
        self.entity_id
    }

    pub fn stats(&self) -> NetworkStats {
        let (rtt_ms, rto_ms) = self.mux.rtt_ms();
        NetworkStats {
            duplicates: self.mux.duplicates(),
            retransmissions: self.mux.retransmissions(),
            unreliable_dropped: self.mux.unreliable_dropped(),
            rtt_ms,
            rto_ms,
            ..self.stats.clone()
        }
    }

    /// Starts the handshake. A session connects at most once.
    pub fn connect(&mut self, now: Instant, deadline: Instant) {
        if self.state != ConnectionState::Disconnected || self.closed {
            log::debug!("connect ignored in state {}", self.state);
            return;
        }

        log::info!("connecting as {}", self.username);
        self.connect_deadline = Some(deadline);
        self.last_receive_time = now;
        self.send_message(
            &ClientMessage::Hello {
                version: PROTOCOL_VERSION,
                username: self.username.clone(),
            },
            now,
        );
        self.set_state(ConnectionState::Connecting);
    }

    pub fn send_command(&mut self, command: &Command, now: Instant) -> Result<(), SendError> {
        self.send_command_on(command, command.channel(), now)
    }

    pub fn send_command_on(
        &mut self,
        command: &Command,
        channel: Channel,
        now: Instant,
    ) -> Result<(), SendError> {
        if channel == Channel::Control {
            return Err(SendError::ReservedChannel);
        }
        if self.state != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }

        log::trace!("queueing {} on {channel}", command.name());
        self.mux.send(channel, command.encode(), now);
        Ok(())
    }

    /// Begins a graceful close. Calling it again, or on a closed session, does nothing.
    pub fn disconnect(&mut self, _now: Instant) {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => return,
            _ => {}
        }

        log::info!("disconnecting");
        self.mux.clear_outbound();
        self.mux.send_urgent(PacketBody::Disconnect);
        self.connect_deadline = None;
        self.set_state(ConnectionState::Disconnecting);
    }

    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                log::debug!("dropping malformed datagram: {err}");
                self.stats.packets_dropped_malformed += 1;
                return;
            }
        };
        if packet.peer_id != PEER_ID_SERVER {
            log::debug!("dropping packet from peer id {}", packet.peer_id);
            self.stats.packets_dropped_malformed += 1;
            return;
        }

        self.stats.record_received(data.len());
        self.last_receive_time = now;

        match packet.body {
            PacketBody::Ping { stamp } => self.mux.send_urgent(PacketBody::Pong { stamp }),
            PacketBody::Pong { stamp } => {
                log::trace!("pong, stamp {stamp}");
            }
            PacketBody::Disconnect => {
                log::info!("server closed the session");
                self.close(DisconnectReason::ServerClosed, false);
            }
            body => {
                if self.state == ConnectionState::Disconnecting {
                    return;
                }
                for payload in self.mux.handle_inbound(packet.channel, body, now) {
                    self.handle_payload(&payload, now);
                    if self.state == ConnectionState::Disconnected {
                        break;
                    }
                }
            }
        }
    }

    fn handle_payload(&mut self, payload: &Bytes, now: Instant) {
        let message = match ServerMessage::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                log::debug!("dropping malformed message: {err}");
                self.stats.packets_dropped_malformed += 1;
                return;
            }
        };

        match message {
            ServerMessage::SetPeerId { peer_id } => {
                if self.state == ConnectionState::Connecting {
                    log::debug!("assigned peer id {peer_id}");
                    self.peer_id = peer_id;
                    self.set_state(ConnectionState::AwaitingPeerId);
                } else {
                    log::debug!("unexpected peer id assignment in state {}", self.state);
                }
            }
            ServerMessage::AuthChallenge { nonce } => {
                if self.state == ConnectionState::AwaitingPeerId {
                    let proof = auth_proof(nonce, &self.username, &self.password);
                    self.send_message(&ClientMessage::AuthResponse { proof }, now);
                    self.set_state(ConnectionState::Authenticating);
                } else {
                    log::debug!("unexpected auth challenge in state {}", self.state);
                }
            }
            ServerMessage::AuthAccept { entity_id } => {
                if self.state == ConnectionState::Authenticating {
                    log::info!(
                        "connected as peer {} (entity {entity_id})",
                        self.peer_id
                    );
                    self.entity_id = Some(entity_id);
                    self.connect_deadline = None;
                    self.set_state(ConnectionState::Connected);
                } else {
                    log::debug!("unexpected auth accept in state {}", self.state);
                }
            }
            ServerMessage::AuthReject { code, reason } => {
                if self.state.is_handshake() {
                    log::warn!("authentication rejected: {code}: {reason}");
                    self.close(
                        DisconnectReason::Failed(SessionError::AuthenticationFailed {
                            code,
                            reason,
                        }),
                        false,
                    );
                } else {
                    log::debug!("unexpected auth reject in state {}", self.state);
                }
            }
            ServerMessage::Kick { reason } => {
                log::warn!("kicked: {reason}");
                self.close(DisconnectReason::Kicked(reason), false);
            }
            ServerMessage::Chat { sender, text } => {
                self.events.push_back(Event::Chat { sender, text });
            }
            ServerMessage::BlockUpdate { pos, node } => {
                self.events.push_back(Event::BlockUpdate { pos, node });
            }
            ServerMessage::EntityState {
                entity_id,
                position,
                yaw,
                pitch,
            } => {
                self.events.push_back(Event::EntityState {
                    entity_id,
                    position,
                    yaw,
                    pitch,
                });
            }
            ServerMessage::EntityRemoved { entity_id } => {
                self.events.push_back(Event::EntityRemoved { entity_id });
            }
        }
    }

    /// Advances timers: handshake deadline, retransmissions and keep-alive.
    pub fn tick(&mut self, now: Instant) {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return;
        }

        if self.connect_deadline.is_some_and(|deadline| now >= deadline) {
            log::warn!("handshake timed out in state {}", self.state);
            self.close(DisconnectReason::Failed(SessionError::ConnectTimeout), true);
            return;
        }

        if let Err(cause) = self.mux.tick(now) {
            log::warn!("peer timed out: {cause}");
            self.close(
                DisconnectReason::Failed(SessionError::PeerTimeout(cause)),
                true,
            );
            return;
        }

        if self.state == ConnectionState::Connected {
            let idle = now.saturating_duration_since(self.last_receive_time);
            if idle > self.keep_alive_timeout {
                let cause = TimeoutCause::KeepAliveExpired { idle };
                log::warn!("peer timed out: {cause}");
                self.close(
                    DisconnectReason::Failed(SessionError::PeerTimeout(cause)),
                    true,
                );
                return;
            }

            if now.saturating_duration_since(self.last_send_time) >= self.keep_alive_interval
                && !self.mux.has_outbound()
            {
                let stamp = now.saturating_duration_since(self.started).as_millis() as u64;
                self.mux.send_urgent(PacketBody::Ping { stamp });
            }
        }
    }

    /// Next datagram to send, already encoded.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Bytes> {
        match self.mux.poll_transmit() {
            Some((channel, body)) => {
                let data = Packet::new(self.peer_id, channel, body).encode();
                self.stats.record_sent(data.len());
                self.last_send_time = now;
                Some(data)
            }
            None => {
                if self.state == ConnectionState::Disconnecting {
                    self.close(DisconnectReason::Requested, false);
                }
                None
            }
        }
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// True once the session ended and its last datagram has been handed out.
    pub fn is_closed(&self) -> bool {
        self.closed && !self.mux.has_outbound()
    }

    fn send_message(&mut self, message: &ClientMessage, now: Instant) {
        self.mux.send(Channel::Control, message.encode(), now);
    }

    fn close(&mut self, reason: DisconnectReason, notify_peer: bool) {
        if self.closed {
            return;
        }

        self.mux.clear_outbound();
        if notify_peer {
            self.mux.send_urgent(PacketBody::Disconnect);
        }
        self.connect_deadline = None;
        self.closed = true;
        self.set_state(ConnectionState::Disconnected);
        self.events.push_back(Event::Disconnected(reason));
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        log::debug!("session {} -> {}", self.state, state);
        self.state = state;
        self.events.push_back(Event::StateChanged(state));
    }
}
