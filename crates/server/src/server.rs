use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use voxlink::config::MAX_USERNAME_LEN;
use voxlink::net::{
    Channel, ClientMessage, Command, NetworkSimulator, PEER_ID_SERVER, PROTOCOL_VERSION, Packet,
    PacketBody, RejectCode, ReliabilitySettings, ServerMessage, verify_proof,
};
use voxlink::NetworkStats;

use crate::config::ServerConfig;
use crate::events::{DisconnectReason, ServerEvent};
use crate::peers::{PeerManager, PeerState, RemotePeer};

pub const REJECT_NAME_TAKEN: RejectCode = RejectCode::Other(5);
pub const REJECT_BAD_NAME: RejectCode = RejectCode::Other(6);

const REJECT_LINGER: Duration = Duration::from_secs(2);

type Datagram = (SocketAddr, Bytes);

/// Reference server. Owns no socket: datagrams are fed in with
/// [`GameServer::handle_datagram`] and pulled out with [`GameServer::poll_transmit`].
pub struct GameServer {
    config: ServerConfig,
    peers: PeerManager,
    rng: StdRng,
    next_entity_id: u32,
    inbound_sim: Option<NetworkSimulator<Datagram>>,
    outbound_sim: Option<NetworkSimulator<Datagram>>,
    outgoing: VecDeque<Datagram>,
    stats: NetworkStats,
    pending_events: VecDeque<ServerEvent>,
}

impl GameServer {
    pub fn new(config: ServerConfig) -> Self {
        let (inbound_sim, outbound_sim) = match config.link {
            Some(conditions) => (
                Some(NetworkSimulator::new(conditions, config.seed)),
                Some(NetworkSimulator::new(conditions, config.seed.wrapping_add(1))),
            ),
            None => (None, None),
        };
        // Room for handshakes and lingering rejections on top of the player cap.
        let max_peers = config.max_clients.saturating_mul(2).saturating_add(8);

        Self {
            peers: PeerManager::new(max_peers, ReliabilitySettings::default()),
            rng: StdRng::seed_from_u64(config.seed),
            next_entity_id: 1,
            inbound_sim,
            outbound_sim,
            outgoing: VecDeque::new(),
            stats: NetworkStats::default(),
            pending_events: VecDeque::new(),
            config,
        }
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn connected_count(&self) -> usize {
        self.peers.connected_count()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.total_count()
    }

    pub fn stats(&self) -> NetworkStats {
        let mut stats = self.stats.clone();
        for peer in self.peers.iter() {
            stats.retransmissions += peer.mux.retransmissions();
            stats.duplicates += peer.mux.duplicates();
            stats.unreliable_dropped += peer.mux.unreliable_dropped();
        }
        stats
    }

    pub fn handle_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        match self.inbound_sim.as_mut() {
            Some(sim) => {
                sim.send((from, Bytes::copy_from_slice(data)), now);
                self.drain_inbound(now);
            }
            None => self.process_datagram(from, data, now),
        }
    }

    fn drain_inbound(&mut self, now: Instant) {
        let ready = match self.inbound_sim.as_mut() {
            Some(sim) => sim.take_ready(now),
            None => return,
        };
        for (from, data) in ready {
            self.process_datagram(from, &data, now);
        }
    }

    fn process_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                log::debug!("dropping malformed datagram from {from}: {err}");
                self.stats.packets_dropped_malformed += 1;
                return;
            }
        };
        self.stats.record_received(data.len());

        // Only a reliable control packet may open a session.
        let opens_session = packet.channel == Channel::Control
            && matches!(packet.body, PacketBody::Reliable { .. });
        let peer = if opens_session {
            self.peers.get_or_create(from, now)
        } else {
            self.peers.get_by_addr_mut(&from)
        };
        let Some(peer) = peer else {
            log::trace!("ignoring {:?} from unknown address {from}", packet.body);
            return;
        };
        if !peer.accepts_id(packet.peer_id) {
            log::debug!(
                "dropping packet from {from} with peer id {}, expected {}",
                packet.peer_id,
                peer.peer_id
            );
            self.stats.packets_dropped_malformed += 1;
            return;
        }

        peer.last_receive_time = now;
        let peer_id = peer.peer_id;

        match packet.body {
            PacketBody::Ping { stamp } => peer.mux.send_urgent(PacketBody::Pong { stamp }),
            PacketBody::Pong { .. } => {}
            PacketBody::Disconnect => {
                log::debug!("peer {peer_id} sent disconnect");
                self.drop_peer(peer_id, DisconnectReason::Graceful, false, now);
            }
            body => {
                let payloads = peer.mux.handle_inbound(packet.channel, body, now);
                for payload in payloads {
                    match ClientMessage::decode(&payload) {
                        Ok(message) => self.handle_message(peer_id, message, now),
                        Err(err) => {
                            log::debug!("dropping malformed message from peer {peer_id}: {err}");
                            self.stats.packets_dropped_malformed += 1;
                        }
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, peer_id: u16, message: ClientMessage, now: Instant) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };

        match (peer.state, message) {
            (PeerState::AwaitingHello, ClientMessage::Hello { version, username }) => {
                self.handle_hello(peer_id, version, username, now);
            }
            (PeerState::AwaitingProof { nonce }, ClientMessage::AuthResponse { proof }) => {
                let valid = self.config.password.is_empty()
                    || verify_proof(nonce, &peer.username, &self.config.password, &proof);
                if valid {
                    self.accept(peer_id, now);
                } else {
                    self.reject(peer_id, RejectCode::WrongPassword, "wrong password", now);
                }
            }
            (PeerState::Connected, ClientMessage::Command(command)) => {
                self.handle_command(peer_id, command, now);
            }
            (PeerState::Rejected { .. }, _) => {}
            (state, message) => {
                log::debug!("peer {peer_id}: unexpected {message:?} in state {state:?}");
            }
        }
    }

    fn handle_hello(&mut self, peer_id: u16, version: u16, username: String, now: Instant) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        let addr = peer.addr;
        self.pending_events
            .push_back(ServerEvent::ClientConnecting { addr });

        if version != PROTOCOL_VERSION {
            let reason = format!("server speaks protocol {PROTOCOL_VERSION}, client {version}");
            self.reject(peer_id, RejectCode::VersionMismatch, &reason, now);
            return;
        }
        if !valid_username(&username) {
            self.reject(peer_id, REJECT_BAD_NAME, "invalid username", now);
            return;
        }
        if self.peers.connected_count() >= self.config.max_clients {
            self.reject(peer_id, RejectCode::ServerFull, "server full", now);
            return;
        }
        if self.peers.name_in_use(&username, peer_id) {
            self.reject(peer_id, REJECT_NAME_TAKEN, "name already in use", now);
            return;
        }

        let nonce: u64 = self.rng.r#gen();
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        log::debug!("peer {peer_id} ({addr}) says hello as {username}");
        peer.username = username;
        peer.state = PeerState::AwaitingProof { nonce };
        peer.send(&ServerMessage::SetPeerId { peer_id }, now);
        peer.send(&ServerMessage::AuthChallenge { nonce }, now);
    }

    fn accept(&mut self, peer_id: u16, now: Instant) {
        let entity_id = self.next_entity_id;
        self.next_entity_id = self.next_entity_id.wrapping_add(1).max(1);

        let others: Vec<ServerMessage> = self
            .peers
            .iter()
            .filter(|p| p.is_connected())
            .filter_map(RemotePeer::entity_state)
            .collect();

        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        peer.state = PeerState::Connected;
        peer.entity_id = Some(entity_id);
        peer.send(&ServerMessage::AuthAccept { entity_id }, now);
        for state in &others {
            peer.send(state, now);
        }

        let addr = peer.addr;
        let username = peer.username.clone();
        let spawned = peer.entity_state();
        log::info!("{username} joined as peer {peer_id} from {addr} (entity {entity_id})");
        if let Some(spawned) = spawned {
            self.peers.broadcast(&spawned, Some(peer_id), now);
        }
        self.pending_events.push_back(ServerEvent::ClientConnected {
            peer_id,
            addr,
            username,
            entity_id,
        });
    }

    fn reject(&mut self, peer_id: u16, code: RejectCode, reason: &str, now: Instant) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        log::info!("rejecting {}: {code}: {reason}", peer.addr);
        peer.state = PeerState::Rejected { since: now };
        peer.send(
            &ServerMessage::AuthReject {
                code,
                reason: reason.to_string(),
            },
            now,
        );
        let addr = peer.addr;
        self.pending_events.push_back(ServerEvent::ConnectionDenied {
            addr,
            reason: format!("{code}: {reason}"),
        });
    }

    fn handle_command(&mut self, peer_id: u16, command: Command, now: Instant) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        log::trace!("peer {peer_id}: {}", command.name());

        let relay = match command {
            Command::Move {
                position,
                yaw,
                pitch,
                ..
            } => {
                peer.position = position;
                peer.yaw = yaw;
                peer.pitch = pitch;
                peer.entity_state()
            }
            Command::LookAt { yaw, pitch } => {
                peer.yaw = yaw;
                peer.pitch = pitch;
                peer.entity_state()
            }
            Command::SelectSlot { slot } => {
                peer.selected_slot = slot;
                log::debug!("peer {peer_id} selected slot {}", peer.selected_slot);
                None
            }
            Command::DigBlock { pos } => {
                let update = ServerMessage::BlockUpdate {
                    pos,
                    node: "air".to_string(),
                };
                self.peers.broadcast(&update, None, now);
                None
            }
            Command::PlaceBlock { pos, item } => {
                let update = ServerMessage::BlockUpdate { pos, node: item };
                self.peers.broadcast(&update, None, now);
                None
            }
            Command::ChatMessage { text } => {
                let text = text.trim();
                if !text.is_empty() {
                    let username = peer.username.clone();
                    let chat = ServerMessage::Chat {
                        sender: username.clone(),
                        text: text.to_string(),
                    };
                    self.peers.broadcast(&chat, None, now);
                    self.pending_events.push_back(ServerEvent::Chat {
                        username,
                        text: text.to_string(),
                    });
                }
                None
            }
        };

        if let Some(state) = relay {
            self.peers.broadcast(&state, Some(peer_id), now);
        }
    }

    /// Retransmits, expires silent peers and releases delayed datagrams.
    pub fn tick(&mut self, now: Instant) {
        self.drain_inbound(now);

        let mut expired = Vec::new();
        let mut forgotten = Vec::new();
        for peer in self.peers.iter_mut() {
            if let PeerState::Rejected { since } = peer.state {
                let linger_over = now.saturating_duration_since(since) >= REJECT_LINGER;
                if linger_over || peer.mux.tick(now).is_err() {
                    forgotten.push(peer.peer_id);
                }
                continue;
            }

            if peer.is_timed_out(self.config.peer_timeout, now) {
                log::info!("peer {} went silent", peer.peer_id);
                expired.push(peer.peer_id);
            } else if let Err(cause) = peer.mux.tick(now) {
                log::info!("peer {} timed out: {cause}", peer.peer_id);
                expired.push(peer.peer_id);
            }
        }

        for peer_id in forgotten {
            self.peers.remove(peer_id);
        }
        for peer_id in expired {
            self.drop_peer(peer_id, DisconnectReason::Timeout, true, now);
        }
    }

    /// Next datagram to put on the wire.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Datagram> {
        let mut flushed = Vec::new();
        for peer in self.peers.iter_mut() {
            peer.drain_datagrams(&mut flushed);
        }
        for datagram in flushed {
            self.emit(datagram, now);
        }
        if let Some(sim) = self.outbound_sim.as_mut() {
            self.outgoing.extend(sim.take_ready(now));
        }

        let datagram = self.outgoing.pop_front()?;
        self.stats.record_sent(datagram.1.len());
        Some(datagram)
    }

    fn emit(&mut self, datagram: Datagram, now: Instant) {
        match self.outbound_sim.as_mut() {
            Some(sim) => sim.send(datagram, now),
            None => self.outgoing.push_back(datagram),
        }
    }

    pub fn kick(&mut self, peer_id: u16, reason: &str, now: Instant) -> bool {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return false;
        };
        peer.mux.clear_outbound();
        peer.send(
            &ServerMessage::Kick {
                reason: reason.to_string(),
            },
            now,
        );
        let mut flushed = Vec::new();
        peer.drain_datagrams(&mut flushed);
        for datagram in flushed {
            self.emit(datagram, now);
        }
        self.drop_peer(peer_id, DisconnectReason::Kicked, false, now);
        true
    }

    /// Tells every peer the server is going away. The notices skip the link
    /// simulator so they are ready to send immediately.
    pub fn shutdown(&mut self, now: Instant) {
        for peer_id in self.peers.ids() {
            if let Some(peer) = self.peers.get(peer_id) {
                let notice = Packet::new(PEER_ID_SERVER, Channel::Control, PacketBody::Disconnect);
                self.outgoing.push_back((peer.addr, notice.encode()));
            }
            self.drop_peer(peer_id, DisconnectReason::Kicked, false, now);
        }
    }

    fn drop_peer(&mut self, peer_id: u16, reason: DisconnectReason, notify: bool, now: Instant) {
        let Some(peer) = self.peers.remove(peer_id) else {
            return;
        };
        if notify {
            let notice = Packet::new(PEER_ID_SERVER, Channel::Control, PacketBody::Disconnect);
            self.emit((peer.addr, notice.encode()), now);
        }
        if !peer.is_connected() {
            return;
        }

        log::info!("{} (peer {peer_id}) {}", peer.username, reason.as_str());
        if let Some(entity_id) = peer.entity_id {
            self.peers
                .broadcast(&ServerMessage::EntityRemoved { entity_id }, None, now);
        }
        self.pending_events
            .push_back(ServerEvent::ClientDisconnected { peer_id, reason });
    }
}

fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
