use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use glam::Vec3;
use voxlink::net::{
    ChannelMux, PEER_ID_SERVER, PEER_ID_UNASSIGNED, Packet, ReliabilitySettings, ServerMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    AwaitingHello,
    AwaitingProof { nonce: u64 },
    Connected,
    /// Kept around until the rejection has had a chance to arrive.
    Rejected { since: Instant },
}

#[derive(Debug)]
pub struct RemotePeer {
    pub addr: SocketAddr,
    pub peer_id: u16,
    pub state: PeerState,
    pub username: String,
    pub entity_id: Option<u32>,
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub selected_slot: u16,
    pub mux: ChannelMux,
    pub last_receive_time: Instant,
}

impl RemotePeer {
    pub fn new(addr: SocketAddr, peer_id: u16, settings: &ReliabilitySettings, now: Instant) -> Self {
        Self {
            addr,
            peer_id,
            state: PeerState::AwaitingHello,
            username: String::new(),
            entity_id: None,
            position: Vec3::ZERO,
            yaw: 0.0,
            pitch: 0.0,
            selected_slot: 0,
            mux: ChannelMux::new(settings),
            last_receive_time: now,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    pub fn is_timed_out(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_receive_time) > timeout
    }

    /// Packets may carry the assigned id or, until the client learns it, zero.
    pub fn accepts_id(&self, peer_id: u16) -> bool {
        peer_id == PEER_ID_UNASSIGNED || peer_id == self.peer_id
    }

    pub fn send(&mut self, message: &ServerMessage, now: Instant) {
        self.mux.send(message.channel(), message.encode(), now);
    }

    pub fn entity_state(&self) -> Option<ServerMessage> {
        self.entity_id.map(|entity_id| ServerMessage::EntityState {
            entity_id,
            position: self.position,
            yaw: self.yaw,
            pitch: self.pitch,
        })
    }

    /// Drains everything the mux wants to send as encoded datagrams.
    pub fn drain_datagrams(&mut self, out: &mut Vec<(SocketAddr, Bytes)>) {
        while let Some((channel, body)) = self.mux.poll_transmit() {
            out.push((self.addr, Packet::new(PEER_ID_SERVER, channel, body).encode()));
        }
    }
}

#[derive(Debug)]
pub struct PeerManager {
    peers_by_addr: HashMap<SocketAddr, u16>,
    peers: HashMap<u16, RemotePeer>,
    next_peer_id: u16,
    max_peers: usize,
    settings: ReliabilitySettings,
}

impl PeerManager {
    pub fn new(max_peers: usize, settings: ReliabilitySettings) -> Self {
        Self {
            peers_by_addr: HashMap::new(),
            peers: HashMap::new(),
            next_peer_id: PEER_ID_SERVER + 1,
            max_peers,
            settings,
        }
    }

    pub fn get_or_create(&mut self, addr: SocketAddr, now: Instant) -> Option<&mut RemotePeer> {
        if !self.peers_by_addr.contains_key(&addr) {
            if self.peers.len() >= self.max_peers {
                return None;
            }
            let peer_id = self.allocate_id()?;
            self.peers
                .insert(peer_id, RemotePeer::new(addr, peer_id, &self.settings, now));
            self.peers_by_addr.insert(addr, peer_id);
        }
        let peer_id = self.peers_by_addr.get(&addr)?;
        self.peers.get_mut(peer_id)
    }

    fn allocate_id(&mut self) -> Option<u16> {
        for _ in 0..=u16::MAX {
            let candidate = self.next_peer_id;
            self.next_peer_id = self.next_peer_id.wrapping_add(1);
            if candidate > PEER_ID_SERVER && !self.peers.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut RemotePeer> {
        let peer_id = self.peers_by_addr.get(addr)?;
        self.peers.get_mut(peer_id)
    }

    pub fn get(&self, peer_id: u16) -> Option<&RemotePeer> {
        self.peers.get(&peer_id)
    }

    pub fn get_mut(&mut self, peer_id: u16) -> Option<&mut RemotePeer> {
        self.peers.get_mut(&peer_id)
    }

    pub fn remove(&mut self, peer_id: u16) -> Option<RemotePeer> {
        let peer = self.peers.remove(&peer_id)?;
        self.peers_by_addr.remove(&peer.addr);
        Some(peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RemotePeer> {
        self.peers.values_mut()
    }

    pub fn ids(&self) -> Vec<u16> {
        self.peers.keys().copied().collect()
    }

    /// True if a connected or authenticating peer other than `except` uses the name.
    pub fn name_in_use(&self, username: &str, except: u16) -> bool {
        self.peers.values().any(|p| {
            p.peer_id != except
                && matches!(p.state, PeerState::Connected | PeerState::AwaitingProof { .. })
                && p.username.eq_ignore_ascii_case(username)
        })
    }

    /// Queues `message` to every connected peer except `except`.
    pub fn broadcast(&mut self, message: &ServerMessage, except: Option<u16>, now: Instant) {
        for peer in self.peers.values_mut() {
            if peer.is_connected() && Some(peer.peer_id) != except {
                peer.send(message, now);
            }
        }
    }

    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected()).count()
    }

    pub fn total_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_peer_ids_skip_reserved_and_in_use() {
        let now = Instant::now();
        let mut peers = PeerManager::new(8, ReliabilitySettings::default());

        let first = peers.get_or_create(addr(1000), now).map(|p| p.peer_id);
        let again = peers.get_or_create(addr(1000), now).map(|p| p.peer_id);
        assert_eq!(first, Some(2));
        assert_eq!(again, Some(2));

        peers.next_peer_id = u16::MAX;
        assert_eq!(peers.get_or_create(addr(1001), now).map(|p| p.peer_id), Some(u16::MAX));
        assert_eq!(peers.get_or_create(addr(1002), now).map(|p| p.peer_id), Some(3));
    }

    #[test]
    fn test_peer_limit() {
        let now = Instant::now();
        let mut peers = PeerManager::new(1, ReliabilitySettings::default());

        assert!(peers.get_or_create(addr(1000), now).is_some());
        assert!(peers.get_or_create(addr(1001), now).is_none());

        peers.remove(2);
        assert!(peers.get_or_create(addr(1001), now).is_some());
        assert_eq!(peers.total_count(), 1);
    }

    #[test]
    fn test_name_in_use_ignores_pending_hello() {
        let now = Instant::now();
        let mut peers = PeerManager::new(4, ReliabilitySettings::default());

        let peer = peers.get_or_create(addr(1000), now).unwrap();
        peer.username = "Alice".into();
        assert!(!peers.name_in_use("alice", 0));

        peers.get_mut(2).unwrap().state = PeerState::Connected;
        assert!(peers.name_in_use("alice", 0));
        assert!(!peers.name_in_use("alice", 2));
    }
}
