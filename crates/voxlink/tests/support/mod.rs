#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::timeout;

use voxlink::ClientConfig;
use voxlink::net::{
    Channel, ChannelMux, ClientMessage, PEER_ID_SERVER, Packet, PacketBody, RejectCode,
    ReliabilitySettings, ServerMessage, verify_proof,
};

pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message {
        peer_id: u16,
        channel: Channel,
        sequence: u16,
        message: ClientMessage,
    },
    Disconnect {
        peer_id: u16,
    },
}

/// Scripted single-peer server on loopback.
pub struct FakeServer {
    socket: UdpSocket,
    mux: ChannelMux,
    peer: Option<SocketAddr>,
    pub answer_pings: bool,
}

impl FakeServer {
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self {
            socket,
            mux: ChannelMux::new(&ReliabilitySettings::default()),
            peer: None,
            answer_pings: true,
        }
    }

    pub fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    pub fn config(&self, username: &str) -> ClientConfig {
        ClientConfig::new(username)
            .with_server("127.0.0.1", self.port())
            .with_connect_timeout(Duration::from_secs(2))
    }

    /// Next raw datagram, or `None` after `wait`.
    pub async fn recv_packet(&mut self, wait: Duration) -> Option<Packet> {
        let mut buf = [0u8; 2048];
        let (len, from) = timeout(wait, self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .unwrap();
        self.peer = Some(from);
        Some(Packet::decode(&buf[..len]).expect("client sent a malformed packet"))
    }

    /// Next fresh message from the client. Acks and pings are handled along the way.
    pub async fn next_incoming(&mut self, wait: Duration) -> Option<Incoming> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let packet = self.recv_packet(remaining).await?;
            let now = Instant::now();

            let sequence = match &packet.body {
                PacketBody::Ping { stamp } => {
                    if self.answer_pings {
                        self.mux.send_urgent(PacketBody::Pong { stamp: *stamp });
                        self.flush().await;
                    }
                    continue;
                }
                PacketBody::Pong { .. } => continue,
                PacketBody::Disconnect => {
                    return Some(Incoming::Disconnect {
                        peer_id: packet.peer_id,
                    });
                }
                PacketBody::Ack { .. } => None,
                PacketBody::Reliable { sequence, .. } | PacketBody::Unreliable { sequence, .. } => {
                    Some(*sequence)
                }
            };

            let delivered = self.mux.handle_inbound(packet.channel, packet.body, now);
            self.flush().await;

            if let (Some(sequence), Some(payload)) = (sequence, delivered.into_iter().next()) {
                return Some(Incoming::Message {
                    peer_id: packet.peer_id,
                    channel: packet.channel,
                    sequence,
                    message: ClientMessage::decode(&payload).unwrap(),
                });
            }
        }
    }

    pub async fn expect_message(&mut self) -> (u16, Channel, u16, ClientMessage) {
        match self.next_incoming(WAIT).await {
            Some(Incoming::Message {
                peer_id,
                channel,
                sequence,
                message,
            }) => (peer_id, channel, sequence, message),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    pub async fn send(&mut self, message: ServerMessage) {
        self.mux
            .send(message.channel(), message.encode(), Instant::now());
        self.flush().await;
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        let peer = self.peer.expect("no client has contacted the server");
        self.socket.send_to(data, peer).await.unwrap();
    }

    pub async fn send_disconnect(&mut self) {
        let data = Packet::new(PEER_ID_SERVER, Channel::Control, PacketBody::Disconnect).encode();
        self.send_raw(&data).await;
    }

    pub async fn flush(&mut self) {
        while let Some((channel, body)) = self.mux.poll_transmit() {
            let data = Packet::new(PEER_ID_SERVER, channel, body).encode();
            self.send_raw(&data).await;
        }
    }

    /// Runs the server half of the handshake up to the auth challenge and
    /// returns the username and proof check result.
    pub async fn challenge(&mut self, peer_id: u16, password: &str) -> (String, bool) {
        let (_, channel, _, hello) = self.expect_message().await;
        assert_eq!(channel, Channel::Control);
        let ClientMessage::Hello { username, .. } = hello else {
            panic!("expected hello, got {hello:?}");
        };

        let nonce = 0x5EED_0000_0000_0001;
        self.send(ServerMessage::SetPeerId { peer_id }).await;
        self.send(ServerMessage::AuthChallenge { nonce }).await;

        let (_, _, _, response) = self.expect_message().await;
        let ClientMessage::AuthResponse { proof } = response else {
            panic!("expected auth response, got {response:?}");
        };
        let valid = verify_proof(nonce, &username, password, &proof);
        (username, valid)
    }

    pub async fn accept(&mut self, peer_id: u16, entity_id: u32, password: &str) {
        let (_, valid) = self.challenge(peer_id, password).await;
        assert!(valid, "client sent a bad proof");
        self.send(ServerMessage::AuthAccept { entity_id }).await;
    }

    pub async fn reject(&mut self, peer_id: u16, code: RejectCode, reason: &str) {
        self.challenge(peer_id, "").await;
        self.send(ServerMessage::AuthReject {
            code,
            reason: reason.to_string(),
        })
        .await;
    }
}
