use std::fmt;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use glam::{IVec3, Vec3};

use super::channel::Channel;
use super::protocol::{MalformedPacket, need};

pub const MAX_TEXT_LEN: usize = 500;
pub const MAX_NAME_LEN: usize = 64;

const TAG_HELLO: u8 = 0x01;
const TAG_AUTH_RESPONSE: u8 = 0x02;
const TAG_MOVE: u8 = 0x10;
const TAG_LOOK_AT: u8 = 0x11;
const TAG_DIG_BLOCK: u8 = 0x12;
const TAG_PLACE_BLOCK: u8 = 0x13;
const TAG_CHAT_MESSAGE: u8 = 0x14;
const TAG_SELECT_SLOT: u8 = 0x15;

const TAG_SET_PEER_ID: u8 = 0x81;
const TAG_AUTH_CHALLENGE: u8 = 0x82;
const TAG_AUTH_ACCEPT: u8 = 0x83;
const TAG_AUTH_REJECT: u8 = 0x84;
const TAG_CHAT: u8 = 0x90;
const TAG_BLOCK_UPDATE: u8 = 0x91;
const TAG_ENTITY_STATE: u8 = 0x92;
const TAG_ENTITY_REMOVED: u8 = 0x93;
const TAG_KICK: u8 = 0x94;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Controls: u32 {
        const FORWARD = 1 << 0;
        const BACKWARD = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
        const JUMP = 1 << 4;
        const SNEAK = 1 << 5;
        const SPRINT = 1 << 6;
        const DIG = 1 << 7;
        const PLACE = 1 << 8;
    }
}

/// Cuts `text` to at most `max` bytes without splitting a character.
pub fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn put_str(buf: &mut BytesMut, text: &str, max: usize) {
    let text = truncate_utf8(text, max);
    buf.put_u16(text.len() as u16);
    buf.put_slice(text.as_bytes());
}

fn get_str(buf: &mut &[u8], field: &'static str) -> Result<String, MalformedPacket> {
    need(buf, 2, field)?;
    let len = buf.get_u16() as usize;
    need(buf, len, field)?;
    let text = std::str::from_utf8(&buf[..len])
        .map_err(|_| MalformedPacket::InvalidUtf8 { field })?
        .to_owned();
    buf.advance(len);
    Ok(text)
}

fn put_vec3(buf: &mut BytesMut, v: Vec3) {
    buf.put_f32(v.x);
    buf.put_f32(v.y);
    buf.put_f32(v.z);
}

fn get_vec3(buf: &mut &[u8], field: &'static str) -> Result<Vec3, MalformedPacket> {
    need(buf, 12, field)?;
    Ok(Vec3::new(buf.get_f32(), buf.get_f32(), buf.get_f32()))
}

fn put_ivec3(buf: &mut BytesMut, v: IVec3) {
    buf.put_i32(v.x);
    buf.put_i32(v.y);
    buf.put_i32(v.z);
}

fn get_ivec3(buf: &mut &[u8], field: &'static str) -> Result<IVec3, MalformedPacket> {
    need(buf, 12, field)?;
    Ok(IVec3::new(buf.get_i32(), buf.get_i32(), buf.get_i32()))
}

fn get_u8(buf: &mut &[u8], field: &'static str) -> Result<u8, MalformedPacket> {
    need(buf, 1, field)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8], field: &'static str) -> Result<u16, MalformedPacket> {
    need(buf, 2, field)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8], field: &'static str) -> Result<u32, MalformedPacket> {
    need(buf, 4, field)?;
    Ok(buf.get_u32())
}

fn get_f32(buf: &mut &[u8], field: &'static str) -> Result<f32, MalformedPacket> {
    need(buf, 4, field)?;
    Ok(buf.get_f32())
}

/// Player actions a client sends once it is connected.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Move {
        position: Vec3,
        yaw: f32,
        pitch: f32,
        controls: Controls,
    },
    LookAt {
        yaw: f32,
        pitch: f32,
    },
    DigBlock {
        pos: IVec3,
    },
    PlaceBlock {
        pos: IVec3,
        item: String,
    },
    ChatMessage {
        text: String,
    },
    SelectSlot {
        slot: u16,
    },
}

impl Command {
    pub fn move_to(position: Vec3) -> Self {
        Self::Move {
            position,
            yaw: 0.0,
            pitch: 0.0,
            controls: Controls::empty(),
        }
    }

    pub fn chat(text: impl Into<String>) -> Self {
        Self::ChatMessage { text: text.into() }
    }

    /// Default channel for this command.
    pub fn channel(&self) -> Channel {
        match self {
            Self::Move { .. }
            | Self::DigBlock { .. }
            | Self::PlaceBlock { .. }
            | Self::ChatMessage { .. } => Channel::ReliableOrdered,
            Self::SelectSlot { .. } => Channel::ReliableUnordered,
            Self::LookAt { .. } => Channel::Unreliable,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::LookAt { .. } => "look_at",
            Self::DigBlock { .. } => "dig_block",
            Self::PlaceBlock { .. } => "place_block",
            Self::ChatMessage { .. } => "chat_message",
            Self::SelectSlot { .. } => "select_slot",
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        self.write(&mut buf);
        buf.freeze()
    }

    fn write(&self, buf: &mut BytesMut) {
        match self {
            Self::Move {
                position,
                yaw,
                pitch,
                controls,
            } => {
                buf.put_u8(TAG_MOVE);
                put_vec3(buf, *position);
                buf.put_f32(*yaw);
                buf.put_f32(*pitch);
                buf.put_u32(controls.bits());
            }
            Self::LookAt { yaw, pitch } => {
                buf.put_u8(TAG_LOOK_AT);
                buf.put_f32(*yaw);
                buf.put_f32(*pitch);
            }
            Self::DigBlock { pos } => {
                buf.put_u8(TAG_DIG_BLOCK);
                put_ivec3(buf, *pos);
            }
            Self::PlaceBlock { pos, item } => {
                buf.put_u8(TAG_PLACE_BLOCK);
                put_ivec3(buf, *pos);
                put_str(buf, item, MAX_NAME_LEN);
            }
            Self::ChatMessage { text } => {
                buf.put_u8(TAG_CHAT_MESSAGE);
                put_str(buf, text, MAX_TEXT_LEN);
            }
            Self::SelectSlot { slot } => {
                buf.put_u8(TAG_SELECT_SLOT);
                buf.put_u16(*slot);
            }
        }
    }

    fn read(tag: u8, buf: &mut &[u8]) -> Result<Self, MalformedPacket> {
        match tag {
            TAG_MOVE => Ok(Self::Move {
                position: get_vec3(buf, "position")?,
                yaw: get_f32(buf, "yaw")?,
                pitch: get_f32(buf, "pitch")?,
                controls: Controls::from_bits_truncate(get_u32(buf, "controls")?),
            }),
            TAG_LOOK_AT => Ok(Self::LookAt {
                yaw: get_f32(buf, "yaw")?,
                pitch: get_f32(buf, "pitch")?,
            }),
            TAG_DIG_BLOCK => Ok(Self::DigBlock {
                pos: get_ivec3(buf, "pos")?,
            }),
            TAG_PLACE_BLOCK => Ok(Self::PlaceBlock {
                pos: get_ivec3(buf, "pos")?,
                item: get_str(buf, "item")?,
            }),
            TAG_CHAT_MESSAGE => Ok(Self::ChatMessage {
                text: get_str(buf, "text")?,
            }),
            TAG_SELECT_SLOT => Ok(Self::SelectSlot {
                slot: get_u16(buf, "slot")?,
            }),
            other => Err(MalformedPacket::UnknownMessage(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Hello { version: u16, username: String },
    AuthResponse { proof: [u8; 32] },
    Command(Command),
}

impl ClientMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(40);
        match self {
            Self::Hello { version, username } => {
                buf.put_u8(TAG_HELLO);
                buf.put_u16(*version);
                put_str(&mut buf, username, MAX_NAME_LEN);
            }
            Self::AuthResponse { proof } => {
                buf.put_u8(TAG_AUTH_RESPONSE);
                buf.put_slice(proof);
            }
            Self::Command(command) => command.write(&mut buf),
        }
        buf.freeze()
    }

    /// Trailing bytes after a known message are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, MalformedPacket> {
        let mut buf = data;
        let tag = get_u8(&mut buf, "tag")?;
        match tag {
            TAG_HELLO => Ok(Self::Hello {
                version: get_u16(&mut buf, "version")?,
                username: get_str(&mut buf, "username")?,
            }),
            TAG_AUTH_RESPONSE => {
                need(buf, 32, "proof")?;
                let mut proof = [0u8; 32];
                buf.copy_to_slice(&mut proof);
                Ok(Self::AuthResponse { proof })
            }
            tag => Command::read(tag, &mut buf).map(Self::Command),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    WrongPassword,
    Banned,
    ServerFull,
    VersionMismatch,
    Other(u8),
}

impl RejectCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            1 => Self::WrongPassword,
            2 => Self::Banned,
            3 => Self::ServerFull,
            4 => Self::VersionMismatch,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::WrongPassword => 1,
            Self::Banned => 2,
            Self::ServerFull => 3,
            Self::VersionMismatch => 4,
            Self::Other(code) => code,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WrongPassword => "wrong password",
            Self::Banned => "banned",
            Self::ServerFull => "server full",
            Self::VersionMismatch => "version mismatch",
            Self::Other(_) => "rejected",
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "rejected (code {code})"),
            _ => f.write_str(self.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    SetPeerId {
        peer_id: u16,
    },
    AuthChallenge {
        nonce: u64,
    },
    AuthAccept {
        entity_id: u32,
    },
    AuthReject {
        code: RejectCode,
        reason: String,
    },
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
    Kick {
        reason: String,
    },
}

impl ServerMessage {
    /// Channel the reference server uses for this message.
    pub fn channel(&self) -> Channel {
        match self {
            Self::SetPeerId { .. }
            | Self::AuthChallenge { .. }
            | Self::AuthAccept { .. }
            | Self::AuthReject { .. }
            | Self::Kick { .. } => Channel::Control,
            Self::Chat { .. } | Self::BlockUpdate { .. } | Self::EntityRemoved { .. } => {
                Channel::ReliableOrdered
            }
            Self::EntityState { .. } => Channel::Unreliable,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            Self::SetPeerId { peer_id } => {
                buf.put_u8(TAG_SET_PEER_ID);
                buf.put_u16(*peer_id);
            }
            Self::AuthChallenge { nonce } => {
                buf.put_u8(TAG_AUTH_CHALLENGE);
                buf.put_u64(*nonce);
            }
            Self::AuthAccept { entity_id } => {
                buf.put_u8(TAG_AUTH_ACCEPT);
                buf.put_u32(*entity_id);
            }
            Self::AuthReject { code, reason } => {
                buf.put_u8(TAG_AUTH_REJECT);
                buf.put_u8(code.as_u8());
                put_str(&mut buf, reason, MAX_TEXT_LEN);
            }
            Self::Chat { sender, text } => {
                buf.put_u8(TAG_CHAT);
                put_str(&mut buf, sender, MAX_NAME_LEN);
                put_str(&mut buf, text, MAX_TEXT_LEN);
            }
            Self::BlockUpdate { pos, node } => {
                buf.put_u8(TAG_BLOCK_UPDATE);
                put_ivec3(&mut buf, *pos);
                put_str(&mut buf, node, MAX_NAME_LEN);
            }
            Self::EntityState {
                entity_id,
                position,
                yaw,
                pitch,
            } => {
                buf.put_u8(TAG_ENTITY_STATE);
                buf.put_u32(*entity_id);
                put_vec3(&mut buf, *position);
                buf.put_f32(*yaw);
                buf.put_f32(*pitch);
            }
            Self::EntityRemoved { entity_id } => {
                buf.put_u8(TAG_ENTITY_REMOVED);
                buf.put_u32(*entity_id);
            }
            Self::Kick { reason } => {
                buf.put_u8(TAG_KICK);
                put_str(&mut buf, reason, MAX_TEXT_LEN);
            }
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, MalformedPacket> {
        let mut buf = data;
        let buf = &mut buf;
        match get_u8(buf, "tag")? {
            TAG_SET_PEER_ID => Ok(Self::SetPeerId {
                peer_id: get_u16(buf, "peer_id")?,
            }),
            TAG_AUTH_CHALLENGE => {
                need(buf, 8, "nonce")?;
                Ok(Self::AuthChallenge {
                    nonce: buf.get_u64(),
                })
            }
            TAG_AUTH_ACCEPT => Ok(Self::AuthAccept {
                entity_id: get_u32(buf, "entity_id")?,
            }),
            TAG_AUTH_REJECT => Ok(Self::AuthReject {
                code: RejectCode::from_u8(get_u8(buf, "code")?),
                reason: get_str(buf, "reason")?,
            }),
            TAG_CHAT => Ok(Self::Chat {
                sender: get_str(buf, "sender")?,
                text: get_str(buf, "text")?,
            }),
            TAG_BLOCK_UPDATE => Ok(Self::BlockUpdate {
                pos: get_ivec3(buf, "pos")?,
                node: get_str(buf, "node")?,
            }),
            TAG_ENTITY_STATE => Ok(Self::EntityState {
                entity_id: get_u32(buf, "entity_id")?,
                position: get_vec3(buf, "position")?,
                yaw: get_f32(buf, "yaw")?,
                pitch: get_f32(buf, "pitch")?,
            }),
            TAG_ENTITY_REMOVED => Ok(Self::EntityRemoved {
                entity_id: get_u32(buf, "entity_id")?,
            }),
            TAG_KICK => Ok(Self::Kick {
                reason: get_str(buf, "reason")?,
            }),
            other => Err(MalformedPacket::UnknownMessage(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_channels() {
        assert_eq!(
            Command::move_to(Vec3::new(1.0, 2.0, 3.0)).channel(),
            Channel::ReliableOrdered
        );
        assert_eq!(Command::chat("hi").channel(), Channel::ReliableOrdered);
        assert_eq!(
            Command::SelectSlot { slot: 3 }.channel(),
            Channel::ReliableUnordered
        );
        assert_eq!(
            Command::LookAt {
                yaw: 0.5,
                pitch: 0.1
            }
            .channel(),
            Channel::Unreliable
        );
    }

    #[test]
    fn test_move_layout() {
        let command = Command::Move {
            position: Vec3::new(1.0, 2.0, 3.0),
            yaw: 0.0,
            pitch: 0.0,
            controls: Controls::FORWARD | Controls::JUMP,
        };
        let data = command.encode();

        assert_eq!(data.len(), 1 + 12 + 8 + 4);
        assert_eq!(data[0], TAG_MOVE);
        assert_eq!(&data[1..5], &1.0f32.to_be_bytes());
        assert_eq!(&data[21..25], &0x11u32.to_be_bytes());
        assert_eq!(
            ClientMessage::decode(&data).unwrap(),
            ClientMessage::Command(command)
        );
    }

    #[test]
    fn test_chat_truncated_at_char_boundary() {
        let text = "é".repeat(300);
        let data = Command::chat(text).encode();

        let ClientMessage::Command(Command::ChatMessage { text }) =
            ClientMessage::decode(&data).unwrap()
        else {
            panic!("expected chat");
        };
        assert_eq!(text.len(), MAX_TEXT_LEN);
        assert_eq!(text.chars().count(), 250);
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        assert_eq!(truncate_utf8("aé", 2), "a");
        assert_eq!(truncate_utf8("", 0), "");
    }

    #[test]
    fn test_server_messages_decode() {
        let messages = [
            ServerMessage::SetPeerId { peer_id: 7 },
            ServerMessage::AuthChallenge { nonce: 0xDEAD_BEEF },
            ServerMessage::AuthReject {
                code: RejectCode::WrongPassword,
                reason: "nope".into(),
            },
            ServerMessage::BlockUpdate {
                pos: IVec3::new(-1, 5, 9),
                node: "default:stone".into(),
            },
            ServerMessage::Kick {
                reason: "bye".into(),
            },
        ];

        for message in messages {
            assert_eq!(ServerMessage::decode(&message.encode()).unwrap(), message);
        }
    }

    #[test]
    fn test_truncated_message_rejected() {
        let data = ServerMessage::Chat {
            sender: "alice".into(),
            text: "hello".into(),
        }
        .encode();

        assert_eq!(
            ServerMessage::decode(&data[..data.len() - 1]),
            Err(MalformedPacket::Truncated { field: "text" })
        );
        assert_eq!(
            ServerMessage::decode(&[]),
            Err(MalformedPacket::Truncated { field: "tag" })
        );
        assert_eq!(
            ServerMessage::decode(&[0x7F]),
            Err(MalformedPacket::UnknownMessage(0x7F))
        );
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let data = [TAG_KICK, 0x00, 0x02, 0xFF, 0xFE];
        assert_eq!(
            ServerMessage::decode(&data),
            Err(MalformedPacket::InvalidUtf8 { field: "reason" })
        );
    }

    #[test]
    fn test_reject_code_mapping() {
        assert_eq!(RejectCode::from_u8(3), RejectCode::ServerFull);
        assert_eq!(RejectCode::from_u8(42), RejectCode::Other(42));
        assert_eq!(RejectCode::Other(42).as_u8(), 42);
        assert_eq!(RejectCode::Banned.to_string(), "banned");
    }

    #[test]
    fn test_unknown_control_bits_ignored() {
        let mut data = Command::Move {
            position: Vec3::ZERO,
            yaw: 0.0,
            pitch: 0.0,
            controls: Controls::SNEAK,
        }
        .encode()
        .to_vec();
        data[21..25].copy_from_slice(&0xFFFF_0020u32.to_be_bytes());

        let ClientMessage::Command(Command::Move { controls, .. }) =
            ClientMessage::decode(&data).unwrap()
        else {
            panic!("expected move");
        };
        assert_eq!(controls, Controls::SNEAK);
    }
}
