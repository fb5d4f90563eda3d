use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::channel::Channel;

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_ID: u32 = 0x564F_584C;
pub const PROTOCOL_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 10;
pub const DEFAULT_PORT: u16 = 30000;

pub const PEER_ID_UNASSIGNED: u16 = 0;
pub const PEER_ID_SERVER: u16 = 1;

const SEQUENCE_WRAP_THRESHOLD: u16 = u16::MAX / 2;

/// Wrap-aware "newer than" for 16-bit sequence numbers.
#[inline]
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPacket {
    #[error("datagram of {len} bytes is shorter than the {HEADER_SIZE}-byte header")]
    TooShort { len: usize },
    #[error("protocol id {0:#010x} does not match")]
    WrongProtocol(u32),
    #[error("declared payload length {declared} but {actual} bytes follow the header")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown packet kind {0:#04x}")]
    UnknownKind(u8),
    #[error("unknown channel id {0}")]
    UnknownChannel(u8),
    #[error("{kind:?} packet is not valid on the {channel} channel")]
    KindChannelMismatch { kind: PacketKind, channel: Channel },
    #[error("{kind:?} payload must be {expected} bytes, got {actual}")]
    BadPayloadSize {
        kind: PacketKind,
        expected: usize,
        actual: usize,
    },
    #[error("truncated field `{field}`")]
    Truncated { field: &'static str },
    #[error("field `{field}` is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
    #[error("unknown message tag {0:#04x}")]
    UnknownMessage(u8),
}

pub(crate) fn need(buf: &[u8], len: usize, field: &'static str) -> Result<(), MalformedPacket> {
    if buf.len() < len {
        Err(MalformedPacket::Truncated { field })
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Ack = 0,
    Reliable = 1,
    Unreliable = 2,
    Ping = 3,
    Pong = 4,
    Disconnect = 5,
}

impl TryFrom<u8> for PacketKind {
    type Error = MalformedPacket;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ack),
            1 => Ok(Self::Reliable),
            2 => Ok(Self::Unreliable),
            3 => Ok(Self::Ping),
            4 => Ok(Self::Pong),
            5 => Ok(Self::Disconnect),
            other => Err(MalformedPacket::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub protocol_id: u32,
    pub peer_id: u16,
    pub channel: Channel,
    pub kind: PacketKind,
    pub payload_len: u16,
}

impl PacketHeader {
    pub fn new(peer_id: u16, channel: Channel, kind: PacketKind, payload_len: u16) -> Self {
        Self {
            protocol_id: PROTOCOL_ID,
            peer_id,
            channel,
            kind,
            payload_len,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.protocol_id == PROTOCOL_ID
    }

    /// Splits a datagram into its header and the payload bytes that follow it.
    pub fn split(data: &[u8]) -> Result<(Self, &[u8]), MalformedPacket> {
        if data.len() < HEADER_SIZE {
            return Err(MalformedPacket::TooShort { len: data.len() });
        }

        let mut buf = &data[..HEADER_SIZE];
        let protocol_id = buf.get_u32();
        if protocol_id != PROTOCOL_ID {
            return Err(MalformedPacket::WrongProtocol(protocol_id));
        }
        let peer_id = buf.get_u16();
        let channel = Channel::try_from(buf.get_u8())?;
        let kind = PacketKind::try_from(buf.get_u8())?;
        let payload_len = buf.get_u16();

        let payload = &data[HEADER_SIZE..];
        if payload.len() != payload_len as usize {
            return Err(MalformedPacket::LengthMismatch {
                declared: payload_len as usize,
                actual: payload.len(),
            });
        }

        Ok((
            Self {
                protocol_id,
                peer_id,
                channel,
                kind,
                payload_len,
            },
            payload,
        ))
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.protocol_id);
        buf.put_u16(self.peer_id);
        buf.put_u8(self.channel.id());
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.payload_len);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    /// `ack` is the highest contiguous sequence delivered; bit `i` of
    /// `selective` marks `ack + 1 + i` as buffered.
    Ack { ack: u16, selective: u32 },
    Reliable { sequence: u16, payload: Bytes },
    Unreliable { sequence: u16, payload: Bytes },
    Ping { stamp: u64 },
    Pong { stamp: u64 },
    Disconnect,
}

impl PacketBody {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Ack { .. } => PacketKind::Ack,
            Self::Reliable { .. } => PacketKind::Reliable,
            Self::Unreliable { .. } => PacketKind::Unreliable,
            Self::Ping { .. } => PacketKind::Ping,
            Self::Pong { .. } => PacketKind::Pong,
            Self::Disconnect => PacketKind::Disconnect,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Ack { .. } => 6,
            Self::Reliable { payload, .. } | Self::Unreliable { payload, .. } => 2 + payload.len(),
            Self::Ping { .. } | Self::Pong { .. } => 8,
            Self::Disconnect => 0,
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        match self {
            Self::Ack { ack, selective } => {
                buf.put_u16(*ack);
                buf.put_u32(*selective);
            }
            Self::Reliable { sequence, payload } | Self::Unreliable { sequence, payload } => {
                buf.put_u16(*sequence);
                buf.put_slice(payload);
            }
            Self::Ping { stamp } | Self::Pong { stamp } => buf.put_u64(*stamp),
            Self::Disconnect => {}
        }
    }

    fn read(kind: PacketKind, mut payload: &[u8]) -> Result<Self, MalformedPacket> {
        let fixed = |expected: usize| {
            if payload.len() == expected {
                Ok(())
            } else {
                Err(MalformedPacket::BadPayloadSize {
                    kind,
                    expected,
                    actual: payload.len(),
                })
            }
        };

        match kind {
            PacketKind::Ack => {
                fixed(6)?;
                Ok(Self::Ack {
                    ack: payload.get_u16(),
                    selective: payload.get_u32(),
                })
            }
            PacketKind::Reliable | PacketKind::Unreliable => {
                need(payload, 2, "sequence")?;
                let sequence = payload.get_u16();
                let payload = Bytes::copy_from_slice(payload);
                if kind == PacketKind::Reliable {
                    Ok(Self::Reliable { sequence, payload })
                } else {
                    Ok(Self::Unreliable { sequence, payload })
                }
            }
            PacketKind::Ping => {
                fixed(8)?;
                Ok(Self::Ping {
                    stamp: payload.get_u64(),
                })
            }
            PacketKind::Pong => {
                fixed(8)?;
                Ok(Self::Pong {
                    stamp: payload.get_u64(),
                })
            }
            PacketKind::Disconnect => {
                fixed(0)?;
                Ok(Self::Disconnect)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub peer_id: u16,
    pub channel: Channel,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(peer_id: u16, channel: Channel, body: PacketBody) -> Self {
        Self {
            peer_id,
            channel,
            body,
        }
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader::new(
            self.peer_id,
            self.channel,
            self.body.kind(),
            self.body.encoded_len() as u16,
        )
    }

    pub fn encode(&self) -> Bytes {
        let header = self.header();
        debug_assert!(HEADER_SIZE + header.payload_len as usize <= MAX_PACKET_SIZE);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + header.payload_len as usize);
        header.write(&mut buf);
        self.body.write(&mut buf);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, MalformedPacket> {
        let (header, payload) = PacketHeader::split(data)?;

        let channel_ok = match header.kind {
            PacketKind::Ack | PacketKind::Reliable => header.channel.is_reliable(),
            PacketKind::Unreliable => !header.channel.is_reliable(),
            PacketKind::Ping | PacketKind::Pong | PacketKind::Disconnect => true,
        };
        if !channel_ok {
            return Err(MalformedPacket::KindChannelMismatch {
                kind: header.kind,
                channel: header.channel,
            });
        }

        Ok(Self {
            peer_id: header.peer_id,
            channel: header.channel,
            body: PacketBody::read(header.kind, payload)?,
        })
    }
}
