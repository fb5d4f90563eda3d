use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::protocol::{MalformedPacket, PacketBody};
use super::tracking::{ReceiveError, ReceiveWindow, ReliabilitySettings, SendTracker};
use crate::error::TimeoutCause;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Channel {
    Control = 0,
    ReliableOrdered = 1,
    ReliableUnordered = 2,
    Unreliable = 3,
}

impl Channel {
    /// All channels, highest transmit priority first.
    pub const ALL: [Channel; 4] = [
        Channel::Control,
        Channel::ReliableOrdered,
        Channel::ReliableUnordered,
        Channel::Unreliable,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    fn index(self) -> usize {
        self as usize
    }

    pub fn is_reliable(self) -> bool {
        !matches!(self, Self::Unreliable)
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, Self::Control | Self::ReliableOrdered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::ReliableOrdered => "reliable-ordered",
            Self::ReliableUnordered => "reliable-unordered",
            Self::Unreliable => "unreliable",
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = MalformedPacket;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Control),
            1 => Ok(Self::ReliableOrdered),
            2 => Ok(Self::ReliableUnordered),
            3 => Ok(Self::Unreliable),
            other => Err(MalformedPacket::UnknownChannel(other)),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct ReliableLane {
    sender: SendTracker,
    receiver: ReceiveWindow,
    outbound: VecDeque<PacketBody>,
    ack_due: bool,
}

impl ReliableLane {
    fn new(ordered: bool, settings: &ReliabilitySettings) -> Self {
        Self {
            sender: SendTracker::new(settings),
            receiver: ReceiveWindow::starting_at(1, settings.receive_window, ordered),
            outbound: VecDeque::new(),
            ack_due: false,
        }
    }

    fn promote_backlog(&mut self, now: Instant) {
        while let Some((sequence, payload)) = self.sender.poll_backlog(now) {
            self.outbound
                .push_back(PacketBody::Reliable { sequence, payload });
        }
    }
}

#[derive(Debug)]
struct UnreliableLane {
    next_sequence: u16,
    outbound: VecDeque<PacketBody>,
    capacity: usize,
}

#[derive(Debug)]
enum Lane {
    Reliable(ReliableLane),
    Unreliable(UnreliableLane),
}

impl Lane {
    fn outbound_mut(&mut self) -> &mut VecDeque<PacketBody> {
        match self {
            Self::Reliable(lane) => &mut lane.outbound,
            Self::Unreliable(lane) => &mut lane.outbound,
        }
    }
}

/// Per-channel reliability and transmit scheduling for one peer.
///
/// Transmit order is urgent control packets (ping, pong, disconnect), then
/// pending acks, then data in channel priority order.
#[derive(Debug)]
pub struct ChannelMux {
    lanes: [Lane; 4],
    urgent: VecDeque<PacketBody>,
    initial_rto: Duration,
    retransmissions: u64,
    duplicates: u64,
    unreliable_dropped: u64,
}

impl ChannelMux {
    pub fn new(settings: &ReliabilitySettings) -> Self {
        Self {
            lanes: [
                Lane::Reliable(ReliableLane::new(true, settings)),
                Lane::Reliable(ReliableLane::new(true, settings)),
                Lane::Reliable(ReliableLane::new(false, settings)),
                Lane::Unreliable(UnreliableLane {
                    next_sequence: 1,
                    outbound: VecDeque::new(),
                    capacity: settings.unreliable_queue.max(1),
                }),
            ],
            urgent: VecDeque::new(),
            initial_rto: settings.initial_rto,
            retransmissions: 0,
            duplicates: 0,
            unreliable_dropped: 0,
        }
    }

    /// Queues an application payload on `channel`.
    pub fn send(&mut self, channel: Channel, payload: Bytes, now: Instant) {
        match &mut self.lanes[channel.index()] {
            Lane::Reliable(lane) => {
                if let Some((sequence, payload)) = lane.sender.track_packet(payload, now) {
                    lane.outbound
                        .push_back(PacketBody::Reliable { sequence, payload });
                } else {
                    log::trace!(
                        "{channel} window full, {} backlogged",
                        lane.sender.backlog_len()
                    );
                }
            }
            Lane::Unreliable(lane) => {
                if lane.outbound.len() >= lane.capacity {
                    lane.outbound.pop_front();
                    self.unreliable_dropped += 1;
                }
                let sequence = lane.next_sequence;
                lane.next_sequence = lane.next_sequence.wrapping_add(1);
                lane.outbound
                    .push_back(PacketBody::Unreliable { sequence, payload });
            }
        }
    }

    /// Queues a ping, pong or disconnect ahead of everything else.
    pub fn send_urgent(&mut self, body: PacketBody) {
        self.urgent.push_back(body);
    }

    /// Feeds an inbound data or ack packet and returns payloads ready for the application.
    pub fn handle_inbound(&mut self, channel: Channel, body: PacketBody, now: Instant) -> Vec<Bytes> {
        match (&mut self.lanes[channel.index()], body) {
            (Lane::Reliable(lane), PacketBody::Ack { ack, selective }) => {
                let acked = lane.sender.process_ack(ack, selective, now);
                if !acked.is_empty() {
                    log::trace!("{channel} acked {acked:?}");
                    lane.promote_backlog(now);
                }
                Vec::new()
            }
            (Lane::Reliable(lane), PacketBody::Reliable { sequence, payload }) => {
                // Duplicates are acked again.
                lane.ack_due = true;
                match lane.receiver.record_received(sequence, payload) {
                    Ok(delivered) => delivered,
                    Err(ReceiveError::DuplicateOrStale(sequence)) => {
                        log::trace!("{channel} duplicate sequence {sequence}");
                        self.duplicates += 1;
                        Vec::new()
                    }
                    Err(err @ ReceiveError::OutOfWindow(_)) => {
                        log::debug!("{channel}: {err}");
                        Vec::new()
                    }
                }
            }
            // No ordering or dedup: late and repeated datagrams are delivered as they come.
            (Lane::Unreliable(_), PacketBody::Unreliable { payload, .. }) => vec![payload],
            (_, body) => {
                log::debug!("ignoring {:?} on {channel}", body.kind());
                Vec::new()
            }
        }
    }

    /// Schedules retransmissions that are due.
    pub fn tick(&mut self, now: Instant) -> Result<(), TimeoutCause> {
        for channel in Channel::ALL {
            let Lane::Reliable(lane) = &mut self.lanes[channel.index()] else {
                continue;
            };
            let resends = lane.sender.collect_resends(now).map_err(|exhausted| {
                TimeoutCause::RetransmitsExhausted {
                    channel,
                    sequence: exhausted.sequence,
                }
            })?;
            for (sequence, payload) in resends {
                log::trace!("{channel} retransmitting {sequence}");
                self.retransmissions += 1;
                lane.outbound
                    .push_back(PacketBody::Reliable { sequence, payload });
            }
        }
        Ok(())
    }

    /// Next packet to put on the wire, in priority order.
    pub fn poll_transmit(&mut self) -> Option<(Channel, PacketBody)> {
        if let Some(body) = self.urgent.pop_front() {
            return Some((Channel::Control, body));
        }

        for channel in Channel::ALL {
            if let Lane::Reliable(lane) = &mut self.lanes[channel.index()] {
                if lane.ack_due {
                    lane.ack_due = false;
                    let (ack, selective) = lane.receiver.ack_data();
                    return Some((channel, PacketBody::Ack { ack, selective }));
                }
            }
        }

        for channel in Channel::ALL {
            if let Some(body) = self.lanes[channel.index()].outbound_mut().pop_front() {
                return Some((channel, body));
            }
        }

        None
    }

    /// Drops everything queued for transmission, including pending acks.
    pub fn clear_outbound(&mut self) {
        self.urgent.clear();
        for lane in &mut self.lanes {
            lane.outbound_mut().clear();
            if let Lane::Reliable(lane) = lane {
                lane.ack_due = false;
            }
        }
    }

    pub fn has_outbound(&self) -> bool {
        !self.urgent.is_empty()
            || self.lanes.iter().any(|lane| match lane {
                Lane::Reliable(lane) => lane.ack_due || !lane.outbound.is_empty(),
                Lane::Unreliable(lane) => !lane.outbound.is_empty(),
            })
    }

    /// True once every reliable message sent has been acknowledged.
    pub fn is_idle(&self) -> bool {
        self.lanes.iter().all(|lane| match lane {
            Lane::Reliable(lane) => lane.sender.is_idle(),
            Lane::Unreliable(_) => true,
        })
    }

    pub fn unacked_count(&self) -> usize {
        self.lanes
            .iter()
            .map(|lane| match lane {
                Lane::Reliable(lane) => lane.sender.unacked_count() + lane.sender.backlog_len(),
                Lane::Unreliable(_) => 0,
            })
            .sum()
    }

    /// Smoothed RTT and RTO in milliseconds, taken from the slowest sampled lane.
    pub fn rtt_ms(&self) -> (f32, f32) {
        let mut srtt = 0.0f32;
        let mut rto = None;
        for lane in &self.lanes {
            let Lane::Reliable(lane) = lane else {
                continue;
            };
            let rtt = lane.sender.rtt();
            if rtt.has_sample() {
                srtt = srtt.max(rtt.srtt());
                rto = rto.max(Some(rtt.rto()));
            }
        }
        let rto = rto.unwrap_or(self.initial_rto);
        (srtt, rto.as_secs_f32() * 1000.0)
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn unreliable_dropped(&self) -> u64 {
        self.unreliable_dropped
    }
}
