use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::protocol::sequence_greater_than;

pub const ACK_BITS: u16 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliabilitySettings {
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    pub max_retransmits: u32,
    pub max_in_flight: usize,
    pub receive_window: usize,
    pub unreliable_queue: usize,
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(500),
            min_rto: Duration::from_millis(100),
            max_rto: Duration::from_millis(4000),
            max_retransmits: 8,
            max_in_flight: 256,
            receive_window: 1024,
            unreliable_queue: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sequence {sequence} unacknowledged after {retransmits} retransmissions")]
pub struct RetransmitsExhausted {
    pub sequence: u16,
    pub retransmits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReceiveError {
    #[error("sequence {0} was already delivered")]
    DuplicateOrStale(u16),
    #[error("sequence {0} is beyond the receive window")]
    OutOfWindow(u16),
}

#[derive(Debug, Clone)]
pub struct SequencedMessage {
    pub sequence: u16,
    pub payload: Bytes,
    pub send_time: Instant,
    pub deadline: Instant,
    pub retransmits: u32,
    pub acked: bool,
}

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: f32,
    rtt_var: f32,
    has_sample: bool,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        let max_rto = max_rto.max(min_rto);
        Self {
            srtt: initial_rto.as_secs_f32() * 1000.0,
            rtt_var: 0.0,
            has_sample: false,
            rto: initial_rto.clamp(min_rto, max_rto),
            min_rto,
            max_rto,
        }
    }

    pub fn update(&mut self, rtt: Duration) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let rtt = rtt.as_secs_f32() * 1000.0;
        if self.has_sample {
            let diff = (rtt - self.srtt).abs();
            self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
        } else {
            self.srtt = rtt;
            self.rtt_var = rtt / 2.0;
            self.has_sample = true;
        }

        let rto_ms = (self.srtt + 4.0 * self.rtt_var).max(0.0);
        self.rto = Duration::from_secs_f32(rto_ms / 1000.0).clamp(self.min_rto, self.max_rto);
    }

    /// Wait before retransmission number `retransmits`: `rto * 2^retransmits`, capped.
    pub fn backoff(&self, retransmits: u32) -> Duration {
        let factor = 1u32.checked_shl(retransmits).unwrap_or(u32::MAX);
        self.rto.saturating_mul(factor).min(self.max_rto)
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }
}

/// Sender half of a reliable lane.
///
/// Messages beyond `max_in_flight` wait in a backlog and get their sequence
/// number only when the window opens, so the peer never sees a gap wider
/// than the window.
#[derive(Debug)]
pub struct SendTracker {
    next_sequence: u16,
    in_flight: VecDeque<SequencedMessage>,
    backlog: VecDeque<Bytes>,
    max_in_flight: usize,
    max_retransmits: u32,
    rtt: RttEstimator,
}

impl SendTracker {
    pub fn new(settings: &ReliabilitySettings) -> Self {
        Self::starting_at(1, settings)
    }

    pub fn starting_at(first_sequence: u16, settings: &ReliabilitySettings) -> Self {
        Self {
            next_sequence: first_sequence,
            in_flight: VecDeque::new(),
            backlog: VecDeque::new(),
            max_in_flight: settings.max_in_flight.max(1),
            max_retransmits: settings.max_retransmits,
            rtt: RttEstimator::new(settings.initial_rto, settings.min_rto, settings.max_rto),
        }
    }

    /// Returns the sequence to transmit now, or `None` if the payload was backlogged.
    pub fn track_packet(&mut self, payload: Bytes, now: Instant) -> Option<(u16, Bytes)> {
        if self.in_flight.len() >= self.max_in_flight || !self.backlog.is_empty() {
            self.backlog.push_back(payload);
            return None;
        }
        Some(self.assign(payload, now))
    }

    pub fn poll_backlog(&mut self, now: Instant) -> Option<(u16, Bytes)> {
        if self.in_flight.len() >= self.max_in_flight {
            return None;
        }
        let payload = self.backlog.pop_front()?;
        Some(self.assign(payload, now))
    }

    fn assign(&mut self, payload: Bytes, now: Instant) -> (u16, Bytes) {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        self.in_flight.push_back(SequencedMessage {
            sequence,
            payload: payload.clone(),
            send_time: now,
            deadline: now + self.rtt.rto(),
            retransmits: 0,
            acked: false,
        });

        (sequence, payload)
    }

    pub fn last_sent(&self) -> u16 {
        self.next_sequence.wrapping_sub(1)
    }

    pub fn process_ack(&mut self, ack: u16, selective: u32, now: Instant) -> Vec<u16> {
        if sequence_greater_than(ack, self.last_sent()) {
            log::debug!(
                "ignoring ack {ack} beyond last sent sequence {}",
                self.last_sent()
            );
            return Vec::new();
        }

        let mut acked_sequences = Vec::new();
        let mut rtt_samples = Vec::new();

        for pending in &mut self.in_flight {
            if pending.acked {
                continue;
            }

            let is_acked = if !sequence_greater_than(pending.sequence, ack) {
                true
            } else {
                let offset = pending.sequence.wrapping_sub(ack).wrapping_sub(1);
                offset < ACK_BITS && (selective & (1u32 << offset)) != 0
            };

            if is_acked {
                pending.acked = true;
                acked_sequences.push(pending.sequence);

                // Karn: a retransmitted message gives an ambiguous sample.
                if pending.retransmits == 0 {
                    rtt_samples.push(now.saturating_duration_since(pending.send_time));
                }
            }
        }

        for rtt in rtt_samples {
            self.rtt.update(rtt);
        }

        while self.in_flight.front().is_some_and(|p| p.acked) {
            self.in_flight.pop_front();
        }

        acked_sequences
    }

    /// Collects every message whose retransmission deadline has passed.
    pub fn collect_resends(
        &mut self,
        now: Instant,
    ) -> Result<Vec<(u16, Bytes)>, RetransmitsExhausted> {
        let mut resends = Vec::new();

        for pending in &mut self.in_flight {
            if pending.acked || pending.deadline > now {
                continue;
            }
            if pending.retransmits >= self.max_retransmits {
                return Err(RetransmitsExhausted {
                    sequence: pending.sequence,
                    retransmits: pending.retransmits,
                });
            }

            pending.retransmits += 1;
            pending.send_time = now;
            pending.deadline = now + self.rtt.backoff(pending.retransmits);
            resends.push((pending.sequence, pending.payload.clone()));
        }

        Ok(resends)
    }

    /// Earliest retransmission deadline among unacked messages.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight
            .iter()
            .filter(|p| !p.acked)
            .map(|p| p.deadline)
            .min()
    }

    pub fn unacked_count(&self) -> usize {
        self.in_flight.iter().filter(|p| !p.acked).count()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_idle(&self) -> bool {
        self.unacked_count() == 0 && self.backlog.is_empty()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }
}

/// Receiver half of a reliable lane.
///
/// `slots[i]` holds sequence `last_delivered + 1 + i`. Ordered windows keep
/// the payload until the gap before it closes; unordered windows hand it out
/// at once and keep an empty marker for duplicate detection.
#[derive(Debug)]
pub struct ReceiveWindow {
    last_delivered: u16,
    slots: VecDeque<Option<Bytes>>,
    capacity: usize,
    ordered: bool,
}

impl ReceiveWindow {
    pub fn ordered(capacity: usize) -> Self {
        Self::starting_at(1, capacity, true)
    }

    pub fn unordered(capacity: usize) -> Self {
        Self::starting_at(1, capacity, false)
    }

    pub fn starting_at(first_sequence: u16, capacity: usize, ordered: bool) -> Self {
        Self {
            last_delivered: first_sequence.wrapping_sub(1),
            slots: VecDeque::new(),
            capacity: capacity.max(1),
            ordered,
        }
    }

    pub fn record_received(
        &mut self,
        sequence: u16,
        payload: Bytes,
    ) -> Result<Vec<Bytes>, ReceiveError> {
        if !sequence_greater_than(sequence, self.last_delivered) {
            return Err(ReceiveError::DuplicateOrStale(sequence));
        }

        let offset = sequence.wrapping_sub(self.last_delivered).wrapping_sub(1) as usize;
        if offset >= self.capacity {
            return Err(ReceiveError::OutOfWindow(sequence));
        }
        if self.slots.len() <= offset {
            self.slots.resize(offset + 1, None);
        }
        if self.slots[offset].is_some() {
            return Err(ReceiveError::DuplicateOrStale(sequence));
        }

        let mut delivered = Vec::new();
        if self.ordered {
            self.slots[offset] = Some(payload);
        } else {
            delivered.push(payload);
            self.slots[offset] = Some(Bytes::new());
        }

        while self.slots.front().is_some_and(Option::is_some) {
            let slot = self.slots.pop_front().flatten();
            self.last_delivered = self.last_delivered.wrapping_add(1);
            if let (true, Some(payload)) = (self.ordered, slot) {
                delivered.push(payload);
            }
        }

        Ok(delivered)
    }

    /// Cumulative ack plus the selective bitfield for the 32 sequences after it.
    pub fn ack_data(&self) -> (u16, u32) {
        let selective = self
            .slots
            .iter()
            .take(ACK_BITS as usize)
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .fold(0u32, |bits, (i, _)| bits | (1 << i));

        (self.last_delivered, selective)
    }

    pub fn last_delivered(&self) -> u16 {
        self.last_delivered
    }

    pub fn buffered_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ReliabilitySettings {
        ReliabilitySettings::default()
    }

    fn payload(n: u8) -> Bytes {
        Bytes::from(vec![n])
    }

    #[test]
    fn test_sequences_start_at_one() {
        let now = Instant::now();
        let mut tracker = SendTracker::new(&settings());

        assert_eq!(tracker.track_packet(payload(1), now).unwrap().0, 1);
        assert_eq!(tracker.track_packet(payload(2), now).unwrap().0, 2);
        assert_eq!(tracker.unacked_count(), 2);
    }

    #[test]
    fn test_cumulative_and_selective_ack() {
        let now = Instant::now();
        let mut tracker = SendTracker::new(&settings());
        for i in 0..6 {
            tracker.track_packet(payload(i), now);
        }

        // 1..=2 delivered, 4 and 6 buffered
        let acked = tracker.process_ack(2, 0b1010, now + Duration::from_millis(40));
        assert_eq!(acked, vec![1, 2, 4, 6]);
        assert_eq!(tracker.unacked_count(), 2);

        let acked = tracker.process_ack(6, 0, now + Duration::from_millis(60));
        assert_eq!(acked, vec![3, 5]);
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_ack_beyond_last_sent_ignored() {
        let now = Instant::now();
        let mut tracker = SendTracker::new(&settings());
        tracker.track_packet(payload(1), now);

        assert!(tracker.process_ack(9, u32::MAX, now).is_empty());
        assert_eq!(tracker.unacked_count(), 1);
    }

    #[test]
    fn test_backlog_beyond_window() {
        let now = Instant::now();
        let settings = ReliabilitySettings {
            max_in_flight: 2,
            ..ReliabilitySettings::default()
        };
        let mut tracker = SendTracker::new(&settings);

        assert!(tracker.track_packet(payload(1), now).is_some());
        assert!(tracker.track_packet(payload(2), now).is_some());
        assert!(tracker.track_packet(payload(3), now).is_none());
        assert_eq!(tracker.backlog_len(), 1);
        assert!(tracker.poll_backlog(now).is_none());

        tracker.process_ack(1, 0, now);
        assert_eq!(tracker.poll_backlog(now).map(|(seq, _)| seq), Some(3));
    }

    #[test]
    fn test_retransmit_backoff_and_exhaustion() {
        let start = Instant::now();
        let settings = ReliabilitySettings {
            initial_rto: Duration::from_millis(100),
            min_rto: Duration::from_millis(100),
            max_rto: Duration::from_millis(300),
            max_retransmits: 3,
            ..ReliabilitySettings::default()
        };
        let mut tracker = SendTracker::new(&settings);
        tracker.track_packet(payload(1), start);

        let at = |ms| start + Duration::from_millis(ms);
        assert!(tracker.collect_resends(at(99)).unwrap().is_empty());
        assert_eq!(tracker.collect_resends(at(100)).unwrap().len(), 1);
        // second wait is 200ms
        assert!(tracker.collect_resends(at(299)).unwrap().is_empty());
        assert_eq!(tracker.collect_resends(at(300)).unwrap().len(), 1);
        // third wait is capped at 300ms
        assert_eq!(tracker.collect_resends(at(600)).unwrap().len(), 1);

        let err = tracker.collect_resends(at(900)).unwrap_err();
        assert_eq!(
            err,
            RetransmitsExhausted {
                sequence: 1,
                retransmits: 3
            }
        );
    }

    #[test]
    fn test_karn_skips_retransmitted_samples() {
        let start = Instant::now();
        let mut tracker = SendTracker::new(&settings());
        tracker.track_packet(payload(1), start);
        tracker
            .collect_resends(start + Duration::from_millis(500))
            .unwrap();

        tracker.process_ack(1, 0, start + Duration::from_millis(520));
        assert!(!tracker.rtt().has_sample());
    }

    #[test]
    fn test_rtt_estimate() {
        let mut rtt = RttEstimator::new(
            Duration::from_millis(500),
            Duration::from_millis(100),
            Duration::from_millis(4000),
        );
        rtt.update(Duration::from_millis(200));
        assert!((rtt.srtt() - 200.0).abs() < 0.01);
        assert!((rtt.rtt_var() - 100.0).abs() < 0.01);
        assert_eq!(rtt.rto().as_millis(), 600);

        for _ in 0..50 {
            rtt.update(Duration::from_millis(20));
        }
        assert_eq!(rtt.rto(), Duration::from_millis(100));
    }

    #[test]
    fn test_ordered_window_reorders() {
        let mut window = ReceiveWindow::ordered(1024);

        assert!(window.record_received(2, payload(2)).unwrap().is_empty());
        assert!(window.record_received(3, payload(3)).unwrap().is_empty());
        // Bit i covers sequence ack + 1 + i, so 2 and 3 are bits 1 and 2.
        assert_eq!(window.ack_data(), (0, 0b110));

        let delivered = window.record_received(1, payload(1)).unwrap();
        assert_eq!(delivered, vec![payload(1), payload(2), payload(3)]);
        assert_eq!(window.ack_data(), (3, 0));
    }

    #[test]
    fn test_unordered_window_delivers_immediately() {
        let mut window = ReceiveWindow::unordered(1024);

        assert_eq!(window.record_received(3, payload(3)).unwrap(), vec![payload(3)]);
        assert_eq!(
            window.record_received(3, payload(3)),
            Err(ReceiveError::DuplicateOrStale(3))
        );
        assert_eq!(window.record_received(1, payload(1)).unwrap(), vec![payload(1)]);
        assert_eq!(window.ack_data(), (1, 0b10));
    }

    #[test]
    fn test_duplicates_and_window_bounds() {
        let mut window = ReceiveWindow::ordered(4);

        window.record_received(1, payload(1)).unwrap();
        assert_eq!(
            window.record_received(1, payload(1)),
            Err(ReceiveError::DuplicateOrStale(1))
        );
        assert_eq!(
            window.record_received(6, payload(6)),
            Err(ReceiveError::OutOfWindow(6))
        );
        assert!(window.record_received(5, payload(5)).is_ok());
    }

    #[test]
    fn test_window_across_wraparound() {
        let mut window = ReceiveWindow::starting_at(u16::MAX - 1, 64, true);

        assert!(window.record_received(0, payload(2)).unwrap().is_empty());
        assert!(window.record_received(u16::MAX, payload(1)).unwrap().is_empty());
        let delivered = window.record_received(u16::MAX - 1, payload(0)).unwrap();

        assert_eq!(delivered, vec![payload(0), payload(1), payload(2)]);
        assert_eq!(window.last_delivered(), 0);
    }
}
