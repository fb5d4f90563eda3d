use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Impairments applied to every datagram passing through a [`NetworkSimulator`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkConditions {
    pub loss_percent: f32,
    pub duplicate_percent: f32,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub jitter: Duration,
}

impl LinkConditions {
    pub fn lossy(loss_percent: f32) -> Self {
        Self {
            loss_percent,
            ..Self::default()
        }
    }

    pub fn is_perfect(&self) -> bool {
        self.loss_percent <= 0.0
            && self.duplicate_percent <= 0.0
            && self.max_latency.is_zero()
            && self.jitter.is_zero()
    }
}

#[derive(Debug)]
struct DelayedDatagram<T> {
    release_time: Instant,
    order: u64,
    datagram: T,
}

impl<T> PartialEq for DelayedDatagram<T> {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.order == other.order
    }
}

impl<T> Eq for DelayedDatagram<T> {}

impl<T> PartialOrd for DelayedDatagram<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DelayedDatagram<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .release_time
            .cmp(&self.release_time)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Seeded, deterministic lossy link. Time is supplied by the caller.
#[derive(Debug)]
pub struct NetworkSimulator<T> {
    conditions: LinkConditions,
    rng: StdRng,
    queue: BinaryHeap<DelayedDatagram<T>>,
    next_order: u64,
    dropped: u64,
    duplicated: u64,
}

impl<T: Clone> NetworkSimulator<T> {
    pub fn new(conditions: LinkConditions, seed: u64) -> Self {
        Self {
            conditions,
            rng: StdRng::seed_from_u64(seed),
            queue: BinaryHeap::new(),
            next_order: 0,
            dropped: 0,
            duplicated: 0,
        }
    }

    pub fn conditions(&self) -> &LinkConditions {
        &self.conditions
    }

    pub fn set_conditions(&mut self, conditions: LinkConditions) {
        self.conditions = conditions;
    }

    pub fn send(&mut self, datagram: T, now: Instant) {
        if self.roll(self.conditions.loss_percent) {
            self.dropped += 1;
            return;
        }
        if self.roll(self.conditions.duplicate_percent) {
            self.duplicated += 1;
            let delay = self.delay();
            self.enqueue(datagram.clone(), now + delay);
        }
        let delay = self.delay();
        self.enqueue(datagram, now + delay);
    }

    /// Pops every datagram whose release time has passed, earliest first.
    pub fn take_ready(&mut self, now: Instant) -> Vec<T> {
        let mut ready = Vec::new();
        while self.queue.peek().is_some_and(|d| d.release_time <= now) {
            if let Some(delayed) = self.queue.pop() {
                ready.push(delayed.datagram);
            }
        }
        ready
    }

    pub fn next_release(&self) -> Option<Instant> {
        self.queue.peek().map(|d| d.release_time)
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn duplicated(&self) -> u64 {
        self.duplicated
    }

    fn enqueue(&mut self, datagram: T, release_time: Instant) {
        self.queue.push(DelayedDatagram {
            release_time,
            order: self.next_order,
            datagram,
        });
        self.next_order += 1;
    }

    fn roll(&mut self, percent: f32) -> bool {
        percent > 0.0 && self.rng.gen_range(0.0..100.0) < percent
    }

    fn delay(&mut self) -> Duration {
        let LinkConditions {
            min_latency,
            max_latency,
            jitter,
            ..
        } = self.conditions;

        let mut delay = min_latency;
        if max_latency > min_latency {
            delay += self.rng.gen_range(Duration::ZERO..=max_latency - min_latency);
        }
        if !jitter.is_zero() {
            delay += self.rng.gen_range(Duration::ZERO..=jitter);
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_link_passes_in_order() {
        let now = Instant::now();
        let mut sim = NetworkSimulator::new(LinkConditions::default(), 1);
        for i in 0..5 {
            sim.send(i, now);
        }
        assert_eq!(sim.take_ready(now), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_latency_holds_datagrams() {
        let now = Instant::now();
        let conditions = LinkConditions {
            min_latency: Duration::from_millis(50),
            max_latency: Duration::from_millis(50),
            ..LinkConditions::default()
        };
        let mut sim = NetworkSimulator::new(conditions, 1);
        sim.send("a", now);

        assert!(sim.take_ready(now + Duration::from_millis(49)).is_empty());
        assert_eq!(sim.next_release(), Some(now + Duration::from_millis(50)));
        assert_eq!(sim.take_ready(now + Duration::from_millis(50)), vec!["a"]);
    }

    #[test]
    fn test_loss_is_seeded() {
        let now = Instant::now();
        let run = |seed| {
            let mut sim = NetworkSimulator::new(LinkConditions::lossy(30.0), seed);
            for i in 0..200 {
                sim.send(i, now);
            }
            sim.take_ready(now)
        };

        let delivered = run(7);
        assert_eq!(delivered, run(7));
        assert!(delivered.len() > 100 && delivered.len() < 180);
    }

    #[test]
    fn test_full_loss_drops_everything() {
        let now = Instant::now();
        let mut sim = NetworkSimulator::new(LinkConditions::lossy(100.0), 3);
        for i in 0..10 {
            sim.send(i, now);
        }
        assert!(sim.take_ready(now).is_empty());
        assert_eq!(sim.dropped(), 10);
    }
}
