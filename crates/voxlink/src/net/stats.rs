#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped_malformed: u64,
    pub duplicates: u64,
    pub retransmissions: u64,
    pub unreliable_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
    pub rto_ms: f32,
}

impl NetworkStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Share of transmissions that were retransmissions, in percent.
    pub fn retransmit_percent(&self) -> f32 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f32 / self.packets_sent as f32 * 100.0
    }
}
