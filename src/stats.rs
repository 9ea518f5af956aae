use std::time::{Duration, Instant};

/// Packet/byte counters for one direction and reliability class.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketCounter {
    pub packets: u64,
    pub wire_bytes: u64,
    pub payload_bytes: u64,
}

impl PacketCounter {
    fn record(&mut self, wire_size: usize, payload_size: usize) {
        self.packets += 1;
        self.wire_bytes += wire_size as u64;
        self.payload_bytes += payload_size as u64;
    }
}

/// One sampled window of per-connection statistics. Event counters cover the sample
///  window; send period, flow window and RTT are gauges carrying the latest value.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub sent_reliable: PacketCounter,
    pub received_reliable: PacketCounter,
    pub sent_unreliable: PacketCounter,
    pub received_unreliable: PacketCounter,
    pub retransmitted: PacketCounter,

    pub acks_sent: u64,
    pub acks_received: u64,

    pub duplicate_packets: u64,
    pub losses_detected: u64,
    pub losses_recovered: u64,

    pub packet_send_period: Duration,
    pub flow_window_size: u32,
    pub congestion_window_size: u32,
    pub rtt_estimate: Option<Duration>,

    pub sample_duration: Duration,
}

/// Collects statistics for one connection; [ConnectionStats::sample] snapshots and starts
///  a fresh window.
pub struct ConnectionStats {
    current: Stats,
    window_started_at: Instant,
}

impl Default for ConnectionStats {
    fn default() -> ConnectionStats {
        ConnectionStats {
            current: Stats::default(),
            window_started_at: Instant::now(),
        }
    }
}

impl ConnectionStats {
    pub fn record_sent_reliable(&mut self, wire_size: usize, payload_size: usize) {
        self.current.sent_reliable.record(wire_size, payload_size);
    }

    pub fn record_received_reliable(&mut self, wire_size: usize, payload_size: usize) {
        self.current.received_reliable.record(wire_size, payload_size);
    }

    pub fn record_sent_unreliable(&mut self, wire_size: usize, payload_size: usize) {
        self.current.sent_unreliable.record(wire_size, payload_size);
    }

    pub fn record_received_unreliable(&mut self, wire_size: usize, payload_size: usize) {
        self.current.received_unreliable.record(wire_size, payload_size);
    }

    pub fn record_retransmission(&mut self, wire_size: usize, payload_size: usize) {
        self.current.retransmitted.record(wire_size, payload_size);
    }

    pub fn record_ack_sent(&mut self) {
        self.current.acks_sent += 1;
    }

    pub fn record_ack_received(&mut self) {
        self.current.acks_received += 1;
    }

    pub fn record_duplicate(&mut self) {
        self.current.duplicate_packets += 1;
    }

    pub fn record_losses_detected(&mut self, count: u32) {
        self.current.losses_detected += count as u64;
    }

    pub fn record_loss_recovered(&mut self) {
        self.current.losses_recovered += 1;
    }

    pub fn record_packet_send_period(&mut self, period: Duration) {
        self.current.packet_send_period = period;
    }

    pub fn record_flow_window_size(&mut self, flow_window_size: u32) {
        self.current.flow_window_size = flow_window_size;
    }

    pub fn record_congestion_window_size(&mut self, congestion_window_size: u32) {
        self.current.congestion_window_size = congestion_window_size;
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        self.current.rtt_estimate = Some(rtt);
    }

    /// Snapshot the current window and start a new one. Gauges survive into the new
    ///  window, event counters start from zero.
    pub fn sample(&mut self) -> Stats {
        let mut sample = Stats {
            packet_send_period: self.current.packet_send_period,
            flow_window_size: self.current.flow_window_size,
            congestion_window_size: self.current.congestion_window_size,
            rtt_estimate: self.current.rtt_estimate,
            ..Stats::default()
        };
        std::mem::swap(&mut sample, &mut self.current);

        let now = Instant::now();
        sample.sample_duration = now - self.window_started_at;
        self.window_started_at = now;

        sample
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let mut stats = ConnectionStats::default();
        stats.record_sent_reliable(100, 72);
        stats.record_sent_reliable(50, 22);
        stats.record_received_unreliable(60, 32);
        stats.record_retransmission(100, 72);
        stats.record_ack_sent();
        stats.record_ack_received();
        stats.record_duplicate();
        stats.record_losses_detected(3);
        stats.record_loss_recovered();

        let sample = stats.sample();
        assert_eq!(sample.sent_reliable, PacketCounter { packets: 2, wire_bytes: 150, payload_bytes: 94 });
        assert_eq!(sample.received_unreliable.packets, 1);
        assert_eq!(sample.retransmitted.packets, 1);
        assert_eq!(sample.acks_sent, 1);
        assert_eq!(sample.acks_received, 1);
        assert_eq!(sample.duplicate_packets, 1);
        assert_eq!(sample.losses_detected, 3);
        assert_eq!(sample.losses_recovered, 1);
    }

    #[test]
    fn test_sample_resets_counters_but_keeps_gauges() {
        let mut stats = ConnectionStats::default();
        stats.record_sent_reliable(100, 72);
        stats.record_packet_send_period(Duration::from_micros(250));
        stats.record_flow_window_size(32);
        stats.record_rtt(Duration::from_millis(5));

        let first = stats.sample();
        assert_eq!(first.sent_reliable.packets, 1);

        let second = stats.sample();
        assert_eq!(second.sent_reliable.packets, 0);
        assert_eq!(second.packet_send_period, Duration::from_micros(250));
        assert_eq!(second.flow_window_size, 32);
        assert_eq!(second.rtt_estimate, Some(Duration::from_millis(5)));
    }
}
