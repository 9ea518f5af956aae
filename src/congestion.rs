use crate::config::{MAXIMUM_ESTIMATED_TIMEOUT, MAX_PACKETS_IN_FLIGHT, MAX_PACKET_SIZE, SYN_INTERVAL};
use crate::sequence_number::SequenceNumber;
#[cfg(test)] use mockall::automock;
use std::cmp::{max, min};
use std::time::Duration;
use tracing::{debug, trace};

/// The congestion-control policy consulted by a connection.
///
/// The engine feeds events in; the policy answers with the four knobs the send queue
///  runs on. A connection applies the outputs after every event under one lock so the
///  four values are always coherent with each other.
///
/// Policies are plug-ins: the socket holds a [CongestionControlFactory] and creates one
///  policy instance per connection.
#[cfg_attr(test, automock)]
pub trait CongestionControl: Send + 'static {
    /// An ACK arrived. `rtt` is a fresh round-trip sample when one could be inferred
    ///  cleanly (never from a retransmitted packet).
    fn on_ack(&mut self, ack: SequenceNumber, rtt: Option<Duration>, packets_in_flight: u32);

    /// A NAK reported the inclusive range `[lo, hi]` as lost.
    fn on_loss(&mut self, lo: SequenceNumber, hi: SequenceNumber);

    /// The send queue gave up waiting for a receiver response.
    fn on_timeout(&mut self);

    fn on_packet_sent(&mut self, wire_size: usize, sequence_number: SequenceNumber);

    fn on_packet_received(&mut self, wire_size: usize);

    /// Periodic tick, roughly every 10 ms.
    fn on_syn(&mut self);

    /// Cap the send rate; `None` lifts the cap.
    fn set_max_bandwidth(&mut self, bits_per_second: Option<u64>);

    /// Interval between two packet send slots.
    fn packet_send_period(&self) -> Duration;

    fn congestion_window_size(&self) -> u32;

    /// Number of unacknowledged packets the sender may have in flight.
    fn flow_window_size(&self) -> u32;

    /// How long to wait for a receiver response before declaring the peer dead. The send
    ///  queue clamps this to its configured bounds.
    fn estimated_timeout(&self) -> Duration;
}

pub trait CongestionControlFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn CongestionControl>;
}


/// From the AIMD tables in RFC 3649 appendix B, with the multiplicative-decrease factor
///  fixed-point scaled at << 8.
///
/// The first value of a pair is the cwnd up to which the entry applies; the index in the
///  table plus 1 is the additive increment. The second value is the variable part `b` of
///  the multiplicative decrease `w <- w * (1 - b(w))`.
const AIMD_VALUES: [(u32, u32); 73] = [
    (     38,  128, /*  0.50 */ ),
    (    118,  112, /*  0.44 */ ),
    (    221,  104, /*  0.41 */ ),
    (    347,   98, /*  0.38 */ ),
    (    495,   93, /*  0.37 */ ),
    (    663,   89, /*  0.35 */ ),
    (    851,   86, /*  0.34 */ ),
    (   1058,   83, /*  0.33 */ ),
    (   1284,   81, /*  0.32 */ ),
    (   1529,   78, /*  0.31 */ ),
    (   1793,   76, /*  0.30 */ ),
    (   2076,   74, /*  0.29 */ ),
    (   2378,   72, /*  0.28 */ ),
    (   2699,   71, /*  0.28 */ ),
    (   3039,   69, /*  0.27 */ ),
    (   3399,   68, /*  0.27 */ ),
    (   3778,   66, /*  0.26 */ ),
    (   4177,   65, /*  0.26 */ ),
    (   4596,   64, /*  0.25 */ ),
    (   5036,   62, /*  0.25 */ ),
    (   5497,   61, /*  0.24 */ ),
    (   5979,   60, /*  0.24 */ ),
    (   6483,   59, /*  0.23 */ ),
    (   7009,   58, /*  0.23 */ ),
    (   7558,   57, /*  0.22 */ ),
    (   8130,   56, /*  0.22 */ ),
    (   8726,   55, /*  0.22 */ ),
    (   9346,   54, /*  0.21 */ ),
    (   9991,   53, /*  0.21 */ ),
    (  10661,   52, /*  0.21 */ ),
    (  11358,   52, /*  0.20 */ ),
    (  12082,   51, /*  0.20 */ ),
    (  12834,   50, /*  0.20 */ ),
    (  13614,   49, /*  0.19 */ ),
    (  14424,   48, /*  0.19 */ ),
    (  15265,   48, /*  0.19 */ ),
    (  16137,   47, /*  0.19 */ ),
    (  17042,   46, /*  0.18 */ ),
    (  17981,   45, /*  0.18 */ ),
    (  18955,   45, /*  0.18 */ ),
    (  19965,   44, /*  0.17 */ ),
    (  21013,   43, /*  0.17 */ ),
    (  22101,   43, /*  0.17 */ ),
    (  23230,   42, /*  0.17 */ ),
    (  24402,   41, /*  0.16 */ ),
    (  25618,   41, /*  0.16 */ ),
    (  26881,   40, /*  0.16 */ ),
    (  28193,   39, /*  0.16 */ ),
    (  29557,   39, /*  0.15 */ ),
    (  30975,   38, /*  0.15 */ ),
    (  32450,   38, /*  0.15 */ ),
    (  33986,   37, /*  0.15 */ ),
    (  35586,   36, /*  0.14 */ ),
    (  37253,   36, /*  0.14 */ ),
    (  38992,   35, /*  0.14 */ ),
    (  40808,   35, /*  0.14 */ ),
    (  42707,   34, /*  0.13 */ ),
    (  44694,   33, /*  0.13 */ ),
    (  46776,   33, /*  0.13 */ ),
    (  48961,   32, /*  0.13 */ ),
    (  51258,   32, /*  0.13 */ ),
    (  53677,   31, /*  0.12 */ ),
    (  56230,   30, /*  0.12 */ ),
    (  58932,   30, /*  0.12 */ ),
    (  61799,   29, /*  0.12 */ ),
    (  64851,   28, /*  0.11 */ ),
    (  68113,   28, /*  0.11 */ ),
    (  71617,   27, /*  0.11 */ ),
    (  75401,   26, /*  0.10 */ ),
    (  79517,   26, /*  0.10 */ ),
    (  84035,   25, /*  0.10 */ ),
    (  89053,   24, /*  0.10 */ ),
    ( u32::MAX,  23, /*  0.09 */ ),
];

/// An adaptation of Sally Floyd's High Speed TCP (RFC 3649) congestion control: AIMD with
///  adaptive increments and decrease factors, adding more and cutting less the larger the
///  window is. Below the first table bin the window grows in classic slow start.
///
/// The send period is derived from the smoothed RTT and the window so the paced rate
///  tracks `cwnd` packets per round trip; the timeout estimate is the usual
///  `srtt + 4 * rtt_var`.
pub struct HighSpeedCongestionControl {
    ai: usize,
    send_window_limit: u32,
    cwnd: u32,
    cwnd_cnt: u32,

    smoothed_rtt: Option<Duration>,
    rtt_variance: Duration,

    max_bandwidth_bps: Option<u64>,
}

impl HighSpeedCongestionControl {
    const START_CWND: u32 = 16;

    pub fn new(send_window_limit: u32) -> HighSpeedCongestionControl {
        assert!(send_window_limit >= 2);

        let cwnd = if send_window_limit <= AIMD_VALUES[0].0 {
            send_window_limit
        }
        else {
            min(send_window_limit, Self::START_CWND)
        };

        HighSpeedCongestionControl {
            ai: 0,
            send_window_limit,
            cwnd,
            cwnd_cnt: 0,
            smoothed_rtt: None,
            rtt_variance: Duration::ZERO,
            max_bandwidth_bps: None,
        }
    }

    fn is_slow_start(&self) -> bool {
        self.cwnd <= AIMD_VALUES[0].0
    }

    fn update_rtt(&mut self, sample: Duration) {
        match self.smoothed_rtt {
            None => {
                self.smoothed_rtt = Some(sample);
                self.rtt_variance = sample / 2;
            }
            Some(srtt) => {
                let deviation = if sample > srtt { sample - srtt } else { srtt - sample };
                self.rtt_variance = (self.rtt_variance * 3 + deviation) / 4;
                self.smoothed_rtt = Some((srtt * 7 + sample) / 8);
            }
        }
    }

    fn rtt_or_default(&self) -> Duration {
        self.smoothed_rtt.unwrap_or(SYN_INTERVAL)
    }

    fn grow_window(&mut self, packets_in_flight: u32) {
        if self.cwnd == self.send_window_limit {
            return;
        }

        if self.is_slow_start() {
            // lenient during slow start: grow on 50% utilization
            if self.cwnd > 2 * packets_in_flight {
                trace!("slow start with less than cwnd/2 packets in flight - no adjustment");
                return;
            }
            self.cwnd += 1;
        }
        else {
            // in congestion avoidance, grow only when the window is actually used up -
            //  otherwise the ACK does not signify additional bandwidth (RFC 2861 spirit)
            if self.cwnd > packets_in_flight {
                trace!("less than cwnd packets in flight - no adjustment");
                return;
            }

            let increment = (self.ai + 1) as u32;
            self.cwnd_cnt += increment;
            while self.cwnd_cnt >= self.cwnd {
                self.cwnd_cnt -= self.cwnd;
                self.cwnd += 1;
            }
        }

        while self.cwnd > AIMD_VALUES[self.ai].0 {
            self.ai += 1;
        }
        self.cwnd = min(self.cwnd, self.send_window_limit);
        debug!("adjusted cwnd to {} packets", self.cwnd);
    }

    fn shrink_window(&mut self) {
        let capped_product = self.cwnd.checked_mul(AIMD_VALUES[self.ai].1)
            .unwrap_or(u32::MAX);
        self.cwnd = max(2, self.cwnd - (capped_product >> 8));

        debug!("loss - adjusting cwnd downwards to {}", self.cwnd);

        // without this reset the accumulated counter could bump cwnd right back up
        self.cwnd_cnt = 0;

        while self.ai > 0 && self.cwnd < AIMD_VALUES[self.ai - 1].0 {
            self.ai -= 1;
        }
    }

    /// The pacing interval that sends `cwnd` packets per smoothed round trip, stretched
    ///  further if a bandwidth cap asks for less.
    fn paced_period(&self) -> Duration {
        let rtt = self.rtt_or_default();
        let window_period = rtt / max(self.cwnd, 1);

        match self.max_bandwidth_bps {
            None => window_period,
            Some(bps) => {
                let bandwidth_period = Duration::from_micros(
                    (MAX_PACKET_SIZE as u64 * 8).saturating_mul(1_000_000) / max(bps, 1),
                );
                max(window_period, bandwidth_period)
            }
        }
    }
}

impl CongestionControl for HighSpeedCongestionControl {
    fn on_ack(&mut self, _ack: SequenceNumber, rtt: Option<Duration>, packets_in_flight: u32) {
        if let Some(sample) = rtt {
            self.update_rtt(sample);
        }
        self.grow_window(packets_in_flight);
    }

    fn on_loss(&mut self, lo: SequenceNumber, hi: SequenceNumber) {
        trace!("loss reported for [{}, {}]", lo, hi);
        self.shrink_window();
    }

    fn on_timeout(&mut self) {
        // the peer went silent: back to square one
        self.cwnd = 2;
        self.cwnd_cnt = 0;
        self.ai = 0;
    }

    fn on_packet_sent(&mut self, _wire_size: usize, _sequence_number: SequenceNumber) {}

    fn on_packet_received(&mut self, _wire_size: usize) {}

    fn on_syn(&mut self) {
        // window state advances on ACK / loss; nothing is time-driven here
    }

    fn set_max_bandwidth(&mut self, bits_per_second: Option<u64>) {
        self.max_bandwidth_bps = bits_per_second;
    }

    fn packet_send_period(&self) -> Duration {
        self.paced_period()
    }

    fn congestion_window_size(&self) -> u32 {
        self.cwnd
    }

    fn flow_window_size(&self) -> u32 {
        min(self.cwnd, MAX_PACKETS_IN_FLIGHT)
    }

    fn estimated_timeout(&self) -> Duration {
        match self.smoothed_rtt {
            Some(srtt) => srtt + 4 * self.rtt_variance + SYN_INTERVAL,
            None => MAXIMUM_ESTIMATED_TIMEOUT,
        }
    }
}

#[derive(Default)]
pub struct HighSpeedCongestionControlFactory {
    pub send_window_limit: Option<u32>,
}

impl CongestionControlFactory for HighSpeedCongestionControlFactory {
    fn create(&self) -> Box<dyn CongestionControl> {
        Box::new(HighSpeedCongestionControl::new(
            self.send_window_limit.unwrap_or(MAX_PACKETS_IN_FLIGHT),
        ))
    }
}


/// A policy with fixed knobs, for tools and tests where adaptivity only gets in the way.
pub struct FixedRateCongestionControl {
    pub packet_send_period: Duration,
    pub window_size: u32,
    pub estimated_timeout: Duration,
}

impl Default for FixedRateCongestionControl {
    fn default() -> FixedRateCongestionControl {
        FixedRateCongestionControl {
            packet_send_period: Duration::ZERO,
            window_size: crate::config::DEFAULT_FLOW_WINDOW_SIZE,
            estimated_timeout: MAXIMUM_ESTIMATED_TIMEOUT,
        }
    }
}

impl CongestionControl for FixedRateCongestionControl {
    fn on_ack(&mut self, _ack: SequenceNumber, _rtt: Option<Duration>, _packets_in_flight: u32) {}
    fn on_loss(&mut self, _lo: SequenceNumber, _hi: SequenceNumber) {}
    fn on_timeout(&mut self) {}
    fn on_packet_sent(&mut self, _wire_size: usize, _sequence_number: SequenceNumber) {}
    fn on_packet_received(&mut self, _wire_size: usize) {}
    fn on_syn(&mut self) {}
    fn set_max_bandwidth(&mut self, _bits_per_second: Option<u64>) {}

    fn packet_send_period(&self) -> Duration {
        self.packet_send_period
    }

    fn congestion_window_size(&self) -> u32 {
        self.window_size
    }

    fn flow_window_size(&self) -> u32 {
        self.window_size
    }

    fn estimated_timeout(&self) -> Duration {
        self.estimated_timeout
    }
}
