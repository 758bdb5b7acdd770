//! Relay runtime configuration

use std::time::Duration;

use mixcraft_core::{Balance, WinProb};
use rand::Rng;

/// What the mixer does with a packet that arrives when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the longest-waiting packet to make room
    #[default]
    DropOldest,
    /// Reject the arriving packet
    DropNewest,
}

/// When the acknowledgement for a forwarded packet is sent upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Only after the transport accepted the packet within the forward timeout.
    /// A packet whose forward times out is never acknowledged.
    #[default]
    AfterForward,
    /// As soon as the first transmission attempt is dispatched
    AfterDispatch,
}

/// Ticket economics applied to outgoing tickets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TicketPricing {
    /// Amount each relay on the path earns per packet
    pub price_per_hop: Balance,
    /// Probability that a ticket wins
    pub win_probability: f64,
}

impl TicketPricing {
    pub fn win_prob(&self) -> WinProb {
        WinProb::from_probability(self.win_probability)
    }
}

impl Default for TicketPricing {
    fn default() -> Self {
        Self {
            price_per_hop: 100,
            win_probability: 1.0,
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Lower bound of the mixing delay
    pub min_mix_delay: Duration,
    /// Upper bound of the mixing delay
    pub max_mix_delay: Duration,
    /// Maximum packets held by the mixer
    pub max_queue_depth: usize,
    /// Applies to the mixer queue and to the parked backlog
    pub overflow_policy: OverflowPolicy,
    /// Timeout for one forward attempt
    pub forward_timeout: Duration,
    /// Forward attempts before a packet is abandoned
    pub forward_attempts: u32,
    /// Pause between forward attempts
    pub retry_backoff: Duration,
    pub ack_policy: AckPolicy,
    /// Timeout for sending an acknowledgement upstream
    pub ack_timeout: Duration,
    pub pricing: TicketPricing,
    /// Capacity of the channel between two pipeline stages
    pub channel_capacity: usize,
    /// Store operations attempted before the store is declared unavailable
    pub store_retry_attempts: u32,
    pub store_retry_backoff: Duration,
    /// Packets and acks held while the store is unavailable
    pub max_parked: usize,
    /// How often the pipeline retries parked work
    pub parked_retry_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            min_mix_delay: Duration::from_millis(0),
            max_mix_delay: Duration::from_millis(200),
            max_queue_depth: 4096,
            overflow_policy: OverflowPolicy::DropOldest,
            forward_timeout: Duration::from_secs(5),
            forward_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            ack_policy: AckPolicy::AfterForward,
            ack_timeout: Duration::from_secs(5),
            pricing: TicketPricing::default(),
            channel_capacity: 1024,
            store_retry_attempts: 3,
            store_retry_backoff: Duration::from_millis(100),
            max_parked: 1024,
            parked_retry_interval: Duration::from_secs(1),
        }
    }
}

impl RelayConfig {
    /// Uniform delay in `[min_mix_delay, max_mix_delay]`
    pub fn sample_mix_delay(&self) -> Duration {
        let min = self.min_mix_delay.min(self.max_mix_delay);
        let max = self.max_mix_delay.max(self.min_mix_delay);
        if min == max {
            return min;
        }
        let micros = rand::thread_rng().gen_range(min.as_micros()..=max.as_micros());
        Duration::from_micros(micros as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policies() {
        let config = RelayConfig::default();
        assert_eq!(config.ack_policy, AckPolicy::AfterForward);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
        assert!(config.forward_attempts > 0);
    }

    #[test]
    fn test_mix_delay_within_bounds() {
        let config = RelayConfig {
            min_mix_delay: Duration::from_millis(10),
            max_mix_delay: Duration::from_millis(20),
            ..Default::default()
        };
        for _ in 0..1000 {
            let delay = config.sample_mix_delay();
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_fixed_mix_delay() {
        let config = RelayConfig {
            min_mix_delay: Duration::from_millis(5),
            max_mix_delay: Duration::from_millis(5),
            ..Default::default()
        };
        assert_eq!(config.sample_mix_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_pricing_win_prob() {
        let pricing = TicketPricing {
            price_per_hop: 1,
            win_probability: 1.0,
        };
        assert_eq!(pricing.win_prob(), WinProb::ALWAYS);
    }
}
