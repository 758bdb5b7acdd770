//! Relay telemetry
//!
//! Counters live in a per-relay prometheus [`Registry`] so several relays can
//! run in one process (the integration tests do) without clashing.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_received: u64,
    pub decode_failures: u64,
    pub replays_dropped: u64,
    pub packets_delivered: u64,
    pub packets_forwarded: u64,
    pub forward_failures: u64,
    pub ticket_rejections: u64,
    pub por_rejections: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub ack_failures: u64,
    pub winning_tickets: u64,
    pub losing_tickets: u64,
    pub mixer_overflow: u64,
    pub parked_dropped: u64,
}

pub struct RelayMetrics {
    registry: Registry,
    pub packets_received: IntCounter,
    pub decode_failures: IntCounter,
    pub replays_dropped: IntCounter,
    pub packets_delivered: IntCounter,
    pub packets_forwarded: IntCounter,
    pub forward_failures: IntCounter,
    pub ticket_rejections: IntCounter,
    pub por_rejections: IntCounter,
    pub acks_sent: IntCounter,
    pub acks_received: IntCounter,
    pub ack_failures: IntCounter,
    pub winning_tickets: IntCounter,
    pub losing_tickets: IntCounter,
    pub mixer_overflow: IntCounter,
    pub parked_dropped: IntCounter,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::new(format!("mixcraft_relay_{}", name), help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            packets_received: counter("packets_received_total", "Inbound packets")?,
            decode_failures: counter("decode_failures_total", "Packets that failed to decode")?,
            replays_dropped: counter("replays_dropped_total", "Packets dropped as replays")?,
            packets_delivered: counter("packets_delivered_total", "Packets delivered locally")?,
            packets_forwarded: counter("packets_forwarded_total", "Packets sent to the next hop")?,
            forward_failures: counter("forward_failures_total", "Packets abandoned after retries")?,
            ticket_rejections: counter("ticket_rejections_total", "Inbound tickets rejected")?,
            por_rejections: counter("por_rejections_total", "Packets failing PoR pre-verification")?,
            acks_sent: counter("acks_sent_total", "Acknowledgements sent upstream")?,
            acks_received: counter("acks_received_total", "Acknowledgements received")?,
            ack_failures: counter("ack_failures_total", "Acknowledgements rejected or undeliverable")?,
            winning_tickets: counter("winning_tickets_total", "Acknowledged winning tickets")?,
            losing_tickets: counter("losing_tickets_total", "Acknowledged losing tickets")?,
            mixer_overflow: counter("mixer_overflow_total", "Packets dropped by a full mixer")?,
            parked_dropped: counter("parked_dropped_total", "Parked items dropped by a full backlog")?,
            registry,
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_received: self.packets_received.get(),
            decode_failures: self.decode_failures.get(),
            replays_dropped: self.replays_dropped.get(),
            packets_delivered: self.packets_delivered.get(),
            packets_forwarded: self.packets_forwarded.get(),
            forward_failures: self.forward_failures.get(),
            ticket_rejections: self.ticket_rejections.get(),
            por_rejections: self.por_rejections.get(),
            acks_sent: self.acks_sent.get(),
            acks_received: self.acks_received.get(),
            ack_failures: self.ack_failures.get(),
            winning_tickets: self.winning_tickets.get(),
            losing_tickets: self.losing_tickets.get(),
            mixer_overflow: self.mixer_overflow.get(),
            parked_dropped: self.parked_dropped.get(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Counters in the prometheus text exposition format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
