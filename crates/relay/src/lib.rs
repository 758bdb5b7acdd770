//! MixCraft Relay
//!
//! Per-packet relay logic for a payment-channel-secured mix network. A packet
//! is decoded and authenticated, checked against the replay store, delayed in
//! the mixer, and then either delivered locally or re-ticketed and forwarded.
//! Once the packet has left, the relay acknowledges upstream with the key
//! share that lets the previous hop redeem its ticket.
//!
//! The node's collaborators (channel bookkeeping, persistence, transport and
//! local message delivery) are traits so the relay logic can run against
//! in-memory implementations in tests.

mod channel;
mod config;
mod handler;
mod locks;
mod metrics;
mod mixer;
mod packet;
mod pipeline;
mod store;
mod transport;

pub use channel::{ChannelCollaborator, ChannelError, MemoryChannels};
pub use config::{AckPolicy, OverflowPolicy, RelayConfig, TicketPricing};
pub use handler::{AckOutcome, PacketOutcome, RelayHandler};
pub use locks::{KeyedGuard, KeyedLocks};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use mixer::Mixer;
pub use packet::{CreatedPacket, ForwardedPacket, Packet, PacketError, PacketKind};
pub use pipeline::{PipelineHandle, RelayPipeline};
pub use store::{MemoryStore, PacketStore, StoreError};
pub use transport::{
    ChannelEmitter, InboundMessage, MessageEmitter, Transport, TransportError, ACK_PROTOCOL,
    PACKET_PROTOCOL,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Decode failed: {0}")]
    Decode(#[from] PacketError),

    #[error("Replay detected")]
    ReplayDetected,

    #[error("PoR validation failed: {0}")]
    PoRValidationFailed(String),

    #[error("Ticket invalid: {0}")]
    TicketInvalid(String),

    #[error("Cannot issue ticket: {0}")]
    TicketIssue(String),

    #[error("Transmission to {peer} timed out after {attempts} attempts")]
    TransmissionTimeout { peer: String, attempts: u32 },

    #[error("Transmission failed: {0}")]
    Transmission(#[from] TransportError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Acknowledgement invalid: {0}")]
    AckInvalid(String),

    #[error("Key error: {0}")]
    Key(#[from] mixcraft_crypto::KeyError),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Pipeline stopped: {0}")]
    PipelineStopped(String),
}

impl RelayError {
    /// Whether the error must stop the pipeline instead of dropping one packet
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_errors_are_fatal() {
        assert!(RelayError::StoreUnavailable(StoreError::Unavailable).is_fatal());
        assert!(!RelayError::ReplayDetected.is_fatal());
        assert!(!RelayError::TicketInvalid("stale epoch".into()).is_fatal());
        assert!(!RelayError::TransmissionTimeout {
            peer: "02ab".into(),
            attempts: 3
        }
        .is_fatal());
    }
}
