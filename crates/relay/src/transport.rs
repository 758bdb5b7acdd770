//! Transport and local delivery collaborators

use std::time::Duration;

use async_trait::async_trait;
use mixcraft_core::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;

/// Protocol id for mix packets
pub const PACKET_PROTOCOL: &str = "/mixcraft/packet/1";

/// Protocol id for acknowledgements
pub const ACK_PROTOCOL: &str = "/mixcraft/ack/1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Send timed out")]
    Timeout,

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Transport closed")]
    Closed,
}

/// Bytes received from a peer on one protocol
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: PeerId,
    pub protocol: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `bytes` to `peer`, giving up after `timeout`
    async fn send(
        &self,
        peer: &PeerId,
        protocol: &str,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Messages arriving on `protocol`
    async fn subscribe(&self, protocol: &str) -> Result<mpsc::Receiver<InboundMessage>, TransportError>;
}

/// Hands delivered plaintext to the local application. Fire-and-forget.
pub trait MessageEmitter: Send + Sync {
    fn emit(&self, plaintext: Vec<u8>);
}

/// [`MessageEmitter`] backed by an unbounded channel
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageEmitter for ChannelEmitter {
    fn emit(&self, plaintext: Vec<u8>) {
        // The application may have gone away; delivery is best-effort
        let _ = self.tx.send(plaintext);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_emitter() {
        let (emitter, mut rx) = ChannelEmitter::new();
        emitter.emit(b"hello".to_vec());
        assert_eq!(rx.recv().await.unwrap(), b"hello");

        drop(rx);
        // Emitting after the receiver is gone must not panic
        emitter.emit(b"ignored".to_vec());
    }
}
