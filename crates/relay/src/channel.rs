//! Payment channel collaborator
//!
//! The relay never touches the chain. It reads the local view of a channel
//! and asks the collaborator to sign outgoing tickets.

use std::collections::HashMap;

use async_trait::async_trait;
use mixcraft_core::{short_hex, ChannelState, PeerId, Signature, TicketFields};
use mixcraft_crypto::{sign_hash, ChainKeypair};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("No channel with {0}")]
    NotFound(String),

    #[error("Ticket signing failed: {0}")]
    SigningFailed(String),
}

#[async_trait]
pub trait ChannelCollaborator: Send + Sync {
    /// Local view of the channel shared with `counterparty`
    async fn get_channel_state(&self, counterparty: &PeerId) -> Result<ChannelState, ChannelError>;

    /// Sign `fields` with the node's chain key
    async fn sign_ticket(&self, fields: &TicketFields) -> Result<Signature, ChannelError>;
}

/// In-memory channel book for tests and local simulations
pub struct MemoryChannels {
    keypair: ChainKeypair,
    channels: RwLock<HashMap<PeerId, ChannelState>>,
}

impl MemoryChannels {
    pub fn new(keypair: ChainKeypair) -> Self {
        Self {
            keypair,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Open or update the channel with `counterparty`
    pub async fn set_channel(&self, counterparty: PeerId, state: ChannelState) {
        self.channels.write().await.insert(counterparty, state);
    }

    pub async fn close_channel(&self, counterparty: &PeerId) {
        self.channels.write().await.remove(counterparty);
    }
}

#[async_trait]
impl ChannelCollaborator for MemoryChannels {
    async fn get_channel_state(&self, counterparty: &PeerId) -> Result<ChannelState, ChannelError> {
        self.channels
            .read()
            .await
            .get(counterparty)
            .copied()
            .ok_or_else(|| ChannelError::NotFound(short_hex(counterparty)))
    }

    async fn sign_ticket(&self, fields: &TicketFields) -> Result<Signature, ChannelError> {
        sign_hash(&self.keypair, &fields.hash()).map_err(|e| ChannelError::SigningFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixcraft_core::{Ticket, WinProb};
    use mixcraft_crypto::verify_ticket;

    #[tokio::test]
    async fn test_channel_state_lookup() {
        let channels = MemoryChannels::new(ChainKeypair::generate());
        let peer = ChainKeypair::generate().peer_id();

        assert!(matches!(
            channels.get_channel_state(&peer).await,
            Err(ChannelError::NotFound(_))
        ));

        channels.set_channel(peer, ChannelState::new(500, 2, 1)).await;
        let state = channels.get_channel_state(&peer).await.unwrap();
        assert_eq!(state.balance, 500);
        assert_eq!(state.epoch, 2);

        channels.close_channel(&peer).await;
        assert!(channels.get_channel_state(&peer).await.is_err());
    }

    #[tokio::test]
    async fn test_signed_ticket_verifies() {
        let keypair = ChainKeypair::generate();
        let issuer = keypair.peer_id();
        let channels = MemoryChannels::new(keypair);

        let fields = TicketFields {
            counterparty: [1u8; 20],
            challenge: [2u8; 20],
            epoch: 1,
            amount: 10,
            win_prob: WinProb::ALWAYS,
            channel_iteration: 1,
        };
        let signature = channels.sign_ticket(&fields).await.unwrap();
        let ticket = Ticket::from_fields(fields, signature);
        assert!(verify_ticket(&ticket, &issuer));
    }
}
