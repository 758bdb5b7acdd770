//! Replay tags and ticket persistence
//!
//! The store is owned outside the relay and shared by every packet in flight.
//! Read-modify-write on a single key must be atomic, which is why tag
//! deduplication goes through [`PacketStore::check_and_record_tag`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use mixcraft_core::{AcknowledgedTicket, PacketTag, PeerId, UnacknowledgedTicket};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable")]
    Unavailable,

    #[error("Store I/O error: {0}")]
    Io(String),
}

#[async_trait]
pub trait PacketStore: Send + Sync {
    async fn tag_exists(&self, tag: &PacketTag) -> Result<bool, StoreError>;

    async fn record_tag(&self, tag: &PacketTag) -> Result<(), StoreError>;

    /// Record `tag` unless already present. Returns `true` if it was fresh.
    async fn check_and_record_tag(&self, tag: &PacketTag) -> Result<bool, StoreError>;

    /// Store a ticket until the acknowledgement revealing `ack_challenge`'s
    /// discrete log arrives
    async fn store_unacknowledged_ticket(
        &self,
        ack_challenge: &PeerId,
        ticket: UnacknowledgedTicket,
    ) -> Result<(), StoreError>;

    async fn lookup_unacknowledged_ticket(
        &self,
        ack_challenge: &PeerId,
    ) -> Result<Option<UnacknowledgedTicket>, StoreError>;

    /// Remove and return the ticket stored under `ack_challenge`
    async fn take_unacknowledged_ticket(
        &self,
        ack_challenge: &PeerId,
    ) -> Result<Option<UnacknowledgedTicket>, StoreError>;

    /// Keep a winning ticket for settlement
    async fn store_acknowledged_ticket(&self, ticket: AcknowledgedTicket) -> Result<(), StoreError>;

    async fn acknowledged_tickets(&self) -> Result<Vec<AcknowledgedTicket>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    tags: HashSet<PacketTag>,
    unacknowledged: HashMap<PeerId, UnacknowledgedTicket>,
    acknowledged: Vec<AcknowledgedTicket>,
}

/// In-memory [`PacketStore`]
///
/// [`MemoryStore::set_available`] switches it into a mode where every
/// operation fails with [`StoreError::Unavailable`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub async fn tag_count(&self) -> usize {
        self.state.lock().await.tags.len()
    }

    pub async fn unacknowledged_count(&self) -> usize {
        self.state.lock().await.unacknowledged.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PacketStore for MemoryStore {
    async fn tag_exists(&self, tag: &PacketTag) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.tags.contains(tag))
    }

    async fn record_tag(&self, tag: &PacketTag) -> Result<(), StoreError> {
        self.check_available()?;
        self.state.lock().await.tags.insert(*tag);
        Ok(())
    }

    async fn check_and_record_tag(&self, tag: &PacketTag) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.tags.insert(*tag))
    }

    async fn store_unacknowledged_ticket(
        &self,
        ack_challenge: &PeerId,
        ticket: UnacknowledgedTicket,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .unacknowledged
            .insert(*ack_challenge, ticket);
        Ok(())
    }

    async fn lookup_unacknowledged_ticket(
        &self,
        ack_challenge: &PeerId,
    ) -> Result<Option<UnacknowledgedTicket>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.unacknowledged.get(ack_challenge).cloned())
    }

    async fn take_unacknowledged_ticket(
        &self,
        ack_challenge: &PeerId,
    ) -> Result<Option<UnacknowledgedTicket>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.unacknowledged.remove(ack_challenge))
    }

    async fn store_acknowledged_ticket(&self, ticket: AcknowledgedTicket) -> Result<(), StoreError> {
        self.check_available()?;
        self.state.lock().await.acknowledged.push(ticket);
        Ok(())
    }

    async fn acknowledged_tickets(&self) -> Result<Vec<AcknowledgedTicket>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.acknowledged.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixcraft_core::{Ticket, TicketFields, WinProb};
    use std::sync::Arc;

    fn sample_unacknowledged() -> UnacknowledgedTicket {
        UnacknowledgedTicket {
            ticket: Ticket::from_fields(
                TicketFields {
                    counterparty: [1u8; 20],
                    challenge: [2u8; 20],
                    epoch: 1,
                    amount: 5,
                    win_prob: WinProb::ALWAYS,
                    channel_iteration: 1,
                },
                [0u8; 65],
            ),
            own_key: [3u8; 32],
            ack_challenge: [4u8; 33],
            issuer: [5u8; 33],
        }
    }

    #[tokio::test]
    async fn test_check_and_record_tag() {
        let store = MemoryStore::new();
        let tag = [7u8; 32];

        assert!(!store.tag_exists(&tag).await.unwrap());
        assert!(store.check_and_record_tag(&tag).await.unwrap());
        assert!(!store.check_and_record_tag(&tag).await.unwrap());
        assert!(store.tag_exists(&tag).await.unwrap());
        assert_eq!(store.tag_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_tag_recording_admits_one() {
        let store = Arc::new(MemoryStore::new());
        let tag = [9u8; 32];

        let mut handles = vec![];
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.check_and_record_tag(&tag).await.unwrap()
            }));
        }

        let mut fresh = 0;
        for handle in handles {
            if handle.await.unwrap() {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
    }

    #[tokio::test]
    async fn test_unacknowledged_ticket_lifecycle() {
        let store = MemoryStore::new();
        let key = [4u8; 33];
        let ticket = sample_unacknowledged();

        store.store_unacknowledged_ticket(&key, ticket.clone()).await.unwrap();
        assert_eq!(
            store.lookup_unacknowledged_ticket(&key).await.unwrap(),
            Some(ticket.clone())
        );
        assert_eq!(store.take_unacknowledged_ticket(&key).await.unwrap(), Some(ticket));
        assert_eq!(store.take_unacknowledged_ticket(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert_eq!(
            store.check_and_record_tag(&[1u8; 32]).await,
            Err(StoreError::Unavailable)
        );
        assert_eq!(store.acknowledged_tickets().await, Err(StoreError::Unavailable));

        store.set_available(true);
        assert!(store.check_and_record_tag(&[1u8; 32]).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_tag_then_exists() {
        let store = MemoryStore::new();
        store.record_tag(&[2u8; 32]).await.unwrap();
        assert!(store.tag_exists(&[2u8; 32]).await.unwrap());
        assert!(!store.check_and_record_tag(&[2u8; 32]).await.unwrap());
    }
}
