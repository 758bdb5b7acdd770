//! Shared helpers: an in-memory transport hub and a fully meshed test network

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mixcraft_core::{ChannelState, PathHop, PeerId};
use mixcraft_crypto::Identity;
use mixcraft_relay::{
    ChannelEmitter, InboundMessage, MemoryChannels, MemoryStore, PacketStore, RelayConfig, RelayHandler,
    TicketPricing, Transport, TransportError,
};
use tokio::sync::mpsc;

/// Routes messages between [`HubTransport`]s by peer id and protocol
#[derive(Default)]
pub struct Hub {
    inboxes: Mutex<HashMap<(PeerId, String), mpsc::Sender<InboundMessage>>>,
    offline: Mutex<HashSet<PeerId>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(self: &Arc<Self>, me: PeerId) -> HubTransport {
        HubTransport {
            hub: self.clone(),
            me,
        }
    }

    /// Make every send to `peer` fail
    pub fn set_offline(&self, peer: PeerId, offline: bool) {
        let mut set = self.offline.lock().unwrap();
        if offline {
            set.insert(peer);
        } else {
            set.remove(&peer);
        }
    }

    /// Drop every inbox so subscribed pipelines wind down
    pub fn close(&self) {
        self.inboxes.lock().unwrap().clear();
    }
}

pub struct HubTransport {
    hub: Arc<Hub>,
    me: PeerId,
}

#[async_trait]
impl Transport for HubTransport {
    async fn send(
        &self,
        peer: &PeerId,
        protocol: &str,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.hub.offline.lock().unwrap().contains(peer) {
            return Err(TransportError::Unreachable(hex::encode(&peer[..8])));
        }
        let inbox = self
            .hub
            .inboxes
            .lock()
            .unwrap()
            .get(&(*peer, protocol.to_string()))
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(hex::encode(&peer[..8])))?;

        let message = InboundMessage {
            from: self.me,
            protocol: protocol.to_string(),
            bytes,
        };
        match tokio::time::timeout(timeout, inbox.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn subscribe(&self, protocol: &str) -> Result<mpsc::Receiver<InboundMessage>, TransportError> {
        let (tx, rx) = mpsc::channel(256);
        self.hub
            .inboxes
            .lock()
            .unwrap()
            .insert((self.me, protocol.to_string()), tx);
        Ok(rx)
    }
}

pub struct TestNode {
    pub id: Identity,
    pub channels: Arc<MemoryChannels>,
    pub store: Arc<MemoryStore>,
    pub handler: Arc<RelayHandler>,
    pub delivered: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl TestNode {
    pub fn peer_id(&self) -> PeerId {
        self.id.peer_id()
    }

    pub fn path_hop(&self) -> PathHop {
        self.id.path_hop()
    }
}

pub fn pricing() -> TicketPricing {
    TicketPricing {
        price_per_hop: 10,
        win_probability: 1.0,
    }
}

pub fn fast_config() -> RelayConfig {
    RelayConfig {
        min_mix_delay: Duration::from_millis(1),
        max_mix_delay: Duration::from_millis(10),
        forward_timeout: Duration::from_millis(200),
        forward_attempts: 2,
        retry_backoff: Duration::from_millis(5),
        ack_timeout: Duration::from_millis(200),
        store_retry_attempts: 1,
        store_retry_backoff: Duration::from_millis(1),
        pricing: pricing(),
        ..Default::default()
    }
}

/// `n` nodes on one hub with a funded channel between every pair
pub async fn network(hub: &Arc<Hub>, n: usize, config: RelayConfig) -> Vec<TestNode> {
    mixcraft_logging::try_init_test_logging();

    let ids: Vec<Identity> = (0..n).map(|_| Identity::generate()).collect();
    let mut nodes = Vec::with_capacity(n);
    for (i, id) in ids.iter().enumerate() {
        let channels = Arc::new(MemoryChannels::new(id.chain.clone()));
        for (j, other) in ids.iter().enumerate() {
            if i != j {
                channels
                    .set_channel(other.peer_id(), ChannelState::new(1_000_000, 1, 1))
                    .await;
            }
        }
        let store = Arc::new(MemoryStore::new());
        let (emitter, delivered) = ChannelEmitter::new();
        let handler = RelayHandler::new(
            id.clone(),
            config.clone(),
            channels.clone(),
            store.clone(),
            Arc::new(hub.transport(id.peer_id())),
            Arc::new(emitter),
        )
        .expect("relay handler");

        nodes.push(TestNode {
            id: id.clone(),
            channels,
            store,
            handler: Arc::new(handler),
            delivered,
        });
    }
    nodes
}

/// Wait until `store` holds at least `count` redeemed tickets
pub async fn wait_for_redeemed(store: &MemoryStore, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let redeemed = store.acknowledged_tickets().await.map(|t| t.len()).unwrap_or(0);
            if redeemed >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("tickets not redeemed in time");
}

/// Next plaintext delivered to `node`, failing after five seconds
pub async fn next_delivery(node: &mut TestNode) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), node.delivered.recv())
        .await
        .expect("nothing delivered in time")
        .expect("emitter closed")
}
