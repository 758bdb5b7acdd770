//! Relay handler
//!
//! Drives one packet through its lifecycle:
//! 1. Decode the local layer and authenticate the previous hop
//! 2. Drop replays by packet tag
//! 3. (mixing delay, applied by the caller)
//! 4. Deliver locally, or validate the inbound ticket, re-ticket, store the
//!    unacknowledged ticket and transmit to the next hop
//! 5. Acknowledge upstream
//!
//! Inbound acknowledgements go through [`RelayHandler::handle_acknowledgement`],
//! which redeems the matching unacknowledged ticket.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use mixcraft_core::{
    AcknowledgedTicket, Acknowledgement, Address, PeerId, UnacknowledgedTicket,
};
use mixcraft_crypto::{
    ack_challenge_of, sign_acknowledgement, validate_acknowledgement, verify_acknowledgement,
    Identity,
};
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::channel::{ChannelCollaborator, ChannelError};
use crate::config::{AckPolicy, OverflowPolicy, RelayConfig};
use crate::locks::KeyedLocks;
use crate::metrics::RelayMetrics;
use crate::mixer::Mixer;
use crate::packet::{Packet, PacketError, PacketKind};
use crate::store::{PacketStore, StoreError};
use crate::transport::{MessageEmitter, Transport, ACK_PROTOCOL, PACKET_PROTOCOL};
use crate::{RelayError, Result};

/// How a released packet left the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Plaintext handed to the local application
    Delivered,
    /// Sent to `next_hop`; `acknowledged` tells whether the upstream ack went out
    Forwarded { next_hop: PeerId, acknowledged: bool },
}

/// Result of an inbound acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The redeemed ticket wins and was kept for settlement
    Winning,
    /// The redeemed ticket loses and was discarded
    Losing,
    /// No unacknowledged ticket waits for this key share
    Unknown,
}

/// Work held back while the store was unavailable
enum Parked {
    Packet { packet: Packet, tag_recorded: bool },
    Ack { bytes: Vec<u8>, from: PeerId },
    /// Unacknowledged ticket left behind by a packet that never left
    Cleanup { ack_challenge: PeerId },
}

impl Parked {
    fn describe(&self) -> String {
        match self {
            Parked::Packet { packet, .. } => format!("packet {}", hex::encode(&packet.tag[..8])),
            Parked::Ack { from, .. } => format!("ack from {}", hex::encode(&from[..8])),
            Parked::Cleanup { ack_challenge } => {
                format!("ticket cleanup {}", hex::encode(&ack_challenge[..8]))
            }
        }
    }
}

/// Relay node handler
pub struct RelayHandler {
    identity: Identity,
    peer_id: PeerId,
    address: Address,
    config: RelayConfig,
    channels: Arc<dyn ChannelCollaborator>,
    store: Arc<dyn PacketStore>,
    transport: Arc<dyn Transport>,
    emitter: Arc<dyn MessageEmitter>,
    /// Serialises ticket validation and issuing per channel counterparty
    channel_locks: KeyedLocks<PeerId>,
    /// Serialises unacknowledged ticket storage and redemption per ack challenge
    ack_locks: KeyedLocks<PeerId>,
    metrics: RelayMetrics,
    /// Bounded by `max_parked`
    parked: Mutex<VecDeque<Parked>>,
}

impl RelayHandler {
    pub fn new(
        identity: Identity,
        config: RelayConfig,
        channels: Arc<dyn ChannelCollaborator>,
        store: Arc<dyn PacketStore>,
        transport: Arc<dyn Transport>,
        emitter: Arc<dyn MessageEmitter>,
    ) -> Result<Self> {
        let peer_id = identity.peer_id();
        let address = identity.address();
        Ok(Self {
            identity,
            peer_id,
            address,
            config,
            channels,
            store,
            transport,
            emitter,
            channel_locks: KeyedLocks::new(),
            ack_locks: KeyedLocks::new(),
            metrics: RelayMetrics::new()?,
            parked: Mutex::new(VecDeque::new()),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Packets and acks waiting for the store to come back
    pub async fn parked_count(&self) -> usize {
        self.parked.lock().await.len()
    }

    /// Run a packet through every stage, sleeping a mixing delay in between.
    /// The staged pipeline does the same with the delay applied by the mixer.
    pub async fn handle_packet(&self, bytes: &[u8], from: &PeerId) -> Result<PacketOutcome> {
        let packet = self.decode(bytes, from)?;
        let packet = self.deduplicate(packet).await?;
        sleep(self.config.sample_mix_delay()).await;
        self.process_released(packet).await
    }

    /// Received: peel the local layer of bytes sent by `from`
    pub fn decode(&self, bytes: &[u8], from: &PeerId) -> Result<Packet> {
        self.metrics.packets_received.inc();
        Packet::deserialize(bytes, &self.identity.encryption, from).map_err(|e| {
            self.metrics.decode_failures.inc();
            debug!("Dropping undecodable packet from {}: {}", hex::encode(&from[..8]), e);
            RelayError::Decode(e)
        })
    }

    /// Deduplicated: record the packet tag, rejecting packets seen before
    pub async fn deduplicate(&self, packet: Packet) -> Result<Packet> {
        let tag = packet.tag;
        let fresh = match self
            .with_store_retry("tag check", || self.store.check_and_record_tag(&tag))
            .await
        {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("Parking packet {}: {}", hex::encode(&tag[..8]), e);
                self.park(Parked::Packet {
                    packet,
                    tag_recorded: false,
                })
                .await;
                return Err(e.into());
            }
        };

        if !fresh {
            self.metrics.replays_dropped.inc();
            debug!("Dropping replayed packet {}", hex::encode(&tag[..8]));
            return Err(RelayError::ReplayDetected);
        }
        Ok(packet)
    }

    /// Handle a packet released by the mixer: deliver it or forward it
    pub async fn process_released(&self, packet: Packet) -> Result<PacketOutcome> {
        let result = match &packet.kind {
            PacketKind::Final { plaintext } => Ok(self.deliver(&packet, plaintext.clone()).await),
            PacketKind::Relay { .. } => self.forward(&packet).await,
        };

        if let Err(e) = &result {
            if e.is_fatal() {
                warn!("Parking packet {}: {}", hex::encode(&packet.tag[..8]), e);
                self.park(Parked::Packet {
                    packet,
                    tag_recorded: true,
                })
                .await;
            }
        }
        result
    }

    async fn deliver(&self, packet: &Packet, plaintext: Vec<u8>) -> PacketOutcome {
        info!(
            "Delivering packet {} ({} bytes)",
            hex::encode(&packet.tag[..8]),
            plaintext.len()
        );
        self.emitter.emit(plaintext);
        self.metrics.packets_delivered.inc();
        self.send_ack(packet).await;
        PacketOutcome::Delivered
    }

    async fn forward(&self, packet: &Packet) -> Result<PacketOutcome> {
        {
            let _guard = self.channel_locks.lock(packet.previous_hop).await;
            self.validate_ticket(packet).await?;
        }

        let next_hop = *packet
            .next_hop()
            .ok_or(RelayError::Decode(PacketError::NotForwardable))?;

        let forwarded = {
            let _guard = self.channel_locks.lock(next_hop).await;
            packet
                .forward_transform(self.channels.as_ref(), &self.config.pricing)
                .await
                .map_err(|e| self.issue_error(e))?
        };

        let ack_challenge = forwarded.unacknowledged.ack_challenge;
        {
            let _guard = self.ack_locks.lock(ack_challenge).await;
            let existing = self
                .with_store_retry("ticket lookup", || {
                    self.store.lookup_unacknowledged_ticket(&ack_challenge)
                })
                .await?;
            if existing.is_some() {
                self.metrics.replays_dropped.inc();
                debug!(
                    "Ticket for packet {} already pending",
                    hex::encode(&packet.tag[..8])
                );
                return Err(RelayError::ReplayDetected);
            }
            self.with_store_retry("ticket store", || {
                self.store
                    .store_unacknowledged_ticket(&ack_challenge, forwarded.unacknowledged.clone())
            })
            .await?;
        }

        let (sent, acknowledged) = match self.config.ack_policy {
            AckPolicy::AfterDispatch => {
                tokio::join!(
                    self.transmit(&next_hop, forwarded.bytes.clone()),
                    self.send_ack(packet)
                )
            }
            AckPolicy::AfterForward => {
                let sent = self.transmit(&next_hop, forwarded.bytes.clone()).await;
                let acknowledged = match sent {
                    Ok(()) => self.send_ack(packet).await,
                    Err(_) => false,
                };
                (sent, acknowledged)
            }
        };

        if let Err(e) = sent {
            self.metrics.forward_failures.inc();
            warn!(
                "Abandoning packet {} to {}: {}",
                hex::encode(&packet.tag[..8]),
                hex::encode(&next_hop[..8]),
                e
            );
            // The next hop never saw the packet, so no acknowledgement will come
            if let Err(cleanup) = self.drop_unacknowledged(&ack_challenge).await {
                debug!("Ticket cleanup deferred: {}", cleanup);
            }
            return Err(e);
        }

        self.metrics.packets_forwarded.inc();
        debug!(
            "Forwarded packet {} to {}",
            hex::encode(&packet.tag[..8]),
            hex::encode(&next_hop[..8])
        );
        Ok(PacketOutcome::Forwarded {
            next_hop,
            acknowledged,
        })
    }

    /// Remove the ticket stored for a packet the next hop never received.
    /// Parks the removal if the store is down.
    async fn drop_unacknowledged(&self, ack_challenge: &PeerId) -> Result<()> {
        let _guard = self.ack_locks.lock(*ack_challenge).await;
        let taken = self
            .with_store_retry("ticket take", || {
                self.store.take_unacknowledged_ticket(ack_challenge)
            })
            .await;
        if let Err(e) = taken {
            warn!(
                "Parking ticket cleanup {}: {}",
                hex::encode(&ack_challenge[..8]),
                e
            );
            self.park(Parked::Cleanup {
                ack_challenge: *ack_challenge,
            })
            .await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Check the inbound ticket against the local view of the channel with
    /// the previous hop, then check the PoR string against its challenge.
    /// The ticket signature was checked when the packet was decoded.
    async fn validate_ticket(&self, packet: &Packet) -> Result<()> {
        let fields = &packet.ticket.fields;
        if fields.counterparty != self.address {
            return Err(self.reject_ticket("ticket is for another node".to_string()));
        }

        let state = match self.channels.get_channel_state(&packet.previous_hop).await {
            Ok(state) => state,
            Err(ChannelError::NotFound(peer)) => {
                return Err(self.reject_ticket(format!("no channel with {}", peer)))
            }
            Err(e) => return Err(e.into()),
        };

        if fields.channel_iteration != state.iteration {
            return Err(self.reject_ticket(format!(
                "channel iteration {} does not match {}",
                fields.channel_iteration, state.iteration
            )));
        }
        if fields.epoch < state.epoch {
            return Err(self.reject_ticket(format!(
                "stale epoch {} (channel is at {})",
                fields.epoch, state.epoch
            )));
        }
        if fields.amount > state.balance {
            return Err(self.reject_ticket(format!(
                "amount {} exceeds channel balance {}",
                fields.amount, state.balance
            )));
        }

        packet.pre_verify().map_err(|e| self.issue_error(e))?;
        Ok(())
    }

    fn reject_ticket(&self, reason: String) -> RelayError {
        self.metrics.ticket_rejections.inc();
        debug!("Rejecting ticket: {}", reason);
        RelayError::TicketInvalid(reason)
    }

    fn issue_error(&self, e: PacketError) -> RelayError {
        match e {
            PacketError::PorMismatch | PacketError::Por(_) => {
                self.metrics.por_rejections.inc();
                debug!("PoR check failed: {}", e);
                RelayError::PoRValidationFailed(e.to_string())
            }
            PacketError::Channel(e) => {
                self.metrics.forward_failures.inc();
                RelayError::Channel(e)
            }
            other => {
                self.metrics.forward_failures.inc();
                RelayError::TicketIssue(other.to_string())
            }
        }
    }

    /// Send to the next hop, retrying with backoff
    async fn transmit(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<()> {
        let attempts = self.config.forward_attempts.max(1);
        for attempt in 1..=attempts {
            let send = self.transport.send(
                peer,
                PACKET_PROTOCOL,
                bytes.clone(),
                self.config.forward_timeout,
            );
            match timeout(self.config.forward_timeout, send).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => debug!(
                    "Send to {} failed (attempt {}/{}): {}",
                    hex::encode(&peer[..8]),
                    attempt,
                    attempts,
                    e
                ),
                Err(_) => debug!(
                    "Send to {} timed out (attempt {}/{})",
                    hex::encode(&peer[..8]),
                    attempt,
                    attempts
                ),
            }
            if attempt < attempts {
                sleep(self.config.retry_backoff).await;
            }
        }
        Err(RelayError::TransmissionTimeout {
            peer: hex::encode(&peer[..8]),
            attempts,
        })
    }

    /// Reveal this hop's ack key share to the previous hop. Best-effort.
    async fn send_ack(&self, packet: &Packet) -> bool {
        let bytes = match self.build_ack(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.metrics.ack_failures.inc();
                warn!("Could not build acknowledgement: {}", e);
                return false;
            }
        };

        let send = self.transport.send(
            &packet.previous_hop,
            ACK_PROTOCOL,
            bytes,
            self.config.ack_timeout,
        );
        match timeout(self.config.ack_timeout, send).await {
            Ok(Ok(())) => {
                self.metrics.acks_sent.inc();
                true
            }
            Ok(Err(e)) => {
                self.metrics.ack_failures.inc();
                warn!(
                    "Acknowledgement to {} failed: {}",
                    hex::encode(&packet.previous_hop[..8]),
                    e
                );
                false
            }
            Err(_) => {
                self.metrics.ack_failures.inc();
                warn!(
                    "Acknowledgement to {} timed out",
                    hex::encode(&packet.previous_hop[..8])
                );
                false
            }
        }
    }

    fn build_ack(&self, packet: &Packet) -> Result<Vec<u8>> {
        let share = packet.ack_key_share()?;
        let ack = sign_acknowledgement(&self.identity.chain, &share)?;
        ack.to_bytes()
            .map_err(|e| RelayError::AckInvalid(e.to_string()))
    }

    /// Acknowledged: redeem the ticket waiting for the key share in `bytes`
    pub async fn handle_acknowledgement(&self, bytes: &[u8], from: &PeerId) -> Result<AckOutcome> {
        self.metrics.acks_received.inc();
        self.process_acknowledgement(bytes, from).await
    }

    /// Shared by inbound acks and parked ones, which were already counted
    async fn process_acknowledgement(&self, bytes: &[u8], from: &PeerId) -> Result<AckOutcome> {
        let ack = Acknowledgement::from_bytes(bytes).map_err(|e| self.reject_ack(e.to_string()))?;
        if !verify_acknowledgement(&ack, from) {
            return Err(self.reject_ack("not signed by the sending peer".to_string()));
        }
        let ack_challenge =
            ack_challenge_of(&ack.ack_key_share).map_err(|e| self.reject_ack(e.to_string()))?;

        match self.redeem(&ack, &ack_challenge).await {
            Err(e) if e.is_fatal() => {
                warn!("Parking acknowledgement from {}: {}", hex::encode(&from[..8]), e);
                self.park(Parked::Ack {
                    bytes: bytes.to_vec(),
                    from: *from,
                })
                .await;
                Err(e)
            }
            other => other,
        }
    }

    async fn redeem(&self, ack: &Acknowledgement, ack_challenge: &PeerId) -> Result<AckOutcome> {
        let _guard = self.ack_locks.lock(*ack_challenge).await;
        let pending = self
            .with_store_retry("ticket lookup", || {
                self.store.lookup_unacknowledged_ticket(ack_challenge)
            })
            .await?;
        let Some(UnacknowledgedTicket {
            ticket,
            own_key,
            issuer,
            ..
        }) = pending
        else {
            debug!("No ticket waits for challenge {}", hex::encode(&ack_challenge[..8]));
            return Ok(AckOutcome::Unknown);
        };

        let validation = validate_acknowledgement(
            &own_key,
            &ack.ack_key_share,
            &ticket.fields.challenge,
            None,
            None,
        );

        self.with_store_retry("ticket take", || {
            self.store.take_unacknowledged_ticket(ack_challenge)
        })
        .await?;

        let response = match (validation.valid, validation.response) {
            (true, Some(response)) => response,
            _ => return Err(self.reject_ack("key share does not solve the ticket".to_string())),
        };

        let acknowledged = AcknowledgedTicket {
            ticket,
            response,
            issuer,
        };
        if acknowledged.is_winning() {
            self.with_store_retry("ticket store", || {
                self.store.store_acknowledged_ticket(acknowledged.clone())
            })
            .await?;
            self.metrics.winning_tickets.inc();
            info!(
                "Winning ticket worth {} from {}",
                acknowledged.ticket.fields.amount,
                hex::encode(&issuer[..8])
            );
            Ok(AckOutcome::Winning)
        } else {
            self.metrics.losing_tickets.inc();
            debug!("Discarding losing ticket from {}", hex::encode(&issuer[..8]));
            Ok(AckOutcome::Losing)
        }
    }

    fn reject_ack(&self, reason: String) -> RelayError {
        self.metrics.ack_failures.inc();
        debug!("Rejecting acknowledgement: {}", reason);
        RelayError::AckInvalid(reason)
    }

    /// Re-run everything parked while the store was unavailable.
    ///
    /// Packets that never reached the mixer are deduplicated and delayed
    /// again; the rest go straight to forwarding. Returns how many items were
    /// handled. If the store fails again, everything not yet handled is
    /// parked again and the error is returned.
    pub async fn retry_parked(&self) -> Result<usize> {
        let parked = Vec::from(std::mem::take(&mut *self.parked.lock().await));
        if parked.is_empty() {
            return Ok(0);
        }
        info!("Retrying {} parked items", parked.len());

        let mut mixer = Mixer::new(&RelayConfig {
            max_queue_depth: parked.len(),
            ..self.config.clone()
        });
        let mut released = VecDeque::new();
        let mut handled = 0;

        let mut remaining = parked.into_iter();
        while let Some(item) = remaining.next() {
            let result = match item {
                Parked::Ack { bytes, from } => self
                    .process_acknowledgement(&bytes, &from)
                    .await
                    .map(|_| ()),
                Parked::Cleanup { ack_challenge } => self.drop_unacknowledged(&ack_challenge).await,
                Parked::Packet {
                    packet,
                    tag_recorded: true,
                } => {
                    released.push_back(packet);
                    Ok(())
                }
                Parked::Packet {
                    packet,
                    tag_recorded: false,
                } => self.deduplicate(packet).await.map(|packet| {
                    mixer.push(packet);
                }),
            };
            match result {
                Err(e) if e.is_fatal() => {
                    // The failed item parked itself again
                    let mut rest: Vec<Parked> = remaining.collect();
                    rest.extend(released.into_iter().chain(mixer.drain()).map(|packet| {
                        Parked::Packet {
                            packet,
                            tag_recorded: true,
                        }
                    }));
                    self.park_all(rest).await;
                    return Err(e);
                }
                _ => handled += 1,
            }
        }

        loop {
            while let Some(packet) = released.pop_front() {
                if let Err(e) = self.process_released(packet).await {
                    if e.is_fatal() {
                        let rest = released.into_iter().chain(mixer.drain()).map(|packet| {
                            Parked::Packet {
                                packet,
                                tag_recorded: true,
                            }
                        });
                        self.park_all(rest.collect()).await;
                        return Err(e);
                    }
                    debug!("Parked packet dropped on retry: {}", e);
                }
            }
            match mixer.next_release() {
                Some(at) => {
                    sleep_until(at).await;
                    released.extend(mixer.pop_ready(Instant::now()));
                }
                None => break,
            }
        }

        Ok(handled)
    }

    async fn park(&self, item: Parked) {
        self.park_all(vec![item]).await;
    }

    /// Hold items for a later retry. A full backlog sheds items by the
    /// overflow policy.
    async fn park_all(&self, items: Vec<Parked>) {
        let limit = self.config.max_parked.max(1);
        let mut parked = self.parked.lock().await;
        for item in items {
            if parked.len() >= limit {
                self.metrics.parked_dropped.inc();
                match self.config.overflow_policy {
                    OverflowPolicy::DropNewest => {
                        warn!("Parked backlog full, dropping {}", item.describe());
                        continue;
                    }
                    OverflowPolicy::DropOldest => {
                        if let Some(oldest) = parked.pop_front() {
                            warn!("Parked backlog full, dropping {}", oldest.describe());
                        }
                    }
                }
            }
            parked.push_back(item);
        }
    }

    /// Run a store operation, retrying transient failures with backoff
    async fn with_store_retry<T, F, Fut>(
        &self,
        what: &str,
        mut op: F,
    ) -> std::result::Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        let attempts = self.config.store_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!("Store {} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                    attempt += 1;
                    sleep(self.config.store_retry_backoff).await;
                }
            }
        }
    }
}
