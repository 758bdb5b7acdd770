//! Packet codec
//!
//! [`Packet::create`] builds the packet a sender hands to the first hop.
//! [`Packet::deserialize`] peels the local layer of an inbound packet and
//! [`Packet::forward_transform`] re-tickets it for the next hop.

use mixcraft_core::{
    short_hex, Balance, CoreError, OnionHeader, PacketTag, PathHop, PeerId, RoutingSlot, Secret, Ticket,
    TicketFields, UnacknowledgedTicket, WirePacket, POR_STRING_LEN,
};
use mixcraft_crypto::{
    address_of, build_header, challenge_address, create_first_challenge, create_por_string,
    derive_ack_key_share, derive_packet_tag, derive_payload_key, open_payload, peel_header,
    peel_payload, pre_verify, receiver_challenge, seal_payload, setup_path, verify_ticket,
    wrap_payload, EncryptError, EncryptionKeypair, KeyError, PorError, PreVerification,
    SphinxError,
};
use thiserror::Error;
use tracing::trace;

use crate::channel::{ChannelCollaborator, ChannelError};
use crate::config::TicketPricing;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Malformed packet: {0}")]
    Malformed(#[from] CoreError),

    #[error("Header rejected: {0}")]
    Header(#[from] SphinxError),

    #[error("Ticket not signed by the sending peer")]
    TicketSignature,

    #[error("Payload rejected: {0}")]
    Payload(#[from] EncryptError),

    #[error("Packet is addressed to this node")]
    NotForwardable,

    #[error("PoR error: {0}")]
    Por(#[from] PorError),

    #[error("PoR string does not match the ticket challenge")]
    PorMismatch,

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Insufficient channel balance: need {needed}, have {available}")]
    InsufficientBalance { needed: u128, available: u128 },

    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

/// What a hop learned from its layer
#[derive(Debug, Clone)]
pub enum PacketKind {
    /// This node is the destination
    Final { plaintext: Vec<u8> },
    /// Forward to `next_hop`
    Relay {
        next_hop: PeerId,
        next_header: OnionHeader,
        /// Payload with this hop's layer removed
        payload: Vec<u8>,
        por_string: [u8; POR_STRING_LEN],
    },
}

/// A packet after the local layer has been peeled
#[derive(Debug, Clone)]
pub struct Packet {
    /// Replay fingerprint derived from this hop's secret
    pub tag: PacketTag,
    /// Peer the packet came from, who also issued `ticket`
    pub previous_hop: PeerId,
    /// Ticket paying this node
    pub ticket: Ticket,
    pub kind: PacketKind,
    secret: Secret,
}

/// Output of [`Packet::create`]
#[derive(Debug, Clone)]
pub struct CreatedPacket {
    pub first_hop: PeerId,
    pub bytes: Vec<u8>,
    pub ticket: Ticket,
}

/// Output of [`Packet::forward_transform`]
#[derive(Debug, Clone)]
pub struct ForwardedPacket {
    pub next_hop: PeerId,
    pub bytes: Vec<u8>,
    /// Ticket issued to `next_hop`
    pub ticket: Ticket,
    /// The inbound ticket, redeemable once `next_hop` acknowledges
    pub unacknowledged: UnacknowledgedTicket,
}

impl Packet {
    /// Build a packet carrying `payload` along `path`.
    ///
    /// The last node of the path is the receiver. The first ticket pays for
    /// every relay on the path; each relay keeps `price_per_hop` of it.
    pub async fn create<C>(
        payload: &[u8],
        path: &[PathHop],
        channels: &C,
        pricing: &TicketPricing,
    ) -> Result<CreatedPacket, PacketError>
    where
        C: ChannelCollaborator + ?Sized,
    {
        let hops = setup_path(path)?;
        let secrets: Vec<Secret> = hops.iter().map(|hop| hop.secret).collect();
        let last = secrets.len() - 1;

        let mut por_strings = Vec::with_capacity(last);
        for i in 0..last {
            por_strings.push(create_por_string(&secrets[i + 1], secrets.get(i + 2))?);
        }
        let header = build_header(path, &hops, &por_strings)?;

        let mut sealed = seal_payload(&derive_payload_key(&secrets[last]), payload)?;
        wrap_payload(&hops, &mut sealed);

        let challenge = if last > 0 {
            create_first_challenge(&secrets[0], &secrets[1])?.ticket_challenge
        } else {
            receiver_challenge(&secrets[0])?
        };

        let first_hop = path[0].peer;
        let amount = pricing.price_per_hop.saturating_mul(last as u128);
        let ticket = issue_ticket(channels, &first_hop, &challenge, amount, pricing).await?;

        let wire = WirePacket {
            header,
            payload: sealed,
            ticket,
        };
        Ok(CreatedPacket {
            first_hop,
            bytes: wire.to_bytes(),
            ticket,
        })
    }

    /// Peel the local layer of `bytes` received from `claimed_sender`.
    ///
    /// Fails if the header MAC does not verify under the local key, if the
    /// ticket was not signed by `claimed_sender`, or if the final payload
    /// does not authenticate.
    pub fn deserialize(
        bytes: &[u8],
        keypair: &EncryptionKeypair,
        claimed_sender: &PeerId,
    ) -> Result<Self, PacketError> {
        let wire = WirePacket::from_bytes(bytes)?;
        let peeled = peel_header(keypair, &wire.header)?;

        if !verify_ticket(&wire.ticket, claimed_sender) {
            return Err(PacketError::TicketSignature);
        }

        let secret = peeled.secret;
        let mut payload = wire.payload;
        peel_payload(&secret, &mut payload);

        let kind = match (peeled.slot, peeled.next_header) {
            (
                RoutingSlot::Relay {
                    next_peer,
                    por_string,
                    ..
                },
                Some(next_header),
            ) => PacketKind::Relay {
                next_hop: next_peer,
                next_header,
                payload,
                por_string,
            },
            (RoutingSlot::Receiver, _) => PacketKind::Final {
                plaintext: open_payload(&derive_payload_key(&secret), &payload)?,
            },
            // Peeling always pairs a relay slot with the next header
            (RoutingSlot::Relay { .. }, None) => {
                return Err(PacketError::Header(SphinxError::InvalidMac))
            }
        };

        Ok(Self {
            tag: derive_packet_tag(&secret),
            previous_hop: *claimed_sender,
            ticket: wire.ticket,
            kind,
            secret,
        })
    }

    /// True iff this node is the final destination
    pub fn is_receiver(&self) -> bool {
        matches!(self.kind, PacketKind::Final { .. })
    }

    pub fn next_hop(&self) -> Option<&PeerId> {
        match &self.kind {
            PacketKind::Relay { next_hop, .. } => Some(next_hop),
            PacketKind::Final { .. } => None,
        }
    }

    /// Key share this node reveals to the previous hop
    pub fn ack_key_share(&self) -> Result<[u8; 32], PacketError> {
        Ok(derive_ack_key_share(&self.secret)?)
    }

    /// Check the PoR string against the inbound ticket's challenge
    pub fn pre_verify(&self) -> Result<PreVerification, PacketError> {
        let PacketKind::Relay { por_string, .. } = &self.kind else {
            return Err(PacketError::NotForwardable);
        };
        let pre = pre_verify(&self.secret, por_string, &self.ticket.fields.challenge)?;
        if !pre.valid {
            return Err(PacketError::PorMismatch);
        }
        Ok(pre)
    }

    /// Produce the packet for the next hop with a freshly issued ticket.
    ///
    /// The outgoing ticket commits to the challenge announced in the PoR
    /// string and carries the inbound amount minus `price_per_hop`.
    pub async fn forward_transform<C>(
        &self,
        channels: &C,
        pricing: &TicketPricing,
    ) -> Result<ForwardedPacket, PacketError>
    where
        C: ChannelCollaborator + ?Sized,
    {
        let PacketKind::Relay {
            next_hop,
            next_header,
            payload,
            ..
        } = &self.kind
        else {
            return Err(PacketError::NotForwardable);
        };
        let pre = self.pre_verify()?;

        let amount = self
            .ticket
            .fields
            .amount
            .saturating_sub(pricing.price_per_hop);
        let ticket =
            issue_ticket(channels, next_hop, &pre.next_ticket_challenge, amount, pricing).await?;

        trace!(
            "Re-ticketed packet {} for {}",
            short_hex(&self.tag),
            short_hex(next_hop)
        );

        let wire = WirePacket {
            header: next_header.clone(),
            payload: payload.clone(),
            ticket,
        };
        Ok(ForwardedPacket {
            next_hop: *next_hop,
            bytes: wire.to_bytes(),
            ticket,
            unacknowledged: UnacknowledgedTicket {
                ticket: self.ticket,
                own_key: pre.own_key,
                ack_challenge: pre.ack_challenge,
                issuer: self.previous_hop,
            },
        })
    }
}

/// Sign a ticket paying `amount` to `counterparty`.
///
/// A ticket worth nothing goes to the receiver, which never redeems it, so it
/// is issued without a channel: epoch and iteration are 0.
async fn issue_ticket<C>(
    channels: &C,
    counterparty: &PeerId,
    challenge: &PeerId,
    amount: Balance,
    pricing: &TicketPricing,
) -> Result<Ticket, PacketError>
where
    C: ChannelCollaborator + ?Sized,
{
    let (epoch, channel_iteration) = if amount == 0 {
        (0, 0)
    } else {
        let state = channels.get_channel_state(counterparty).await?;
        if amount > state.balance {
            return Err(PacketError::InsufficientBalance {
                needed: amount,
                available: state.balance,
            });
        }
        (state.epoch, state.iteration)
    };

    let fields = TicketFields {
        counterparty: address_of(counterparty)?,
        challenge: challenge_address(challenge)?,
        epoch,
        amount,
        win_prob: pricing.win_prob(),
        channel_iteration,
    };
    let signature = channels.sign_ticket(&fields).await?;
    Ok(Ticket::from_fields(fields, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannels;
    use mixcraft_core::{ChannelState, PACKET_LEN};
    use mixcraft_crypto::{sign_ticket, Identity, PAYLOAD_CAPACITY};

    struct Node {
        id: Identity,
        channels: MemoryChannels,
    }

    async fn nodes(n: usize) -> Vec<Node> {
        let ids: Vec<Identity> = (0..n).map(|_| Identity::generate()).collect();
        let mut out = Vec::with_capacity(n);
        for (i, id) in ids.iter().enumerate() {
            let channels = MemoryChannels::new(id.chain.clone());
            for (j, other) in ids.iter().enumerate() {
                if i != j {
                    channels
                        .set_channel(other.peer_id(), ChannelState::new(1_000_000, 1, 1))
                        .await;
                }
            }
            out.push(Node {
                id: id.clone(),
                channels,
            });
        }
        out
    }

    fn pricing() -> TicketPricing {
        TicketPricing {
            price_per_hop: 10,
            win_probability: 1.0,
        }
    }

    #[tokio::test]
    async fn test_create_and_walk_three_hops() {
        // nodes[0] is the sender
        let nodes = nodes(4).await;
        let path: Vec<PathHop> = nodes[1..].iter().map(|n| n.id.path_hop()).collect();

        let created = Packet::create(b"through the mix", &path, &nodes[0].channels, &pricing())
            .await
            .unwrap();
        assert_eq!(created.bytes.len(), PACKET_LEN);
        assert_eq!(created.first_hop, nodes[1].id.peer_id());
        assert_eq!(created.ticket.fields.amount, 20);

        let mut bytes = created.bytes;
        let mut sender = nodes[0].id.peer_id();
        let mut tags = vec![];
        for hop in 1..=2 {
            let node = &nodes[hop];
            let packet = Packet::deserialize(&bytes, &node.id.encryption, &sender).unwrap();
            assert!(!packet.is_receiver());
            assert_eq!(packet.next_hop(), Some(&nodes[hop + 1].id.peer_id()));
            tags.push(packet.tag);

            let forwarded = packet
                .forward_transform(&node.channels, &pricing())
                .await
                .unwrap();
            assert_eq!(forwarded.bytes.len(), PACKET_LEN);
            assert_eq!(forwarded.ticket.fields.amount, 20 - 10 * hop as u128);
            assert_eq!(forwarded.unacknowledged.issuer, sender);

            bytes = forwarded.bytes;
            sender = node.id.peer_id();
        }

        let last = Packet::deserialize(&bytes, &nodes[3].id.encryption, &sender).unwrap();
        assert!(last.is_receiver());
        tags.push(last.tag);
        match last.kind {
            PacketKind::Final { plaintext } => assert_eq!(plaintext, b"through the mix"),
            PacketKind::Relay { .. } => panic!("expected final packet"),
        }
        assert_ne!(tags[0], tags[1]);
        assert_ne!(tags[1], tags[2]);
    }

    #[tokio::test]
    async fn test_tag_is_deterministic() {
        let nodes = nodes(3).await;
        let path: Vec<PathHop> = nodes[1..].iter().map(|n| n.id.path_hop()).collect();
        let created = Packet::create(b"x", &path, &nodes[0].channels, &pricing())
            .await
            .unwrap();

        let sender = nodes[0].id.peer_id();
        let a = Packet::deserialize(&created.bytes, &nodes[1].id.encryption, &sender).unwrap();
        let b = Packet::deserialize(&created.bytes, &nodes[1].id.encryption, &sender).unwrap();
        assert_eq!(a.tag, b.tag);
    }

    #[tokio::test]
    async fn test_direct_to_receiver() {
        let nodes = nodes(2).await;
        let path = vec![nodes[1].id.path_hop()];
        let created = Packet::create(b"direct", &path, &nodes[0].channels, &pricing())
            .await
            .unwrap();
        assert_eq!(created.ticket.fields.amount, 0);

        let packet =
            Packet::deserialize(&created.bytes, &nodes[1].id.encryption, &nodes[0].id.peer_id())
                .unwrap();
        assert!(packet.is_receiver());
        assert!(matches!(
            packet.forward_transform(&nodes[1].channels, &pricing()).await,
            Err(PacketError::NotForwardable)
        ));
    }

    #[tokio::test]
    async fn test_wrong_claimed_sender() {
        let nodes = nodes(3).await;
        let path: Vec<PathHop> = nodes[1..].iter().map(|n| n.id.path_hop()).collect();
        let created = Packet::create(b"x", &path, &nodes[0].channels, &pricing())
            .await
            .unwrap();

        let result =
            Packet::deserialize(&created.bytes, &nodes[1].id.encryption, &nodes[2].id.peer_id());
        assert!(matches!(result, Err(PacketError::TicketSignature)));
    }

    #[tokio::test]
    async fn test_wrong_local_key() {
        let nodes = nodes(3).await;
        let path: Vec<PathHop> = nodes[1..].iter().map(|n| n.id.path_hop()).collect();
        let created = Packet::create(b"x", &path, &nodes[0].channels, &pricing())
            .await
            .unwrap();

        let result =
            Packet::deserialize(&created.bytes, &nodes[2].id.encryption, &nodes[0].id.peer_id());
        assert!(matches!(result, Err(PacketError::Header(SphinxError::InvalidMac))));
    }

    #[tokio::test]
    async fn test_malformed_bytes() {
        let keypair = EncryptionKeypair::generate();
        let result = Packet::deserialize(&[0u8; 100], &keypair, &[2u8; 33]);
        assert!(matches!(result, Err(PacketError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_ticket_with_foreign_challenge_fails_pre_verify() {
        let nodes = nodes(3).await;
        let path: Vec<PathHop> = nodes[1..].iter().map(|n| n.id.path_hop()).collect();
        let created = Packet::create(b"x", &path, &nodes[0].channels, &pricing())
            .await
            .unwrap();

        // Re-sign the ticket with a challenge the PoR string does not support
        let mut wire = WirePacket::from_bytes(&created.bytes).unwrap();
        let mut fields = wire.ticket.fields;
        fields.challenge = [0x42; 20];
        wire.ticket = sign_ticket(&nodes[0].id.chain, fields).unwrap();

        let packet = Packet::deserialize(
            &wire.to_bytes(),
            &nodes[1].id.encryption,
            &nodes[0].id.peer_id(),
        )
        .unwrap();
        assert!(matches!(packet.pre_verify(), Err(PacketError::PorMismatch)));
        assert!(matches!(
            packet.forward_transform(&nodes[1].channels, &pricing()).await,
            Err(PacketError::PorMismatch)
        ));
    }

    #[tokio::test]
    async fn test_receiver_reached_without_channel() {
        let nodes = nodes(3).await;
        let path: Vec<PathHop> = nodes[1..].iter().map(|n| n.id.path_hop()).collect();
        let created = Packet::create(b"no channel needed", &path, &nodes[0].channels, &pricing())
            .await
            .unwrap();

        let relay = &nodes[1];
        relay.channels.close_channel(&nodes[2].id.peer_id()).await;
        let packet =
            Packet::deserialize(&created.bytes, &relay.id.encryption, &nodes[0].id.peer_id())
                .unwrap();
        let forwarded = packet
            .forward_transform(&relay.channels, &pricing())
            .await
            .unwrap();

        let fields = forwarded.ticket.fields;
        assert_eq!(fields.amount, 0);
        assert_eq!(fields.epoch, 0);
        assert_eq!(fields.channel_iteration, 0);
        assert!(verify_ticket(&forwarded.ticket, &relay.id.peer_id()));

        let last =
            Packet::deserialize(&forwarded.bytes, &nodes[2].id.encryption, &relay.id.peer_id())
                .unwrap();
        match last.kind {
            PacketKind::Final { plaintext } => assert_eq!(plaintext, b"no channel needed"),
            PacketKind::Relay { .. } => panic!("expected final packet"),
        }
    }

    #[tokio::test]
    async fn test_direct_to_receiver_without_channel() {
        let sender = Identity::generate();
        let receiver = Identity::generate();
        let channels = MemoryChannels::new(sender.chain.clone());

        let created = Packet::create(b"hi", &[receiver.path_hop()], &channels, &pricing())
            .await
            .unwrap();
        assert_eq!(created.ticket.fields.amount, 0);
        assert_eq!(created.ticket.fields.channel_iteration, 0);

        let packet =
            Packet::deserialize(&created.bytes, &receiver.encryption, &sender.peer_id()).unwrap();
        assert!(packet.is_receiver());
    }

    #[tokio::test]
    async fn test_missing_channel_to_paid_hop() {
        let nodes = nodes(4).await;
        let path: Vec<PathHop> = nodes[1..].iter().map(|n| n.id.path_hop()).collect();
        let created = Packet::create(b"x", &path, &nodes[0].channels, &pricing())
            .await
            .unwrap();

        // nodes[2] is a relay and is owed 10
        let packet =
            Packet::deserialize(&created.bytes, &nodes[1].id.encryption, &nodes[0].id.peer_id())
                .unwrap();
        nodes[1].channels.close_channel(&nodes[2].id.peer_id()).await;
        assert!(matches!(
            packet.forward_transform(&nodes[1].channels, &pricing()).await,
            Err(PacketError::Channel(ChannelError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_payload_too_large() {
        let nodes = nodes(2).await;
        let path = vec![nodes[1].id.path_hop()];
        let result = Packet::create(
            &vec![0u8; PAYLOAD_CAPACITY + 1],
            &path,
            &nodes[0].channels,
            &pricing(),
        )
        .await;
        assert!(matches!(
            result,
            Err(PacketError::Payload(EncryptError::PayloadTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_insufficient_balance() {
        let nodes = nodes(3).await;
        nodes[0]
            .channels
            .set_channel(nodes[1].id.peer_id(), ChannelState::new(5, 1, 1))
            .await;
        let path: Vec<PathHop> = nodes[1..].iter().map(|n| n.id.path_hop()).collect();
        let result = Packet::create(b"x", &path, &nodes[0].channels, &pricing()).await;
        assert!(matches!(
            result,
            Err(PacketError::InsufficientBalance { needed: 10, available: 5 })
        ));
    }
}
