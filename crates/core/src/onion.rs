//! Onion header types
//!
//! The header is a fixed-size Sphinx-style structure: every relay peels one
//! routing slot from `beta`, learns the next hop and the next hop's `alpha`
//! and `gamma`, and shifts the remaining routing information left. The header
//! length never changes along the path.

use crate::error::{expect_len, CoreError, Result};
use crate::types::{PeerId, PUBLIC_KEY_LENGTH};

/// Maximum number of nodes on a path (intermediate relays plus receiver)
pub const MAX_HOPS: usize = 4;

/// Length of an X25519 public key
pub const ALPHA_LEN: usize = 32;

/// Length of the header MAC
pub const MAC_LEN: usize = 32;

/// Length of a PoR string: next ticket challenge || ack challenge hint
pub const POR_STRING_LEN: usize = PUBLIC_KEY_LENGTH * 2;

/// flag || next_peer || next_alpha || next_gamma || por_string
pub const HOP_SLOT_LEN: usize = 1 + PUBLIC_KEY_LENGTH + ALPHA_LEN + MAC_LEN + POR_STRING_LEN;

/// Length of `beta`
pub const ROUTING_INFO_LEN: usize = MAX_HOPS * HOP_SLOT_LEN;

/// alpha || beta || gamma
pub const HEADER_LEN: usize = ALPHA_LEN + ROUTING_INFO_LEN + MAC_LEN;

const FLAG_RELAY: u8 = 0x00;
const FLAG_RECEIVER: u8 = 0x01;

/// Routing information a hop learns after peeling its layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingSlot {
    /// Forward to `next_peer`
    Relay {
        next_peer: PeerId,
        next_alpha: [u8; ALPHA_LEN],
        next_gamma: [u8; MAC_LEN],
        /// PoR string produced for this hop by the sender
        por_string: [u8; POR_STRING_LEN],
    },
    /// This hop is the final destination
    Receiver,
}

impl RoutingSlot {
    pub fn is_receiver(&self) -> bool {
        matches!(self, RoutingSlot::Receiver)
    }

    pub fn to_bytes(&self) -> [u8; HOP_SLOT_LEN] {
        let mut out = [0u8; HOP_SLOT_LEN];
        match self {
            RoutingSlot::Relay {
                next_peer,
                next_alpha,
                next_gamma,
                por_string,
            } => {
                let mut offset = 0;
                out[offset] = FLAG_RELAY;
                offset += 1;
                out[offset..offset + PUBLIC_KEY_LENGTH].copy_from_slice(next_peer);
                offset += PUBLIC_KEY_LENGTH;
                out[offset..offset + ALPHA_LEN].copy_from_slice(next_alpha);
                offset += ALPHA_LEN;
                out[offset..offset + MAC_LEN].copy_from_slice(next_gamma);
                offset += MAC_LEN;
                out[offset..].copy_from_slice(por_string);
            }
            RoutingSlot::Receiver => out[0] = FLAG_RECEIVER,
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        expect_len(bytes, HOP_SLOT_LEN)?;
        match bytes[0] {
            FLAG_RECEIVER => Ok(RoutingSlot::Receiver),
            FLAG_RELAY => {
                let mut offset = 1;
                let mut next_peer = [0u8; PUBLIC_KEY_LENGTH];
                next_peer.copy_from_slice(&bytes[offset..offset + PUBLIC_KEY_LENGTH]);
                offset += PUBLIC_KEY_LENGTH;
                let mut next_alpha = [0u8; ALPHA_LEN];
                next_alpha.copy_from_slice(&bytes[offset..offset + ALPHA_LEN]);
                offset += ALPHA_LEN;
                let mut next_gamma = [0u8; MAC_LEN];
                next_gamma.copy_from_slice(&bytes[offset..offset + MAC_LEN]);
                offset += MAC_LEN;
                let mut por_string = [0u8; POR_STRING_LEN];
                por_string.copy_from_slice(&bytes[offset..]);
                Ok(RoutingSlot::Relay {
                    next_peer,
                    next_alpha,
                    next_gamma,
                    por_string,
                })
            }
            other => Err(CoreError::InvalidRoutingFlag(other)),
        }
    }
}

/// Fixed-size onion header carried by every packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionHeader {
    /// Ephemeral X25519 public key for this hop's key exchange
    pub alpha: [u8; ALPHA_LEN],
    /// Encrypted routing information, always [`ROUTING_INFO_LEN`] bytes
    pub beta: Vec<u8>,
    /// MAC over `beta` under this hop's MAC key
    pub gamma: [u8; MAC_LEN],
}

impl OnionHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&self.alpha);
        out.extend_from_slice(&self.beta);
        out.extend_from_slice(&self.gamma);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        expect_len(bytes, HEADER_LEN)?;
        let mut alpha = [0u8; ALPHA_LEN];
        alpha.copy_from_slice(&bytes[..ALPHA_LEN]);
        let beta = bytes[ALPHA_LEN..ALPHA_LEN + ROUTING_INFO_LEN].to_vec();
        let mut gamma = [0u8; MAC_LEN];
        gamma.copy_from_slice(&bytes[ALPHA_LEN + ROUTING_INFO_LEN..]);
        Ok(Self { alpha, beta, gamma })
    }
}
