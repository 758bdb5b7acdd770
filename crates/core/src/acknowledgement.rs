//! Acknowledgement sent to the previous hop after a packet was forwarded
//!
//! It reveals the sender's ack key share. The upstream relay matches it against
//! the stored unacknowledged ticket by the share's public point and combines it
//! with its own key share to solve the ticket challenge.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use sha3::{Digest, Keccak256};

use crate::types::{Hash, Signature};

/// Domain separator for acknowledgement signatures
const ACK_DOMAIN: &[u8] = b"mixcraft-ack-v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// Ack key share scalar of the acknowledging node
    pub ack_key_share: [u8; 32],
    /// Acknowledging node's chain-key signature over [`Acknowledgement::signable_hash`]
    #[serde(with = "BigArray")]
    pub signature: Signature,
}

impl Acknowledgement {
    /// Keccak-256(domain || ack_key_share)
    pub fn signable_hash(ack_key_share: &[u8; 32]) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update(ACK_DOMAIN);
        hasher.update(ack_key_share);
        hasher.finalize().into()
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
