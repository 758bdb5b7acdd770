use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

/// 32-byte hash
pub type Hash = [u8; 32];

/// 20-byte account identifier (last 20 bytes of Keccak-256 over the public key)
pub type Address = [u8; 20];

/// Compressed secp256k1 public key identifying a node on the wire
pub type PeerId = [u8; 33];

/// Recoverable ECDSA signature: r(32) || s(32) || v(1)
pub type Signature = [u8; 65];

/// Per-hop shared secret derived during packet construction
pub type Secret = [u8; 32];

/// Replay-detection fingerprint derived from a per-hop secret
pub type PacketTag = [u8; 32];

/// Token balance in the smallest unit
pub type Balance = u128;

/// Length of a per-hop secret
pub const SECRET_LENGTH: usize = 32;

/// Length of an [`Address`]
pub const ADDRESS_LENGTH: usize = 20;

/// Length of a compressed secp256k1 public key
pub const PUBLIC_KEY_LENGTH: usize = 33;

/// Length of a recoverable signature
pub const SIGNATURE_LENGTH: usize = 65;

/// Length of a secp256k1 scalar
pub const SCALAR_LENGTH: usize = 32;

/// Local view of a payment channel with one counterparty.
///
/// `epoch` is the ticket epoch the channel currently accepts and `iteration`
/// increments every time the channel is closed and reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelState {
    pub balance: Balance,
    pub epoch: u64,
    pub iteration: u64,
}

impl ChannelState {
    pub fn new(balance: Balance, epoch: u64, iteration: u64) -> Self {
        Self { balance, epoch, iteration }
    }
}

/// One node on a packet path, as known to the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathHop {
    /// Chain key of the node (also its transport identity)
    #[serde(with = "BigArray")]
    pub peer: PeerId,
    /// X25519 key used for the per-hop key exchange
    pub encryption_pubkey: [u8; 32],
}

impl PathHop {
    pub fn new(peer: PeerId, encryption_pubkey: [u8; 32]) -> Self {
        Self { peer, encryption_pubkey }
    }
}

/// Short hex prefix used in log lines
pub fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(8)])
}
