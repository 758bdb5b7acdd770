//! Probabilistic payment tickets
//!
//! A ticket pays `amount` with probability `win_prob / 2^256`. It commits to
//! the address of a proof-of-relay challenge, so the holder can only evaluate
//! the win test once it has learned the challenge's discrete log from the
//! downstream acknowledgement.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use sha3::{Digest, Keccak256};

use crate::error::{expect_len, Result};
use crate::types::{Address, Balance, Hash, PeerId, Signature, ADDRESS_LENGTH, SIGNATURE_LENGTH};

/// Winning threshold stored as a little-endian 256-bit integer.
///
/// A ticket wins iff `luck < threshold`, with `luck` also read little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinProb(pub [u8; 32]);

impl WinProb {
    /// Every ticket wins
    pub const ALWAYS: WinProb = WinProb([0xff; 32]);

    /// No ticket wins
    pub const NEVER: WinProb = WinProb([0u8; 32]);

    /// Threshold for a target probability: `floor(p * (2^256 - 1))` at 2^-64 resolution.
    ///
    /// Values outside `(0, 1)` clamp to [`WinProb::NEVER`] / [`WinProb::ALWAYS`].
    pub fn from_probability(p: f64) -> Self {
        if p.is_nan() || p <= 0.0 {
            return Self::NEVER;
        }
        if p >= 1.0 {
            return Self::ALWAYS;
        }
        let scaled = (p * 18_446_744_073_709_551_616.0) as u64;
        Self::from_u256((U256::MAX >> 64usize) * U256::from(scaled))
    }

    pub fn from_u256(value: U256) -> Self {
        let mut bytes = [0u8; 32];
        value.to_little_endian(&mut bytes);
        Self(bytes)
    }

    pub fn as_u256(&self) -> U256 {
        U256::from_little_endian(&self.0)
    }

    /// Approximate probability this threshold encodes
    pub fn to_probability(&self) -> f64 {
        if *self == Self::ALWAYS {
            return 1.0;
        }
        (self.as_u256() >> 192usize).low_u64() as f64 / 18_446_744_073_709_551_616.0
    }

    /// `luck < threshold`, both little-endian
    pub fn accepts(&self, luck: &Hash) -> bool {
        U256::from_little_endian(luck) < self.as_u256()
    }
}

/// Ticket fields covered by the issuer's signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketFields {
    /// Address of the node the ticket pays
    pub counterparty: Address,
    /// Address of the PoR challenge point
    pub challenge: Address,
    /// Ticket epoch of the issuing channel
    pub epoch: u64,
    pub amount: Balance,
    pub win_prob: WinProb,
    /// Channel iteration the ticket was issued in
    pub channel_iteration: u64,
}

impl TicketFields {
    /// Byte length of the unsigned encoding
    pub const LEN: usize = ADDRESS_LENGTH * 2 + 8 + 16 + 32 + 8;

    /// Fixed layout:
    /// counterparty(20) || challenge(20) || epoch_be(8) || amount_be(16) || win_prob_le(32) || iteration_be(8)
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..20].copy_from_slice(&self.counterparty);
        out[20..40].copy_from_slice(&self.challenge);
        out[40..48].copy_from_slice(&self.epoch.to_be_bytes());
        out[48..64].copy_from_slice(&self.amount.to_be_bytes());
        out[64..96].copy_from_slice(&self.win_prob.0);
        out[96..104].copy_from_slice(&self.channel_iteration.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        expect_len(bytes, Self::LEN)?;
        Ok(Self {
            counterparty: array(&bytes[0..20]),
            challenge: array(&bytes[20..40]),
            epoch: u64::from_be_bytes(array(&bytes[40..48])),
            amount: u128::from_be_bytes(array(&bytes[48..64])),
            win_prob: WinProb(array(&bytes[64..96])),
            channel_iteration: u64::from_be_bytes(array(&bytes[96..104])),
        })
    }

    /// Keccak-256 over the unsigned encoding; this is what the issuer signs
    pub fn hash(&self) -> Hash {
        Keccak256::digest(self.to_bytes()).into()
    }
}

/// A signed ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub fields: TicketFields,
    #[serde(with = "BigArray")]
    pub signature: Signature,
}

impl Ticket {
    /// Byte length of the signed encoding
    pub const LEN: usize = TicketFields::LEN + SIGNATURE_LENGTH;

    /// Attach a signature produced over `fields.hash()`
    pub fn from_fields(fields: TicketFields, signature: Signature) -> Self {
        Self { fields, signature }
    }

    /// Decode the fixed layout produced by [`Ticket::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        expect_len(bytes, Self::LEN)?;
        let fields = TicketFields::from_bytes(&bytes[..TicketFields::LEN])?;
        Ok(Self {
            fields,
            signature: array(&bytes[TicketFields::LEN..]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..TicketFields::LEN].copy_from_slice(&self.fields.to_bytes());
        out[TicketFields::LEN..].copy_from_slice(&self.signature);
        out
    }

    pub fn hash(&self) -> Hash {
        self.fields.hash()
    }

    /// Keccak-256(ticket_hash || response), the value compared against `win_prob`
    pub fn luck(&self, response: &[u8; 32]) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update(self.hash());
        hasher.update(response);
        hasher.finalize().into()
    }

    /// Whether the ticket wins given the PoR response that solves its challenge
    pub fn is_winning(&self, response: &[u8; 32]) -> bool {
        self.fields.win_prob.accepts(&self.luck(response))
    }
}

/// A ticket held by a relay until the downstream acknowledgement arrives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnacknowledgedTicket {
    pub ticket: Ticket,
    /// Own key share scalar, one half of the challenge's discrete log
    pub own_key: [u8; 32],
    /// Public point the downstream ack key share must match
    #[serde(with = "BigArray")]
    pub ack_challenge: PeerId,
    /// Previous hop that issued the ticket
    #[serde(with = "BigArray")]
    pub issuer: PeerId,
}

/// A ticket whose challenge has been solved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgedTicket {
    pub ticket: Ticket,
    /// Discrete log of the challenge point
    pub response: [u8; 32],
    #[serde(with = "BigArray")]
    pub issuer: PeerId,
}

impl AcknowledgedTicket {
    pub fn is_winning(&self) -> bool {
        self.ticket.is_winning(&self.response)
    }
}

fn array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoreError;
    use rand::RngCore;

    fn sample_fields() -> TicketFields {
        TicketFields {
            counterparty: [1u8; 20],
            challenge: [2u8; 20],
            epoch: 7,
            amount: 1_000_000,
            win_prob: WinProb::from_probability(0.25),
            channel_iteration: 3,
        }
    }

    #[test]
    fn test_ticket_bytes_layout() {
        let ticket = Ticket::from_fields(sample_fields(), [9u8; 65]);
        let bytes = ticket.to_bytes();
        assert_eq!(bytes.len(), Ticket::LEN);
        assert_eq!(&bytes[0..20], &[1u8; 20]);
        assert_eq!(&bytes[40..48], &7u64.to_be_bytes());
        assert_eq!(Ticket::from_bytes(&bytes).unwrap(), ticket);
    }

    #[test]
    fn test_ticket_wrong_length() {
        let result = Ticket::from_bytes(&[0u8; 10]);
        assert_eq!(
            result,
            Err(CoreError::InvalidLength { expected: Ticket::LEN, actual: 10 })
        );
    }

    #[test]
    fn test_hash_changes_with_every_field() {
        let base = sample_fields();
        let mut variants = vec![];
        let mut f = base;
        f.counterparty[0] ^= 1;
        variants.push(f);
        let mut f = base;
        f.challenge[0] ^= 1;
        variants.push(f);
        let mut f = base;
        f.epoch += 1;
        variants.push(f);
        let mut f = base;
        f.amount += 1;
        variants.push(f);
        let mut f = base;
        f.win_prob.0[31] ^= 1;
        variants.push(f);
        let mut f = base;
        f.channel_iteration += 1;
        variants.push(f);

        for v in variants {
            assert_ne!(v.hash(), base.hash());
        }
    }

    #[test]
    fn test_win_prob_bounds() {
        assert_eq!(WinProb::from_probability(1.0), WinProb::ALWAYS);
        assert_eq!(WinProb::from_probability(2.0), WinProb::ALWAYS);
        assert_eq!(WinProb::from_probability(0.0), WinProb::NEVER);
        assert_eq!(WinProb::from_probability(f64::NAN), WinProb::NEVER);
        assert!(WinProb::ALWAYS.accepts(&[0xfe; 32]));
        assert!(!WinProb::NEVER.accepts(&[0u8; 32]));
    }

    #[test]
    fn test_win_prob_roundtrip_probability() {
        let p = WinProb::from_probability(0.125).to_probability();
        assert!((p - 0.125).abs() < 1e-9);
    }

    #[test]
    fn test_win_rate_converges_to_probability() {
        let mut rng = rand::thread_rng();
        for &p in &[0.5f64, 0.1] {
            let win_prob = WinProb::from_probability(p);
            let trials = 20_000u32;
            let mut wins = 0u32;
            let mut luck = [0u8; 32];
            for _ in 0..trials {
                rng.fill_bytes(&mut luck);
                if win_prob.accepts(&luck) {
                    wins += 1;
                }
            }
            let observed = wins as f64 / trials as f64;
            let sigma = (p * (1.0 - p) / trials as f64).sqrt();
            assert!(
                (observed - p).abs() < 5.0 * sigma,
                "observed {observed} for p = {p}"
            );
        }
    }

    #[test]
    fn test_luck_depends_on_response() {
        let ticket = Ticket::from_fields(sample_fields(), [0u8; 65]);
        assert_ne!(ticket.luck(&[1u8; 32]), ticket.luck(&[2u8; 32]));
    }

    #[test]
    fn test_always_winning_ticket() {
        let mut fields = sample_fields();
        fields.win_prob = WinProb::ALWAYS;
        let acked = AcknowledgedTicket {
            ticket: Ticket::from_fields(fields, [0u8; 65]),
            response: [5u8; 32],
            issuer: [2u8; 33],
        };
        assert!(acked.is_winning());
    }
}
