//! Proof-of-relay challenges
//!
//! The ticket a node receives commits to the address of
//! `G * own(s_i) + G * ack(s_{i+1})`. The node knows `own(s_i)` from its own
//! secret but only learns `ack(s_{i+1})` when the next hop acknowledges the
//! forwarded packet, so it cannot evaluate (or redeem) the ticket before it
//! has actually relayed.

use mixcraft_core::{Address, PeerId, Secret, POR_STRING_LEN, PUBLIC_KEY_LENGTH};
use thiserror::Error;

use crate::curve::{add_scalars, CurvePoint};
use crate::derivation::{derive_ack_key_share, derive_own_key_share};
use crate::keys::KeyError;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PorError {
    #[error("Malformed curve point in PoR string")]
    MalformedPoint,
    #[error("PoR string has wrong length: {0}")]
    InvalidLength(usize),
    #[error("Key derivation failed: {0}")]
    Key(#[from] KeyError),
}

/// Sender-side challenge for the first hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstChallenge {
    /// `own(s0)`, kept by the sender
    pub own_key: [u8; 32],
    /// `G * ack(s1)`, the point the first hop's acknowledgement must match
    pub ack_challenge: PeerId,
    /// Point the first ticket commits to
    pub ticket_challenge: PeerId,
}

impl FirstChallenge {
    pub fn ticket_challenge_address(&self) -> Result<Address, PorError> {
        challenge_address(&self.ticket_challenge)
    }
}

/// What a relay learns from its PoR string before any acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreVerification {
    pub valid: bool,
    /// `G * ack(s_{i+1})` announced by the sender
    pub ack_challenge: PeerId,
    /// Challenge point the ticket to the next hop must commit to
    pub next_ticket_challenge: PeerId,
    pub own_key: [u8; 32],
    /// `G * own_key`
    pub own_share: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckValidation {
    pub valid: bool,
    /// Discrete log of the ticket challenge, `None` if it could not be formed
    pub response: Option<[u8; 32]>,
}

/// Challenge the sender attaches to the ticket for the first hop.
///
/// `secret_self` belongs to the first hop, `secret_next` to the hop after it.
pub fn create_first_challenge(
    secret_self: &Secret,
    secret_next: &Secret,
) -> Result<FirstChallenge, PorError> {
    let own_key = derive_own_key_share(secret_self)?;
    let own_share = CurvePoint::from_scalar(&own_key)?;
    let ack_point = CurvePoint::from_scalar(&derive_ack_key_share(secret_next)?)?;
    let ticket_challenge = own_share.combine(&ack_point)?;

    Ok(FirstChallenge {
        own_key,
        ack_challenge: ack_point.to_bytes(),
        ticket_challenge: ticket_challenge.to_bytes(),
    })
}

/// Challenge for a hop with no successor (the receiver).
///
/// Only `own(s_last)` is involved, so the receiver's ticket never needs an
/// acknowledgement to be solved.
pub fn receiver_challenge(secret: &Secret) -> Result<PeerId, PorError> {
    let own_key = derive_own_key_share(secret)?;
    Ok(CurvePoint::from_scalar(&own_key)?.to_bytes())
}

/// PoR string read by the relay that forwards to the holder of `secret_next`.
///
/// Layout: `next_ticket_challenge(33) || ack_challenge(33)`. The first point
/// is `G * own(secret_next) + G * ack(secret_after)`, the challenge of the
/// ticket the relay issues downstream (just `G * own(secret_next)` when the
/// next hop is the receiver). The second is `G * ack(secret_next)`, which the
/// downstream acknowledgement will reveal.
pub fn create_por_string(
    secret_next: &Secret,
    secret_after: Option<&Secret>,
) -> Result<[u8; POR_STRING_LEN], PorError> {
    let own_point = CurvePoint::from_scalar(&derive_own_key_share(secret_next)?)?;
    let next_challenge = match secret_after {
        Some(after) => {
            let after_ack = CurvePoint::from_scalar(&derive_ack_key_share(after)?)?;
            own_point.combine(&after_ack)?
        }
        None => own_point,
    };
    let hint = CurvePoint::from_scalar(&derive_ack_key_share(secret_next)?)?;

    let mut out = [0u8; POR_STRING_LEN];
    out[..PUBLIC_KEY_LENGTH].copy_from_slice(&next_challenge.to_bytes());
    out[PUBLIC_KEY_LENGTH..].copy_from_slice(&hint.to_bytes());
    Ok(out)
}

/// Check a PoR string against the challenge address of the ticket that came
/// with it, before the packet is forwarded.
///
/// Malformed points produce `Err`; a well-formed but inconsistent string
/// yields `valid == false`.
pub fn pre_verify(
    secret_own: &Secret,
    por_string: &[u8],
    expected_challenge: &Address,
) -> Result<PreVerification, PorError> {
    if por_string.len() != POR_STRING_LEN {
        return Err(PorError::InvalidLength(por_string.len()));
    }
    let own_key = derive_own_key_share(secret_own)?;
    let own_share = CurvePoint::from_scalar(&own_key)?;

    let next_ticket_challenge = CurvePoint::from_bytes(&por_string[..PUBLIC_KEY_LENGTH])
        .map_err(|_| PorError::MalformedPoint)?;
    let ack_challenge = CurvePoint::from_bytes(&por_string[PUBLIC_KEY_LENGTH..])
        .map_err(|_| PorError::MalformedPoint)?;

    let valid = match ack_challenge.combine(&own_share) {
        Ok(challenge) => challenge.to_address() == *expected_challenge,
        Err(_) => false,
    };

    Ok(PreVerification {
        valid,
        ack_challenge: ack_challenge.to_bytes(),
        next_ticket_challenge: next_ticket_challenge.to_bytes(),
        own_key,
        own_share: own_share.to_bytes(),
    })
}

/// Reconstruct the ticket response from the own key and an acknowledged key
/// share, and check it solves `expected_challenge`.
///
/// With `own_share` set, the acknowledged share must also combine with it to
/// the expected challenge. A `precomputed_response` skips the reconstruction.
pub fn validate_acknowledgement(
    own_key: &[u8; 32],
    ack_key_share: &[u8; 32],
    expected_challenge: &Address,
    own_share: Option<&PeerId>,
    precomputed_response: Option<&[u8; 32]>,
) -> AckValidation {
    if let Some(response) = precomputed_response {
        let valid = CurvePoint::from_scalar(response)
            .map(|point| point.to_address() == *expected_challenge)
            .unwrap_or(false);
        return AckValidation {
            valid,
            response: Some(*response),
        };
    }

    let response = match add_scalars(own_key, ack_key_share) {
        Ok(response) => response,
        Err(_) => {
            return AckValidation {
                valid: false,
                response: None,
            }
        }
    };

    let mut valid = CurvePoint::from_scalar(&response)
        .map(|point| point.to_address() == *expected_challenge)
        .unwrap_or(false);

    if let Some(share) = own_share {
        valid &= shares_combine_to(ack_key_share, share, expected_challenge);
    }

    AckValidation {
        valid,
        response: Some(response),
    }
}

/// Whether `G * ack_key_share` equals the point `ack_challenge`
pub fn ack_matches_challenge(ack_key_share: &[u8; 32], ack_challenge: &PeerId) -> bool {
    CurvePoint::from_scalar(ack_key_share)
        .map(|point| point.to_bytes() == *ack_challenge)
        .unwrap_or(false)
}

/// Public point of an ack key share, the key unacknowledged tickets are stored under
pub fn ack_challenge_of(ack_key_share: &[u8; 32]) -> Result<PeerId, PorError> {
    Ok(CurvePoint::from_scalar(ack_key_share)?.to_bytes())
}

/// Address of a challenge point, as committed to by tickets
pub fn challenge_address(point: &PeerId) -> Result<Address, PorError> {
    Ok(CurvePoint::from_bytes(point)
        .map_err(|_| PorError::MalformedPoint)?
        .to_address())
}

fn shares_combine_to(ack_key_share: &[u8; 32], own_share: &PeerId, expected: &Address) -> bool {
    let ack_point = match CurvePoint::from_scalar(ack_key_share) {
        Ok(point) => point,
        Err(_) => return false,
    };
    CurvePoint::from_bytes(own_share)
        .and_then(|own| ack_point.combine(&own))
        .map(|challenge| challenge.to_address() == *expected)
        .unwrap_or(false)
}
