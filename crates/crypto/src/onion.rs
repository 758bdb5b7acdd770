//! Sphinx-style onion header construction and peeling
//!
//! Each hop shares a secret with the sender through X25519 between the hop's
//! encryption key and a fresh ephemeral key (`alpha`). The hop verifies
//! `gamma`, decrypts `beta` with its header keystream, reads the first routing
//! slot and shifts the rest left. A filler computed by the sender makes the
//! bytes shifted in at the end decrypt to what the next hop's MAC expects, so
//! the header keeps the same length at every position on the path.

use mixcraft_core::{
    CoreError, OnionHeader, PathHop, RoutingSlot, Secret, HOP_SLOT_LEN, MAX_HOPS, POR_STRING_LEN,
    ROUTING_INFO_LEN,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::derivation::{apply_header_stream, apply_payload_stream, header_mac, verify_header_mac};
use crate::keys::{EncryptionKeypair, KeyError};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SphinxError {
    #[error("Path is empty")]
    EmptyPath,
    #[error("Path has {hops} hops (max {max})")]
    TooManyHops { hops: usize, max: usize },
    #[error("Expected {expected} PoR strings, got {actual}")]
    PorStringCount { expected: usize, actual: usize },
    #[error("Header MAC mismatch")]
    InvalidMac,
    #[error("Routing info has wrong length: {0}")]
    InvalidRoutingInfo(usize),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Routing slot error: {0}")]
    Routing(#[from] CoreError),
}

/// Sender-side key material for one hop
#[derive(Debug, Clone)]
pub struct HopSecret {
    /// Ephemeral public key the hop performs ECDH against
    pub alpha: [u8; 32],
    pub secret: Secret,
}

/// Result of peeling one header layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeledHeader {
    /// Secret shared with the sender for this hop
    pub secret: Secret,
    pub slot: RoutingSlot,
    /// Header for the next hop; `None` at the receiver
    pub next_header: Option<OnionHeader>,
}

/// Generate an ephemeral key per hop and derive the shared secrets
pub fn setup_path(path: &[PathHop]) -> Result<Vec<HopSecret>, SphinxError> {
    check_path_len(path.len())?;
    path.iter()
        .map(|hop| {
            let ephemeral = EncryptionKeypair::generate();
            let secret = ephemeral.shared_secret(&hop.encryption_pubkey)?;
            Ok(HopSecret {
                alpha: ephemeral.public_key_bytes(),
                secret,
            })
        })
        .collect()
}

/// Secret a hop shares with the sender, from the header's `alpha`
pub fn derive_hop_secret(
    keypair: &EncryptionKeypair,
    alpha: &[u8; 32],
) -> Result<Secret, SphinxError> {
    Ok(keypair.shared_secret(alpha)?)
}

/// Build the header for `path`.
///
/// `por_strings[i]` is placed in the slot of hop `i`, so there is one per
/// relay (every hop except the last).
pub fn build_header(
    path: &[PathHop],
    hops: &[HopSecret],
    por_strings: &[[u8; POR_STRING_LEN]],
) -> Result<OnionHeader, SphinxError> {
    let n = path.len();
    check_path_len(n)?;
    if hops.len() != n || por_strings.len() != n - 1 {
        return Err(SphinxError::PorStringCount {
            expected: n - 1,
            actual: por_strings.len(),
        });
    }

    let filler = build_filler(hops);

    // Innermost routing info: the receiver slot, random padding, then filler
    let open_len = ROUTING_INFO_LEN - filler.len();
    let mut beta = vec![0u8; open_len];
    beta[..HOP_SLOT_LEN].copy_from_slice(&RoutingSlot::Receiver.to_bytes());
    OsRng.fill_bytes(&mut beta[HOP_SLOT_LEN..]);
    apply_header_stream(&hops[n - 1].secret, &mut beta);
    beta.extend_from_slice(&filler);
    let mut gamma = header_mac(&hops[n - 1].secret, &beta)?;

    for i in (0..n - 1).rev() {
        let slot = RoutingSlot::Relay {
            next_peer: path[i + 1].peer,
            next_alpha: hops[i + 1].alpha,
            next_gamma: gamma,
            por_string: por_strings[i],
        };
        let mut next_beta = Vec::with_capacity(ROUTING_INFO_LEN);
        next_beta.extend_from_slice(&slot.to_bytes());
        next_beta.extend_from_slice(&beta[..ROUTING_INFO_LEN - HOP_SLOT_LEN]);
        apply_header_stream(&hops[i].secret, &mut next_beta);
        gamma = header_mac(&hops[i].secret, &next_beta)?;
        beta = next_beta;
    }

    Ok(OnionHeader {
        alpha: hops[0].alpha,
        beta,
        gamma,
    })
}

/// Bytes that hops `0..n-1` shift into the end of the routing info
fn build_filler(hops: &[HopSecret]) -> Vec<u8> {
    let stream_len = ROUTING_INFO_LEN + HOP_SLOT_LEN;
    let mut filler: Vec<u8> = Vec::new();
    for hop in &hops[..hops.len() - 1] {
        filler.extend_from_slice(&[0u8; HOP_SLOT_LEN]);
        let mut stream = vec![0u8; stream_len];
        apply_header_stream(&hop.secret, &mut stream);
        let offset = stream_len - filler.len();
        for (byte, key) in filler.iter_mut().zip(&stream[offset..]) {
            *byte ^= key;
        }
    }
    filler
}

/// Verify and peel this hop's layer
pub fn peel_header(
    keypair: &EncryptionKeypair,
    header: &OnionHeader,
) -> Result<PeeledHeader, SphinxError> {
    if header.beta.len() != ROUTING_INFO_LEN {
        return Err(SphinxError::InvalidRoutingInfo(header.beta.len()));
    }
    let secret = derive_hop_secret(keypair, &header.alpha)?;
    if !verify_header_mac(&secret, &header.beta, &header.gamma) {
        return Err(SphinxError::InvalidMac);
    }

    let mut routing = Vec::with_capacity(ROUTING_INFO_LEN + HOP_SLOT_LEN);
    routing.extend_from_slice(&header.beta);
    routing.extend_from_slice(&[0u8; HOP_SLOT_LEN]);
    apply_header_stream(&secret, &mut routing);

    let slot = RoutingSlot::from_bytes(&routing[..HOP_SLOT_LEN])?;
    let next_header = match &slot {
        RoutingSlot::Relay {
            next_alpha,
            next_gamma,
            ..
        } => Some(OnionHeader {
            alpha: *next_alpha,
            beta: routing[HOP_SLOT_LEN..].to_vec(),
            gamma: *next_gamma,
        }),
        RoutingSlot::Receiver => None,
    };

    Ok(PeeledHeader {
        secret,
        slot,
        next_header,
    })
}

/// Apply every hop's payload layer to a sealed payload
pub fn wrap_payload(hops: &[HopSecret], payload: &mut [u8]) {
    for hop in hops.iter().rev() {
        apply_payload_stream(&hop.secret, payload);
    }
}

/// Remove this hop's payload layer
pub fn peel_payload(secret: &Secret, payload: &mut [u8]) {
    apply_payload_stream(secret, payload);
}

fn check_path_len(n: usize) -> Result<(), SphinxError> {
    if n == 0 {
        return Err(SphinxError::EmptyPath);
    }
    if n > MAX_HOPS {
        return Err(SphinxError::TooManyHops {
            hops: n,
            max: MAX_HOPS,
        });
    }
    Ok(())
}
