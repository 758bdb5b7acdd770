//! End-to-end payload sealing
//!
//! The sender seals the application payload for the receiver before any
//! per-hop layering. The sealed frame is always [`PAYLOAD_LEN`] bytes so
//! relays cannot infer the message size.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use mixcraft_core::PAYLOAD_LEN;
use thiserror::Error;

const AEAD_TAG_LEN: usize = 16;
const LENGTH_PREFIX_LEN: usize = 2;

/// Length of the padded plaintext frame
const FRAME_LEN: usize = PAYLOAD_LEN - AEAD_TAG_LEN;

/// Largest application payload a single packet can carry
pub const PAYLOAD_CAPACITY: usize = FRAME_LEN - LENGTH_PREFIX_LEN;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncryptError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Malformed payload frame")]
    MalformedFrame,
}

/// Pad `data` into a fixed frame and encrypt it.
///
/// The key is derived from a per-packet secret and used once, so the nonce is zero.
pub fn seal_payload(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, EncryptError> {
    if data.len() > PAYLOAD_CAPACITY {
        return Err(EncryptError::PayloadTooLarge {
            size: data.len(),
            max: PAYLOAD_CAPACITY,
        });
    }

    let mut frame = vec![0u8; FRAME_LEN];
    frame[..LENGTH_PREFIX_LEN].copy_from_slice(&(data.len() as u16).to_le_bytes());
    frame[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + data.len()].copy_from_slice(data);

    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptError::InvalidKey)?;
    cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), frame.as_slice())
        .map_err(|_| EncryptError::EncryptionFailed)
}

/// Decrypt a sealed frame and strip its padding
pub fn open_payload(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, EncryptError> {
    if sealed.len() != PAYLOAD_LEN {
        return Err(EncryptError::MalformedFrame);
    }

    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptError::InvalidKey)?;
    let frame = cipher
        .decrypt(Nonce::from_slice(&[0u8; 12]), sealed)
        .map_err(|_| EncryptError::DecryptionFailed)?;

    let len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
    if len > PAYLOAD_CAPACITY {
        return Err(EncryptError::MalformedFrame);
    }
    Ok(frame[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + len].to_vec())
}
