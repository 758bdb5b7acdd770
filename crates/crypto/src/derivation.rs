//! Sub-keys derived from a per-hop secret
//!
//! Every key a hop needs is expanded from its shared secret with HKDF-SHA256
//! under a distinct label, so no two uses ever share key material.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use k256::SecretKey;
use mixcraft_core::{PacketTag, Secret};
use sha2::Sha256;

use crate::keys::KeyError;

const OWN_KEY_LABEL: &[u8] = b"mixcraft-own-key-share";
const ACK_KEY_LABEL: &[u8] = b"mixcraft-ack-key-share";
const PACKET_TAG_LABEL: &[u8] = b"mixcraft-packet-tag";
const MAC_KEY_LABEL: &[u8] = b"mixcraft-header-mac";
const HEADER_STREAM_LABEL: &[u8] = b"mixcraft-header-stream";
const PAYLOAD_STREAM_LABEL: &[u8] = b"mixcraft-payload-stream";
const PAYLOAD_KEY_LABEL: &[u8] = b"mixcraft-payload-key";

type HmacSha256 = Hmac<Sha256>;

fn expand(secret: &Secret, label: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, secret);
    let mut okm = [0u8; 32];
    // 32 bytes is always within the HKDF-SHA256 output limit
    let _ = hkdf.expand(label, &mut okm);
    okm
}

/// Expand until the output is a valid non-zero scalar
fn sample_scalar(secret: &Secret, label: &[u8]) -> Result<[u8; 32], KeyError> {
    let mut info = Vec::with_capacity(label.len() + 1);
    info.extend_from_slice(label);
    info.push(0);
    for counter in 0..=u8::MAX {
        info[label.len()] = counter;
        let candidate = expand(secret, &info);
        if SecretKey::from_slice(&candidate).is_ok() {
            return Ok(candidate);
        }
    }
    Err(KeyError::InvalidSecretKey)
}

/// Half of the challenge a hop solves itself
pub fn derive_own_key_share(secret: &Secret) -> Result<[u8; 32], KeyError> {
    sample_scalar(secret, OWN_KEY_LABEL)
}

/// Half of the challenge the upstream hop solves after acknowledgement
pub fn derive_ack_key_share(secret: &Secret) -> Result<[u8; 32], KeyError> {
    sample_scalar(secret, ACK_KEY_LABEL)
}

pub fn derive_packet_tag(secret: &Secret) -> PacketTag {
    expand(secret, PACKET_TAG_LABEL)
}

pub fn derive_payload_key(secret: &Secret) -> [u8; 32] {
    expand(secret, PAYLOAD_KEY_LABEL)
}

/// HMAC-SHA256 over `data` under the secret's MAC key
pub fn header_mac(secret: &Secret, data: &[u8]) -> Result<[u8; 32], KeyError> {
    let key = expand(secret, MAC_KEY_LABEL);
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| KeyError::InvalidSecretKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time check of a header MAC
pub fn verify_header_mac(secret: &Secret, data: &[u8], tag: &[u8; 32]) -> bool {
    let key = expand(secret, MAC_KEY_LABEL);
    match HmacSha256::new_from_slice(&key) {
        Ok(mut mac) => {
            mac.update(data);
            mac.verify_slice(tag).is_ok()
        }
        Err(_) => false,
    }
}

/// XOR the header keystream into `buf`
pub fn apply_header_stream(secret: &Secret, buf: &mut [u8]) {
    apply_stream(&expand(secret, HEADER_STREAM_LABEL), buf);
}

/// XOR the payload keystream into `buf`
pub fn apply_payload_stream(secret: &Secret, buf: &mut [u8]) {
    apply_stream(&expand(secret, PAYLOAD_STREAM_LABEL), buf);
}

/// Keys are single-use, so a zero nonce is safe
fn apply_stream(key: &[u8; 32], buf: &mut [u8]) {
    let mut cipher = ChaCha20::new(key.into(), &[0u8; 12].into());
    cipher.apply_keystream(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shares_are_deterministic() {
        let secret = [7u8; 32];
        assert_eq!(
            derive_own_key_share(&secret).unwrap(),
            derive_own_key_share(&secret).unwrap()
        );
        assert_eq!(
            derive_ack_key_share(&secret).unwrap(),
            derive_ack_key_share(&secret).unwrap()
        );
    }

    #[test]
    fn test_labels_separate_keys() {
        let secret = [7u8; 32];
        let own = derive_own_key_share(&secret).unwrap();
        let ack = derive_ack_key_share(&secret).unwrap();
        let tag = derive_packet_tag(&secret);
        let payload = derive_payload_key(&secret);
        assert_ne!(own, ack);
        assert_ne!(own, tag);
        assert_ne!(tag, payload);
    }

    #[test]
    fn test_tag_depends_on_secret() {
        assert_ne!(derive_packet_tag(&[1u8; 32]), derive_packet_tag(&[2u8; 32]));
    }

    #[test]
    fn test_mac_verifies() {
        let secret = [3u8; 32];
        let mac = header_mac(&secret, b"routing info").unwrap();
        assert!(verify_header_mac(&secret, b"routing info", &mac));
        assert!(!verify_header_mac(&secret, b"routing infp", &mac));
        assert!(!verify_header_mac(&[4u8; 32], b"routing info", &mac));
    }

    #[test]
    fn test_stream_is_involution() {
        let secret = [5u8; 32];
        let mut buf = b"hello mix network".to_vec();
        apply_payload_stream(&secret, &mut buf);
        assert_ne!(buf, b"hello mix network");
        apply_payload_stream(&secret, &mut buf);
        assert_eq!(buf, b"hello mix network");
    }

    #[test]
    fn test_header_and_payload_streams_differ() {
        let secret = [5u8; 32];
        let mut header = [0u8; 64];
        let mut payload = [0u8; 64];
        apply_header_stream(&secret, &mut header);
        apply_payload_stream(&secret, &mut payload);
        assert_ne!(header, payload);
    }

    #[test]
    fn test_stream_prefix_is_stable() {
        // A longer keystream extends a shorter one
        let secret = [9u8; 32];
        let mut short = [0u8; 32];
        let mut long = [0u8; 96];
        apply_header_stream(&secret, &mut short);
        apply_header_stream(&secret, &mut long);
        assert_eq!(&long[..32], &short);
    }
}
