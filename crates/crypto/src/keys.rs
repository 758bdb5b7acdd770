use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use mixcraft_core::{Address, PathHop, PeerId, Secret};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid secret key")]
    InvalidSecretKey,
    #[error("Point at infinity")]
    PointAtInfinity,
    #[error("Key exchange produced a non-contributory secret")]
    NonContributory,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Signing failed")]
    SigningFailed,
}

/// Secp256k1 keypair used for tickets, acknowledgements and node identity
#[derive(Clone)]
pub struct ChainKeypair {
    signing_key: SigningKey,
}

impl ChainKeypair {
    /// Generate a new random chain keypair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Create from raw secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, KeyError> {
        let signing_key =
            SigningKey::from_slice(secret).map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self { signing_key })
    }

    /// Get the secret key as bytes
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.signing_key.to_bytes());
        out
    }

    /// Compressed public key, used as the node's peer id
    pub fn peer_id(&self) -> PeerId {
        let point = self.signing_key.verifying_key().to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Account address: last 20 bytes of Keccak-256 over the uncompressed key
    pub fn address(&self) -> Address {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        uncompressed_to_address(point.as_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl std::fmt::Debug for ChainKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChainKeypair {{ address: {} }}", hex::encode(self.address()))
    }
}

/// Keypair for encryption (X25519)
pub struct EncryptionKeypair {
    pub secret: StaticSecret,
    pub public: X25519PublicKey,
}

impl Clone for EncryptionKeypair {
    fn clone(&self) -> Self {
        let secret_bytes = self.secret.as_bytes();
        let secret = StaticSecret::from(*secret_bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl EncryptionKeypair {
    /// Generate a new random encryption keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Get the secret key as bytes
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        *self.secret.as_bytes()
    }

    /// Create from raw secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*secret);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Diffie-Hellman followed by SHA-256, rejecting low-order peer keys
    pub fn shared_secret(&self, their_public: &[u8; 32]) -> Result<Secret, KeyError> {
        let their_public = X25519PublicKey::from(*their_public);
        let shared = self.secret.diffie_hellman(&their_public);
        if !shared.was_contributory() {
            return Err(KeyError::NonContributory);
        }
        Ok(hash(shared.as_bytes()))
    }
}

/// Combined node identity
#[derive(Clone)]
pub struct Identity {
    pub chain: ChainKeypair,
    pub encryption: EncryptionKeypair,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self {
            chain: ChainKeypair::generate(),
            encryption: EncryptionKeypair::generate(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.chain.peer_id()
    }

    pub fn address(&self) -> Address {
        self.chain.address()
    }

    /// How senders address this node on a path
    pub fn path_hop(&self) -> PathHop {
        PathHop::new(self.peer_id(), self.encryption.public_key_bytes())
    }
}

/// Hash data using SHA-256
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash data using Keccak-256
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Address of a compressed or uncompressed secp256k1 public key
pub fn address_of(peer: &[u8]) -> Result<Address, KeyError> {
    let key = k256::PublicKey::from_sec1_bytes(peer).map_err(|_| KeyError::InvalidPublicKey)?;
    let point = key.to_encoded_point(false);
    Ok(uncompressed_to_address(point.as_bytes()))
}

fn uncompressed_to_address(uncompressed: &[u8]) -> Address {
    // Skip the 0x04 prefix
    let digest = keccak256(&uncompressed[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_keypair_restore() {
        let kp = ChainKeypair::generate();
        let restored = ChainKeypair::from_secret_bytes(&kp.secret_key_bytes()).unwrap();
        assert_eq!(restored.peer_id(), kp.peer_id());
        assert_eq!(restored.address(), kp.address());
    }

    #[test]
    fn test_zero_secret_rejected() {
        assert_eq!(
            ChainKeypair::from_secret_bytes(&[0u8; 32]).unwrap_err(),
            KeyError::InvalidSecretKey
        );
    }

    #[test]
    fn test_address_of_peer_id_matches() {
        let kp = ChainKeypair::generate();
        assert_eq!(address_of(&kp.peer_id()).unwrap(), kp.address());
    }

    #[test]
    fn test_address_of_known_key() {
        // Secret key 1 maps to the generator point
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let kp = ChainKeypair::from_secret_bytes(&secret).unwrap();
        assert_eq!(
            hex::encode(kp.address()),
            "7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_address_of_garbage_fails() {
        assert_eq!(address_of(&[0u8; 33]).unwrap_err(), KeyError::InvalidPublicKey);
    }

    #[test]
    fn test_encryption_keypair() {
        let kp = EncryptionKeypair::generate();
        let restored = EncryptionKeypair::from_secret_bytes(&kp.secret_key_bytes());
        assert_eq!(restored.public_key_bytes(), kp.public_key_bytes());
    }

    #[test]
    fn test_shared_secret_agrees() {
        let alice = EncryptionKeypair::generate();
        let bob = EncryptionKeypair::generate();

        let alice_shared = alice.shared_secret(&bob.public_key_bytes()).unwrap();
        let bob_shared = bob.shared_secret(&alice.public_key_bytes()).unwrap();

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = EncryptionKeypair::generate();
        assert_eq!(
            alice.shared_secret(&[0u8; 32]).unwrap_err(),
            KeyError::NonContributory
        );
    }

    #[test]
    fn test_identity_path_hop() {
        let id = Identity::generate();
        let hop = id.path_hop();
        assert_eq!(hop.peer, id.peer_id());
        assert_eq!(hop.encryption_pubkey, id.encryption.public_key_bytes());
    }
}
