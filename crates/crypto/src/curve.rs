//! Secp256k1 points and scalars used by the proof-of-relay scheme

use k256::elliptic_curve::group::Curve;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{NonZeroScalar, PublicKey, SecretKey};
use mixcraft_core::{Address, PUBLIC_KEY_LENGTH};

use crate::keys::{address_of, KeyError};

/// A validated secp256k1 point. Never the point at infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurvePoint(PublicKey);

impl CurvePoint {
    /// Parse a SEC1-encoded point; off-curve and identity encodings fail
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        PublicKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| KeyError::InvalidPublicKey)
    }

    /// `G * scalar`
    pub fn from_scalar(scalar: &[u8; 32]) -> Result<Self, KeyError> {
        let secret = SecretKey::from_slice(scalar).map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self(secret.public_key()))
    }

    /// Point addition; fails if the sum is the point at infinity
    pub fn combine(&self, other: &CurvePoint) -> Result<CurvePoint, KeyError> {
        let sum = self.0.to_projective() + other.0.to_projective();
        PublicKey::from_affine(sum.to_affine())
            .map(Self)
            .map_err(|_| KeyError::PointAtInfinity)
    }

    /// Compressed SEC1 encoding
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        let point = self.0.to_encoded_point(true);
        let mut out = [0u8; PUBLIC_KEY_LENGTH];
        out.copy_from_slice(point.as_bytes());
        out
    }

    pub fn to_address(&self) -> Address {
        let point = self.0.to_encoded_point(false);
        // A valid point always hashes to an address
        address_of(point.as_bytes()).unwrap_or_default()
    }
}

/// Parse a non-zero scalar below the group order
pub(crate) fn scalar_from_bytes(bytes: &[u8; 32]) -> Result<NonZeroScalar, KeyError> {
    SecretKey::from_slice(bytes)
        .map(|secret| secret.to_nonzero_scalar())
        .map_err(|_| KeyError::InvalidSecretKey)
}

/// `a + b mod n`, rejecting a zero sum
pub(crate) fn add_scalars(a: &[u8; 32], b: &[u8; 32]) -> Result<[u8; 32], KeyError> {
    let sum = *scalar_from_bytes(a)? + *scalar_from_bytes(b)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&sum.to_bytes());
    scalar_from_bytes(&out)?;
    Ok(out)
}
