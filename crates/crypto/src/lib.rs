//! MixCraft Cryptography
//!
//! This crate provides the cryptographic primitives for MixCraft relays:
//! node keys, per-hop key derivation, the proof-of-relay challenge builder,
//! ticket and acknowledgement signatures, and the fixed-size onion header.

mod curve;
mod derivation;
mod encrypt;
mod keys;
mod onion;
mod por;
mod sign;

pub use curve::*;
pub use derivation::*;
pub use encrypt::*;
pub use keys::*;
pub use onion::*;
pub use por::*;
pub use sign::*;
