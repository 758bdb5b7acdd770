use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use mixcraft_core::{
    Acknowledgement, Address, Hash, PeerId, Signature, Ticket, TicketFields, PUBLIC_KEY_LENGTH,
    SIGNATURE_LENGTH,
};

use crate::keys::{address_of, ChainKeypair, KeyError};

/// Sign a 32-byte hash, producing `r || s || v`
pub fn sign_hash(keypair: &ChainKeypair, hash: &Hash) -> Result<Signature, KeyError> {
    let (signature, recovery_id) = keypair
        .signing_key()
        .sign_prehash_recoverable(hash)
        .map_err(|_| KeyError::SigningFailed)?;

    let mut out = [0u8; SIGNATURE_LENGTH];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = recovery_id.to_byte();
    Ok(out)
}

/// Recover the compressed public key that produced `signature` over `hash`
pub fn recover_signer(hash: &Hash, signature: &Signature) -> Result<PeerId, KeyError> {
    let ecdsa = EcdsaSignature::from_slice(&signature[..64]).map_err(|_| KeyError::InvalidSignature)?;
    let recovery_id = RecoveryId::from_byte(signature[64]).ok_or(KeyError::InvalidSignature)?;
    let key = VerifyingKey::recover_from_prehash(hash, &ecdsa, recovery_id)
        .map_err(|_| KeyError::InvalidSignature)?;

    let point = key.to_encoded_point(true);
    let mut out = [0u8; PUBLIC_KEY_LENGTH];
    out.copy_from_slice(point.as_bytes());
    Ok(out)
}

/// Sign ticket fields with the issuer's chain key
pub fn sign_ticket(keypair: &ChainKeypair, fields: TicketFields) -> Result<Ticket, KeyError> {
    let signature = sign_hash(keypair, &fields.hash())?;
    Ok(Ticket::from_fields(fields, signature))
}

/// Address of the key that signed the ticket
pub fn ticket_signer(ticket: &Ticket) -> Result<Address, KeyError> {
    let signer = recover_signer(&ticket.hash(), &ticket.signature)?;
    address_of(&signer)
}

/// Whether `issuer` signed the ticket
pub fn verify_ticket(ticket: &Ticket, issuer: &PeerId) -> bool {
    recover_signer(&ticket.hash(), &ticket.signature)
        .map(|signer| signer == *issuer)
        .unwrap_or(false)
}

pub fn sign_acknowledgement(
    keypair: &ChainKeypair,
    ack_key_share: &[u8; 32],
) -> Result<Acknowledgement, KeyError> {
    let signature = sign_hash(keypair, &Acknowledgement::signable_hash(ack_key_share))?;
    Ok(Acknowledgement {
        ack_key_share: *ack_key_share,
        signature,
    })
}

/// Whether `signer` produced the acknowledgement
pub fn verify_acknowledgement(ack: &Acknowledgement, signer: &PeerId) -> bool {
    let hash = Acknowledgement::signable_hash(&ack.ack_key_share);
    recover_signer(&hash, &ack.signature)
        .map(|recovered| recovered == *signer)
        .unwrap_or(false)
}
