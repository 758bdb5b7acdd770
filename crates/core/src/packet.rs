//! Fixed-size packet wire format
//!
//! `version(1) || header(HEADER_LEN) || payload(PAYLOAD_LEN) || ticket(Ticket::LEN)`
//!
//! Every packet on the wire has exactly [`PACKET_LEN`] bytes regardless of its
//! position on the path. Changing any offset requires bumping [`PACKET_VERSION`].

use crate::error::{expect_len, CoreError, Result};
use crate::onion::{OnionHeader, HEADER_LEN};
use crate::ticket::Ticket;

/// Current wire format version
pub const PACKET_VERSION: u8 = 1;

/// Layered payload length
pub const PAYLOAD_LEN: usize = 500;

/// Total packet length on the wire
pub const PACKET_LEN: usize = 1 + HEADER_LEN + PAYLOAD_LEN + Ticket::LEN;

/// Packet as it travels between two hops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket {
    pub header: OnionHeader,
    /// Layer-encrypted payload, always [`PAYLOAD_LEN`] bytes
    pub payload: Vec<u8>,
    /// Ticket issued by the previous hop to the receiving hop
    pub ticket: Ticket,
}

impl WirePacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_LEN);
        out.push(PACKET_VERSION);
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.ticket.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        expect_len(bytes, PACKET_LEN)?;
        if bytes[0] != PACKET_VERSION {
            return Err(CoreError::UnsupportedVersion(bytes[0]));
        }
        let header_end = 1 + HEADER_LEN;
        let payload_end = header_end + PAYLOAD_LEN;
        Ok(Self {
            header: OnionHeader::from_bytes(&bytes[1..header_end])?,
            payload: bytes[header_end..payload_end].to_vec(),
            ticket: Ticket::from_bytes(&bytes[payload_end..])?,
        })
    }
}
