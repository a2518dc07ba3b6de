//! PCP MAP request and response encoding, RFC 6887.

use std::net::Ipv4Addr;

use num_enum::TryFromPrimitive;

use crate::wire::{self, Field};
use crate::Transport;

/// Protocol version. PCP must identify itself with a `2` byte; `1` was
/// burned by pre-standard devices.
pub(crate) const VERSION: u8 = 2;

/// The MAP opcode. The base opcode is all this crate speaks.
pub(crate) const OPCODE_MAP: u8 = 1;

/// Indicator ORed into the opcode to mark a response packet.
pub(crate) const RESPONSE_INDICATOR: u8 = 1 << 7;

/// Size of an encoded MAP request.
pub(crate) const MAP_REQUEST_SIZE: usize = 60;

/// A MAP response is at least as large as its request; a server may append
/// options up to this size.
pub(crate) const MAX_RESPONSE_SIZE: usize = 1100;

/// Result codes, RFC 6887 section 7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum ResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    MalformedRequest = 3,
    UnsupportedOpcode = 4,
    UnsupportedOption = 5,
    MalformedOption = 6,
    NetworkFailure = 7,
    /// Out of free external ports. Deleting a mapping that is already gone
    /// also reports this, so deletion treats it as success.
    NoResources = 8,
    UnsupportedProtocol = 9,
    UserExceededQuota = 10,
    CannotProvideExternal = 11,
    AddressMismatch = 12,
    ExcessiveRemotePeers = 13,
}

/// A MAP request. Lifetime 0 with the original nonce deletes the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapRequest {
    pub lifetime_seconds: u32,
    /// Address the request is sent from, embedded IPv4-mapped.
    pub client_ip: Ipv4Addr,
    /// Random tag binding this mapping to its future deletion.
    pub nonce: [u8; 12],
    pub transport: Transport,
    pub internal_port: u16,
    /// Suggested external port, 0 to let the gateway pick.
    pub external_port: u16,
}

impl Transport {
    /// IANA protocol number carried in the MAP protocol byte.
    pub(crate) fn protocol_number(self) -> u8 {
        match self {
            Transport::Tcp => 6,
            Transport::Udp => 17,
        }
    }
}

impl MapRequest {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = wire::build(
            MAP_REQUEST_SIZE,
            &[
                Field::u8(0, VERSION),
                // R bit 0: request
                Field::u8(1, OPCODE_MAP),
                // offsets 2..3 reserved
                Field::u32(4, self.lifetime_seconds),
                // client address, IPv4-mapped IPv6: ::ffff:a.b.c.d
                Field::u16(18, 0xffff),
                Field::u32(20, self.client_ip.into()),
                Field::u8(36, self.transport.protocol_number()),
                // offsets 37..39 reserved
                Field::u16(40, self.internal_port),
                Field::u16(42, self.external_port),
                // suggested external address, IPv4-mapped zero address:
                // let the gateway pick
                Field::u16(54, 0xffff),
            ],
        );
        buf[24..36].copy_from_slice(&self.nonce);
        buf
    }
}

/// The fields of a MAP response this client consumes, read from their
/// fixed offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapResponse {
    pub result: ResultCode,
    pub lifetime_seconds: u32,
    pub epoch_seconds: u32,
    pub nonce: [u8; 12],
    pub protocol: u8,
    pub internal_port: u16,
    pub external_port: u16,
    pub external_ip: Ipv4Addr,
}

/// Errors produced when decoding a [`MapResponse`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, thiserror::Error)]
pub(crate) enum Error {
    #[display("response is malformed")]
    Malformed,
    #[display("packet is not a response")]
    NotAResponse,
    #[display("invalid version {_0}")]
    InvalidVersion(u8),
    #[display("invalid opcode {_0}")]
    InvalidOpcode(u8),
    #[display("invalid result code {_0}")]
    InvalidResultCode(u8),
}

impl MapResponse {
    /// Decodes a response. Non-success result codes are data, not errors:
    /// deletion needs to look at [`ResultCode::NoResources`].
    pub(crate) fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < MAP_REQUEST_SIZE || buf.len() > MAX_RESPONSE_SIZE {
            return Err(Error::Malformed);
        }
        let version = wire::read_u8(buf, 0);
        if version != VERSION {
            return Err(Error::InvalidVersion(version));
        }
        let opcode = wire::read_u8(buf, 1);
        if opcode & RESPONSE_INDICATOR != RESPONSE_INDICATOR {
            return Err(Error::NotAResponse);
        }
        if opcode & !RESPONSE_INDICATOR != OPCODE_MAP {
            return Err(Error::InvalidOpcode(opcode & !RESPONSE_INDICATOR));
        }
        let result = wire::read_u8(buf, 3);
        let result: ResultCode = result
            .try_into()
            .map_err(|_| Error::InvalidResultCode(result))?;

        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&buf[24..36]);

        let ip_octets: [u8; 4] = buf[56..60].try_into().expect("slice has the right len");

        Ok(MapResponse {
            result,
            lifetime_seconds: wire::read_u32(buf, 4),
            epoch_seconds: wire::read_u32(buf, 8),
            nonce,
            protocol: wire::read_u8(buf, 36),
            internal_port: wire::read_u16(buf, 40),
            external_port: wire::read_u16(buf, 42),
            external_ip: ip_octets.into(),
        })
    }
}
