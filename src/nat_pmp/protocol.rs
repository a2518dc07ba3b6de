//! NAT-PMP request and response encoding, RFC 6886.

use std::net::Ipv4Addr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::wire::{self, Field};
use crate::Transport;

/// Protocol version. NAT-PMP identifies itself with a `0` byte.
pub(crate) const VERSION: u8 = 0;

/// NAT-PMP operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum Opcode {
    /// Request the gateway's external address.
    DetermineExternalAddress = 0,
    /// Map a UDP port.
    MapUdp = 1,
    /// Map a TCP port.
    MapTcp = 2,
}

impl From<Transport> for Opcode {
    fn from(transport: Transport) -> Self {
        match transport {
            Transport::Udp => Opcode::MapUdp,
            Transport::Tcp => Opcode::MapTcp,
        }
    }
}

/// Result codes a server can reply with, RFC 6886 section 3.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub(crate) enum ResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    /// Supported but not allowed, e.g. port mapping disabled by the user.
    NotAuthorizedOrRefused = 2,
    /// The NAT box itself is in a failed network state.
    NetworkFailure = 3,
    /// The NAT box cannot create more mappings at this time.
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

/// A NAT-PMP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    /// Two-byte probe for the gateway's external address.
    ExternalAddress,
    /// Request to map (or with lifetime 0, unmap) a port.
    Mapping {
        transport: Transport,
        internal_port: u16,
        /// Suggested external port; the gateway may assign another.
        external_port: u16,
        lifetime_seconds: u32,
    },
}

impl Request {
    /// Size of an encoded mapping request.
    pub(crate) const MAP_SIZE: usize = 12;

    pub(crate) fn encode(&self) -> Vec<u8> {
        match *self {
            Request::ExternalAddress => wire::build(
                2,
                &[
                    Field::u8(0, VERSION),
                    Field::u8(1, Opcode::DetermineExternalAddress.into()),
                ],
            ),
            Request::Mapping {
                transport,
                internal_port,
                external_port,
                lifetime_seconds,
            } => wire::build(
                Self::MAP_SIZE,
                &[
                    Field::u8(0, VERSION),
                    Field::u8(1, Opcode::from(transport).into()),
                    // offset 2: u16 reserved, stays zero
                    Field::u16(4, internal_port),
                    Field::u16(6, external_port),
                    Field::u32(8, lifetime_seconds),
                ],
            ),
        }
    }
}

/// A NAT-PMP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Response {
    ExternalAddress {
        epoch_seconds: u32,
        external_ip: Ipv4Addr,
    },
    Mapping {
        transport: Transport,
        epoch_seconds: u32,
        internal_port: u16,
        external_port: u16,
        lifetime_seconds: u32,
    },
}

/// Errors produced when decoding a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, thiserror::Error)]
pub(crate) enum Error {
    /// Response is too short or too long for its opcode.
    #[display("response is malformed")]
    Malformed,
    /// The response indicator bit is not set.
    #[display("packet is not a response")]
    NotAResponse,
    #[display("invalid version {_0}")]
    InvalidVersion(u8),
    #[display("invalid opcode {_0}")]
    InvalidOpcode(u8),
    #[display("invalid result code {_0}")]
    InvalidResultCode(u16),
    /// The server replied with a non-success result code.
    #[display("gateway replied with result code {_0:?}")]
    Result(ResultCode),
}

impl Response {
    /// Size of an external-address response.
    pub(crate) const ADDRESS_SIZE: usize = 12;
    /// Size of a mapping response.
    pub(crate) const MAP_SIZE: usize = 16;

    /// Indicator ORed into the request opcode to mark a response packet.
    pub(crate) const INDICATOR: u8 = 1 << 7;

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::ADDRESS_SIZE {
            return Err(Error::Malformed);
        }
        let version = wire::read_u8(buf, 0);
        if version != VERSION {
            return Err(Error::InvalidVersion(version));
        }
        let opcode = wire::read_u8(buf, 1);
        if opcode & Self::INDICATOR != Self::INDICATOR {
            return Err(Error::NotAResponse);
        }
        let opcode: Opcode = (opcode & !Self::INDICATOR)
            .try_into()
            .map_err(|_| Error::InvalidOpcode(opcode & !Self::INDICATOR))?;

        let result = wire::read_u16(buf, 2);
        let result: ResultCode = result
            .try_into()
            .map_err(|_| Error::InvalidResultCode(result))?;
        if result != ResultCode::Success {
            return Err(Error::Result(result));
        }

        let epoch_seconds = wire::read_u32(buf, 4);

        match opcode {
            Opcode::DetermineExternalAddress => {
                if buf.len() != Self::ADDRESS_SIZE {
                    return Err(Error::Malformed);
                }
                let octets: [u8; 4] = buf[8..12].try_into().expect("slice has the right len");
                Ok(Response::ExternalAddress {
                    epoch_seconds,
                    external_ip: octets.into(),
                })
            }
            Opcode::MapUdp | Opcode::MapTcp => {
                if buf.len() != Self::MAP_SIZE {
                    return Err(Error::Malformed);
                }
                let transport = match opcode {
                    Opcode::MapUdp => Transport::Udp,
                    _ => Transport::Tcp,
                };
                Ok(Response::Mapping {
                    transport,
                    epoch_seconds,
                    internal_port: wire::read_u16(buf, 8),
                    external_port: wire::read_u16(buf, 10),
                    lifetime_seconds: wire::read_u32(buf, 12),
                })
            }
        }
    }
}
