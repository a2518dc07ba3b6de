//! A port mapping created with one of the supported protocols.

use std::net::Ipv4Addr;
use std::num::NonZeroU16;

use crate::candidates::Waves;
use crate::{nat_pmp, pcp, upnp, Error, Transport};

/// Shared accessors over the per-protocol mapping records.
pub(crate) trait PortMapped: std::fmt::Debug {
    /// Local address forwarded traffic is delivered to.
    fn internal_ip(&self) -> Ipv4Addr;
    fn internal_port(&self) -> NonZeroU16;
    /// Port granted on the WAN side; authoritative, may differ from the
    /// requested one.
    fn external_port(&self) -> NonZeroU16;
    /// Lifetime granted by the router. 0 means static.
    fn lifetime_seconds(&self) -> u32;
}

/// The wire protocol that produced a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Protocol {
    #[display("NAT-PMP")]
    NatPmp,
    #[display("PCP")]
    Pcp,
    #[display("UPnP")]
    Upnp,
}

/// A port mapping created with one of the supported protocols.
///
/// Protocol-specific material (the PCP nonce, the router-reported external
/// address, the UPnP control URL) lives in the variant that needs it.
#[derive(derive_more::Debug, Clone, PartialEq, Eq)]
pub enum Mapping {
    /// A NAT-PMP mapping.
    #[debug("{_0:?}")]
    NatPmp(nat_pmp::Mapping),
    /// A PCP mapping.
    #[debug("{_0:?}")]
    Pcp(pcp::Mapping),
    /// A UPnP mapping.
    #[debug("{_0:?}")]
    Upnp(upnp::Mapping),
}

/// Context a release needs beyond the mapping itself: NAT-PMP and PCP
/// deletions fan out across the candidate waves current at deletion time.
#[derive(Debug)]
pub(crate) struct ReleaseContext<'a> {
    pub waves: &'a Waves,
    pub gateway_port: u16,
    pub http: &'a reqwest::Client,
}

impl Mapping {
    /// The protocol that produced this mapping, which is also the protocol
    /// that has to delete it.
    pub fn protocol(&self) -> Protocol {
        match self {
            Mapping::NatPmp(_) => Protocol::NatPmp,
            Mapping::Pcp(_) => Protocol::Pcp,
            Mapping::Upnp(_) => Protocol::Upnp,
        }
    }

    /// Local address forwarded traffic is delivered to.
    pub fn internal_ip(&self) -> Ipv4Addr {
        self.as_port_mapped().internal_ip()
    }

    pub fn internal_port(&self) -> NonZeroU16 {
        self.as_port_mapped().internal_port()
    }

    /// Port granted on the WAN side. The router may have assigned a
    /// different port than the one asked for; this value is authoritative.
    pub fn external_port(&self) -> NonZeroU16 {
        self.as_port_mapped().external_port()
    }

    /// External address as reported by the router. Only PCP reports one.
    pub fn external_ip(&self) -> Option<Ipv4Addr> {
        match self {
            Mapping::Pcp(m) => Some(m.external_ip),
            Mapping::NatPmp(_) | Mapping::Upnp(_) => None,
        }
    }

    /// Lifetime granted by the router in seconds; may be shorter than
    /// requested. 0 means the mapping is static.
    pub fn lifetime_seconds(&self) -> u32 {
        self.as_port_mapped().lifetime_seconds()
    }

    /// The nonce binding a PCP mapping to its deletion.
    pub fn nonce(&self) -> Option<&[u8; 12]> {
        match self {
            Mapping::Pcp(m) => Some(&m.nonce),
            Mapping::NatPmp(_) | Mapping::Upnp(_) => None,
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            Mapping::NatPmp(m) => m.transport,
            Mapping::Pcp(m) => m.transport,
            Mapping::Upnp(m) => m.transport,
        }
    }

    /// Releases the mapping with the protocol that created it.
    pub(crate) async fn release(&self, ctx: &ReleaseContext<'_>) -> Result<(), Error> {
        match self {
            Mapping::NatPmp(m) => nat_pmp::release(m, ctx.waves, ctx.gateway_port).await,
            Mapping::Pcp(m) => pcp::release(m, ctx.waves, ctx.gateway_port).await,
            Mapping::Upnp(m) => {
                upnp::delete_port_mapping(ctx.http, &m.control_url, m.external_port, m.transport)
                    .await
            }
        }
    }

    fn as_port_mapped(&self) -> &dyn PortMapped {
        match self {
            Mapping::NatPmp(m) => m,
            Mapping::Pcp(m) => m,
            Mapping::Upnp(m) => m,
        }
    }
}

impl std::fmt::Display for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} mapping {}:{} -> {}",
            self.protocol(),
            self.internal_ip(),
            self.internal_port(),
            self.external_port(),
        )
    }
}

impl PortMapped for nat_pmp::Mapping {
    fn internal_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    fn internal_port(&self) -> NonZeroU16 {
        self.internal_port
    }

    fn external_port(&self) -> NonZeroU16 {
        self.external_port
    }

    fn lifetime_seconds(&self) -> u32 {
        self.lifetime_seconds
    }
}

impl PortMapped for pcp::Mapping {
    fn internal_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    fn internal_port(&self) -> NonZeroU16 {
        self.internal_port
    }

    fn external_port(&self) -> NonZeroU16 {
        self.external_port
    }

    fn lifetime_seconds(&self) -> u32 {
        self.lifetime_seconds
    }
}

impl PortMapped for upnp::Mapping {
    fn internal_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    fn internal_port(&self) -> NonZeroU16 {
        self.internal_port
    }

    fn external_port(&self) -> NonZeroU16 {
        self.external_port
    }

    fn lifetime_seconds(&self) -> u32 {
        self.lifetime_seconds
    }
}
